use crate::common::*;

/// Creates `dir` and its parents. An existing directory is not an error.
pub fn create_dir_idempotent(dir: impl AsRef<Path>) -> Result<()> {
    let dir = dir.as_ref();
    match fs::create_dir_all(dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => Ok(()),
        Err(err) => {
            Err(Error::from(err).context(format!("failed to create '{}'", dir.display())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_existing_dir() -> Result<()> {
        let dir = std::env::temp_dir().join("hdetr-train-fs-test").join("nested");
        create_dir_idempotent(&dir)?;
        create_dir_idempotent(&dir)?;
        assert!(dir.is_dir());
        Ok(())
    }

    #[test]
    fn create_dir_over_file_fails() -> Result<()> {
        let root = std::env::temp_dir().join("hdetr-train-fs-test");
        create_dir_idempotent(&root)?;
        let file = root.join("plain-file");
        fs::write(&file, b"")?;
        assert!(create_dir_idempotent(&file).is_err());
        Ok(())
    }
}
