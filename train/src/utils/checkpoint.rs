use crate::{common::*, config::LoadCheckpoint};

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

fn checkpoint_filename_regex() -> Result<Regex> {
    let regex =
        Regex::new(r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_(\d{4,})\.ckpt$")?;
    Ok(regex)
}

/// Save parameters to a checkpoint file named after the time and epoch.
pub fn save_checkpoint(vs: &nn::VarStore, checkpoint_dir: &Path, epoch: usize) -> Result<PathBuf> {
    let filename = format!("{}_{:04}.ckpt", Local::now().format(FILE_STRFTIME), epoch);
    let path = checkpoint_dir.join(filename);
    vs.save(&path)?;
    info!("checkpoint saved to '{}'", path.display());
    Ok(path)
}

/// Extracts the epoch from a checkpoint file name.
pub fn checkpoint_epoch(path: &Path) -> Option<usize> {
    let regex = checkpoint_filename_regex().ok()?;
    let file_name = path.file_name()?.to_str()?;
    let captures = regex.captures(file_name)?;
    captures.get(2)?.as_str().parse().ok()
}

/// Finds the most recent checkpoint under the run directories in `logging_dir`.
pub fn find_recent_checkpoint(logging_dir: &Path) -> Result<Option<PathBuf>> {
    let regex = checkpoint_filename_regex()?;
    let pattern = format!("{}/*/checkpoints/*.ckpt", logging_dir.display());
    let paths: Vec<_> = glob::glob(&pattern)?.try_collect()?;

    let checkpoint_file = paths
        .into_iter()
        .filter_map(|path| {
            let file_name = path.file_name()?.to_str()?;
            let captures = regex.captures(file_name)?;
            let datetime_str = captures.get(1)?.as_str();
            let datetime = DateTime::parse_from_str(datetime_str, FILE_STRFTIME).ok()?;
            Some((path, datetime))
        })
        .max_by_key(|(_path, datetime)| *datetime)
        .map(|(path, _datetime)| path);

    Ok(checkpoint_file)
}

/// Load parameters with specified checkpoint loading method.
///
/// Returns the epoch recorded in the loaded checkpoint file name.
pub fn try_load_checkpoint(
    vs: &mut nn::VarStore,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<usize>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let checkpoint_file = find_recent_checkpoint(logging_dir)?;
            if checkpoint_file.is_none() {
                warn!("no checkpoint file found");
            }
            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            if file.is_file() {
                Some(file.to_owned())
            } else {
                warn!("{} is not a file", file.display());
                None
            }
        }
    };

    let path = match path {
        Some(path) => path,
        None => return Ok(None),
    };

    info!("load checkpoint file {}", path.display());
    vs.load_partial(&path)?;
    Ok(checkpoint_epoch(&path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_and_find_recent_checkpoint() -> Result<()> {
        let logging_dir = std::env::temp_dir().join("hdetr-checkpoint-test");
        let checkpoint_dir = logging_dir.join("run").join("checkpoints");
        if logging_dir.exists() {
            fs::remove_dir_all(&logging_dir)?;
        }
        fs::create_dir_all(&checkpoint_dir)?;

        let vs = nn::VarStore::new(Device::Cpu);
        let _ = vs.root().ones("weight", &[2]);

        save_checkpoint(&vs, &checkpoint_dir, 3)?;
        thread::sleep(Duration::from_millis(5));
        let last = save_checkpoint(&vs, &checkpoint_dir, 4)?;

        assert_eq!(find_recent_checkpoint(&logging_dir)?, Some(last.clone()));
        assert_eq!(checkpoint_epoch(&last), Some(4));

        let mut vs = nn::VarStore::new(Device::Cpu);
        let _ = vs.root().zeros("weight", &[2]);
        let epoch = try_load_checkpoint(&mut vs, &logging_dir, &LoadCheckpoint::FromRecent)?;
        assert_eq!(epoch, Some(4));
        Ok(())
    }
}
