//! Box prompt exporting.

use crate::{common::*, config::PromptConfig, data, utils};
use hdetr::postprocess::BoxPostProcess;
use ndarray::Array2;

/// Runs the detector over listed images and saves the confident boxes of
/// each image as a `[n, 5]` array of `(x1, y1, x2, y2, label)` rows.
pub struct PromptExporter<'a, D>
where
    D: Detector + ?Sized,
{
    pub model: &'a mut D,
    pub postprocess: &'a dyn BoxPostProcess,
    pub config: &'a PromptConfig,
}

impl<'a, D> PromptExporter<'a, D>
where
    D: Detector + ?Sized,
{
    /// Exports the test file list and then the val file list. Returns the
    /// number of written files.
    pub fn run(self) -> Result<usize> {
        let Self {
            model,
            postprocess,
            config,
        } = self;
        utils::create_dir_idempotent(&config.output_dir)?;

        let mut model = QueryConfigGuard::narrow_to_one2one(model)?;
        let result = tch::no_grad(|| -> Result<usize> {
            let mut count = 0;
            for (name, list_file) in [("test", &config.test_files), ("val", &config.val_files)] {
                let files = read_file_list(list_file)?;
                info!("exporting prompts of {} {} files", files.len(), name);

                for file in files {
                    let path = config.image_dir.join(&file);
                    let prompts = predict_prompts(&mut *model, postprocess, config, &path)?;
                    let output_file = prompt_file(&config.output_dir, &file)?;
                    write_prompts(&output_file, &prompts)?;
                    count += 1;
                }
            }
            Ok(count)
        });
        let restored = model.restore();
        let count = result?;
        restored?;

        info!("{} prompt files written to '{}'", count, config.output_dir.display());
        Ok(count)
    }
}

/// Reads one path per line, sorted. Blank lines are skipped.
pub fn read_file_list(list_file: &Path) -> Result<Vec<PathBuf>> {
    let reader = BufReader::new(
        fs::File::open(list_file)
            .with_context(|| format!("failed to open '{}'", list_file.display()))?,
    );
    let mut files: Vec<PathBuf> = reader
        .lines()
        .filter_map(|line| match line {
            Ok(line) => {
                let line = line.trim();
                (!line.is_empty()).then(|| Ok(PathBuf::from(line)))
            }
            Err(err) => Some(Err(err)),
        })
        .try_collect()?;
    files.sort();
    Ok(files)
}

/// `{output_dir}/{file stem}.npy`
pub fn prompt_file(output_dir: &Path, file: &Path) -> Result<PathBuf> {
    let stem = file
        .file_stem()
        .ok_or_else(|| format_err!("'{}' has no file name", file.display()))?;
    let mut output_file = output_dir.join(stem);
    output_file.set_extension("npy");
    Ok(output_file)
}

fn predict_prompts<D>(
    model: &mut D,
    postprocess: &dyn BoxPostProcess,
    config: &PromptConfig,
    path: &Path,
) -> Result<Tensor>
where
    D: Detector + ?Sized,
{
    let PromptConfig {
        image_size: [height, width],
        score_threshold,
        device,
        ..
    } = *config;

    let (image, _orig_size) = data::load_image(path, [height, width])?;
    let samples = NestedTensor::from_tensor_list(&[image])?.to_device(device);
    let output = model.forward_t(&samples, false, false)?;

    let target_sizes = Tensor::of_slice(&[height, width])
        .view([1, 2])
        .to_device(device);
    let detections = postprocess.forward(&output.one2one, &target_sizes)?;
    let detections = detections
        .into_iter()
        .next()
        .ok_or_else(|| format_err!("no detections for '{}'", path.display()))?;

    Ok(detections.to_prompts(score_threshold.raw(), [height, width]))
}

fn write_prompts(output_file: &Path, prompts: &Tensor) -> Result<()> {
    let (num_rows, num_cols) = prompts.size2()?;
    let values = Vec::<f64>::from(&prompts.to_device(Device::Cpu).contiguous().view([-1]));
    let array = Array2::from_shape_vec((num_rows as usize, num_cols as usize), values)?;
    ndarray_npy::write_npy(output_file, &array)
        .with_context(|| format!("failed to write '{}'", output_file.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_list_is_sorted_and_skips_blank_lines() -> Result<()> {
        let dir = std::env::temp_dir().join("hdetr-prompt-list-test");
        utils::create_dir_idempotent(&dir)?;
        let list_file = dir.join("files.txt");
        fs::write(&list_file, "images/b.png\n\n  images/a.png  \n")?;

        let files = read_file_list(&list_file)?;
        assert_eq!(
            files,
            vec![PathBuf::from("images/a.png"), PathBuf::from("images/b.png")]
        );
        Ok(())
    }

    #[test]
    fn prompt_file_uses_the_stem() -> Result<()> {
        let output_file = prompt_file(Path::new("out"), Path::new("fold1/images/1_23.png"))?;
        assert_eq!(output_file, Path::new("out").join("1_23.npy"));
        Ok(())
    }

    #[test]
    fn write_prompt_array() -> Result<()> {
        let dir = std::env::temp_dir().join("hdetr-prompt-write-test");
        utils::create_dir_idempotent(&dir)?;
        let output_file = dir.join("a.npy");
        let prompts = Tensor::of_slice(&[0.0f64, 255.0, 10.0, 255.0, 2.0]).view([1, 5]);

        write_prompts(&output_file, &prompts)?;
        let array: Array2<f64> = ndarray_npy::read_npy(&output_file)?;
        assert_eq!(array.shape(), &[1, 5]);
        assert_abs_diff_eq!(array[[0, 4]], 2.0);
        Ok(())
    }
}
