//! Training program configuration format.

use crate::common::*;

pub use criterion::*;
pub use dataset::*;
pub use evaluation::*;
pub use model::*;
pub use prompts::*;
pub use training::*;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub criterion: CriterionConfig,
    pub dataset: DatasetConfig,
    pub logging: LoggingConfig,
    pub training: TrainingConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,
    /// Box prompt exporting options.
    pub prompts: Option<PromptConfig>,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config: Self = json5::from_str(&text)?;
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        ensure!(
            !self.training.devices.is_empty(),
            "at least one training device must be specified"
        );
        ensure!(
            self.training.print_freq > 0,
            "print_freq must be positive"
        );
        ensure!(
            self.evaluation.batch_size > 0,
            "evaluation batch_size must be positive"
        );
        ensure!(
            self.criterion
                .weight_dict
                .keys()
                .any(|name| !name.ends_with(loss::ONE2MANY_SUFFIX)),
            "the weight dict must weight at least one one-to-one loss"
        );
        Ok(())
    }
}

mod model {
    use super::*;

    /// The TorchScript detector options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        pub module_file: PathBuf,
        pub num_queries_one2one: usize,
        /// The number of extra queries trained with one-to-many matching.
        pub num_queries_one2many: usize,
    }
}

mod criterion {
    use super::*;

    /// The TorchScript criterion options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CriterionConfig {
        pub module_file: PathBuf,
        /// Loss name to coefficient. Losses not listed here are logged only.
        pub weight_dict: IndexMap<String, R64>,
    }

    impl CriterionConfig {
        pub fn weight_dict(&self) -> WeightDict {
            self.weight_dict
                .iter()
                .map(|(name, weight)| (name.clone(), weight.raw()))
                .collect()
        }
    }
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
    /// Write raw losses to TensorBoard event files.
    #[serde(default)]
    pub enable_events: bool,
}

mod dataset {
    use super::*;

    /// Microsoft COCO dataset options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DatasetConfig {
        /// The directory containing `annotations/`, `train2017/` and
        /// `val2017/`.
        pub dataset_dir: PathBuf,
        /// The side length images are resized to.
        pub image_size: NonZeroUsize,
        #[serde(default = "default_seed")]
        pub seed: u64,
    }

    fn default_seed() -> u64 {
        42
    }
}

mod training {
    use super::*;

    /// The training options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TrainingConfig {
        pub epochs: NonZeroUsize,
        /// The batch size per device.
        pub batch_size: NonZeroUsize,
        /// Learning rate scheduling strategy.
        pub lr_schedule: LearningRateSchedule,
        /// The weight decay parameter for optimizer.
        pub weight_decay: R64,
        /// Gradient clipping threshold. Zero disables clipping.
        #[serde(default = "default_max_norm")]
        pub max_norm: R64,
        /// Target replication factor of the one-to-many branch. Zero
        /// disables the branch.
        pub k_one2many: usize,
        pub lambda_one2many: R64,
        /// Run forward passes in reduced precision with loss scaling.
        #[serde(default)]
        pub fp16: bool,
        /// One data-parallel worker is started per device.
        #[serde(with = "serde_vec_device", default = "default_devices")]
        pub devices: Vec<Device>,
        /// Checkpoint file loading method.
        pub load_checkpoint: LoadCheckpoint,
        /// Print progress every this number of steps.
        #[serde(default = "default_print_freq")]
        pub print_freq: usize,
    }

    fn default_max_norm() -> R64 {
        r64(0.1)
    }

    fn default_print_freq() -> usize {
        10
    }

    fn default_devices() -> Vec<Device> {
        vec![Device::Cpu]
    }

    /// The learning rate scheduling strategy, keyed by epoch.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LearningRateSchedule {
        /// Use constant learning rate.
        Constant { lr: R64 },
        /// Switch to a learning rate from the specified epoch on.
        StepWise { steps: Vec<(usize, R64)> },
    }

    /// Checkpoint file loading method.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(tag = "type")]
    pub enum LoadCheckpoint {
        /// Disable checkpoint file loading.
        Disabled,
        /// Load the most recent checkpoint file.
        FromRecent,
        /// Load the checkpoint file at specified path.
        FromFile { file: PathBuf },
    }
}

mod evaluation {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct EvaluationConfig {
        /// The number of detections kept per image.
        pub num_select: i64,
        /// The batch size per device.
        pub batch_size: usize,
    }

    impl Default for EvaluationConfig {
        fn default() -> Self {
            Self {
                num_select: 100,
                batch_size: 1,
            }
        }
    }
}

mod prompts {
    use super::*;

    /// Box prompt exporting options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct PromptConfig {
        /// Image paths in the file lists are relative to this directory.
        pub image_dir: PathBuf,
        /// Text files listing one image path per line.
        pub test_files: PathBuf,
        pub val_files: PathBuf,
        pub output_dir: PathBuf,
        #[serde(default = "default_score_threshold")]
        pub score_threshold: R64,
        /// The `[height, width]` of the exported images.
        #[serde(default = "default_prompt_image_size")]
        pub image_size: [i64; 2],
        #[serde(with = "tch_serde::serde_device", default = "default_prompt_device")]
        pub device: Device,
    }

    fn default_prompt_device() -> Device {
        Device::Cpu
    }

    fn default_score_threshold() -> R64 {
        r64(0.33)
    }

    fn default_prompt_image_size() -> [i64; 2] {
        [256, 256]
    }
}

mod serde_vec_device {
    use super::*;

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    struct DeviceWrapper(#[serde(with = "tch_serde::serde_device")] Device);

    pub fn serialize<S>(devices: &[Device], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let devices: Vec<_> = devices.iter().cloned().map(DeviceWrapper).collect();
        devices.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<Device>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let devices = Vec::<DeviceWrapper>::deserialize(deserializer)?;
        let devices: Vec<_> = devices
            .into_iter()
            .map(|DeviceWrapper(device)| device)
            .collect();
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE: &str = r#"{
        model: {
            module_file: "hdetr.pt",
            num_queries_one2one: 300,
            num_queries_one2many: 1500,
        },
        criterion: {
            module_file: "criterion.pt",
            weight_dict: { loss_ce: 2.0, loss_bbox: 5.0, loss_ce_one2many: 2.0 },
        },
        dataset: { dataset_dir: "coco", image_size: 800 },
        logging: { dir: "runs" },
        training: {
            epochs: 12,
            batch_size: 2,
            lr_schedule: { type: "StepWise", steps: [[0, 2e-4], [11, 2e-5]] },
            weight_decay: 1e-4,
            k_one2many: 6,
            lambda_one2many: 1.0,
            load_checkpoint: { type: "Disabled" },
        },
    }"#;

    #[test]
    fn parse_example_config() -> Result<()> {
        let config: Config = json5::from_str(EXAMPLE)?;
        config.check()?;

        assert_eq!(config.training.devices, vec![Device::Cpu]);
        assert_eq!(config.training.print_freq, 10);
        assert_abs_diff_eq!(config.training.max_norm.raw(), 0.1);
        assert_eq!(config.evaluation.num_select, 100);
        assert!(config.prompts.is_none());
        assert_eq!(
            config.criterion.weight_dict().keys().collect_vec(),
            vec!["loss_ce", "loss_bbox", "loss_ce_one2many"]
        );
        Ok(())
    }
}
