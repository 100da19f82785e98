//! The training program for the hdetr project.

pub mod common;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod prefetch;
pub mod prompt;
pub mod telemetry;
pub mod train;
pub mod utils;

use crate::{
    common::*,
    config::Config,
    data::{CocoDetection, RandomAccessDataset},
    train::Datasets,
};

/// Creates a timestamped output directory and saves the config in it.
async fn prepare_output_dir(config: &Config) -> Result<Arc<PathBuf>> {
    let start_time = Local::now();
    let output_dir = config
        .logging
        .dir
        .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));

    tokio::fs::create_dir_all(&output_dir).await?;
    tokio::fs::create_dir_all(output_dir.join("checkpoints")).await?;
    let path = output_dir.join("config.json5");
    let text = serde_json::to_string_pretty(config)?;
    tokio::fs::write(&path, text).await?;

    info!("output directory '{}'", output_dir.display());
    Ok(Arc::new(output_dir))
}

async fn load_split(
    config: &Arc<Config>,
    split: &'static str,
) -> Result<Arc<dyn RandomAccessDataset>> {
    let config = config.clone();
    let dataset = tokio::task::spawn_blocking(move || {
        CocoDetection::load(
            &config.dataset.dataset_dir,
            split,
            config.dataset.image_size.get(),
        )
    })
    .await??;
    Ok(Arc::new(dataset))
}

/// Runs `worker` once per configured device, each in its own blocking
/// thread, and waits for all of them.
async fn spawn_workers<T, F>(devices: &[Device], worker: F) -> Result<Vec<T>>
where
    T: Send + 'static,
    F: Fn(LocalGroup, Device) -> Result<T> + Send + Sync + 'static,
{
    let groups = LocalGroup::new(devices.len())?;
    let worker = Arc::new(worker);

    let handles = izip!(groups, devices.iter().cloned()).map(|(group, device)| {
        let worker = worker.clone();
        tokio::task::spawn_blocking(move || worker(group, device))
            .map(|result| Fallible::Ok(result??))
    });
    future::try_join_all(handles).await
}

/// The entry of training program.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let output_dir = prepare_output_dir(&config).await?;

    info!("loading dataset");
    let datasets = Datasets {
        train: load_split(&config, "train").await?,
        val: load_split(&config, "val").await?,
    };

    let devices = config.training.devices.clone();
    info!("start {} training workers", devices.len());
    spawn_workers(&devices, move |group, device| {
        train::training_worker(
            config.clone(),
            output_dir.clone(),
            datasets.clone(),
            group,
            device,
        )
    })
    .await?;

    Ok(())
}

/// The entry of evaluation program.
pub async fn start_eval(config: Arc<Config>) -> Result<()> {
    let output_dir = prepare_output_dir(&config).await?;
    let val_set = load_split(&config, "val").await?;

    let devices = config.training.devices.clone();
    spawn_workers(&devices, move |group, device| {
        train::evaluation_worker(
            config.clone(),
            output_dir.clone(),
            val_set.clone(),
            group,
            device,
        )
    })
    .await?;

    Ok(())
}

/// The entry of box prompt exporting.
pub async fn export_prompts(config: Arc<Config>) -> Result<()> {
    let count = tokio::task::spawn_blocking(move || train::prompt_worker(config)).await??;
    info!("exported {} prompt files", count);
    Ok(())
}
