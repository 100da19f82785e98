use anyhow::{Context, Result};
use std::{env, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tracing::{info_span, Instrument};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};
use train::config::Config;

#[derive(Debug, Clone, StructOpt)]
/// Train and evaluate hybrid-matching DETR models
enum Args {
    /// Train the model
    Train {
        #[structopt(long, default_value = "train.json5")]
        /// configuration file
        config_file: PathBuf,
    },
    /// Evaluate the one-to-one branch on the validation split
    Eval {
        #[structopt(long, default_value = "train.json5")]
        /// configuration file
        config_file: PathBuf,
    },
    /// Export box prompts for the listed images
    ExportPrompts {
        #[structopt(long, default_value = "train.json5")]
        /// configuration file
        config_file: PathBuf,
    },
}

fn load_config(config_file: &PathBuf) -> Result<Arc<Config>> {
    let config = Config::open(config_file)
        .with_context(|| format!("failed to load config file '{}'", config_file.display()))?;
    Ok(Arc::new(config))
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        let filter = if let Err(_) = env::var("RUST_LOG") {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        };
        filter
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse arguments
    match Args::from_args() {
        Args::Train { config_file } => {
            let config = load_config(&config_file)?;
            train::start(config).instrument(info_span!("train")).await?;
        }
        Args::Eval { config_file } => {
            let config = load_config(&config_file)?;
            train::start_eval(config)
                .instrument(info_span!("eval"))
                .await?;
        }
        Args::ExportPrompts { config_file } => {
            let config = load_config(&config_file)?;
            train::export_prompts(config)
                .instrument(info_span!("export_prompts"))
                .await?;
        }
    }

    Ok(())
}
