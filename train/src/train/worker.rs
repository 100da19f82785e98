use super::*;
use crate::{
    common::*,
    config::{Config, TrainingConfig},
    data::{DataLoader, DataLoaderInit, RandomAccessDataset},
    evaluate::{evaluate, EvalContext, EvalStats},
    prefetch::Prefetcher,
    prompt::PromptExporter,
    telemetry::{EventSink, TelemetrySink},
    utils::{self, LrScheduler},
};

const DUMMY_LR: f64 = 1.0;

/// The datasets shared by all workers.
#[derive(Debug, Clone)]
pub struct Datasets {
    pub train: Arc<dyn RandomAccessDataset>,
    pub val: Arc<dyn RandomAccessDataset>,
}

/// The detector, criterion and postprocessors of one worker.
struct WorkerModel {
    vs: nn::VarStore,
    model: JitDetector,
    criterion: JitCriterion,
    postprocessors: PostProcessors,
}

impl WorkerModel {
    fn new(config: &Config, device: Device) -> Result<Self> {
        let vs = nn::VarStore::new(device);
        let model = JitDetectorInit {
            module_file: config.model.module_file.clone(),
            num_queries_one2one: config.model.num_queries_one2one as i64,
            num_queries_one2many: config.model.num_queries_one2many as i64,
        }
        .build(vs.root())?;
        let criterion = JitCriterion::load(
            &config.criterion.module_file,
            config.criterion.weight_dict(),
        )?;
        let postprocessors = PostProcessors::new(
            TopKPostProcessInit {
                num_select: config.evaluation.num_select,
            }
            .build()?,
        );

        Ok(Self {
            vs,
            model,
            criterion,
            postprocessors,
        })
    }

    /// Returns the epoch recorded in the loaded checkpoint.
    fn load_checkpoint(&mut self, config: &Config) -> Result<Option<usize>> {
        utils::try_load_checkpoint(
            &mut self.vs,
            &config.logging.dir,
            &config.training.load_checkpoint,
        )
    }
}

fn val_loader(
    config: &Config,
    dataset: Arc<dyn RandomAccessDataset>,
    group: &dyn ProcessGroup,
) -> Result<Arc<DataLoader>> {
    let loader = DataLoaderInit {
        batch_size: config.evaluation.batch_size,
        shuffle: false,
        drop_last: false,
        seed: config.dataset.seed,
        rank: group.rank(),
        world_size: group.world_size(),
    }
    .build(dataset)?;
    Ok(Arc::new(loader))
}

fn run_evaluation(
    worker: &mut WorkerModel,
    config: &Config,
    loader: &Arc<DataLoader>,
    group: &dyn ProcessGroup,
    device: Device,
    output_file: PathBuf,
) -> Result<EvalStats> {
    let WorkerModel {
        model,
        criterion,
        postprocessors,
        ..
    } = worker;
    let batches = Prefetcher::new(loader.clone().iter_epoch(0), device);
    let dumper: Box<dyn DetectionEvaluator> = Box::new(DetectionDumper::new(output_file));

    let (stats, _) = evaluate(
        EvalContext {
            model,
            criterion,
            postprocessors,
            group,
            print_freq: config.training.print_freq,
        },
        batches,
        loader.num_batches(),
        Some(dumper),
        None,
    )?;
    Ok(stats)
}

/// Trains on `device` as one member of `group`.
pub fn training_worker(
    config: Arc<Config>,
    output_dir: Arc<PathBuf>,
    datasets: Datasets,
    group: LocalGroup,
    device: Device,
) -> Result<()> {
    let rank = group.rank();
    let is_main_process = group.is_main_process();
    info!("worker {} uses device {:?}", rank, device);

    let TrainingConfig {
        epochs,
        batch_size,
        ref lr_schedule,
        weight_decay,
        max_norm,
        k_one2many,
        lambda_one2many,
        fp16,
        print_freq,
        ..
    } = config.training;

    // init model
    let mut worker = WorkerModel::new(&config, device)?;
    let hybrid_loss = HybridLossInit {
        k_one2many,
        lambda_one2many,
    }
    .build()?;
    let mut optimizer = nn::AdamW {
        beta1: 0.9,
        beta2: 0.999,
        wd: weight_decay.raw(),
    }
    .build(&worker.vs, DUMMY_LR)?;
    let mut precision: Box<dyn PrecisionPolicy> = if fp16 {
        Box::new(MixedPrecision::new(GradScalerInit::default().build()?))
    } else {
        Box::new(FullPrecision)
    };
    let lr_scheduler = LrScheduler::new(lr_schedule)?;

    let start_epoch = worker
        .load_checkpoint(&config)?
        .map(|epoch| epoch + 1)
        .unwrap_or(0);

    // init data
    let train_loader = Arc::new(
        DataLoaderInit {
            batch_size: batch_size.get(),
            shuffle: true,
            drop_last: true,
            seed: config.dataset.seed,
            rank,
            world_size: group.world_size(),
        }
        .build(datasets.train.clone())?,
    );
    let val_loader = val_loader(&config, datasets.val.clone(), &group)?;

    let mut event_sink = if config.logging.enable_events && is_main_process {
        Some(EventSink::new(&output_dir.join("events"), "train")?)
    } else {
        None
    };
    let checkpoint_dir = output_dir.join("checkpoints");
    let log_file = output_dir.join("log.txt");

    info!("start training from epoch {}", start_epoch);

    for epoch in start_epoch..epochs.get() {
        let lr = lr_scheduler.lr(epoch);
        optimizer.set_lr(lr);
        let vars = worker.vs.trainable_variables();

        let train_stats = {
            let batches = Prefetcher::new(train_loader.clone().iter_epoch(epoch), device);
            train_one_epoch(
                TrainingContext {
                    model: &mut worker.model,
                    criterion: &mut worker.criterion,
                    hybrid_loss: &hybrid_loss,
                    optimizer: &mut optimizer,
                    vars: &vars,
                    precision: precision.as_mut(),
                    group: &group,
                    max_norm: max_norm.raw(),
                    lr,
                    print_freq,
                    telemetry: event_sink
                        .as_mut()
                        .map(|sink| sink as &mut dyn TelemetrySink),
                },
                batches,
                train_loader.num_batches(),
                epoch,
            )?
        };

        if is_main_process {
            utils::save_checkpoint(&worker.vs, &checkpoint_dir, epoch)?;
        }

        let output_file = output_dir
            .join("eval")
            .join(format!("bbox_{:04}.json", epoch));
        let test_stats =
            run_evaluation(&mut worker, &config, &val_loader, &group, device, output_file)?;

        if is_main_process {
            append_log_line(&log_file, epoch, &train_stats, &test_stats)?;
        }
    }

    info!("worker {} finished", rank);
    Ok(())
}

/// Evaluates the configured checkpoint on `device` as one member of
/// `group`.
pub fn evaluation_worker(
    config: Arc<Config>,
    output_dir: Arc<PathBuf>,
    val_set: Arc<dyn RandomAccessDataset>,
    group: LocalGroup,
    device: Device,
) -> Result<EvalStats> {
    let mut worker = WorkerModel::new(&config, device)?;
    if worker.load_checkpoint(&config)?.is_none() {
        warn!("evaluating a model without a loaded checkpoint");
    }

    let val_loader = val_loader(&config, val_set, &group)?;
    let output_file = output_dir.join("eval").join("bbox.json");
    let stats = run_evaluation(&mut worker, &config, &val_loader, &group, device, output_file)?;

    if group.is_main_process() {
        info!("{}", serde_json::to_string(&stats)?);
    }
    Ok(stats)
}

/// Exports box prompts with the configured checkpoint.
pub fn prompt_worker(config: Arc<Config>) -> Result<usize> {
    let prompt_config = config
        .prompts
        .as_ref()
        .ok_or_else(|| format_err!("the 'prompts' section is missing in the config"))?;

    let mut worker = WorkerModel::new(&config, prompt_config.device)?;
    if worker.load_checkpoint(&config)?.is_none() {
        warn!("exporting prompts without a loaded checkpoint");
    }

    PromptExporter {
        model: &mut worker.model,
        postprocess: worker.postprocessors.bbox.as_ref(),
        config: prompt_config,
    }
    .run()
}

fn append_log_line(
    log_file: &Path,
    epoch: usize,
    train_stats: &IndexMap<String, f64>,
    test_stats: &EvalStats,
) -> Result<()> {
    let mut line: serde_json::Map<String, serde_json::Value> = train_stats
        .iter()
        .map(|(name, &value)| (format!("train_{}", name), value.into()))
        .collect();
    line.extend(test_stats.to_prefixed_json("test_")?);
    line.insert("epoch".into(), epoch.into());

    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)
        .with_context(|| format!("failed to open '{}'", log_file.display()))?;
    writeln!(file, "{}", serde_json::Value::Object(line))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_lines_are_appended() -> Result<()> {
        let dir = std::env::temp_dir().join("hdetr-worker-log-test");
        utils::create_dir_idempotent(&dir)?;
        let log_file = dir.join("log.txt");
        if log_file.exists() {
            fs::remove_file(&log_file)?;
        }

        let train_stats: IndexMap<String, f64> = [("loss".to_string(), 1.5)].into_iter().collect();
        let test_stats = EvalStats {
            metrics: [("loss".to_string(), 2.5)].into_iter().collect(),
            coco_eval_bbox: Some(vec![0.1, 0.2]),
            ..Default::default()
        };
        append_log_line(&log_file, 0, &train_stats, &test_stats)?;
        append_log_line(&log_file, 1, &train_stats, &test_stats)?;

        let text = fs::read_to_string(&log_file)?;
        let lines: Vec<serde_json::Value> = text
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 1);
        assert_eq!(lines[0]["train_loss"], 1.5);
        assert_eq!(lines[0]["test_loss"], 2.5);
        assert_eq!(lines[0]["test_coco_eval_bbox"][1], 0.2);
        assert!(lines[0].get("test_PQ_all").is_none());
        Ok(())
    }
}
