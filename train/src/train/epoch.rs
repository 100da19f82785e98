use crate::{common::*, telemetry::TelemetrySink};
use hdetr::loss::LossSummary;

/// Everything a training step mutates or reads.
pub struct TrainingContext<'a, D, C>
where
    D: Detector + ?Sized,
    C: Criterion + ?Sized,
{
    pub model: &'a mut D,
    pub criterion: &'a mut C,
    pub hybrid_loss: &'a HybridLoss,
    pub optimizer: &'a mut nn::Optimizer,
    /// The trainable variables of the model.
    pub vars: &'a [Tensor],
    pub precision: &'a mut dyn PrecisionPolicy,
    pub group: &'a dyn ProcessGroup,
    /// Gradient clipping threshold. Non-positive values disable clipping.
    pub max_norm: f64,
    pub lr: f64,
    pub print_freq: usize,
    pub telemetry: Option<&'a mut dyn TelemetrySink>,
}

/// The loggable results of one optimization step.
#[derive(Debug, Clone)]
pub struct StepOutput {
    pub summary: LossSummary,
    /// The local losses before worker reduction.
    pub raw_losses: IndexMap<String, f64>,
    /// The gradient norm before clipping.
    pub grad_norm: f64,
    /// False if the step was skipped by the loss scaler.
    pub stepped: bool,
}

/// Runs one pass over `batches` and returns the worker-averaged metrics.
///
/// At most `num_batches` batches are consumed. The loop stops early when
/// the batch stream ends. Every worker must call this function with the
/// same `num_batches`.
pub fn train_one_epoch<D, C, I>(
    mut ctx: TrainingContext<'_, D, C>,
    batches: I,
    num_batches: usize,
    epoch: usize,
) -> Result<IndexMap<String, f64>>
where
    D: Detector + ?Sized,
    C: Criterion + ?Sized,
    I: IntoIterator<Item = Result<Batch>>,
{
    let metric_logger = MetricLogger::new("  ");
    metric_logger.add_meter("lr", SmoothedValue::latest(6));
    metric_logger.add_meter(CLASS_ERROR, SmoothedValue::latest(2));
    metric_logger.add_meter("grad_norm", SmoothedValue::latest(2));
    let header = format!("Epoch: [{}]", epoch);

    let mut batches = batches.into_iter();

    for step in metric_logger.log_every(0..num_batches, ctx.print_freq, header) {
        let batch = match batches.next() {
            Some(batch) => batch?,
            None => break,
        };

        let StepOutput {
            summary,
            raw_losses,
            grad_norm,
            ..
        } = train_step(&mut ctx, &batch)?;

        summary.log_to(&metric_logger);
        metric_logger.update("lr", ctx.lr);
        metric_logger.update("grad_norm", grad_norm);

        if let Some(sink) = ctx.telemetry.as_deref_mut() {
            let global_step = (epoch * num_batches + step) as i64;
            crate::telemetry::log_best_effort(sink, global_step, &raw_losses);
        }
    }

    metric_logger.synchronize_between_processes(ctx.group)?;
    info!("Averaged stats: {}", metric_logger);

    Ok(metric_logger.global_averages())
}

/// Runs forward, backward and optimizer step on one batch.
///
/// The process exits if the worker-averaged loss is not finite.
pub fn train_step<D, C>(ctx: &mut TrainingContext<'_, D, C>, batch: &Batch) -> Result<StepOutput>
where
    D: Detector + ?Sized,
    C: Criterion + ?Sized,
{
    let TrainingContext {
        ref mut model,
        ref mut criterion,
        hybrid_loss,
        ref mut optimizer,
        vars,
        ref mut precision,
        group,
        max_norm,
        ..
    } = *ctx;
    let mut timing = Timing::new("train_step");

    precision.before_forward(optimizer);
    let output = model.forward_t(&batch.samples, true, precision.autocast())?;
    timing.set_record("forward");

    let loss_dict = hybrid_loss.forward(&mut **criterion, &output, &batch.targets)?;
    let weight_dict = criterion.weight_dict();
    let losses = loss::weighted_sum(&loss_dict, weight_dict)?;
    timing.set_record("loss");

    let summary = LossSummary::reduce(group, &loss_dict, weight_dict)?;
    if let Err(err) = summary.ensure_finite() {
        error!("{:#}", err);
        std::process::exit(1);
    }

    precision.backward(optimizer, &losses);
    distributed::average_gradients(group, vars)?;
    precision.unscale(vars);
    timing.set_record("backward");

    let grad_norm = if max_norm > 0.0 {
        precision::clip_grad_norm(vars, max_norm)
    } else {
        precision::total_grad_norm(vars)
    };
    let stepped = precision.step(optimizer, vars);
    timing.set_record("step");
    timing.report();

    Ok(StepOutput {
        summary,
        raw_losses: loss::loss_values(&loss_dict),
        grad_norm,
        stepped,
    })
}
