//! Evaluation of the one-to-one branch.

use crate::common::*;
use hdetr::loss::LossSummary;

/// The statistics of one evaluation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct EvalStats {
    /// Worker-averaged losses and `class_error`.
    #[serde(flatten)]
    pub metrics: IndexMap<String, f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coco_eval_bbox: Option<Vec<f64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub coco_eval_masks: Option<Vec<f64>>,
    #[serde(rename = "PQ_all", skip_serializing_if = "Option::is_none")]
    pub pq_all: Option<PqStats>,
    #[serde(rename = "PQ_th", skip_serializing_if = "Option::is_none")]
    pub pq_things: Option<PqStats>,
    #[serde(rename = "PQ_st", skip_serializing_if = "Option::is_none")]
    pub pq_stuff: Option<PqStats>,
}

impl EvalStats {
    /// Flattens the statistics into a JSON object with prefixed keys.
    pub fn to_prefixed_json(&self, prefix: &str) -> Result<serde_json::Map<String, serde_json::Value>> {
        let value = serde_json::to_value(self)?;
        let object = match value {
            serde_json::Value::Object(object) => object,
            _ => bail!("evaluation statistics must serialize to an object"),
        };
        Ok(object
            .into_iter()
            .map(|(key, value)| (format!("{}{}", prefix, key), value))
            .collect())
    }
}

/// The components an evaluation pass reads.
pub struct EvalContext<'a, D, C>
where
    D: Detector + ?Sized,
    C: Criterion + ?Sized,
{
    pub model: &'a mut D,
    pub criterion: &'a mut C,
    pub postprocessors: &'a PostProcessors,
    pub group: &'a dyn ProcessGroup,
    pub print_freq: usize,
}

/// Evaluates the one-to-one branch over `batches`.
///
/// The model is narrowed to its one-to-one queries for the duration of the
/// call. The query configuration is restored before returning, whether the
/// pass succeeds or not. Returns the statistics and the detection evaluator
/// for further reporting.
pub fn evaluate<D, C, I>(
    ctx: EvalContext<'_, D, C>,
    batches: I,
    num_batches: usize,
    mut detection_evaluator: Option<Box<dyn DetectionEvaluator>>,
    mut panoptic_evaluator: Option<Box<dyn PanopticEvaluator>>,
) -> Result<(EvalStats, Option<Box<dyn DetectionEvaluator>>)>
where
    D: Detector + ?Sized,
    C: Criterion + ?Sized,
    I: IntoIterator<Item = Result<Batch>>,
{
    let EvalContext {
        model,
        criterion,
        postprocessors,
        group,
        print_freq,
    } = ctx;
    ensure!(
        postprocessors.panoptic.is_none() || panoptic_evaluator.is_some(),
        "a panoptic postprocessor requires a panoptic evaluator"
    );

    let mut model = QueryConfigGuard::narrow_to_one2one(model)?;
    let result = tch::no_grad(|| {
        let pass = EvalPass {
            criterion,
            postprocessors,
            group,
            print_freq,
        };
        pass.run(
            &mut *model,
            batches,
            num_batches,
            detection_evaluator
                .as_mut()
                .map(|evaluator| evaluator.as_mut() as &mut dyn DetectionEvaluator),
            panoptic_evaluator
                .as_mut()
                .map(|evaluator| evaluator.as_mut() as &mut dyn PanopticEvaluator),
        )
    });
    let restored = model.restore();
    let stats = result?;
    restored?;

    Ok((stats, detection_evaluator))
}

struct EvalPass<'a, C>
where
    C: Criterion + ?Sized,
{
    criterion: &'a mut C,
    postprocessors: &'a PostProcessors,
    group: &'a dyn ProcessGroup,
    print_freq: usize,
}

impl<'a, C> EvalPass<'a, C>
where
    C: Criterion + ?Sized,
{
    fn run<D, I>(
        self,
        model: &mut D,
        batches: I,
        num_batches: usize,
        mut detection_evaluator: Option<&mut dyn DetectionEvaluator>,
        mut panoptic_evaluator: Option<&mut dyn PanopticEvaluator>,
    ) -> Result<EvalStats>
    where
        D: Detector + ?Sized,
        I: IntoIterator<Item = Result<Batch>>,
    {
        let Self {
            criterion,
            postprocessors,
            group,
            print_freq,
        } = self;

        let metric_logger = MetricLogger::new("  ");
        metric_logger.add_meter(CLASS_ERROR, SmoothedValue::latest(2));
        let mut batches = batches.into_iter();

        for _ in metric_logger.log_every(0..num_batches, print_freq, "Test:") {
            let batch = match batches.next() {
                Some(batch) => batch?,
                None => break,
            };

            let output = model.forward_t(&batch.samples, false, false)?;
            let loss_dict = criterion.forward(&output.one2one, &batch.targets)?;
            LossSummary::reduce(group, &loss_dict, criterion.weight_dict())?
                .log_to(&metric_logger);

            let image_ids: Vec<i64> = batch.targets.iter().map(|target| target.image_id).collect();
            let orig_target_sizes = batch.orig_target_sizes();
            let mut results = postprocessors
                .bbox
                .forward(&output.one2one, &orig_target_sizes)?;
            if let Some(segm) = &postprocessors.segm {
                let target_sizes = batch.target_sizes();
                results = segm.forward(results, &output.one2one, &orig_target_sizes, &target_sizes)?;
            }

            if let Some(evaluator) = detection_evaluator.as_deref_mut() {
                let res: IndexMap<i64, Detections> =
                    image_ids.iter().cloned().zip(results).collect();
                evaluator.update(res)?;
            }

            if let (Some(panoptic), Some(evaluator)) =
                (&postprocessors.panoptic, panoptic_evaluator.as_deref_mut())
            {
                let target_sizes = batch.target_sizes();
                let predictions =
                    panoptic.forward(&output.one2one, &target_sizes, &orig_target_sizes)?;
                let records: Vec<_> = izip!(image_ids, predictions)
                    .map(|(image_id, prediction)| PanopticRecord::new(image_id, prediction))
                    .collect();
                evaluator.update(records)?;
            }
        }

        metric_logger.synchronize_between_processes(group)?;
        info!("Averaged stats: {}", metric_logger);

        if let Some(evaluator) = detection_evaluator.as_deref_mut() {
            evaluator.synchronize_between_processes(group)?;
        }
        if let Some(evaluator) = panoptic_evaluator.as_deref_mut() {
            evaluator.synchronize_between_processes(group)?;
        }

        let mut stats = EvalStats {
            metrics: metric_logger.global_averages(),
            ..Default::default()
        };

        if let Some(evaluator) = detection_evaluator {
            evaluator.accumulate()?;
            evaluator.summarize()?;
            stats.coco_eval_bbox = evaluator.stats(IouType::Bbox);
            if postprocessors.segm.is_some() {
                stats.coco_eval_masks = evaluator.stats(IouType::Segm);
            }
        }

        if let Some(evaluator) = panoptic_evaluator {
            let PanopticSummary {
                all,
                things,
                stuff,
            } = evaluator.summarize()?;
            stats.pq_all = Some(all);
            stats.pq_things = Some(things);
            stats.pq_stuff = Some(stuff);
        }

        Ok(stats)
    }
}
