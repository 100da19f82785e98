//! Loss dictionaries and the one-to-one plus one-to-many combination.

use crate::{
    batch::Target,
    common::*,
    distributed::{self, ProcessGroup},
    metric::MetricLogger,
    model::{BranchOutput, DetectorOutput, Prediction},
};
use tch::{CModule, IValue};

pub use criterion::*;
pub use hybrid::*;
pub use jit_criterion::*;
pub use summary::*;

/// Loss name to scalar loss.
pub type LossDict = IndexMap<String, Tensor>;

/// Loss name to coefficient.
pub type WeightDict = IndexMap<String, f64>;

/// The suffix attached to losses computed on the one-to-many branch.
pub const ONE2MANY_SUFFIX: &str = "_one2many";

/// The entry every criterion emits for logging.
pub const CLASS_ERROR: &str = "class_error";

/// Sums `weight * loss` over the names present in both dictionaries.
pub fn weighted_sum(loss_dict: &LossDict, weight_dict: &WeightDict) -> Result<Tensor> {
    let mut terms = loss_dict.iter().filter_map(|(name, loss)| {
        let weight = *weight_dict.get(name)?;
        Some(loss * weight)
    });
    let first = terms.next().ok_or_else(|| {
        format_err!(
            "none of the losses {:?} has a weight",
            loss_dict.keys().collect::<Vec<_>>()
        )
    })?;
    Ok(terms.fold(first, |sum, term| sum + term))
}

/// Picks the weighted scalar entries.
pub fn scaled_losses(losses: &IndexMap<String, f64>, weight_dict: &WeightDict) -> IndexMap<String, f64> {
    losses
        .iter()
        .filter_map(|(name, &value)| {
            let weight = *weight_dict.get(name)?;
            Some((name.clone(), value * weight))
        })
        .collect()
}

/// Renames every entry to `<name>_unscaled`.
pub fn unscaled_losses(losses: &IndexMap<String, f64>) -> IndexMap<String, f64> {
    losses
        .iter()
        .map(|(name, &value)| (format!("{}_unscaled", name), value))
        .collect()
}

/// Detaches and copies a loss dictionary to host scalars.
pub fn loss_values(loss_dict: &LossDict) -> IndexMap<String, f64> {
    loss_dict
        .iter()
        .map(|(name, loss)| (name.clone(), f64::from(loss.detach())))
        .collect()
}

/// Adds `lambda * loss` of each one-to-many entry to `loss_dict` under the
/// suffixed name.
pub fn merge_one2many(loss_dict: &mut LossDict, one2many: LossDict, lambda: f64) {
    one2many.into_iter().for_each(|(name, loss)| {
        let key = format!("{}{}", name, ONE2MANY_SUFFIX);
        let scaled = loss * lambda;
        let merged = match loss_dict.remove(&key) {
            Some(prev) => prev + scaled,
            None => scaled,
        };
        loss_dict.insert(key, merged);
    });
}

mod summary {
    use super::*;

    /// Worker-averaged loss values prepared for logging.
    #[derive(Debug, Clone)]
    pub struct LossSummary {
        /// Every loss averaged over workers.
        pub reduced: IndexMap<String, f64>,
        /// The weighted entries.
        pub scaled: IndexMap<String, f64>,
        /// Every entry renamed to `<name>_unscaled`.
        pub unscaled: IndexMap<String, f64>,
        /// The sum of the weighted entries.
        pub total: f64,
        pub class_error: f64,
    }

    impl LossSummary {
        /// Averages `loss_dict` over the workers. Blocks until every worker
        /// arrives.
        pub fn reduce(
            group: &dyn ProcessGroup,
            loss_dict: &LossDict,
            weight_dict: &WeightDict,
        ) -> Result<Self> {
            let reduced = distributed::reduce_dict(group, &loss_values(loss_dict), true)?;
            let class_error = *reduced
                .get(CLASS_ERROR)
                .ok_or_else(|| format_err!("the criterion did not emit '{}'", CLASS_ERROR))?;
            let scaled = scaled_losses(&reduced, weight_dict);
            let unscaled = unscaled_losses(&reduced);
            let total = scaled.values().sum();

            Ok(Self {
                reduced,
                scaled,
                unscaled,
                total,
                class_error,
            })
        }

        /// Fails with the reduced losses if the total is not finite.
        pub fn ensure_finite(&self) -> Result<()> {
            ensure!(
                self.total.is_finite(),
                "Loss is {}, stopping training\n{:?}",
                self.total,
                self.reduced
            );
            Ok(())
        }

        /// Records `loss`, the scaled and unscaled entries and `class_error`.
        pub fn log_to(&self, metric_logger: &MetricLogger) {
            metric_logger.update("loss", self.total);
            metric_logger.update_many(&self.scaled);
            metric_logger.update_many(&self.unscaled);
            metric_logger.update(CLASS_ERROR, self.class_error);
        }
    }
}

mod criterion {
    use super::*;

    /// The matching-based set criterion.
    pub trait Criterion {
        /// Computes the losses of one query group, including its auxiliary
        /// layers. The output always contains [CLASS_ERROR].
        fn forward(&mut self, output: &BranchOutput, targets: &[Target]) -> Result<LossDict>;

        fn weight_dict(&self) -> &WeightDict;
    }
}

mod hybrid {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct HybridLossInit {
        /// Replication factor of targets for the one-to-many branch. Zero
        /// disables the branch.
        pub k_one2many: usize,
        pub lambda_one2many: R64,
    }

    impl HybridLossInit {
        pub fn build(self) -> Result<HybridLoss> {
            let Self {
                k_one2many,
                lambda_one2many,
            } = self;
            ensure!(
                lambda_one2many >= 0.0,
                "lambda_one2many must be non-negative"
            );

            Ok(HybridLoss {
                k_one2many,
                lambda_one2many: lambda_one2many.raw(),
            })
        }
    }

    /// Combines the one-to-one and one-to-many losses into one dictionary.
    #[derive(Debug, Clone)]
    pub struct HybridLoss {
        k_one2many: usize,
        lambda_one2many: f64,
    }

    impl HybridLoss {
        pub fn k_one2many(&self) -> usize {
            self.k_one2many
        }

        pub fn lambda_one2many(&self) -> f64 {
            self.lambda_one2many
        }

        pub fn forward<C>(
            &self,
            criterion: &mut C,
            output: &DetectorOutput,
            targets: &[Target],
        ) -> Result<LossDict>
        where
            C: Criterion + ?Sized,
        {
            let mut loss_dict = criterion.forward(&output.one2one, targets)?;
            if self.k_one2many == 0 {
                return Ok(loss_dict);
            }

            let one2many_output = output
                .one2many
                .as_ref()
                .ok_or_else(|| format_err!("the model did not emit one-to-many predictions"))?;
            let multi_targets: Vec<Target> = targets
                .iter()
                .map(|target| target.replicate(self.k_one2many))
                .try_collect()?;
            let one2many = criterion.forward(one2many_output, &multi_targets)?;
            merge_one2many(&mut loss_dict, one2many, self.lambda_one2many);

            Ok(loss_dict)
        }
    }
}

mod jit_criterion {
    use super::*;

    /// A TorchScript criterion.
    ///
    /// The scripted `forward(outputs, targets)` takes the prediction dict and
    /// a list of target dicts and returns a dict of scalar losses.
    #[derive(Debug)]
    pub struct JitCriterion {
        module: CModule,
        weight_dict: WeightDict,
    }

    impl JitCriterion {
        pub fn load(module_file: impl AsRef<Path>, weight_dict: WeightDict) -> Result<Self> {
            let module_file = module_file.as_ref();
            let module = CModule::load(module_file)
                .with_context(|| format!("failed to load '{}'", module_file.display()))?;
            ensure!(!weight_dict.is_empty(), "the weight dict must not be empty");
            Ok(Self {
                module,
                weight_dict,
            })
        }
    }

    impl Criterion for JitCriterion {
        fn forward(&mut self, output: &BranchOutput, targets: &[Target]) -> Result<LossDict> {
            let BranchOutput { pred, aux } = output;
            let mut outputs = prediction_entries(pred);
            outputs.push((
                IValue::String("aux_outputs".into()),
                IValue::GenericList(
                    aux.iter()
                        .map(|pred| IValue::GenericDict(prediction_entries(pred)))
                        .collect(),
                ),
            ));
            let targets = IValue::GenericList(targets.iter().map(target_to_ivalue).collect());

            let losses = self
                .module
                .forward_is(&[IValue::GenericDict(outputs), targets])?;
            let loss_dict: LossDict = match losses {
                IValue::GenericDict(entries) => entries
                    .into_iter()
                    .map(|entry| match entry {
                        (IValue::String(name), IValue::Tensor(loss)) => Ok((name, loss)),
                        (name, _) => bail!("the loss {:?} is not a tensor", name),
                    })
                    .try_collect()?,
                other => bail!("expect a dict of losses, but get {:?}", other),
            };
            ensure!(
                loss_dict.contains_key(CLASS_ERROR),
                "the criterion did not emit '{}'",
                CLASS_ERROR
            );

            Ok(loss_dict)
        }

        fn weight_dict(&self) -> &WeightDict {
            &self.weight_dict
        }
    }

    fn prediction_entries(pred: &Prediction) -> Vec<(IValue, IValue)> {
        vec![
            (
                IValue::String("pred_logits".into()),
                IValue::Tensor(pred.logits.shallow_clone()),
            ),
            (
                IValue::String("pred_boxes".into()),
                IValue::Tensor(pred.boxes.shallow_clone()),
            ),
        ]
    }

    fn target_to_ivalue(target: &Target) -> IValue {
        let device = target.boxes.device();
        let entry = |name: &str, tensor: Tensor| (IValue::String(name.into()), IValue::Tensor(tensor));

        IValue::GenericDict(vec![
            entry("boxes", target.boxes.shallow_clone()),
            entry("labels", target.labels.shallow_clone()),
            entry("image_id", Tensor::of_slice(&[target.image_id]).to_device(device)),
            entry("orig_size", Tensor::of_slice(&target.orig_size).to_device(device)),
            entry("size", Tensor::of_slice(&target.size).to_device(device)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(value: f64) -> Tensor {
        Tensor::from(value)
    }

    fn dict(entries: &[(&str, f64)]) -> LossDict {
        entries
            .iter()
            .map(|&(name, value)| (name.to_string(), scalar(value)))
            .collect()
    }

    #[test]
    fn weighted_sum_skips_unweighted_losses() -> Result<()> {
        let loss_dict = dict(&[("a", 2.0), ("b", 3.0)]);
        let weight_dict: WeightDict = [("a".to_string(), 1.0)].into_iter().collect();

        let sum = weighted_sum(&loss_dict, &weight_dict)?;
        assert_abs_diff_eq!(f64::from(sum), 2.0);

        let values = loss_values(&loss_dict);
        let scaled = scaled_losses(&values, &weight_dict);
        assert_eq!(scaled.keys().collect::<Vec<_>>(), vec!["a"]);
        let unscaled = unscaled_losses(&values);
        assert_abs_diff_eq!(unscaled["b_unscaled"], 3.0);
        Ok(())
    }

    #[test]
    fn weighted_sum_requires_a_weighted_loss() {
        let loss_dict = dict(&[("b", 3.0)]);
        let weight_dict: WeightDict = [("a".to_string(), 1.0)].into_iter().collect();
        assert!(weighted_sum(&loss_dict, &weight_dict).is_err());
    }

    #[test]
    fn merge_adds_suffixed_scaled_entries() {
        let mut loss_dict = dict(&[("loss_ce", 1.0), ("loss_bbox", 2.0)]);
        let one2many = dict(&[("loss_ce", 4.0), ("loss_bbox", 6.0)]);
        merge_one2many(&mut loss_dict, one2many, 0.5);

        let values = loss_values(&loss_dict);
        assert_eq!(
            values.keys().collect::<Vec<_>>(),
            vec![
                "loss_ce",
                "loss_bbox",
                "loss_ce_one2many",
                "loss_bbox_one2many"
            ]
        );
        assert_abs_diff_eq!(values["loss_ce"], 1.0);
        assert_abs_diff_eq!(values["loss_bbox"], 2.0);
        assert_abs_diff_eq!(values["loss_ce_one2many"], 2.0);
        assert_abs_diff_eq!(values["loss_bbox_one2many"], 3.0);
    }

    #[test]
    fn merge_accumulates_existing_suffixed_entries() {
        let mut loss_dict = dict(&[("loss_ce_one2many", 1.0)]);
        merge_one2many(&mut loss_dict, dict(&[("loss_ce", 4.0)]), 2.0);
        assert_abs_diff_eq!(f64::from(&loss_dict["loss_ce_one2many"]), 9.0);
    }

    #[test]
    fn summary_logs_scaled_and_unscaled_entries() -> Result<()> {
        use crate::distributed::SingleProcess;

        let loss_dict = dict(&[("a", 2.0), ("b", 3.0), (CLASS_ERROR, 50.0)]);
        let weight_dict: WeightDict = [("a".to_string(), 1.0)].into_iter().collect();
        let summary = LossSummary::reduce(&SingleProcess, &loss_dict, &weight_dict)?;

        assert_abs_diff_eq!(summary.total, 2.0);
        assert_abs_diff_eq!(summary.class_error, 50.0);
        summary.ensure_finite()?;

        let metric_logger = MetricLogger::default();
        summary.log_to(&metric_logger);
        let averages = metric_logger.global_averages();
        assert_eq!(
            averages.keys().collect::<Vec<_>>(),
            vec![
                "loss",
                "a",
                "a_unscaled",
                "b_unscaled",
                "class_error_unscaled",
                CLASS_ERROR
            ]
        );
        Ok(())
    }

    #[test]
    fn summary_detects_non_finite_total() -> Result<()> {
        use crate::distributed::SingleProcess;

        let loss_dict = dict(&[("a", f64::NAN), (CLASS_ERROR, 0.0)]);
        let weight_dict: WeightDict = [("a".to_string(), 1.0)].into_iter().collect();
        let summary = LossSummary::reduce(&SingleProcess, &loss_dict, &weight_dict)?;
        assert!(summary.ensure_finite().is_err());
        Ok(())
    }

    /// Reports the number of objects it was given as the loss.
    struct CountingCriterion {
        weight_dict: WeightDict,
    }

    impl Criterion for CountingCriterion {
        fn forward(&mut self, output: &BranchOutput, targets: &[Target]) -> Result<LossDict> {
            let num_objects: i64 = targets.iter().map(|target| target.num_objects()).sum();
            let queries = output.num_queries() as f64;
            Ok(dict(&[
                ("loss_ce", num_objects as f64),
                ("loss_queries", queries),
                (CLASS_ERROR, 0.0),
            ]))
        }

        fn weight_dict(&self) -> &WeightDict {
            &self.weight_dict
        }
    }

    fn branch(queries: i64) -> BranchOutput {
        BranchOutput {
            pred: Prediction {
                logits: Tensor::zeros(&[1, queries, 2], FLOAT_CPU),
                boxes: Tensor::zeros(&[1, queries, 4], FLOAT_CPU),
            },
            aux: vec![],
        }
    }

    fn target() -> Target {
        Target {
            boxes: Tensor::rand(&[2, 4], FLOAT_CPU),
            labels: Tensor::of_slice(&[1i64, 2]),
            image_id: 1,
            orig_size: [64, 64],
            size: [64, 64],
        }
    }

    #[test]
    fn hybrid_loss_feeds_replicated_targets_to_one2many_branch() -> Result<()> {
        let hybrid = HybridLossInit {
            k_one2many: 3,
            lambda_one2many: r64(0.5),
        }
        .build()?;
        let mut criterion = CountingCriterion {
            weight_dict: WeightDict::new(),
        };
        let output = DetectorOutput {
            one2one: branch(10),
            one2many: Some(branch(30)),
        };
        let targets = vec![target()];

        let values = loss_values(&hybrid.forward(&mut criterion, &output, &targets)?);
        assert_abs_diff_eq!(values["loss_ce"], 2.0);
        assert_abs_diff_eq!(values["loss_ce_one2many"], 3.0);
        assert_abs_diff_eq!(values["loss_queries"], 10.0);
        assert_abs_diff_eq!(values["loss_queries_one2many"], 15.0);
        assert_eq!(values.len(), 6);
        assert_eq!(targets[0].num_objects(), 2);
        Ok(())
    }

    #[test]
    fn hybrid_loss_without_one2many_queries() -> Result<()> {
        let hybrid = HybridLossInit {
            k_one2many: 0,
            lambda_one2many: r64(1.0),
        }
        .build()?;
        let mut criterion = CountingCriterion {
            weight_dict: WeightDict::new(),
        };
        let output = DetectorOutput {
            one2one: branch(10),
            one2many: None,
        };

        let loss_dict = hybrid.forward(&mut criterion, &output, &[target()])?;
        assert!(loss_dict.keys().all(|name| !name.ends_with(ONE2MANY_SUFFIX)));
        Ok(())
    }
}
