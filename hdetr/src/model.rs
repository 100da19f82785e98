//! The detector contract and its TorchScript adaptor.

use crate::{batch::NestedTensor, common::*};
use tch::{IValue, TrainableCModule};

pub use detector::*;
pub use jit_detector::*;
pub use output::*;
pub use query_config::*;

mod output {
    use super::*;

    /// Class logits and boxes predicted by one decoder layer.
    #[derive(Debug, TensorLike)]
    pub struct Prediction {
        /// `[batch, queries, classes]`
        pub logits: Tensor,
        /// `[batch, queries, 4]` in normalized `(cx, cy, w, h)` form.
        pub boxes: Tensor,
    }

    /// The predictions of one query group together with the intermediate
    /// decoder layers.
    #[derive(Debug, TensorLike)]
    pub struct BranchOutput {
        pub pred: Prediction,
        pub aux: Vec<Prediction>,
    }

    impl BranchOutput {
        pub fn batch_size(&self) -> i64 {
            self.pred.logits.size()[0]
        }

        pub fn num_queries(&self) -> i64 {
            self.pred.logits.size()[1]
        }
    }

    /// The model output holding both query groups.
    ///
    /// `one2many` is absent when the model runs with one-to-one queries only.
    #[derive(Debug, TensorLike)]
    pub struct DetectorOutput {
        pub one2one: BranchOutput,
        pub one2many: Option<BranchOutput>,
    }
}

mod query_config {
    use super::*;

    /// The number of active queries and two-stage proposals of a detector.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct QueryConfig {
        pub num_queries: i64,
        pub two_stage_num_proposals: i64,
    }

    /// Restricts a detector to its one-to-one queries until the guard is
    /// released.
    ///
    /// The saved configuration is written back exactly once, by
    /// [QueryConfigGuard::restore] or otherwise on drop.
    #[derive(Debug)]
    pub struct QueryConfigGuard<'a, D>
    where
        D: Detector + ?Sized,
    {
        model: &'a mut D,
        saved: Option<QueryConfig>,
    }

    impl<'a, D> QueryConfigGuard<'a, D>
    where
        D: Detector + ?Sized,
    {
        pub fn narrow_to_one2one(model: &'a mut D) -> Result<Self> {
            let saved = model.query_config();
            let num_queries = model.num_queries_one2one();
            model.set_query_config(QueryConfig {
                num_queries,
                two_stage_num_proposals: num_queries,
            })?;
            info!(
                "narrow queries from {} to {} for evaluation",
                saved.num_queries, num_queries
            );

            Ok(Self {
                model,
                saved: Some(saved),
            })
        }

        /// The configuration that will be restored.
        pub fn saved(&self) -> Option<QueryConfig> {
            self.saved
        }

        /// Restores the saved configuration and reports failures.
        pub fn restore(mut self) -> Result<()> {
            match self.saved.take() {
                Some(saved) => self.model.set_query_config(saved),
                None => Ok(()),
            }
        }
    }

    impl<'a, D> Deref for QueryConfigGuard<'a, D>
    where
        D: Detector + ?Sized,
    {
        type Target = D;

        fn deref(&self) -> &Self::Target {
            &*self.model
        }
    }

    impl<'a, D> DerefMut for QueryConfigGuard<'a, D>
    where
        D: Detector + ?Sized,
    {
        fn deref_mut(&mut self) -> &mut Self::Target {
            &mut *self.model
        }
    }

    impl<'a, D> Drop for QueryConfigGuard<'a, D>
    where
        D: Detector + ?Sized,
    {
        fn drop(&mut self) {
            if let Some(saved) = self.saved.take() {
                if let Err(err) = self.model.set_query_config(saved) {
                    error!("failed to restore query configuration {:?}: {:?}", saved, err);
                }
            }
        }
    }
}

mod detector {
    use super::*;

    /// A set-prediction detector with one-to-one and one-to-many query groups.
    pub trait Detector {
        /// Runs the model. With `autocast`, the forward pass runs in reduced
        /// precision where the model supports it.
        fn forward_t(
            &mut self,
            samples: &NestedTensor,
            train: bool,
            autocast: bool,
        ) -> Result<DetectorOutput>;

        fn query_config(&self) -> QueryConfig;

        fn set_query_config(&mut self, config: QueryConfig) -> Result<()>;

        /// The size of the one-to-one query group.
        fn num_queries_one2one(&self) -> i64;
    }
}

mod jit_detector {
    use super::*;

    /// Loads a TorchScript detector.
    ///
    /// The scripted `forward(images, mask, autocast, num_queries,
    /// two_stage_num_proposals)` returns a dict with `pred_logits`,
    /// `pred_boxes`, `aux_outputs` and, while one-to-many queries are active,
    /// `pred_logits_one2many`, `pred_boxes_one2many` and
    /// `aux_outputs_one2many`.
    #[derive(Debug, Clone)]
    pub struct JitDetectorInit {
        pub module_file: PathBuf,
        pub num_queries_one2one: i64,
        pub num_queries_one2many: i64,
    }

    impl JitDetectorInit {
        pub fn build<'p>(self, path: impl Borrow<nn::Path<'p>>) -> Result<JitDetector> {
            let Self {
                module_file,
                num_queries_one2one,
                num_queries_one2many,
            } = self;
            ensure!(
                num_queries_one2one > 0,
                "num_queries_one2one must be positive"
            );
            ensure!(
                num_queries_one2many >= 0,
                "num_queries_one2many must be non-negative"
            );

            let path = path.borrow();
            let module = TrainableCModule::load(&module_file, path.clone())
                .with_context(|| format!("failed to load '{}'", module_file.display()))?;
            let num_queries = num_queries_one2one + num_queries_one2many;

            Ok(JitDetector {
                module,
                num_queries_one2one,
                max_queries: num_queries,
                query_config: QueryConfig {
                    num_queries,
                    two_stage_num_proposals: num_queries,
                },
                train: None,
            })
        }
    }

    #[derive(Debug)]
    pub struct JitDetector {
        module: TrainableCModule,
        num_queries_one2one: i64,
        max_queries: i64,
        query_config: QueryConfig,
        train: Option<bool>,
    }

    impl Detector for JitDetector {
        fn forward_t(
            &mut self,
            samples: &NestedTensor,
            train: bool,
            autocast: bool,
        ) -> Result<DetectorOutput> {
            if self.train != Some(train) {
                if train {
                    self.module.set_train();
                } else {
                    self.module.set_eval();
                }
                self.train = Some(train);
            }

            let QueryConfig {
                num_queries,
                two_stage_num_proposals,
            } = self.query_config;
            let output = self.module.inner.forward_is(&[
                IValue::Tensor(samples.tensors.shallow_clone()),
                IValue::Tensor(samples.mask.shallow_clone()),
                IValue::Bool(autocast),
                IValue::Int(num_queries),
                IValue::Int(two_stage_num_proposals),
            ])?;

            let mut dict = into_dict(output)?;
            let one2one = take_branch(&mut dict, "")?
                .ok_or_else(|| format_err!("the model output has no 'pred_logits'"))?;
            let one2many = take_branch(&mut dict, "_one2many")?;

            Ok(DetectorOutput { one2one, one2many })
        }

        fn query_config(&self) -> QueryConfig {
            self.query_config
        }

        fn set_query_config(&mut self, config: QueryConfig) -> Result<()> {
            ensure!(
                config.num_queries > 0 && config.num_queries <= self.max_queries,
                "num_queries must be in range 1..={}, but get {}",
                self.max_queries,
                config.num_queries
            );
            ensure!(
                config.two_stage_num_proposals > 0,
                "two_stage_num_proposals must be positive"
            );
            self.query_config = config;
            Ok(())
        }

        fn num_queries_one2one(&self) -> i64 {
            self.num_queries_one2one
        }
    }

    fn into_dict(value: IValue) -> Result<HashMap<String, IValue>> {
        match value {
            IValue::GenericDict(entries) => entries
                .into_iter()
                .map(|(key, value)| match key {
                    IValue::String(key) => Ok((key, value)),
                    key => bail!("expect string keys in model output, but get {:?}", key),
                })
                .try_collect(),
            value => bail!("expect a dict as model output, but get {:?}", value),
        }
    }

    fn into_tensor(value: IValue, name: &str) -> Result<Tensor> {
        match value {
            IValue::Tensor(tensor) => Ok(tensor),
            _ => bail!("'{}' is not a tensor", name),
        }
    }

    fn into_prediction(mut dict: HashMap<String, IValue>, suffix: &str) -> Result<Prediction> {
        let logits_key = format!("pred_logits{}", suffix);
        let boxes_key = format!("pred_boxes{}", suffix);

        // aux dicts may use either the plain or the suffixed names
        let logits = dict
            .remove(&logits_key)
            .or_else(|| dict.remove("pred_logits"))
            .ok_or_else(|| format_err!("missing '{}'", logits_key))?;
        let boxes = dict
            .remove(&boxes_key)
            .or_else(|| dict.remove("pred_boxes"))
            .ok_or_else(|| format_err!("missing '{}'", boxes_key))?;

        Ok(Prediction {
            logits: into_tensor(logits, &logits_key)?,
            boxes: into_tensor(boxes, &boxes_key)?,
        })
    }

    fn take_branch(
        dict: &mut HashMap<String, IValue>,
        suffix: &str,
    ) -> Result<Option<BranchOutput>> {
        let logits_key = format!("pred_logits{}", suffix);
        let boxes_key = format!("pred_boxes{}", suffix);
        let aux_key = format!("aux_outputs{}", suffix);

        let (logits, boxes) = match (dict.remove(&logits_key), dict.remove(&boxes_key)) {
            (Some(logits), Some(boxes)) => (logits, boxes),
            (None, None) => return Ok(None),
            _ => bail!("'{}' and '{}' must come together", logits_key, boxes_key),
        };
        let pred = Prediction {
            logits: into_tensor(logits, &logits_key)?,
            boxes: into_tensor(boxes, &boxes_key)?,
        };

        let aux: Vec<Prediction> = match dict.remove(&aux_key) {
            None | Some(IValue::None) => vec![],
            Some(IValue::GenericList(layers)) | Some(IValue::Tuple(layers)) => layers
                .into_iter()
                .map(|layer| into_prediction(into_dict(layer)?, suffix))
                .try_collect()?,
            Some(_) => bail!("'{}' must be a list of dicts", aux_key),
        };

        Ok(Some(BranchOutput { pred, aux }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct FixedDetector {
        config: QueryConfig,
    }

    impl Detector for FixedDetector {
        fn forward_t(
            &mut self,
            _samples: &NestedTensor,
            _train: bool,
            _autocast: bool,
        ) -> Result<DetectorOutput> {
            bail!("not used")
        }

        fn query_config(&self) -> QueryConfig {
            self.config
        }

        fn set_query_config(&mut self, config: QueryConfig) -> Result<()> {
            self.config = config;
            Ok(())
        }

        fn num_queries_one2one(&self) -> i64 {
            100
        }
    }

    fn original() -> QueryConfig {
        QueryConfig {
            num_queries: 300,
            two_stage_num_proposals: 300,
        }
    }

    #[test]
    fn guard_narrows_and_restores() -> Result<()> {
        let mut model = FixedDetector { config: original() };
        {
            let guard = QueryConfigGuard::narrow_to_one2one(&mut model)?;
            assert_eq!(
                guard.query_config(),
                QueryConfig {
                    num_queries: 100,
                    two_stage_num_proposals: 100
                }
            );
            assert_eq!(guard.saved(), Some(original()));
            guard.restore()?;
        }
        assert_eq!(model.query_config(), original());
        Ok(())
    }

    #[test]
    fn guard_restores_on_early_exit() {
        let mut model = FixedDetector { config: original() };

        let result: Result<()> = (|| {
            let _guard = QueryConfigGuard::narrow_to_one2one(&mut model)?;
            bail!("inference failed");
        })();

        assert!(result.is_err());
        assert_eq!(model.query_config(), original());
    }
}
