#![allow(dead_code)]

use hdetr::model::{BranchOutput, Prediction};
use train::common::*;

/// A detector whose every query predicts the same value, a single
/// trainable weight.
#[derive(Debug)]
pub struct ToyDetector {
    weight: Tensor,
    config: QueryConfig,
    num_queries_one2one: i64,
    /// The number of active queries of every forward call.
    pub seen_queries: Vec<i64>,
}

impl ToyDetector {
    pub fn new<'p>(
        path: impl Borrow<nn::Path<'p>>,
        num_queries_one2one: i64,
        num_queries_one2many: i64,
    ) -> Self {
        let path = path.borrow();
        let num_queries = num_queries_one2one + num_queries_one2many;
        Self {
            weight: path.var("weight", &[1], nn::Init::Const(1.0)),
            config: QueryConfig {
                num_queries,
                two_stage_num_proposals: num_queries,
            },
            num_queries_one2one,
            seen_queries: vec![],
        }
    }

    pub fn weight(&self) -> f64 {
        f64::from(&self.weight)
    }
}

fn branch(weight: &Tensor, batch_size: i64, num_queries: i64) -> BranchOutput {
    let logits = weight.view([1, 1, 1]).expand(&[batch_size, num_queries, 2], false) * 1.0;
    let boxes = weight
        .sigmoid()
        .view([1, 1, 1])
        .expand(&[batch_size, num_queries, 4], false)
        * 0.5;
    BranchOutput {
        pred: Prediction { logits, boxes },
        aux: vec![],
    }
}

impl Detector for ToyDetector {
    fn forward_t(
        &mut self,
        samples: &NestedTensor,
        train: bool,
        _autocast: bool,
    ) -> Result<DetectorOutput> {
        let batch_size = samples.batch_size();
        let num_queries = self.config.num_queries;
        self.seen_queries.push(num_queries);

        let num_one2one = num_queries.min(self.num_queries_one2one);
        let num_one2many = num_queries - num_one2one;
        let one2one = branch(&self.weight, batch_size, num_one2one);
        let one2many = (train && num_one2many > 0)
            .then(|| branch(&self.weight, batch_size, num_one2many));

        Ok(DetectorOutput { one2one, one2many })
    }

    fn query_config(&self) -> QueryConfig {
        self.config
    }

    fn set_query_config(&mut self, config: QueryConfig) -> Result<()> {
        self.config = config;
        Ok(())
    }

    fn num_queries_one2one(&self) -> i64 {
        self.num_queries_one2one
    }
}

/// Mean prediction losses plus the number of objects it was given.
#[derive(Debug)]
pub struct ToyCriterion {
    weight_dict: WeightDict,
    /// The number of target objects of every call.
    pub seen_objects: Vec<i64>,
}

impl ToyCriterion {
    pub fn new() -> Self {
        let weight_dict: WeightDict = [
            ("loss_ce", 1.0),
            ("loss_bbox", 5.0),
            ("loss_ce_one2many", 1.0),
            ("loss_bbox_one2many", 5.0),
        ]
        .into_iter()
        .map(|(name, weight)| (name.to_string(), weight))
        .collect();

        Self {
            weight_dict,
            seen_objects: vec![],
        }
    }
}

impl Criterion for ToyCriterion {
    fn forward(&mut self, output: &BranchOutput, targets: &[Target]) -> Result<LossDict> {
        let num_objects: i64 = targets.iter().map(|target| target.num_objects()).sum();
        self.seen_objects.push(num_objects);

        let loss_dict: LossDict = [
            ("loss_ce", output.pred.logits.mean(Kind::Float)),
            ("loss_bbox", output.pred.boxes.mean(Kind::Float)),
            ("num_objects", Tensor::from(num_objects as f32)),
            (CLASS_ERROR, Tensor::from(25.0f32)),
        ]
        .into_iter()
        .map(|(name, loss)| (name.to_string(), loss))
        .collect();
        Ok(loss_dict)
    }

    fn weight_dict(&self) -> &WeightDict {
        &self.weight_dict
    }
}

/// A batch of `batch_size` blank images with one object each.
pub fn toy_batch(first_image_id: i64, batch_size: i64) -> Result<Batch> {
    let images: Vec<Tensor> = (0..batch_size)
        .map(|_| Tensor::zeros(&[3, 8, 8], FLOAT_CPU))
        .collect();
    let targets: Vec<Target> = (0..batch_size)
        .map(|index| Target {
            boxes: Tensor::of_slice(&[0.5f32, 0.5, 0.25, 0.25]).view([1, 4]),
            labels: Tensor::of_slice(&[1i64]),
            image_id: first_image_id + index,
            orig_size: [16, 16],
            size: [8, 8],
        })
        .collect();
    Batch::new(NestedTensor::from_tensor_list(&images)?, targets)
}

pub fn toy_batches(num_batches: i64, batch_size: i64) -> Vec<Result<Batch>> {
    (0..num_batches)
        .map(|index| toy_batch(index * batch_size, batch_size))
        .collect()
}
