//! Conversion of raw predictions into per-image detections.

use crate::{box_ops, common::*, model::BranchOutput};

pub use detections::*;
pub use processors::*;
pub use top_k::*;

mod detections {
    use super::*;

    /// The detections of one image.
    #[derive(Debug, TensorLike)]
    pub struct Detections {
        /// `[n]` confidence scores.
        pub scores: Tensor,
        /// `[n]` class indices.
        pub labels: Tensor,
        /// `[n, 4]` boxes in absolute `(x1, y1, x2, y2)` pixels.
        pub boxes: Tensor,
        /// Optional `[n, 1, h, w]` instance masks.
        pub masks: Option<Tensor>,
    }

    impl Detections {
        pub fn len(&self) -> i64 {
            self.scores.size()[0]
        }

        pub fn is_empty(&self) -> bool {
            self.len() == 0
        }

        /// Keeps the detections with `score >= threshold`.
        pub fn filter_by_score(&self, threshold: f64) -> Self {
            let keep = self.scores.ge(threshold).nonzero().view([-1]);
            Self {
                scores: self.scores.index_select(0, &keep),
                labels: self.labels.index_select(0, &keep),
                boxes: self.boxes.index_select(0, &keep),
                masks: self.masks.as_ref().map(|masks| masks.index_select(0, &keep)),
            }
        }

        /// Builds `[n, 5]` rows of `(x1, y1, x2, y2, label)` in double
        /// precision for box prompts.
        ///
        /// Detections below `threshold` are dropped, labels are shifted down
        /// by one and boxes are clipped into the image of `[height, width]`.
        pub fn to_prompts(&self, threshold: f64, image_size: [i64; 2]) -> Tensor {
            let kept = self.filter_by_score(threshold);
            let boxes = box_ops::clip_xyxy(&kept.boxes, image_size).to_kind(Kind::Double);
            let labels = (kept.labels - 1).to_kind(Kind::Double).unsqueeze(1);
            Tensor::cat(&[boxes, labels], 1)
        }
    }
}

mod processors {
    use super::*;

    /// Converts box predictions to detections scaled to `target_sizes`, a
    /// `[batch, 2]` tensor of `(height, width)`.
    pub trait BoxPostProcess {
        fn forward(&self, output: &BranchOutput, target_sizes: &Tensor) -> Result<Vec<Detections>>;
    }

    /// Attaches instance masks to box detections.
    pub trait SegmPostProcess {
        fn forward(
            &self,
            detections: Vec<Detections>,
            output: &BranchOutput,
            orig_target_sizes: &Tensor,
            target_sizes: &Tensor,
        ) -> Result<Vec<Detections>>;
    }

    /// One segment in a panoptic prediction.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct SegmentInfo {
        pub id: i64,
        pub category_id: i64,
        pub isthing: bool,
        pub area: i64,
    }

    /// The panoptic segmentation of one image.
    #[derive(Debug, TensorLike)]
    pub struct PanopticPrediction {
        /// `[height, width]` segment ids.
        pub segmentation: Tensor,
        #[tensor_like(clone)]
        pub segments_info: Vec<SegmentInfo>,
    }

    pub trait PanopticPostProcess {
        fn forward(
            &self,
            output: &BranchOutput,
            target_sizes: &Tensor,
            orig_target_sizes: &Tensor,
        ) -> Result<Vec<PanopticPrediction>>;
    }

    /// The postprocessors available to evaluation. `bbox` is mandatory.
    pub struct PostProcessors {
        pub bbox: Box<dyn BoxPostProcess>,
        pub segm: Option<Box<dyn SegmPostProcess>>,
        pub panoptic: Option<Box<dyn PanopticPostProcess>>,
    }

    impl PostProcessors {
        pub fn new(bbox: impl BoxPostProcess + 'static) -> Self {
            Self {
                bbox: Box::new(bbox),
                segm: None,
                panoptic: None,
            }
        }
    }

    impl Debug for PostProcessors {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.debug_struct("PostProcessors")
                .field("segm", &self.segm.is_some())
                .field("panoptic", &self.panoptic.is_some())
                .finish()
        }
    }
}

mod top_k {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TopKPostProcessInit {
        pub num_select: i64,
    }

    impl Default for TopKPostProcessInit {
        fn default() -> Self {
            Self { num_select: 100 }
        }
    }

    impl TopKPostProcessInit {
        pub fn build(self) -> Result<TopKPostProcess> {
            let Self { num_select } = self;
            ensure!(num_select > 0, "num_select must be positive");
            Ok(TopKPostProcess { num_select })
        }
    }

    /// Selects the top scoring (query, class) pairs of each image.
    #[derive(Debug, Clone)]
    pub struct TopKPostProcess {
        num_select: i64,
    }

    impl BoxPostProcess for TopKPostProcess {
        fn forward(&self, output: &BranchOutput, target_sizes: &Tensor) -> Result<Vec<Detections>> {
            tch::no_grad(|| {
                let logits = &output.pred.logits;
                let (batch_size, num_queries, num_classes) = logits.size3()?;
                ensure!(
                    target_sizes.size() == vec![batch_size, 2],
                    "target_sizes must be in shape [{}, 2], but get {:?}",
                    batch_size,
                    target_sizes.size()
                );

                let num_select = self.num_select.min(num_queries * num_classes);
                let prob = logits.sigmoid().view([batch_size, -1]);
                let (scores, flat_indexes) = prob.topk(num_select, 1, true, true);
                let labels = flat_indexes.fmod(num_classes);
                let query_indexes = ((&flat_indexes - &labels).to_kind(Kind::Double)
                    / num_classes as f64)
                    .to_kind(Kind::Int64);

                let boxes = box_ops::cxcywh_to_xyxy(&output.pred.boxes).gather(
                    1,
                    &query_indexes.unsqueeze(-1).repeat(&[1, 1, 4]),
                    false,
                );

                let target_sizes = target_sizes.to_device(boxes.device()).to_kind(boxes.kind());
                let img_h = target_sizes.select(1, 0);
                let img_w = target_sizes.select(1, 1);
                let scale = Tensor::stack(&[&img_w, &img_h, &img_w, &img_h], 1).unsqueeze(1);
                let boxes = boxes * scale;

                Ok((0..batch_size)
                    .map(|index| Detections {
                        scores: scores.get(index),
                        labels: labels.get(index),
                        boxes: boxes.get(index),
                        masks: None,
                    })
                    .collect())
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Prediction;

    #[test]
    fn prompts_keep_confident_detections() {
        let detections = Detections {
            scores: Tensor::of_slice(&[0.9f32, 0.30, 0.40]),
            labels: Tensor::of_slice(&[3i64, 1, 5]),
            boxes: Tensor::of_slice(&[
                -5.0f32, 300.0, 10.0, 260.0, //
                1.0, 1.0, 2.0, 2.0, //
                4.0, 4.0, 8.0, 8.0,
            ])
            .view([3, 4]),
            masks: None,
        };

        let kept = detections.filter_by_score(0.33);
        assert_eq!(Vec::<f32>::from(&kept.scores), vec![0.9, 0.40]);

        let prompts = detections.to_prompts(0.33, [256, 256]);
        assert_eq!(prompts.kind(), Kind::Double);
        assert_eq!(prompts.size(), vec![2, 5]);
        assert_eq!(
            Vec::<f64>::from(&prompts.view([-1])),
            vec![0.0, 255.0, 10.0, 255.0, 2.0, 4.0, 4.0, 8.0, 8.0, 4.0]
        );
    }

    #[test]
    fn top_k_scales_boxes_to_image_size() -> Result<()> {
        let postprocess = TopKPostProcessInit { num_select: 2 }.build()?;

        // query 1 class 0 scores highest, then query 0 class 1
        let logits = Tensor::of_slice(&[-5.0f32, 1.0, 3.0, -5.0]).view([1, 2, 2]);
        let boxes = Tensor::of_slice(&[0.5f32, 0.5, 0.2, 0.2, 0.25, 0.25, 0.5, 0.5]).view([1, 2, 4]);
        let output = BranchOutput {
            pred: Prediction { logits, boxes },
            aux: vec![],
        };
        let target_sizes = Tensor::of_slice(&[100i64, 200]).view([1, 2]);

        let detections = postprocess.forward(&output, &target_sizes)?;
        assert_eq!(detections.len(), 1);
        let detections = &detections[0];

        assert_eq!(Vec::<i64>::from(&detections.labels), vec![0, 1]);
        let expect = Tensor::of_slice(&[
            0.0f32, 0.0, 100.0, 50.0, //
            80.0, 40.0, 120.0, 60.0,
        ])
        .view([2, 4]);
        assert!(detections.boxes.allclose(&expect, 1e-5, 1e-4, false));
        Ok(())
    }
}
