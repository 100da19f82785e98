//! Scoring contracts fed by the evaluation pass.

use crate::{
    box_ops,
    common::*,
    distributed::ProcessGroup,
    postprocess::{Detections, PanopticPrediction},
};
use std::fs;

pub use detection::*;
pub use dumper::*;
pub use panoptic::*;

mod detection {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub enum IouType {
        #[serde(rename = "bbox")]
        Bbox,
        #[serde(rename = "segm")]
        Segm,
    }

    /// A COCO-style detection scorer.
    pub trait DetectionEvaluator {
        fn update(&mut self, detections: IndexMap<i64, Detections>) -> Result<()>;

        /// Merges the detections of every worker. Blocks until all workers
        /// arrive.
        fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> Result<()>;

        fn accumulate(&mut self) -> Result<()>;

        fn summarize(&mut self) -> Result<()>;

        /// The summary statistics computed for `iou_type`, if any.
        fn stats(&self, iou_type: IouType) -> Option<Vec<f64>>;
    }
}

mod panoptic {
    use super::*;

    /// A panoptic prediction tagged with its image.
    #[derive(Debug)]
    pub struct PanopticRecord {
        pub image_id: i64,
        pub file_name: String,
        pub prediction: PanopticPrediction,
    }

    impl PanopticRecord {
        pub fn new(image_id: i64, prediction: PanopticPrediction) -> Self {
            Self {
                image_id,
                file_name: panoptic_file_name(image_id),
                prediction,
            }
        }
    }

    /// The segmentation file name of an image, the id zero-padded to 12
    /// digits.
    pub fn panoptic_file_name(image_id: i64) -> String {
        format!("{:012}.png", image_id)
    }

    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct PqStats {
        pub pq: f64,
        pub sq: f64,
        pub rq: f64,
        pub n: usize,
    }

    /// Panoptic quality over all, thing and stuff categories.
    #[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
    pub struct PanopticSummary {
        #[serde(rename = "All")]
        pub all: PqStats,
        #[serde(rename = "Things")]
        pub things: PqStats,
        #[serde(rename = "Stuff")]
        pub stuff: PqStats,
    }

    pub trait PanopticEvaluator {
        fn update(&mut self, records: Vec<PanopticRecord>) -> Result<()>;

        fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> Result<()>;

        fn summarize(&mut self) -> Result<PanopticSummary>;
    }
}

mod dumper {
    use super::*;

    /// One entry of a COCO results file.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct CocoResult {
        pub image_id: i64,
        pub category_id: i64,
        /// `[x, y, width, height]` in pixels.
        pub bbox: [f64; 4],
        pub score: f64,
    }

    /// Collects detections from all workers and writes a COCO results file.
    ///
    /// It computes no AP itself: `stats` is always `None`, so the epoch log
    /// carries no `test_coco_eval_bbox` entry. Score the written JSON offline
    /// against the annotation file.
    #[derive(Debug)]
    pub struct DetectionDumper {
        output_file: PathBuf,
        is_main_process: bool,
        results: Vec<CocoResult>,
    }

    impl DetectionDumper {
        pub fn new(output_file: impl AsRef<Path>) -> Self {
            Self {
                output_file: output_file.as_ref().to_owned(),
                is_main_process: true,
                results: vec![],
            }
        }

        pub fn results(&self) -> &[CocoResult] {
            &self.results
        }
    }

    impl DetectionEvaluator for DetectionDumper {
        fn update(&mut self, detections: IndexMap<i64, Detections>) -> Result<()> {
            detections.into_iter().for_each(|(image_id, detections)| {
                let detections = detections.to_device(Device::Cpu);
                let xywh = box_ops::xyxy_to_xywh(&detections.boxes).to_kind(Kind::Double);
                let scores = Vec::<f64>::from(&detections.scores.to_kind(Kind::Double));
                let labels = Vec::<i64>::from(&detections.labels.to_kind(Kind::Int64));
                let boxes = Vec::<f64>::from(&xywh.view([-1]));

                let results = izip!(scores, labels, boxes.chunks_exact(4)).map(
                    |(score, category_id, bbox)| CocoResult {
                        image_id,
                        category_id,
                        bbox: [bbox[0], bbox[1], bbox[2], bbox[3]],
                        score,
                    },
                );
                self.results.extend(results);
            });
            Ok(())
        }

        fn synchronize_between_processes(&mut self, group: &dyn ProcessGroup) -> Result<()> {
            let bytes = serde_json::to_vec(&self.results)?;
            let gathered = group.all_gather_bytes(bytes)?;
            let results: Vec<Vec<CocoResult>> = gathered
                .iter()
                .map(|bytes| serde_json::from_slice(bytes))
                .try_collect()?;

            // padded shards repeat images across workers
            let mut seen_images = HashSet::new();
            self.results = results
                .into_iter()
                .flat_map(|rank_results| {
                    let fresh: HashSet<i64> = rank_results
                        .iter()
                        .map(|result| result.image_id)
                        .filter(|image_id| !seen_images.contains(image_id))
                        .collect();
                    seen_images.extend(fresh.iter().cloned());
                    rank_results
                        .into_iter()
                        .filter(move |result| fresh.contains(&result.image_id))
                })
                .collect();
            self.is_main_process = group.is_main_process();
            Ok(())
        }

        fn accumulate(&mut self) -> Result<()> {
            Ok(())
        }

        fn summarize(&mut self) -> Result<()> {
            if !self.is_main_process {
                return Ok(());
            }

            if let Some(dir) = self.output_file.parent() {
                fs::create_dir_all(dir)?;
            }
            let text = serde_json::to_string(&self.results)?;
            fs::write(&self.output_file, text).with_context(|| {
                format!("failed to write '{}'", self.output_file.display())
            })?;
            info!(
                "{} detections written to '{}'",
                self.results.len(),
                self.output_file.display()
            );
            Ok(())
        }

        // scoring happens offline from the written file
        fn stats(&self, _iou_type: IouType) -> Option<Vec<f64>> {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{LocalGroup, SingleProcess};
    use std::thread;

    fn detections(score: f32, label: i64) -> Detections {
        Detections {
            scores: Tensor::of_slice(&[score]),
            labels: Tensor::of_slice(&[label]),
            boxes: Tensor::of_slice(&[10.0f32, 20.0, 30.0, 60.0]).view([1, 4]),
            masks: None,
        }
    }

    #[test]
    fn panoptic_file_name_is_zero_padded() {
        assert_eq!(panoptic_file_name(42), "000000000042.png");
    }

    #[test]
    fn dumper_writes_xywh_results() -> Result<()> {
        let output_file = std::env::temp_dir()
            .join("hdetr-evaluator-test")
            .join("bbox.json");
        let mut dumper = DetectionDumper::new(&output_file);

        dumper.update([(7, detections(0.5, 3))].into_iter().collect())?;
        dumper.synchronize_between_processes(&SingleProcess)?;
        dumper.accumulate()?;
        dumper.summarize()?;

        let text = fs::read_to_string(&output_file)?;
        let results: Vec<CocoResult> = serde_json::from_str(&text)?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].image_id, 7);
        assert_eq!(results[0].category_id, 3);
        assert_eq!(results[0].bbox, [10.0, 20.0, 20.0, 40.0]);
        assert!(dumper.stats(IouType::Bbox).is_none());
        Ok(())
    }

    #[test]
    fn dumper_gathers_every_worker() {
        let groups = LocalGroup::new(2).unwrap();
        let counts: Vec<usize> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    scope.spawn(move || {
                        let mut dumper = DetectionDumper::new("unused.json");
                        let image_id = group.rank() as i64;
                        dumper
                            .update([(image_id, detections(0.9, 1))].into_iter().collect())
                            .unwrap();
                        dumper.synchronize_between_processes(&group).unwrap();
                        dumper.results().len()
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });
        assert_eq!(counts, vec![2, 2]);
    }

    #[test]
    fn dumper_drops_images_repeated_by_padding() {
        let groups = LocalGroup::new(2).unwrap();
        let counts: Vec<usize> = thread::scope(|scope| {
            let handles: Vec<_> = groups
                .into_iter()
                .map(|group| {
                    scope.spawn(move || {
                        let mut dumper = DetectionDumper::new("unused.json");
                        let image_id = group.rank() as i64;
                        let detections: IndexMap<_, _> =
                            [(image_id, detections(0.9, 1)), (0, detections(0.8, 2))]
                                .into_iter()
                                .collect();
                        dumper.update(detections).unwrap();
                        dumper.synchronize_between_processes(&group).unwrap();
                        dumper.results().len()
                    })
                })
                .collect();
            handles.into_iter().map(|handle| handle.join().unwrap()).collect()
        });
        assert_eq!(counts, vec![2, 2]);
    }
}
