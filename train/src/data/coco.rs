use super::*;
use crate::common::*;

mod format {
    use super::*;

    /// The subset of the COCO instances file the loader reads.
    #[derive(Debug, Clone, Deserialize)]
    pub struct Instances {
        pub images: Vec<ImageInfo>,
        pub annotations: Vec<Annotation>,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct ImageInfo {
        pub id: i64,
        pub file_name: String,
        pub height: i64,
        pub width: i64,
    }

    #[derive(Debug, Clone, Deserialize)]
    pub struct Annotation {
        pub image_id: i64,
        /// `[x, y, width, height]` in pixels.
        pub bbox: [f64; 4],
        pub category_id: i64,
        #[serde(default)]
        pub iscrowd: i64,
    }
}

/// The annotations of one image.
#[derive(Debug, Clone, PartialEq)]
pub struct CocoRecord {
    pub image_id: i64,
    pub path: PathBuf,
    /// `[height, width]` from the annotation file.
    pub orig_size: [i64; 2],
    /// Normalized `(cx, cy, w, h)` boxes.
    pub boxes: Vec<[f32; 4]>,
    pub labels: Vec<i64>,
}

/// Microsoft COCO detection split.
#[derive(Debug, Clone)]
pub struct CocoDetection {
    image_size: i64,
    records: Vec<CocoRecord>,
}

impl CocoDetection {
    /// Loads `annotations/instances_{split}2017.json` with images in
    /// `{split}2017/`.
    pub fn load(dataset_dir: impl AsRef<Path>, split: &str, image_size: usize) -> Result<Self> {
        let dataset_dir = dataset_dir.as_ref();
        let ann_file = dataset_dir
            .join("annotations")
            .join(format!("instances_{}2017.json", split));
        let image_dir = dataset_dir.join(format!("{}2017", split));

        let text = fs::read_to_string(&ann_file)
            .with_context(|| format!("failed to read '{}'", ann_file.display()))?;
        let instances: format::Instances = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse '{}'", ann_file.display()))?;
        let records = build_records(instances, &image_dir);
        info!(
            "loaded {} images from '{}'",
            records.len(),
            ann_file.display()
        );

        Ok(Self {
            image_size: image_size as i64,
            records,
        })
    }

    pub fn records(&self) -> &[CocoRecord] {
        &self.records
    }
}

impl RandomAccessDataset for CocoDetection {
    fn num_records(&self) -> usize {
        self.records.len()
    }

    fn nth(&self, index: usize) -> Result<Sample> {
        let record = self
            .records
            .get(index)
            .ok_or_else(|| format_err!("record index {} is out of bound", index))?;
        let size = [self.image_size, self.image_size];
        let (image, orig_size) = load_image(&record.path, size)?;

        let num_objects = record.labels.len() as i64;
        let flat_boxes: Vec<f32> = record.boxes.iter().flatten().cloned().collect();
        let target = Target {
            boxes: Tensor::of_slice(&flat_boxes).view([num_objects, 4]),
            labels: Tensor::of_slice(&record.labels),
            image_id: record.image_id,
            orig_size,
            size,
        };

        Ok(Sample { image, target })
    }
}

fn build_records(instances: format::Instances, image_dir: &Path) -> Vec<CocoRecord> {
    let format::Instances {
        images,
        annotations,
    } = instances;

    let mut annotations = annotations.into_iter().into_group_map_by(|ann| ann.image_id);

    images
        .into_iter()
        .map(|image| {
            let format::ImageInfo {
                id,
                file_name,
                height,
                width,
            } = image;
            let (img_w, img_h) = (width as f64, height as f64);

            let (boxes, labels): (Vec<_>, Vec<_>) = annotations
                .remove(&id)
                .unwrap_or_default()
                .into_iter()
                .filter(|ann| ann.iscrowd == 0)
                .filter_map(|ann| {
                    let [x, y, w, h] = ann.bbox;
                    let x1 = x.clamp(0.0, img_w);
                    let y1 = y.clamp(0.0, img_h);
                    let x2 = (x + w).clamp(0.0, img_w);
                    let y2 = (y + h).clamp(0.0, img_h);

                    // drop degenerate boxes
                    if x2 <= x1 || y2 <= y1 {
                        return None;
                    }

                    let cxcywh = [
                        ((x1 + x2) / 2.0 / img_w) as f32,
                        ((y1 + y2) / 2.0 / img_h) as f32,
                        ((x2 - x1) / img_w) as f32,
                        ((y2 - y1) / img_h) as f32,
                    ];
                    Some((cxcywh, ann.category_id))
                })
                .unzip();

            CocoRecord {
                image_id: id,
                path: image_dir.join(file_name),
                orig_size: [height, width],
                boxes,
                labels,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const INSTANCES: &str = r#"{
        "images": [
            { "id": 1, "file_name": "a.png", "height": 20, "width": 40 },
            { "id": 2, "file_name": "b.png", "height": 10, "width": 10 }
        ],
        "annotations": [
            { "image_id": 1, "bbox": [10, 5, 20, 10], "category_id": 3, "iscrowd": 0 },
            { "image_id": 1, "bbox": [0, 0, 5, 5], "category_id": 4, "iscrowd": 1 },
            { "image_id": 1, "bbox": [50, 0, 5, 5], "category_id": 5, "iscrowd": 0 }
        ],
        "categories": []
    }"#;

    #[test]
    fn build_records_drops_crowd_and_degenerate_boxes() -> Result<()> {
        let instances: format::Instances = serde_json::from_str(INSTANCES)?;
        let records = build_records(instances, Path::new("images"));

        assert_eq!(records.len(), 2);
        let record = &records[0];
        assert_eq!(record.labels, vec![3]);
        assert_eq!(record.boxes, vec![[0.5, 0.5, 0.5, 0.5]]);
        assert_eq!(record.path, Path::new("images").join("a.png"));
        assert!(records[1].labels.is_empty());
        Ok(())
    }

    #[test]
    fn load_coco_split() -> Result<()> {
        let dataset_dir = std::env::temp_dir().join("hdetr-coco-test");
        fs::create_dir_all(dataset_dir.join("annotations"))?;
        fs::create_dir_all(dataset_dir.join("val2017"))?;
        fs::write(
            dataset_dir.join("annotations").join("instances_val2017.json"),
            INSTANCES,
        )?;
        let image = Tensor::zeros(&[3, 20, 40], (Kind::Uint8, Device::Cpu));
        vision::image::save(&image, dataset_dir.join("val2017").join("a.png"))?;

        let dataset = CocoDetection::load(&dataset_dir, "val", 32)?;
        assert_eq!(dataset.num_records(), 2);

        let Sample { image, target } = dataset.nth(0)?;
        assert_eq!(image.size(), vec![3, 32, 32]);
        assert_eq!(target.orig_size, [20, 40]);
        assert_eq!(target.size, [32, 32]);
        assert_eq!(target.boxes.size(), vec![1, 4]);
        assert!(dataset.nth(5).is_err());
        Ok(())
    }
}
