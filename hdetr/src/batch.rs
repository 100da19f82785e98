//! Batched images and per-image ground truth.

use crate::common::*;

/// Padded images along with the padding mask.
///
/// The `mask` is `true` on padded pixels.
#[derive(Debug, TensorLike)]
pub struct NestedTensor {
    /// Images in `[batch, channels, height, width]` shape.
    pub tensors: Tensor,
    /// Boolean padding mask in `[batch, height, width]` shape.
    pub mask: Tensor,
}

impl NestedTensor {
    /// Pads a list of `[channels, height, width]` images into one batch.
    pub fn from_tensor_list(images: &[Tensor]) -> Result<Self> {
        ensure!(!images.is_empty(), "cannot batch an empty image list");

        let shapes: Vec<(i64, i64, i64)> = images
            .iter()
            .map(|image| image.size3())
            .try_collect()?;
        let channels = shapes[0].0;
        ensure!(
            shapes.iter().all(|&(c, _, _)| c == channels),
            "images must have the same number of channels"
        );
        let max_h = shapes.iter().map(|&(_, h, _)| h).fold(0, i64::max);
        let max_w = shapes.iter().map(|&(_, _, w)| w).fold(0, i64::max);
        let batch_size = images.len() as i64;
        let kind = images[0].kind();
        let device = images[0].device();

        let tensors = Tensor::zeros(&[batch_size, channels, max_h, max_w], (kind, device));
        let mask = Tensor::ones(&[batch_size, max_h, max_w], (Kind::Bool, device));

        tch::no_grad(|| {
            izip!(images, &shapes)
                .enumerate()
                .for_each(|(index, (image, &(_, h, w)))| {
                    let index = index as i64;
                    let _ = tensors.i((index, .., ..h, ..w)).copy_(image);
                    let _ = mask.i((index, ..h, ..w)).fill_(0);
                });
        });

        Ok(Self { tensors, mask })
    }

    pub fn batch_size(&self) -> i64 {
        self.tensors.size()[0]
    }
}

/// Ground truth of one image.
#[derive(Debug, TensorLike)]
pub struct Target {
    /// Boxes in `[num_objects, 4]` shape, normalized `(cx, cy, w, h)` form.
    pub boxes: Tensor,
    /// Class indices in `[num_objects]` shape.
    pub labels: Tensor,
    #[tensor_like(clone)]
    pub image_id: i64,
    /// The `[height, width]` of the image before resizing.
    #[tensor_like(clone)]
    pub orig_size: [i64; 2],
    /// The `[height, width]` of the image fed to the model.
    #[tensor_like(clone)]
    pub size: [i64; 2],
}

impl Target {
    pub fn num_objects(&self) -> i64 {
        self.labels.size()[0]
    }

    /// Builds a new target whose boxes and labels are repeated `k` times.
    ///
    /// The returned boxes and labels own fresh storage.
    pub fn replicate(&self, k: usize) -> Result<Self> {
        ensure!(k >= 1, "the replication factor must be at least 1");
        let k = k as i64;

        Ok(Self {
            boxes: self.boxes.repeat(&[k, 1]),
            labels: self.labels.repeat(&[k]),
            image_id: self.image_id,
            orig_size: self.orig_size,
            size: self.size,
        })
    }
}

/// A padded image batch paired with per-image targets.
#[derive(Debug)]
pub struct Batch {
    pub samples: NestedTensor,
    pub targets: Vec<Target>,
}

impl Batch {
    pub fn new(samples: NestedTensor, targets: Vec<Target>) -> Result<Self> {
        ensure!(
            samples.batch_size() == targets.len() as i64,
            "batch size mismatch: {} images but {} targets",
            samples.batch_size(),
            targets.len()
        );
        Ok(Self { samples, targets })
    }

    pub fn to_device(&self, device: Device) -> Self {
        Self {
            samples: self.samples.to_device(device),
            targets: self
                .targets
                .iter()
                .map(|target| target.to_device(device))
                .collect(),
        }
    }

    /// Stacks `orig_size` of all targets into a `[batch, 2]` tensor.
    pub fn orig_target_sizes(&self) -> Tensor {
        stack_sizes(self.targets.iter().map(|target| target.orig_size))
    }

    /// Stacks `size` of all targets into a `[batch, 2]` tensor.
    pub fn target_sizes(&self) -> Tensor {
        stack_sizes(self.targets.iter().map(|target| target.size))
    }
}

fn stack_sizes(sizes: impl Iterator<Item = [i64; 2]>) -> Tensor {
    let flat: Vec<i64> = sizes.flat_map(|[h, w]| [h, w]).collect();
    Tensor::of_slice(&flat).view([-1, 2])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_target() -> Target {
        Target {
            boxes: Tensor::of_slice(&[0.5f32, 0.5, 0.2, 0.2, 0.3, 0.4, 0.1, 0.2]).view([2, 4]),
            labels: Tensor::of_slice(&[3i64, 7]),
            image_id: 42,
            orig_size: [480, 640],
            size: [800, 1066],
        }
    }

    #[test]
    fn replicate_repeats_boxes_and_labels_in_order() -> Result<()> {
        let target = make_target();
        let replica = target.replicate(3)?;

        assert_eq!(replica.boxes.size(), vec![6, 4]);
        assert_eq!(replica.num_objects(), 3 * target.num_objects());
        assert_eq!(
            Vec::<i64>::from(&replica.labels),
            vec![3, 7, 3, 7, 3, 7]
        );
        assert!(replica.boxes.i(2..4).equal(&target.boxes));
        assert_eq!(replica.image_id, target.image_id);
        Ok(())
    }

    #[test]
    fn replicate_does_not_alias_the_original() -> Result<()> {
        let target = make_target();
        let replica = target.replicate(1)?;

        let _ = replica.boxes.shallow_clone().fill_(0.0);
        let _ = replica.labels.shallow_clone().fill_(0);

        assert_eq!(Vec::<i64>::from(&target.labels), vec![3, 7]);
        assert_abs_diff_eq!(f64::from(target.boxes.sum(Kind::Double)), 2.6, epsilon = 1e-6);
        Ok(())
    }

    #[test]
    fn replicate_rejects_zero() {
        assert!(make_target().replicate(0).is_err());
    }

    #[test]
    fn nested_tensor_pads_and_masks() -> Result<()> {
        let images = vec![
            Tensor::ones(&[3, 2, 3], FLOAT_CPU),
            Tensor::ones(&[3, 4, 2], FLOAT_CPU),
        ];
        let nested = NestedTensor::from_tensor_list(&images)?;

        assert_eq!(nested.tensors.size(), vec![2, 3, 4, 3]);
        assert_eq!(nested.mask.size(), vec![2, 4, 3]);
        // valid pixels: 2*3 + 4*2
        assert_eq!(i64::from(nested.mask.logical_not().sum(Kind::Int64)), 14);
        assert_abs_diff_eq!(f64::from(nested.tensors.sum(Kind::Double)), 3.0 * 14.0);
        Ok(())
    }
}
