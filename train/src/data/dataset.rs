use crate::common::*;

/// An image with its ground truth.
#[derive(Debug, TensorLike)]
pub struct Sample {
    /// Normalized image in `[3, height, width]` shape.
    pub image: Tensor,
    pub target: Target,
}

/// The dataset that can be random accessed.
pub trait RandomAccessDataset
where
    Self: Debug + Sync + Send,
{
    /// Get number of records in the dataset.
    fn num_records(&self) -> usize;

    /// Get the nth record in the dataset.
    fn nth(&self, index: usize) -> Result<Sample>;
}
