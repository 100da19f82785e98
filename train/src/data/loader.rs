use super::*;
use crate::common::*;

#[derive(Debug, Clone)]
pub struct DataLoaderInit {
    pub batch_size: usize,
    /// Shuffle the records every epoch.
    pub shuffle: bool,
    /// Drop the trailing batch smaller than `batch_size`.
    pub drop_last: bool,
    pub seed: u64,
    pub rank: usize,
    pub world_size: usize,
}

impl DataLoaderInit {
    pub fn build(self, dataset: Arc<dyn RandomAccessDataset>) -> Result<DataLoader> {
        let Self {
            batch_size,
            shuffle,
            drop_last,
            seed,
            rank,
            world_size,
        } = self;
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(
            rank < world_size,
            "rank {} is out of world size {}",
            rank,
            world_size
        );
        ensure!(dataset.num_records() > 0, "the dataset is empty");

        Ok(DataLoader {
            dataset,
            batch_size,
            shuffle,
            drop_last,
            seed,
            rank,
            world_size,
        })
    }
}

/// Splits a dataset among workers and assembles padded batches.
///
/// Every worker receives the same number of records. The record list is
/// padded by wrapping around when it does not divide evenly.
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Arc<dyn RandomAccessDataset>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    seed: u64,
    rank: usize,
    world_size: usize,
}

impl DataLoader {
    pub fn dataset(&self) -> &Arc<dyn RandomAccessDataset> {
        &self.dataset
    }

    fn shard_len(&self) -> usize {
        let num_records = self.dataset.num_records();
        (num_records + self.world_size - 1) / self.world_size
    }

    /// The record indices assigned to this worker in `epoch`.
    pub fn shard_indices(&self, epoch: usize) -> Vec<usize> {
        let num_records = self.dataset.num_records();
        let mut indices: Vec<usize> = (0..num_records).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            indices.shuffle(&mut rng);
        }

        let total_len = self.shard_len() * self.world_size;
        indices
            .iter()
            .cycle()
            .take(total_len)
            .skip(self.rank)
            .step_by(self.world_size)
            .cloned()
            .collect()
    }

    pub fn num_batches(&self) -> usize {
        let shard_len = self.shard_len();
        if self.drop_last {
            shard_len / self.batch_size
        } else {
            (shard_len + self.batch_size - 1) / self.batch_size
        }
    }

    pub fn batch_indices(&self, epoch: usize) -> Vec<Vec<usize>> {
        let num_batches = self.num_batches();
        self.shard_indices(epoch)
            .chunks(self.batch_size)
            .take(num_batches)
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    pub fn load_batch(&self, indices: &[usize]) -> Result<Batch> {
        let (images, targets): (Vec<_>, Vec<_>) = indices
            .iter()
            .map(|&index| {
                let Sample { image, target } = self.dataset.nth(index)?;
                Fallible::Ok((image, target))
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .unzip();
        let samples = NestedTensor::from_tensor_list(&images)?;
        Batch::new(samples, targets)
    }

    /// Iterates over the batches of `epoch`, loading each batch lazily.
    pub fn iter_epoch(
        self: Arc<Self>,
        epoch: usize,
    ) -> impl Iterator<Item = Result<Batch>> + Send + 'static {
        self.batch_indices(epoch)
            .into_iter()
            .map(move |indices| self.load_batch(&indices))
    }
}
