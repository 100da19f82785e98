//! Background batch loading.

use crate::common::*;

/// Loads the next batch and moves it to the device while the current batch
/// is being consumed.
#[derive(Debug)]
pub struct Prefetcher {
    rx: flume::Receiver<Result<Batch>>,
}

impl Prefetcher {
    pub fn new<I>(batches: I, device: Device) -> Self
    where
        I: Iterator<Item = Result<Batch>> + Send + 'static,
    {
        let (tx, rx) = flume::bounded(1);

        thread::spawn(move || {
            for result in batches {
                let result = result.map(|batch| batch.to_device(device));
                let is_err = result.is_err();

                // the receiver is gone
                if tx.send(result).is_err() {
                    break;
                }
                if is_err {
                    break;
                }
            }
        });

        Self { rx }
    }

    /// Blocks until the next batch is ready. Returns `None` at the end of
    /// the stream.
    pub fn next_batch(&self) -> Result<Option<Batch>> {
        match self.rx.recv() {
            Ok(result) => result.map(Some),
            Err(flume::RecvError::Disconnected) => Ok(None),
        }
    }
}

impl Iterator for Prefetcher {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_batch().transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(image_id: i64) -> Result<Batch> {
        let target = Target {
            boxes: Tensor::zeros(&[0, 4], FLOAT_CPU),
            labels: Tensor::zeros(&[0], (Kind::Int64, Device::Cpu)),
            image_id,
            orig_size: [2, 2],
            size: [2, 2],
        };
        let samples = NestedTensor::from_tensor_list(&[Tensor::zeros(&[3, 2, 2], FLOAT_CPU)])?;
        Batch::new(samples, vec![target])
    }

    #[test]
    fn prefetch_in_order() -> Result<()> {
        let prefetcher = Prefetcher::new((0..4).map(batch), Device::Cpu);
        let ids: Vec<i64> = prefetcher
            .map(|batch| Ok(batch?.targets[0].image_id))
            .collect::<Result<_>>()?;
        assert_eq!(ids, vec![0, 1, 2, 3]);
        Ok(())
    }

    #[test]
    fn prefetch_stops_at_error() {
        let batches = vec![batch(0), Err(format_err!("broken")), batch(2)];
        let prefetcher = Prefetcher::new(batches.into_iter(), Device::Cpu);
        assert_eq!(prefetcher.count(), 2);
    }
}
