//! Collective communication among data-parallel workers.
//!
//! Every collective is blocking: all members of a group must call it, in the
//! same order, before any of them returns. Sums are always accumulated in rank
//! order so the result does not depend on which worker arrives first.

use crate::common::*;

/// The collective operations needed by the training and evaluation loops.
pub trait ProcessGroup: Send + Sync + Debug {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    fn is_main_process(&self) -> bool {
        self.rank() == 0
    }

    /// Element-wise sum of `values` over all workers.
    fn all_reduce_f64(&self, values: &[f64]) -> Result<Vec<f64>>;

    /// Element-wise sum of each tensor over all workers.
    ///
    /// The returned tensors live on the device of the corresponding input.
    fn all_reduce_tensors(&self, tensors: &[Tensor]) -> Result<Vec<Tensor>>;

    /// Collects one byte buffer from every worker, ordered by rank.
    fn all_gather_bytes(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>>;

    fn barrier(&self) -> Result<()>;
}

/// Reduces a scalar dictionary over all workers.
///
/// Values are exchanged in sorted-key order, so workers may insert keys in
/// different orders. The result keeps the caller's key order. With `average`,
/// values are divided by the world size.
pub fn reduce_dict(
    group: &dyn ProcessGroup,
    dict: &IndexMap<String, f64>,
    average: bool,
) -> Result<IndexMap<String, f64>> {
    let world_size = group.world_size();
    if world_size < 2 {
        return Ok(dict.clone());
    }

    let mut keys: Vec<&String> = dict.keys().collect();
    keys.sort();
    let values: Vec<f64> = keys.iter().map(|&key| dict[key]).collect();
    let reduced: HashMap<&String, f64> = keys
        .into_iter()
        .zip(group.all_reduce_f64(&values)?)
        .collect();

    Ok(dict
        .keys()
        .map(|key| {
            let value = reduced[key];
            let value = if average {
                value / world_size as f64
            } else {
                value
            };
            (key.clone(), value)
        })
        .collect())
}

/// Replaces the gradient of every variable by its mean over all workers.
pub fn average_gradients(group: &dyn ProcessGroup, vars: &[Tensor]) -> Result<()> {
    let world_size = group.world_size();
    if world_size < 2 {
        return Ok(());
    }

    // every worker contributes the same list, with zeros for missing gradients
    let grads: Vec<Tensor> = vars
        .iter()
        .map(|var| {
            let grad = var.grad();
            if grad.defined() {
                grad
            } else {
                var.zeros_like()
            }
        })
        .collect();
    let sums = group.all_reduce_tensors(&grads)?;

    tch::no_grad(|| {
        izip!(vars, sums).for_each(|(var, sum)| {
            let mut grad = var.grad();
            if grad.defined() {
                grad.copy_(&(sum / world_size as f64));
            }
        });
    });

    Ok(())
}

/// A group containing only the calling process.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_f64(&self, values: &[f64]) -> Result<Vec<f64>> {
        Ok(values.to_vec())
    }

    fn all_reduce_tensors(&self, tensors: &[Tensor]) -> Result<Vec<Tensor>> {
        Ok(tensors.iter().map(|tensor| tensor.shallow_clone()).collect())
    }

    fn all_gather_bytes(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        Ok(vec![bytes])
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

/// A group of workers living in the same process, one thread per rank.
#[derive(Debug, Clone)]
pub struct LocalGroup {
    rank: usize,
    shared: Arc<LocalShared>,
}

struct LocalShared {
    world_size: usize,
    barrier: Barrier,
    slots: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
}

impl Debug for LocalShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalShared")
            .field("world_size", &self.world_size)
            .finish()
    }
}

impl LocalGroup {
    /// Creates one handle per rank. Hand each handle to a distinct thread.
    pub fn new(world_size: usize) -> Result<Vec<LocalGroup>> {
        ensure!(world_size > 0, "world_size must be positive");

        let shared = Arc::new(LocalShared {
            world_size,
            barrier: Barrier::new(world_size),
            slots: Mutex::new((0..world_size).map(|_| None).collect()),
        });

        Ok((0..world_size)
            .map(|rank| LocalGroup {
                rank,
                shared: shared.clone(),
            })
            .collect())
    }

    /// Publishes `value` and reads every rank's contribution with `read`.
    ///
    /// A poisoned lock means another worker panicked inside a collective and
    /// will never reach the barrier, so the whole process exits.
    fn exchange<T, R, F>(&self, value: T, read: F) -> Result<R>
    where
        T: Any + Send,
        F: FnOnce(Vec<&T>) -> Result<R>,
    {
        self.lock_slots()[self.rank] = Some(Box::new(value));
        self.shared.barrier.wait();

        let output = {
            let slots = self.lock_slots();
            let values: Option<Vec<&T>> = slots
                .iter()
                .map(|slot| slot.as_ref()?.downcast_ref::<T>())
                .collect();
            // every rank reaches the second barrier even when the read fails
            values
                .ok_or_else(|| {
                    format_err!("workers called mismatched collectives on the process group")
                })
                .and_then(read)
        };

        // keep the slots alive until every rank has read them
        self.shared.barrier.wait();
        output
    }

    fn lock_slots(&self) -> MutexGuard<'_, Vec<Option<Box<dyn Any + Send>>>> {
        match self.shared.slots.lock() {
            Ok(slots) => slots,
            Err(_) => {
                error!("process group state is poisoned, stopping all workers");
                std::process::exit(1);
            }
        }
    }
}

impl ProcessGroup for LocalGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.shared.world_size
    }

    fn all_reduce_f64(&self, values: &[f64]) -> Result<Vec<f64>> {
        let len = values.len();
        self.exchange(values.to_vec(), |contributions| {
            ensure!(
                contributions.iter().all(|values| values.len() == len),
                "workers reduced vectors of different lengths"
            );
            let sum = contributions.into_iter().fold(vec![0.0; len], |mut acc, values| {
                acc.iter_mut().zip(values).for_each(|(acc, value)| *acc += value);
                acc
            });
            Ok(sum)
        })
    }

    fn all_reduce_tensors(&self, tensors: &[Tensor]) -> Result<Vec<Tensor>> {
        let cpu_tensors: Vec<Tensor> = tch::no_grad(|| {
            tensors
                .iter()
                .map(|tensor| tensor.to_device(Device::Cpu).copy())
                .collect()
        });

        let sums = self.exchange(cpu_tensors, |contributions| {
            let len = tensors.len();
            ensure!(
                contributions.iter().all(|tensors| tensors.len() == len),
                "workers reduced tensor lists of different lengths"
            );
            let sums: Vec<Tensor> = tch::no_grad(|| {
                (0..len)
                    .map(|index| {
                        contributions
                            .iter()
                            .skip(1)
                            .fold(contributions[0][index].copy(), |acc, contribution| {
                                acc + &contribution[index]
                            })
                    })
                    .collect()
            });
            Ok(sums)
        })?;

        Ok(tch::no_grad(|| {
            izip!(sums, tensors)
                .map(|(sum, orig)| sum.to_device(orig.device()))
                .collect()
        }))
    }

    fn all_gather_bytes(&self, bytes: Vec<u8>) -> Result<Vec<Vec<u8>>> {
        self.exchange(bytes, |contributions| {
            Ok(contributions.into_iter().cloned().collect())
        })
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}
