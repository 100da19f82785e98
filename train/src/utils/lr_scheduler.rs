use crate::{common::*, config::LearningRateSchedule};

/// Maps an epoch to its learning rate.
#[derive(Debug, Clone)]
pub enum LrScheduler {
    Constant {
        lr: R64,
    },
    /// Sorted `(start_epoch, lr)` pairs starting from epoch zero.
    StepWise {
        steps: Vec<(usize, R64)>,
    },
}

impl LrScheduler {
    pub fn new(config: &LearningRateSchedule) -> Result<Self> {
        let scheduler = match *config {
            LearningRateSchedule::Constant { lr } => {
                ensure!(lr > 0.0, "the lr must be positive");
                Self::Constant { lr }
            }
            LearningRateSchedule::StepWise { ref steps } => {
                ensure!(
                    !steps.is_empty() && steps[0].0 == 0,
                    "the steps must start from zero"
                );

                steps.iter().try_fold(None, |prev_epoch, &(curr_epoch, lr)| {
                    if let Some(prev_epoch) = prev_epoch {
                        ensure!(curr_epoch > prev_epoch, "the steps must be monotonic");
                    }
                    ensure!(lr > 0.0, "lr must be positive");
                    Ok(Some(curr_epoch))
                })?;

                Self::StepWise {
                    steps: steps.clone(),
                }
            }
        };

        Ok(scheduler)
    }

    pub fn lr(&self, epoch: usize) -> f64 {
        match self {
            Self::Constant { lr } => lr.raw(),
            Self::StepWise { steps } => {
                let index = match steps.binary_search_by_key(&epoch, |(start, _lr)| *start) {
                    Ok(index) => index,
                    // the first step starts from zero, so index > 0
                    Err(index) => index - 1,
                };
                steps[index].1.raw()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_wise_schedule() -> Result<()> {
        let scheduler = LrScheduler::new(&LearningRateSchedule::StepWise {
            steps: vec![(0, r64(2e-4)), (40, r64(2e-5))],
        })?;

        assert_abs_diff_eq!(scheduler.lr(0), 2e-4);
        assert_abs_diff_eq!(scheduler.lr(39), 2e-4);
        assert_abs_diff_eq!(scheduler.lr(40), 2e-5);
        assert_abs_diff_eq!(scheduler.lr(100), 2e-5);
        Ok(())
    }

    #[test]
    fn reject_unordered_steps() {
        let result = LrScheduler::new(&LearningRateSchedule::StepWise {
            steps: vec![(0, r64(1e-4)), (5, r64(1e-5)), (3, r64(1e-6))],
        });
        assert!(result.is_err());
    }
}
