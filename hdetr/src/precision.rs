//! Full and mixed precision backward/step policies.

use crate::common::*;

pub use grad_norm::*;
pub use grad_scaler::*;
pub use policy::*;

mod policy {
    use super::*;

    /// The per-step call sequence shared by precision modes.
    ///
    /// A training step calls [before_forward](PrecisionPolicy::before_forward),
    /// runs the forward pass with [autocast](PrecisionPolicy::autocast), then
    /// calls [backward](PrecisionPolicy::backward),
    /// [unscale](PrecisionPolicy::unscale) and finally
    /// [step](PrecisionPolicy::step). Gradients are zeroed exactly once along
    /// the way.
    pub trait PrecisionPolicy: Debug + Send {
        fn autocast(&self) -> bool;

        fn before_forward(&mut self, optimizer: &mut nn::Optimizer);

        fn backward(&mut self, optimizer: &mut nn::Optimizer, loss: &Tensor);

        /// Brings gradients back to their true magnitude before the norm is
        /// inspected.
        fn unscale(&mut self, vars: &[Tensor]);

        /// Returns false if the optimizer step was skipped.
        fn step(&mut self, optimizer: &mut nn::Optimizer, vars: &[Tensor]) -> bool;
    }

    #[derive(Debug, Clone, Copy, Default)]
    pub struct FullPrecision;

    impl PrecisionPolicy for FullPrecision {
        fn autocast(&self) -> bool {
            false
        }

        fn before_forward(&mut self, _optimizer: &mut nn::Optimizer) {}

        fn backward(&mut self, optimizer: &mut nn::Optimizer, loss: &Tensor) {
            optimizer.zero_grad();
            loss.backward();
        }

        fn unscale(&mut self, _vars: &[Tensor]) {}

        fn step(&mut self, optimizer: &mut nn::Optimizer, _vars: &[Tensor]) -> bool {
            optimizer.step();
            true
        }
    }

    /// Reduced precision forward with dynamic loss scaling.
    #[derive(Debug)]
    pub struct MixedPrecision {
        scaler: GradScaler,
    }

    impl MixedPrecision {
        pub fn new(scaler: GradScaler) -> Self {
            Self { scaler }
        }

        pub fn scaler(&self) -> &GradScaler {
            &self.scaler
        }
    }

    impl PrecisionPolicy for MixedPrecision {
        fn autocast(&self) -> bool {
            true
        }

        fn before_forward(&mut self, optimizer: &mut nn::Optimizer) {
            optimizer.zero_grad();
        }

        fn backward(&mut self, _optimizer: &mut nn::Optimizer, loss: &Tensor) {
            self.scaler.scale(loss).backward();
        }

        fn unscale(&mut self, vars: &[Tensor]) {
            self.scaler.unscale(vars);
        }

        fn step(&mut self, optimizer: &mut nn::Optimizer, vars: &[Tensor]) -> bool {
            let stepped = self.scaler.step(optimizer, vars);
            self.scaler.update();
            stepped
        }
    }
}

mod grad_scaler {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct GradScalerInit {
        pub init_scale: f64,
        pub growth_factor: f64,
        pub backoff_factor: f64,
        pub growth_interval: usize,
    }

    impl Default for GradScalerInit {
        fn default() -> Self {
            Self {
                init_scale: 65536.0,
                growth_factor: 2.0,
                backoff_factor: 0.5,
                growth_interval: 2000,
            }
        }
    }

    impl GradScalerInit {
        pub fn build(self) -> Result<GradScaler> {
            let Self {
                init_scale,
                growth_factor,
                backoff_factor,
                growth_interval,
            } = self;
            ensure!(
                init_scale.is_finite() && init_scale > 0.0,
                "init_scale must be positive"
            );
            ensure!(growth_factor > 1.0, "growth_factor must be greater than 1");
            ensure!(
                backoff_factor > 0.0 && backoff_factor < 1.0,
                "backoff_factor must be in range (0, 1)"
            );
            ensure!(growth_interval > 0, "growth_interval must be positive");

            Ok(GradScaler {
                scale: init_scale,
                growth_factor,
                backoff_factor,
                growth_interval,
                growth_tracker: 0,
                found_inf: None,
            })
        }
    }

    /// Dynamic loss scaler.
    ///
    /// The scale backs off whenever gradients overflow and grows after
    /// `growth_interval` consecutive finite steps.
    #[derive(Debug, Clone)]
    pub struct GradScaler {
        scale: f64,
        growth_factor: f64,
        backoff_factor: f64,
        growth_interval: usize,
        growth_tracker: usize,
        /// Set once gradients of the current step are unscaled.
        found_inf: Option<bool>,
    }

    impl GradScaler {
        pub fn scale_factor(&self) -> f64 {
            self.scale
        }

        pub fn scale(&self, loss: &Tensor) -> Tensor {
            loss * self.scale
        }

        /// Divides gradients by the scale. Repeated calls in one step are
        /// no-ops.
        pub fn unscale(&mut self, vars: &[Tensor]) {
            if self.found_inf.is_some() {
                return;
            }

            let inv_scale = 1.0 / self.scale;
            let found_inf = tch::no_grad(|| {
                vars.iter()
                    .map(|var| var.grad())
                    .filter(|grad| grad.defined())
                    .fold(false, |found_inf, mut grad| {
                        let unscaled = &grad * inv_scale;
                        grad.copy_(&unscaled);
                        let magnitude = f64::from(unscaled.abs().sum(Kind::Double));
                        found_inf || !magnitude.is_finite()
                    })
            });
            self.found_inf = Some(found_inf);
        }

        /// Runs the optimizer unless the unscaled gradients are not finite.
        pub fn step(&mut self, optimizer: &mut nn::Optimizer, vars: &[Tensor]) -> bool {
            self.unscale(vars);

            if self.found_inf == Some(true) {
                warn!(
                    "non-finite gradients found with scale {}, skip optimizer step",
                    self.scale
                );
                false
            } else {
                optimizer.step();
                true
            }
        }

        /// Adjusts the scale for the next step.
        pub fn update(&mut self) {
            match self.found_inf.take() {
                Some(true) => {
                    self.scale *= self.backoff_factor;
                    self.growth_tracker = 0;
                }
                Some(false) | None => {
                    self.growth_tracker += 1;
                    if self.growth_tracker >= self.growth_interval {
                        self.scale *= self.growth_factor;
                        self.growth_tracker = 0;
                    }
                }
            }
        }
    }
}

mod grad_norm {
    use super::*;

    /// The L2 norm over the gradients of all variables.
    pub fn total_grad_norm(vars: &[Tensor]) -> f64 {
        let sum_squares: f64 = tch::no_grad(|| {
            vars.iter()
                .map(|var| var.grad())
                .filter(|grad| grad.defined())
                .map(|grad| f64::from(grad.square().sum(Kind::Double)))
                .sum()
        });
        sum_squares.sqrt()
    }

    /// Rescales gradients so that their total norm does not exceed
    /// `max_norm`. Returns the norm before clipping.
    pub fn clip_grad_norm(vars: &[Tensor], max_norm: f64) -> f64 {
        let total_norm = total_grad_norm(vars);
        let clip_coef = max_norm / (total_norm + 1e-6);

        if clip_coef < 1.0 {
            tch::no_grad(|| {
                vars.iter()
                    .map(|var| var.grad())
                    .filter(|grad| grad.defined())
                    .for_each(|mut grad| {
                        let clipped = &grad * clip_coef;
                        grad.copy_(&clipped);
                    });
            });
        }

        total_norm
    }
}
