//! Epoch-based step decay of the learning rate.

use burn::prelude::*;

use crate::SbirError;

/// Configuration for [`StepLr`].
#[derive(Config, Debug)]
pub struct StepLrConfig {
    /// Epochs between decays.
    pub step_size: usize,
    /// Multiplicative decay factor.
    #[config(default = 0.1)]
    pub gamma: f64,
}

impl StepLrConfig {
    /// Build a scheduler starting at `base_lr`.
    ///
    /// # Errors
    /// `InvalidConfig` if `step_size` is zero or `base_lr` is not a positive finite number.
    pub fn init(&self, base_lr: f64) -> Result<StepLr, SbirError> {
        if self.step_size == 0 {
            return Err(SbirError::InvalidConfig(
                "lr_scheduler_step_size must be > 0".to_string(),
            ));
        }
        if !(base_lr.is_finite() && base_lr > 0.0) {
            return Err(SbirError::InvalidConfig(format!(
                "learning rate must be positive, got {base_lr}"
            )));
        }
        Ok(StepLr {
            base_lr,
            step_size: self.step_size,
            gamma: self.gamma,
            stepped: 0,
        })
    }
}

/// `lr = base_lr * gamma^floor(stepped / step_size)`.
///
/// Stepped once per epoch, after that epoch's optimizer updates. Resuming at
/// epoch `n` calls [`advance(n)`](StepLr::advance) so the rate matches an
/// uninterrupted run.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    base_lr: f64,
    step_size: usize,
    gamma: f64,
    stepped: usize,
}

impl StepLr {
    /// Current learning rate.
    pub fn lr(&self) -> f64 {
        let decays = (self.stepped / self.step_size) as i32;
        self.base_lr * self.gamma.powi(decays)
    }

    /// Mark one epoch complete; returns the rate for the next epoch.
    pub fn step(&mut self) -> f64 {
        self.stepped += 1;
        self.lr()
    }

    /// Step `epochs` times without training.
    pub fn advance(&mut self, epochs: usize) -> f64 {
        self.stepped += epochs;
        self.lr()
    }

    pub fn epochs_stepped(&self) -> usize {
        self.stepped
    }

    pub fn base_lr(&self) -> f64 {
        self.base_lr
    }
}
