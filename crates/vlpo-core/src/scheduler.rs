//! Learning rate schedules for optimizer updates.
//!
//! The scheduler counts optimizer updates, not micro steps.

use crate::{LrSchedulerType, Result, VlpoError};
use std::f64::consts::PI;

/// Learning rate scheduler that computes LR from update progress.
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    base_lr: f64,
    min_lr: f64,
    total_steps: usize,
    warmup_steps: usize,
    scheduler_type: LrSchedulerType,
    num_restarts: usize,
    current_step: usize,
}

impl LearningRateScheduler {
    /// Create a new learning rate scheduler.
    pub fn new(
        base_lr: f64,
        total_steps: usize,
        warmup_steps: usize,
        scheduler_type: LrSchedulerType,
    ) -> Self {
        Self {
            base_lr,
            min_lr: 0.0,
            total_steps,
            warmup_steps,
            scheduler_type,
            num_restarts: 1,
            current_step: 0,
        }
    }

    /// Set minimum learning rate.
    pub fn with_min_lr(mut self, min_lr: f64) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// Set number of restarts for cosine with restarts.
    pub fn with_num_restarts(mut self, num_restarts: usize) -> Self {
        self.num_restarts = num_restarts;
        self
    }

    /// Learning rate for a specific update.
    #[must_use]
    pub fn get_lr(&self, step: usize) -> f64 {
        if self.scheduler_type == LrSchedulerType::Constant {
            return self.base_lr;
        }

        if step < self.warmup_steps {
            let warmup_factor = step as f64 / self.warmup_steps.max(1) as f64;
            return self.min_lr + (self.base_lr - self.min_lr) * warmup_factor;
        }

        let decay_steps = self.total_steps.saturating_sub(self.warmup_steps);
        let current_decay_step = step.saturating_sub(self.warmup_steps);

        if decay_steps == 0 {
            return self.base_lr;
        }

        let progress = (current_decay_step as f64 / decay_steps as f64).min(1.0);

        match self.scheduler_type {
            LrSchedulerType::Constant | LrSchedulerType::ConstantWithWarmup => self.base_lr,

            LrSchedulerType::Linear => {
                self.min_lr + (self.base_lr - self.min_lr) * (1.0 - progress)
            }

            LrSchedulerType::Cosine => {
                self.min_lr + (self.base_lr - self.min_lr) * 0.5 * (1.0 + (PI * progress).cos())
            }

            LrSchedulerType::CosineWithRestarts => {
                let cycle_length = decay_steps / self.num_restarts.max(1);
                let cycle_progress = if cycle_length > 0 {
                    (current_decay_step % cycle_length) as f64 / cycle_length as f64
                } else {
                    0.0
                };
                self.min_lr
                    + (self.base_lr - self.min_lr) * 0.5 * (1.0 + (PI * cycle_progress).cos())
            }

            LrSchedulerType::Polynomial => {
                let power = 2.0;
                self.min_lr + (self.base_lr - self.min_lr) * (1.0 - progress).powf(power)
            }
        }
    }

    /// Learning rate for the current update.
    #[must_use]
    pub fn current_lr(&self) -> f64 {
        self.get_lr(self.current_step)
    }

    /// Advance by one optimizer update.
    pub fn step(&mut self) {
        self.current_step += 1;
    }

    /// Set the current update (used when resuming).
    pub fn set_step(&mut self, step: usize) {
        self.current_step = step;
    }

    /// Current update count.
    #[must_use]
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Total updates this schedule spans.
    #[must_use]
    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// Warmup updates.
    #[must_use]
    pub fn warmup_steps(&self) -> usize {
        self.warmup_steps
    }
}

/// Number of optimizer updates per epoch: `ceil(batches / accumulation)`.
pub fn updates_per_epoch(batches_per_epoch: usize, gradient_accumulation_steps: usize) -> usize {
    batches_per_epoch.div_ceil(gradient_accumulation_steps.max(1))
}

/// Resolve a warmup setting to an update count.
///
/// Values `<= 1` are a fraction of all updates in the run, larger values are an absolute count.
pub fn resolve_warmup_steps(num_warmup_steps: f64, total_updates: usize) -> Result<usize> {
    if !num_warmup_steps.is_finite() || num_warmup_steps < 0.0 {
        return Err(VlpoError::Config(format!(
            "num_warmup_steps must be a non-negative number, got {num_warmup_steps}"
        )));
    }
    if num_warmup_steps <= 1.0 {
        Ok((num_warmup_steps * total_updates as f64) as usize)
    } else {
        Ok(num_warmup_steps as usize)
    }
}

/// Builder for `LearningRateScheduler`.
#[derive(Debug, Clone)]
pub struct SchedulerBuilder {
    base_lr: f64,
    min_lr: f64,
    num_epochs: usize,
    updates_per_epoch: usize,
    warmup: f64,
    scheduler_type: LrSchedulerType,
    num_restarts: usize,
}

impl Default for SchedulerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SchedulerBuilder {
    /// Create a new scheduler builder.
    pub fn new() -> Self {
        Self {
            base_lr: 1e-3,
            min_lr: 0.0,
            num_epochs: 1,
            updates_per_epoch: 1,
            warmup: 0.0,
            scheduler_type: LrSchedulerType::Cosine,
            num_restarts: 1,
        }
    }

    /// Set base learning rate.
    pub fn base_lr(mut self, lr: f64) -> Self {
        self.base_lr = lr;
        self
    }

    /// Set minimum learning rate.
    pub fn min_lr(mut self, lr: f64) -> Self {
        self.min_lr = lr;
        self
    }

    /// Set epochs and optimizer updates per epoch.
    pub fn schedule(mut self, num_epochs: usize, updates_per_epoch: usize) -> Self {
        self.num_epochs = num_epochs;
        self.updates_per_epoch = updates_per_epoch;
        self
    }

    /// Set warmup, as a fraction (`<= 1`) or an update count.
    pub fn warmup(mut self, warmup: f64) -> Self {
        self.warmup = warmup;
        self
    }

    /// Set scheduler type.
    pub fn scheduler_type(mut self, scheduler: LrSchedulerType) -> Self {
        self.scheduler_type = scheduler;
        self
    }

    /// Set number of restarts for cosine with restarts.
    pub fn num_restarts(mut self, restarts: usize) -> Self {
        self.num_restarts = restarts;
        self
    }

    /// Build the scheduler.
    pub fn build(self) -> Result<LearningRateScheduler> {
        let total_steps = self.num_epochs * self.updates_per_epoch;
        let warmup_steps = resolve_warmup_steps(self.warmup, total_steps)?;

        Ok(LearningRateScheduler::new(
            self.base_lr,
            total_steps,
            warmup_steps,
            self.scheduler_type,
        )
        .with_min_lr(self.min_lr)
        .with_num_restarts(self.num_restarts))
    }
}
