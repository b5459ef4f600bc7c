//! Uniform step interface over every model role.
//!
//! A [`DistributedRuntime`] wraps a model, its optional optimizer and scheduler into a
//! [`TrainingEngine`]. The loss step only calls `forward`, `backward` and `step`; which roles
//! take part is its only role-specific decision.
//!
//! Gradients are computed functionally: `backward` takes the inputs and a loss closure over
//! the model output, evaluates both under autodiff, and accumulates the resulting gradients.

use mlx_rs::error::Exception;
use mlx_rs::module::{FlattenedModuleParam, ModuleParameters};
use mlx_rs::{nn, Array};
use vlpo_core::{LearningRateScheduler, ModelRole, Result, VlpoError};
use vlpo_distributed::RuntimeConfig;

use crate::model::{ModelInputs, ModelOutput, ParameterMap, VisionLanguageModel};
use crate::optimizer::{clip_grad_norm, GroupedAdamW};

/// Loss over one model output.
pub type LossFn<'a> = dyn Fn(&ModelOutput) -> Result<Array> + 'a;

/// One model under the sharding runtime.
pub trait TrainingEngine {
    /// Role of the wrapped model.
    fn role(&self) -> ModelRole;

    /// Whether the engine owns an optimizer.
    fn is_trainable(&self) -> bool;

    /// Runtime configuration the engine was initialized with.
    fn runtime_config(&self) -> &RuntimeConfig;

    /// Forward pass. Frozen engines return outputs detached from autodiff.
    fn forward(&mut self, inputs: &ModelInputs) -> Result<ModelOutput>;

    /// Evaluate `loss_fn` on a forward pass, accumulate its gradients and return the loss.
    fn backward(&mut self, inputs: &ModelInputs, loss_fn: &LossFn<'_>) -> Result<f32>;

    /// Apply the optimizer at accumulation boundaries; returns whether an update happened.
    fn step(&mut self) -> Result<bool>;

    /// Apply a partial accumulation as a full update, rescaled to the micro batches seen.
    ///
    /// Returns false when nothing is pending.
    fn flush(&mut self) -> Result<bool>;

    /// Accumulated gradients awaiting the next update.
    fn pending_gradients(&mut self) -> Option<&mut FlattenedModuleParam>;

    /// Whether the next `step` applies an update.
    fn at_accumulation_boundary(&self) -> bool;

    /// Current base learning rate, 0 for frozen engines.
    fn learning_rate(&self) -> f64;

    /// Optimizer updates applied so far.
    fn global_steps(&self) -> usize;

    /// Copy of every named parameter.
    fn state_dict(&self) -> ParameterMap;
}

/// The sharding runtime collaborator.
pub trait DistributedRuntime {
    /// Wrap `model` for `role`. Trainable roles pass an optimizer and scheduler.
    fn initialize<M: VisionLanguageModel + 'static>(
        &self,
        role: ModelRole,
        model: M,
        optimizer: Option<GroupedAdamW>,
        config: RuntimeConfig,
        scheduler: Option<LearningRateScheduler>,
    ) -> Result<Box<dyn TrainingEngine>>;
}

/// Runtime holding a full replica per worker.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRuntime;

impl DistributedRuntime for LocalRuntime {
    fn initialize<M: VisionLanguageModel + 'static>(
        &self,
        role: ModelRole,
        model: M,
        optimizer: Option<GroupedAdamW>,
        config: RuntimeConfig,
        scheduler: Option<LearningRateScheduler>,
    ) -> Result<Box<dyn TrainingEngine>> {
        config.validate()?;
        Ok(Box::new(LocalEngine::new(
            role, model, optimizer, config, scheduler,
        )?))
    }
}

/// Optimizer state for a trainable engine.
struct Trainer {
    optimizer: GroupedAdamW,
    scheduler: LearningRateScheduler,
    accumulated: Option<FlattenedModuleParam>,
    micro_steps: usize,
}

/// Engine over a locally held model.
pub struct LocalEngine<M> {
    role: ModelRole,
    model: M,
    trainer: Option<Trainer>,
    config: RuntimeConfig,
    global_steps: usize,
}

impl<M: VisionLanguageModel> LocalEngine<M> {
    fn new(
        role: ModelRole,
        mut model: M,
        optimizer: Option<GroupedAdamW>,
        config: RuntimeConfig,
        scheduler: Option<LearningRateScheduler>,
    ) -> Result<Self> {
        let trainer = match (optimizer, scheduler) {
            (Some(mut optimizer), Some(scheduler)) => {
                optimizer.set_learning_rate(scheduler.current_lr() as f32);
                Some(Trainer {
                    optimizer,
                    scheduler,
                    accumulated: None,
                    micro_steps: 0,
                })
            }
            (None, None) => {
                model.freeze_parameters(true);
                None
            }
            _ => {
                return Err(VlpoError::Config(format!(
                    "{role} engine needs both an optimizer and a scheduler, or neither"
                )))
            }
        };

        tracing::info!(
            "initialized {} engine: stage {}, offload {}, trainable {}",
            role,
            config.stage,
            config.offload,
            trainer.is_some()
        );

        Ok(Self {
            role,
            model,
            trainer,
            config,
            global_steps: 0,
        })
    }

    fn trainer_mut(&mut self, op: &str) -> Result<&mut Trainer> {
        let role = self.role;
        self.trainer
            .as_mut()
            .ok_or_else(|| VlpoError::Training(format!("{op} called on frozen {role} engine")))
    }
}

impl<M: VisionLanguageModel> TrainingEngine for LocalEngine<M> {
    fn role(&self) -> ModelRole {
        self.role
    }

    fn is_trainable(&self) -> bool {
        self.trainer.is_some()
    }

    fn runtime_config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn forward(&mut self, inputs: &ModelInputs) -> Result<ModelOutput> {
        let output = self.model.forward(inputs)?;
        if self.trainer.is_some() {
            Ok(output)
        } else {
            Ok(output.stop_gradient()?)
        }
    }

    fn backward(&mut self, inputs: &ModelInputs, loss_fn: &LossFn<'_>) -> Result<f32> {
        let accum = self.config.gradient_accumulation_steps.max(1);
        self.trainer_mut("backward")?;

        let step_loss = |model: &mut M, inputs: &ModelInputs| -> std::result::Result<Array, Exception> {
            let output = model.forward(inputs)?;
            loss_fn(&output).map_err(|e| Exception::custom(e.to_string()))
        };
        let mut loss_and_grad_fn = nn::value_and_grad(step_loss);
        let (loss, grads) = loss_and_grad_fn(&mut self.model, inputs)?;
        loss.eval()?;
        let loss_val = loss.item::<f32>();

        let scale = Array::from_f32(1.0 / accum as f32);
        let trainer = self.trainer_mut("backward")?;
        match &mut trainer.accumulated {
            None => {
                let mut scaled = FlattenedModuleParam::new();
                for (k, v) in grads {
                    scaled.insert(k, v.multiply(&scale)?);
                }
                trainer.accumulated = Some(scaled);
            }
            Some(acc) => {
                for (key, grad) in grads {
                    if let Some(existing) = acc.get_mut(&key) {
                        *existing = existing.add(&grad.multiply(&scale)?)?;
                    }
                }
            }
        }
        trainer.micro_steps += 1;
        Ok(loss_val)
    }

    fn step(&mut self) -> Result<bool> {
        let accum = self.config.gradient_accumulation_steps.max(1);
        let clip = self.config.gradient_clipping as f32;
        let role = self.role;
        let trainer = self
            .trainer
            .as_mut()
            .ok_or_else(|| VlpoError::Training(format!("step called on frozen {role} engine")))?;

        if trainer.micro_steps < accum {
            return Ok(false);
        }
        trainer.micro_steps = 0;
        let Some(mut grads) = trainer.accumulated.take() else {
            return Ok(false);
        };

        let grad_norm = clip_grad_norm(&mut grads, clip)?;
        trainer.optimizer.update(&mut self.model, &grads)?;
        trainer.scheduler.step();
        let lr = trainer.scheduler.current_lr();
        trainer.optimizer.set_learning_rate(lr as f32);
        self.global_steps += 1;

        tracing::debug!(
            "{} update {}: grad_norm {:.4}, lr {:.3e}",
            role,
            self.global_steps,
            grad_norm,
            lr
        );
        Ok(true)
    }

    fn flush(&mut self) -> Result<bool> {
        let accum = self.config.gradient_accumulation_steps.max(1);
        let trainer = self.trainer_mut("flush")?;
        let seen = trainer.micro_steps;
        if seen == 0 || trainer.accumulated.is_none() {
            return Ok(false);
        }
        if seen < accum {
            let scale = Array::from_f32(accum as f32 / seen as f32);
            if let Some(acc) = trainer.accumulated.as_mut() {
                for grad in acc.values_mut() {
                    *grad = grad.multiply(&scale)?;
                }
            }
            tracing::debug!("{}: flushing {} of {} micro batches", self.role, seen, accum);
        }
        let trainer = self.trainer_mut("flush")?;
        trainer.micro_steps = accum;
        self.step()
    }

    fn pending_gradients(&mut self) -> Option<&mut FlattenedModuleParam> {
        self.trainer.as_mut().and_then(|t| t.accumulated.as_mut())
    }

    fn at_accumulation_boundary(&self) -> bool {
        let accum = self.config.gradient_accumulation_steps.max(1);
        self.trainer
            .as_ref()
            .is_some_and(|t| t.micro_steps >= accum)
    }

    fn learning_rate(&self) -> f64 {
        self.trainer
            .as_ref()
            .map(|t| t.optimizer.learning_rate() as f64)
            .unwrap_or(0.0)
    }

    fn global_steps(&self) -> usize {
        self.global_steps
    }

    fn state_dict(&self) -> ParameterMap {
        self.model
            .parameters()
            .flatten()
            .into_iter()
            .map(|(k, v)| (k, v.clone()))
            .collect()
    }
}
