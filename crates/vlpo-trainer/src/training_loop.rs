//! DPO training loop over a policy and a frozen reference.
//!
//! Each micro batch:
//!
//! 1. Drop rows flagged invalid and incomplete pair groups.
//! 2. Stack the kept rows and let the model adapter shape them for the architecture.
//! 3. Score the rows with the reference, then run the policy under autodiff with the DPO
//!    loss as the objective.
//! 4. At accumulation boundaries average gradients across workers and step the optimizer.
//! 5. Average the loss across workers and log the running mean on rank 0.
//!
//! Every worker enters the same collectives in the same order, so a batch that is empty on
//! any worker is skipped on all of them.

use std::path::PathBuf;

use mlx_rs::module::FlattenedModuleParam;
use mlx_rs::{Array, Dtype};
use vlpo_core::{DpoRunConfig, Result, VlpoError};
use vlpo_data::{PreferenceBatch, PreferenceDataLoader, WorkerContext};
use vlpo_distributed::DistributedContext;

use crate::adapter::ModelAdapter;
use crate::checkpoint::{save_epoch_checkpoint, TrainingState};
use crate::dpo::{DpoConfig, DpoLoss};
use crate::logprobs::gather_log_probs;
use crate::model::ModelOutput;
use crate::orchestrator::DpoEngines;

/// Loop settings.
#[derive(Debug, Clone)]
pub struct DpoLoopConfig {
    /// Objective.
    pub dpo: DpoConfig,
    /// Epochs to run.
    pub num_epochs: usize,
    /// Checkpoint root; `None` disables per-epoch checkpoints.
    pub output_dir: Option<PathBuf>,
    /// Seed recorded in checkpoints.
    pub seed: u64,
}

impl DpoLoopConfig {
    /// Settings from a run configuration.
    pub fn from_run(config: &DpoRunConfig) -> Self {
        Self {
            dpo: DpoConfig::from(&config.dpo),
            num_epochs: config.training.num_train_epochs,
            output_dir: Some(config.training.output_dir.clone()),
            seed: config.training.seed,
        }
    }
}

/// Result of one micro batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepOutcome {
    /// Local loss.
    pub loss: f32,
    /// Loss averaged across workers.
    pub mean_loss: f32,
    /// Rows used.
    pub rows: usize,
    /// Whether an optimizer update was applied.
    pub updated: bool,
}

/// Totals for one epoch.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochSummary {
    /// Epoch index.
    pub epoch: usize,
    /// Micro batches trained on.
    pub steps: usize,
    /// Micro batches skipped for lack of trainable rows.
    pub skipped: usize,
    /// Mean of the worker-averaged step losses.
    pub mean_loss: f64,
    /// Checkpoint written by this worker.
    pub checkpoint: Option<PathBuf>,
}

/// Totals for a run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DpoRunSummary {
    /// Per-epoch totals.
    pub epochs: Vec<EpochSummary>,
    /// Optimizer updates applied.
    pub global_steps: usize,
}

impl DpoRunSummary {
    /// Mean loss of the last epoch.
    pub fn final_loss(&self) -> Option<f64> {
        self.epochs.last().map(|e| e.mean_loss)
    }
}

/// Drives DPO training for one worker.
pub struct DpoTrainer {
    config: DpoLoopConfig,
    loss: DpoLoss,
    adapter: Box<dyn ModelAdapter>,
    ctx: DistributedContext,
}

impl DpoTrainer {
    /// Create a trainer.
    pub fn new(
        config: DpoLoopConfig,
        adapter: Box<dyn ModelAdapter>,
        ctx: DistributedContext,
    ) -> Result<Self> {
        let loss = DpoLoss::new(config.dpo)?;
        Ok(Self {
            config,
            loss,
            adapter,
            ctx,
        })
    }

    /// Distributed context of this worker.
    pub fn context(&self) -> &DistributedContext {
        &self.ctx
    }

    /// Run every epoch.
    pub async fn train(
        &mut self,
        engines: &mut DpoEngines,
        loader: &mut PreferenceDataLoader,
        worker: &mut WorkerContext,
    ) -> Result<DpoRunSummary> {
        if self.ctx.is_master() {
            tracing::info!("***** Running training *****");
        }
        let mut summary = DpoRunSummary::default();
        for epoch in 0..self.config.num_epochs {
            let epoch_summary = self.train_epoch(epoch, engines, loader, worker).await?;
            summary.epochs.push(epoch_summary);
        }
        summary.global_steps = engines.policy.global_steps();
        if self.ctx.is_master() {
            tracing::info!(
                "Training complete: {} updates, final loss {:.4}",
                summary.global_steps,
                summary.final_loss().unwrap_or(0.0)
            );
        }
        Ok(summary)
    }

    /// Run one epoch and write its checkpoint.
    pub async fn train_epoch(
        &mut self,
        epoch: usize,
        engines: &mut DpoEngines,
        loader: &mut PreferenceDataLoader,
        worker: &mut WorkerContext,
    ) -> Result<EpochSummary> {
        if self.ctx.is_master() {
            tracing::info!(
                "Beginning of Epoch {}/{}, Total Micro Batches {}",
                epoch + 1,
                self.config.num_epochs,
                loader.num_batches()
            );
        }
        loader.set_epoch(epoch);

        let mut running = 0.0f64;
        let mut steps = 0usize;
        let mut skipped = 0usize;
        let mut batch_index = 0usize;

        while let Some(batch) = loader.next_batch(worker)? {
            match self.train_step(engines, &batch, worker).await? {
                Some(outcome) => {
                    running += outcome.mean_loss as f64;
                    steps += 1;
                    if self.ctx.is_master() {
                        tracing::info!(
                            "Epoch {}, Step: {}, Loss: {:.6}",
                            epoch,
                            batch_index,
                            running / steps as f64
                        );
                    }
                }
                None => skipped += 1,
            }
            batch_index += 1;
        }
        self.flush_accumulation(engines).await?;

        let mean_loss = if steps > 0 { running / steps as f64 } else { 0.0 };
        let checkpoint = match &self.config.output_dir {
            Some(dir) => {
                let state = TrainingState::new(
                    epoch,
                    engines.policy.global_steps(),
                    mean_loss,
                    engines.policy.learning_rate(),
                )
                .with_seed(self.config.seed);
                save_epoch_checkpoint(&self.ctx, engines.policy.as_ref(), dir, &state).await?
            }
            None => None,
        };

        Ok(EpochSummary {
            epoch,
            steps,
            skipped,
            mean_loss,
            checkpoint,
        })
    }

    /// Train on one collated batch; `None` if every worker had to skip it.
    pub async fn train_step(
        &mut self,
        engines: &mut DpoEngines,
        batch: &PreferenceBatch,
        worker: &mut WorkerContext,
    ) -> Result<Option<StepOutcome>> {
        let trainable = batch.trainable_rows()?;
        for warning in trainable.warnings {
            worker.record_warning(warning);
        }

        let empty = if trainable.indices.is_empty() { 1.0 } else { 0.0 };
        if self.ctx.all_reduce_scalar_mean(empty).await? > 0.0 {
            if trainable.indices.is_empty() {
                tracing::warn!("rank {}: batch has no trainable rows, skipping", worker.rank);
            }
            return Ok(None);
        }
        if trainable.indices.len() % 2 != 0 {
            return Err(VlpoError::shape(
                "trainable rows (chosen/rejected pairs)",
                vec![trainable.indices.len() + 1],
                vec![trainable.indices.len()],
            ));
        }

        let tensors = batch.to_tensors(&trainable.indices)?;
        let inputs = self.adapter.prepare_inputs(&tensors)?;

        let reference_output = engines.reference.forward(&inputs)?;
        let reference_logits = self.adapter.extract_logits(&reference_output)?;
        let reference_logps =
            gather_log_probs(&reference_logits, &tensors.input_ids, &tensors.labels)?;
        reference_logps.eval()?;

        let adapter = self.adapter.as_ref();
        let dpo = &self.loss;
        let loss_fn = |output: &ModelOutput| -> Result<Array> {
            let logits = adapter.extract_logits(output)?;
            let policy_logps = gather_log_probs(&logits, &tensors.input_ids, &tensors.labels)?;
            Ok(dpo.compute(&policy_logps, &reference_logps)?.loss)
        };
        let loss = engines.policy.backward(&inputs, &loss_fn)?;

        if engines.policy.at_accumulation_boundary() && self.ctx.world_size() > 1 {
            if let Some(grads) = engines.policy.pending_gradients() {
                average_gradients(&self.ctx, grads).await?;
            }
        }
        let updated = engines.policy.step()?;
        let mean_loss = self.ctx.all_reduce_scalar_mean(loss).await?;

        Ok(Some(StepOutcome {
            loss,
            mean_loss,
            rows: tensors.rows,
            updated,
        }))
    }

    /// Apply gradients left over from a batch count that does not divide evenly.
    ///
    /// Skips are collective, so every worker holds the same number of pending micro batches.
    pub async fn flush_accumulation(&mut self, engines: &mut DpoEngines) -> Result<bool> {
        if self.ctx.world_size() > 1 {
            if let Some(grads) = engines.policy.pending_gradients() {
                average_gradients(&self.ctx, grads).await?;
            }
        }
        engines.policy.flush()
    }
}

/// Average gradients element-wise across workers, in place.
///
/// Keys are visited in sorted order so every worker reduces tensors in the same sequence.
pub async fn average_gradients(
    ctx: &DistributedContext,
    grads: &mut FlattenedModuleParam,
) -> Result<()> {
    let mut keys: Vec<_> = grads.keys().cloned().collect();
    keys.sort();

    for key in keys {
        let Some(grad) = grads.get_mut(&key) else {
            continue;
        };
        let dtype = grad.dtype();
        let shape = grad.shape().to_vec();
        let as_f32 = grad.as_dtype(Dtype::Float32)?;
        as_f32.eval()?;
        let mut values: Vec<f32> = as_f32.as_slice::<f32>().to_vec();

        ctx.all_reduce_mean_f32(&mut values).await?;

        let reduced = Array::from_slice(&values, &shape);
        *grad = if dtype == Dtype::Float32 {
            reduced
        } else {
            reduced.as_dtype(dtype)?
        };
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;
    use vlpo_distributed::InProcessGroup;

    #[tokio::test]
    async fn test_average_gradients_single_worker_is_identity() {
        let ctx = DistributedContext::local();
        let mut grads = FlattenedModuleParam::new();
        grads.insert(Rc::from("w"), Array::from_slice(&[1.0f32, -2.0], &[2]));
        average_gradients(&ctx, &mut grads).await.unwrap();

        let w = grads.get("w").unwrap();
        w.eval().unwrap();
        assert_eq!(w.as_slice::<f32>(), &[1.0, -2.0]);
    }

    #[test]
    fn test_average_gradients_across_workers() {
        let backends = InProcessGroup::new(2).unwrap();
        let handles: Vec<_> = backends
            .into_iter()
            .enumerate()
            .map(|(rank, backend)| {
                std::thread::spawn(move || {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                        .unwrap();
                    runtime.block_on(async move {
                        let ctx = DistributedContext::new(Box::new(backend));
                        let base = rank as f32 * 2.0;
                        let mut grads = FlattenedModuleParam::new();
                        grads.insert(Rc::from("b"), Array::from_slice(&[base], &[1]));
                        grads.insert(
                            Rc::from("a"),
                            Array::from_slice(&[base, base + 1.0], &[1, 2]),
                        );
                        average_gradients(&ctx, &mut grads).await.unwrap();

                        let a = grads.get("a").unwrap();
                        a.eval().unwrap();
                        assert_eq!(a.shape(), &[1, 2]);
                        let b = grads.get("b").unwrap();
                        b.eval().unwrap();
                        (a.as_slice::<f32>().to_vec(), b.item::<f32>())
                    })
                })
            })
            .collect();
        for handle in handles {
            let (a, b) = handle.join().unwrap();
            assert_eq!(a, vec![1.0, 2.0]);
            assert!((b - 1.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_loop_config_from_run() {
        let mut run = DpoRunConfig::default();
        run.dpo.beta = 0.2;
        run.training.num_train_epochs = 2;
        let config = DpoLoopConfig::from_run(&run);
        assert!((config.dpo.beta - 0.2).abs() < 1e-12);
        assert_eq!(config.num_epochs, 2);
        assert_eq!(config.seed, 1235);
    }
}
