use serde::{Deserialize, Serialize};
use vlpo_core::{PartitionStage, Precision};

use crate::error::{DistributedError, DistributedResult};

/// Configuration handed to the sharding runtime for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Partition stage.
    pub stage: PartitionStage,
    /// Offload optimizer state and parameters to host memory.
    pub offload: bool,
    /// Mixed-precision mode.
    pub precision: Precision,
    /// Micro batch per worker.
    pub train_micro_batch_size_per_gpu: usize,
    /// Micro steps per optimizer update.
    pub gradient_accumulation_steps: usize,
    /// Global batch: micro batch x workers x accumulation.
    pub train_batch_size: usize,
    /// Gradient norm clip.
    #[serde(default = "default_clipping")]
    pub gradient_clipping: f64,
    /// Workers in the data-parallel group.
    pub world_size: usize,
}

fn default_clipping() -> f64 {
    1.0
}

impl RuntimeConfig {
    /// Configuration for a trained model.
    pub fn for_training(
        stage: PartitionStage,
        offload: bool,
        precision: Precision,
        micro_batch: usize,
        gradient_accumulation_steps: usize,
        world_size: usize,
    ) -> Self {
        Self {
            stage,
            offload,
            precision,
            train_micro_batch_size_per_gpu: micro_batch,
            gradient_accumulation_steps,
            train_batch_size: micro_batch * world_size * gradient_accumulation_steps,
            gradient_clipping: default_clipping(),
            world_size,
        }
    }

    /// Configuration for an inference-only model.
    pub fn for_inference(
        stage: PartitionStage,
        offload: bool,
        precision: Precision,
        micro_batch: usize,
        world_size: usize,
    ) -> Self {
        Self::for_training(stage, offload, precision, micro_batch, 1, world_size)
    }

    /// Same configuration under a different stage.
    pub fn with_stage(mut self, stage: PartitionStage) -> Self {
        self.stage = stage;
        self
    }

    /// Check the batch arithmetic.
    pub fn validate(&self) -> DistributedResult<()> {
        if self.world_size == 0 || self.train_micro_batch_size_per_gpu == 0 {
            return Err(DistributedError::Config(
                "world size and micro batch must be positive".into(),
            ));
        }
        let expected =
            self.train_micro_batch_size_per_gpu * self.world_size * self.gradient_accumulation_steps;
        if self.train_batch_size != expected {
            return Err(DistributedError::Config(format!(
                "train_batch_size {} != micro batch {} x world {} x accumulation {}",
                self.train_batch_size,
                self.train_micro_batch_size_per_gpu,
                self.world_size,
                self.gradient_accumulation_steps
            )));
        }
        Ok(())
    }
}
