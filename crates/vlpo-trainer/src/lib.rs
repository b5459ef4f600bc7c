//! Multi-model orchestration and DPO training for vlpo.
//!
//! This crate provides:
//! - Sequence log-probabilities over masked labels
//! - The DPO loss with label smoothing
//! - Four-group AdamW with decay and pretrained-component learning rates
//! - Model, builder and engine contracts plus a local runtime
//! - Per-architecture model adapters
//! - Role-driven construction of actor, reference, reward and critic models
//! - Epoch checkpoints and non-strict weight loading
//! - The DPO training loop
//!
//! ```ignore
//! use vlpo_trainer::prelude::*;
//!
//! let policy = load_role_model(&builder, &RoleDescriptor::dpo_policy(&model, &training), ..)?;
//! let plan = StepPlan::new(loader.num_batches(), &training)?;
//! let policy = initialize_role(&LocalRuntime, &descriptor, policy.model, &training, &plan, 1)?;
//! let mut engines = DpoEngines::new(policy, reference)?;
//! trainer.train(&mut engines, &mut loader, &mut worker).await?;
//! ```

#![warn(missing_docs)]

pub mod adapter;
pub mod checkpoint;
pub mod dpo;
pub mod engine;
pub mod logprobs;
pub mod model;
pub mod optimizer;
pub mod orchestrator;
pub mod param_groups;
pub mod training_loop;

pub use adapter::{adapter_for, ModelAdapter};
pub use checkpoint::{load_non_strict, load_weights, LoadReport, TrainingState};
pub use dpo::{DpoConfig, DpoLoss, DpoLossOutput, DpoMetrics};
pub use engine::{DistributedRuntime, LocalRuntime, LossFn, TrainingEngine};
pub use logprobs::gather_log_probs;
pub use model::{BuiltModel, ModelBuilder, ModelInputs, ModelOutput, ParameterMap, VisionLanguageModel};
pub use optimizer::{clip_grad_norm, GroupedAdamW};
pub use orchestrator::{
    build_role, initialize_role, load_role_model, rlhf_roles, DpoEngines, LoadedModel,
    RlhfEngines, RoleDescriptor, RoleEngine, StepPlan, TokenizerSetup,
};
pub use param_groups::{ParameterGroupConfig, ParameterGroupKind};
pub use training_loop::{DpoLoopConfig, DpoRunSummary, DpoTrainer, EpochSummary, StepOutcome};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::adapter::{adapter_for, ModelAdapter};
    pub use crate::dpo::{DpoConfig, DpoLoss};
    pub use crate::engine::{DistributedRuntime, LocalRuntime, TrainingEngine};
    pub use crate::model::{BuiltModel, ModelBuilder, ModelInputs, ModelOutput, VisionLanguageModel};
    pub use crate::orchestrator::{
        build_role, initialize_role, load_role_model, DpoEngines, RlhfEngines, RoleDescriptor,
        StepPlan,
    };
    pub use crate::training_loop::{DpoLoopConfig, DpoTrainer};
}
