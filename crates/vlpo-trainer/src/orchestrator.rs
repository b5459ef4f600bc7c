//! Multi-model construction for DPO and RLHF runs.
//!
//! Every role is described by a [`RoleDescriptor`] and goes through the same two steps:
//!
//! 1. [`load_role_model`]: build the model under a stage-2 load configuration and copy in
//!    the role's checkpoint non-strictly.
//! 2. [`initialize_role`]: hand the model to the runtime under the role's own stage, with an
//!    optimizer and scheduler if the role is trained.
//!
//! The DPO setup runs step 1 for the policy first because the dataset needs the policy's
//! tokenizer and image processor, and the step plan needs the dataset size.

use std::path::PathBuf;

use vlpo_core::scheduler::{resolve_warmup_steps, updates_per_epoch};
use vlpo_core::{
    ModelArchitecture, ModelConfig, ModelRole, PartitionStage, Result, RlhfRunConfig,
    RoleSettings, SchedulerBuilder, TrainingConfig, VlpoError,
};
use vlpo_data::{ImageProcessor, PaddingSide, Tokenizer};
use vlpo_distributed::RuntimeConfig;

use crate::checkpoint::{load_non_strict, load_weights, LoadReport};
use crate::engine::{DistributedRuntime, TrainingEngine};
use crate::model::{BuiltModel, ModelBuilder, VisionLanguageModel};
use crate::optimizer::GroupedAdamW;
use crate::param_groups::ParameterGroupConfig;

/// Stage every model is built under before it reaches the runtime.
pub const LOAD_STAGE: PartitionStage = PartitionStage::Gradients;

/// Stage of frozen reference and reward models.
pub const FROZEN_STAGE: PartitionStage = PartitionStage::Parameters;

/// Tokenizer adjustments a role applies around its builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenizerSetup {
    /// Keep the tokenizer the builder returns.
    #[default]
    AsBuilt,
    /// Pad on the left, before and after building. DPO policy and reference.
    LeftPadded,
    /// Pad on the right and add BOS and EOS once built. Reward and critic.
    ValueHead,
}

impl TokenizerSetup {
    /// Text tokenizer handed to the builder.
    pub fn before_build(self, tokenizer: &Tokenizer) -> Tokenizer {
        match self {
            Self::LeftPadded => tokenizer.clone().with_padding_side(PaddingSide::Left),
            Self::AsBuilt | Self::ValueHead => tokenizer.clone(),
        }
    }

    /// Tokenizer the role ends up with.
    pub fn after_build(self, tokenizer: Tokenizer) -> Tokenizer {
        match self {
            Self::AsBuilt => tokenizer,
            Self::LeftPadded => tokenizer.with_padding_side(PaddingSide::Left),
            Self::ValueHead => tokenizer
                .with_padding_side(PaddingSide::Right)
                .with_special_tokens(true, true),
        }
    }
}

/// How one role is built and wrapped.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleDescriptor {
    /// Role.
    pub role: ModelRole,
    /// Whether the role gets an optimizer and scheduler.
    pub trainable: bool,
    /// Stage once handed to the runtime.
    pub stage: PartitionStage,
    /// Offload to host memory.
    pub offload: bool,
    /// Base learning rate; unused for frozen roles.
    pub learning_rate: f64,
    /// Directory holding `pytorch_model.bin`, if weights are loaded after building.
    pub checkpoint: Option<PathBuf>,
    /// Tokenizer adjustments.
    pub tokenizer: TokenizerSetup,
}

impl RoleDescriptor {
    fn trained(role: ModelRole, stage: PartitionStage, offload: bool, lr: f64, ckpt: Option<PathBuf>) -> Self {
        Self {
            role,
            trainable: true,
            stage,
            offload,
            learning_rate: lr,
            checkpoint: ckpt,
            tokenizer: TokenizerSetup::AsBuilt,
        }
    }

    fn frozen(role: ModelRole, offload: bool, ckpt: Option<PathBuf>) -> Self {
        Self {
            role,
            trainable: false,
            stage: FROZEN_STAGE,
            offload,
            learning_rate: 0.0,
            checkpoint: ckpt,
            tokenizer: TokenizerSetup::AsBuilt,
        }
    }

    /// DPO policy, left-padded.
    ///
    /// Only the built-in architecture reloads `from_checkpoint`; the others come fully
    /// initialized from the builder.
    pub fn dpo_policy(model: &ModelConfig, training: &TrainingConfig) -> Self {
        Self::trained(
            ModelRole::Actor,
            training.zero_stage,
            training.offload,
            training.learning_rate,
            dpo_checkpoint(model),
        )
        .with_tokenizer(TokenizerSetup::LeftPadded)
    }

    /// Frozen DPO reference, built like the policy.
    pub fn dpo_reference(model: &ModelConfig, training: &TrainingConfig) -> Self {
        Self::frozen(ModelRole::Reference, training.offload, dpo_checkpoint(model))
            .with_tokenizer(TokenizerSetup::LeftPadded)
    }

    /// RLHF actor.
    pub fn actor(actor: &RoleSettings) -> Self {
        Self::trained(
            ModelRole::Actor,
            actor.zero_stage,
            actor.offload,
            actor.learning_rate,
            Some(actor.model_path.clone()),
        )
    }

    /// Frozen snapshot of the actor's initial checkpoint.
    pub fn reference(actor: &RoleSettings) -> Self {
        Self::frozen(ModelRole::Reference, actor.offload, Some(actor.model_path.clone()))
    }

    /// RLHF critic.
    pub fn critic(critic: &RoleSettings) -> Self {
        Self::trained(
            ModelRole::Critic,
            critic.zero_stage,
            critic.offload,
            critic.learning_rate,
            Some(critic.model_path.clone()),
        )
        .with_tokenizer(TokenizerSetup::ValueHead)
    }

    /// Frozen reward model, loaded from the critic's checkpoint.
    pub fn reward(critic: &RoleSettings) -> Self {
        Self::frozen(ModelRole::Reward, critic.offload, Some(critic.model_path.clone()))
            .with_tokenizer(TokenizerSetup::ValueHead)
    }

    /// Replace the tokenizer adjustments.
    pub fn with_tokenizer(mut self, setup: TokenizerSetup) -> Self {
        self.tokenizer = setup;
        self
    }

    /// Configuration the builder sees.
    pub fn load_config(&self, training: &TrainingConfig, world_size: usize) -> RuntimeConfig {
        self.config_with_stage(LOAD_STAGE, training, world_size)
    }

    /// Configuration the runtime wraps the model with.
    pub fn runtime_config(&self, training: &TrainingConfig, world_size: usize) -> RuntimeConfig {
        self.config_with_stage(self.stage, training, world_size)
    }

    fn config_with_stage(
        &self,
        stage: PartitionStage,
        training: &TrainingConfig,
        world_size: usize,
    ) -> RuntimeConfig {
        if self.trainable {
            RuntimeConfig::for_training(
                stage,
                self.offload,
                training.precision,
                training.per_device_train_batch_size,
                training.gradient_accumulation_steps,
                world_size,
            )
        } else {
            RuntimeConfig::for_inference(
                stage,
                self.offload,
                training.precision,
                training.per_device_train_batch_size,
                world_size,
            )
        }
    }
}

fn dpo_checkpoint(model: &ModelConfig) -> Option<PathBuf> {
    (model.model_architecture == ModelArchitecture::Default).then(|| model.from_checkpoint.clone())
}

/// Optimizer update counts for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    /// Micro batches (or examples) per epoch on one worker.
    pub batches_per_epoch: usize,
    /// `ceil(batches_per_epoch / accumulation)`.
    pub updates_per_epoch: usize,
    /// Epochs.
    pub num_epochs: usize,
    /// Updates over the whole run.
    pub total_updates: usize,
    /// Warmup updates.
    pub warmup_updates: usize,
}

impl StepPlan {
    /// Plan for `batches_per_epoch` micro batches under `training`.
    pub fn new(batches_per_epoch: usize, training: &TrainingConfig) -> Result<Self> {
        let updates = updates_per_epoch(batches_per_epoch, training.gradient_accumulation_steps);
        let total_updates = updates * training.num_train_epochs;
        Ok(Self {
            batches_per_epoch,
            updates_per_epoch: updates,
            num_epochs: training.num_train_epochs,
            total_updates,
            warmup_updates: resolve_warmup_steps(training.num_warmup_steps, total_updates)?,
        })
    }
}

/// A built and loaded model that has not reached the runtime yet.
pub struct LoadedModel<M> {
    /// The model.
    pub model: M,
    /// Image processor returned by the builder.
    pub image_processor: ImageProcessor,
    /// Tokenizer returned by the builder.
    pub tokenizer: Tokenizer,
    /// Outcome of the checkpoint load, if one was configured.
    pub report: Option<LoadReport>,
}

/// A role under the runtime together with its preprocessing collaborators.
pub struct RoleEngine {
    /// Engine driving the model.
    pub engine: Box<dyn TrainingEngine>,
    /// Image processor returned by the builder.
    pub image_processor: ImageProcessor,
    /// Tokenizer returned by the builder, adjusted for the role.
    pub tokenizer: Tokenizer,
}

/// Build the model for `descriptor` and load its checkpoint.
pub fn load_role_model<B: ModelBuilder>(
    builder: &B,
    descriptor: &RoleDescriptor,
    text_tokenizer: &Tokenizer,
    model_config: &ModelConfig,
    training: &TrainingConfig,
    world_size: usize,
) -> Result<LoadedModel<B::Model>> {
    let load_config = descriptor.load_config(training, world_size);
    let BuiltModel {
        mut model,
        image_processor,
        tokenizer,
    } = builder.build(
        descriptor.role,
        &descriptor.tokenizer.before_build(text_tokenizer),
        model_config,
        &load_config,
    )?;
    let tokenizer = descriptor.tokenizer.after_build(tokenizer);

    let report = match &descriptor.checkpoint {
        Some(dir) => {
            tracing::info!("load {} model............", descriptor.role);
            let weights = load_weights(dir)?;
            let report = load_non_strict(&mut model, weights);
            report.log(descriptor.role.as_str());
            Some(report)
        }
        None => None,
    };

    Ok(LoadedModel {
        model,
        image_processor,
        tokenizer,
        report,
    })
}

/// Wrap `model` for `descriptor` under `runtime`.
pub fn initialize_role<R, M>(
    runtime: &R,
    descriptor: &RoleDescriptor,
    model: M,
    training: &TrainingConfig,
    plan: &StepPlan,
    world_size: usize,
) -> Result<Box<dyn TrainingEngine>>
where
    R: DistributedRuntime,
    M: VisionLanguageModel + 'static,
{
    let config = descriptor.runtime_config(training, world_size);
    let (optimizer, scheduler) = if descriptor.trainable {
        if descriptor.learning_rate <= 0.0 {
            return Err(VlpoError::Config(format!(
                "{} learning rate must be positive",
                descriptor.role
            )));
        }
        let groups = ParameterGroupConfig::for_role(training, descriptor.learning_rate);
        let optimizer = GroupedAdamW::new(&groups)?;
        let scheduler = SchedulerBuilder::new()
            .base_lr(descriptor.learning_rate)
            .schedule(plan.num_epochs, plan.updates_per_epoch)
            .warmup(training.num_warmup_steps)
            .scheduler_type(training.lr_scheduler_type)
            .build()?;
        (Some(optimizer), Some(scheduler))
    } else {
        (None, None)
    };

    runtime.initialize(descriptor.role, model, optimizer, config, scheduler)
}

/// [`load_role_model`] followed by [`initialize_role`].
#[allow(clippy::too_many_arguments)]
pub fn build_role<R: DistributedRuntime, B: ModelBuilder>(
    runtime: &R,
    builder: &B,
    descriptor: &RoleDescriptor,
    text_tokenizer: &Tokenizer,
    model_config: &ModelConfig,
    training: &TrainingConfig,
    plan: &StepPlan,
    world_size: usize,
) -> Result<RoleEngine>
where
    B::Model: 'static,
{
    let loaded = load_role_model(
        builder,
        descriptor,
        text_tokenizer,
        model_config,
        training,
        world_size,
    )?;
    let engine = initialize_role(runtime, descriptor, loaded.model, training, plan, world_size)?;
    Ok(RoleEngine {
        engine,
        image_processor: loaded.image_processor,
        tokenizer: loaded.tokenizer,
    })
}

/// Policy and frozen reference for DPO.
pub struct DpoEngines {
    /// Trained policy.
    pub policy: Box<dyn TrainingEngine>,
    /// Frozen reference.
    pub reference: Box<dyn TrainingEngine>,
}

impl DpoEngines {
    /// Pair the engines, checking which one trains.
    pub fn new(policy: Box<dyn TrainingEngine>, reference: Box<dyn TrainingEngine>) -> Result<Self> {
        if !policy.is_trainable() {
            return Err(VlpoError::Config("DPO policy engine must be trainable".into()));
        }
        if reference.is_trainable() {
            return Err(VlpoError::Config("DPO reference engine must be frozen".into()));
        }
        Ok(Self { policy, reference })
    }
}

/// Descriptors of the four RLHF roles, in construction order.
pub fn rlhf_roles(config: &RlhfRunConfig) -> [RoleDescriptor; 4] {
    [
        RoleDescriptor::actor(&config.actor),
        RoleDescriptor::reference(&config.actor),
        RoleDescriptor::reward(&config.critic),
        RoleDescriptor::critic(&config.critic),
    ]
}

/// Actor, reference, reward and critic engines.
pub struct RlhfEngines {
    /// Trained policy.
    pub actor: RoleEngine,
    /// Frozen reference.
    pub reference: RoleEngine,
    /// Frozen reward model.
    pub reward: RoleEngine,
    /// Trained value model.
    pub critic: RoleEngine,
}

impl RlhfEngines {
    /// Stand up all four roles.
    ///
    /// The actor and reference are built by `policy_builder` from `actor_tokenizer`; the
    /// reward and critic by `value_builder` from `reward_tokenizer`. Reward and critic
    /// tokenizers pad on the right and add both BOS and EOS. `num_examples` sizes the
    /// schedules of the trained roles.
    #[allow(clippy::too_many_arguments)]
    pub fn build<R, P, V>(
        runtime: &R,
        policy_builder: &P,
        value_builder: &V,
        actor_tokenizer: &Tokenizer,
        reward_tokenizer: &Tokenizer,
        config: &RlhfRunConfig,
        num_examples: usize,
        world_size: usize,
    ) -> Result<Self>
    where
        R: DistributedRuntime,
        P: ModelBuilder,
        V: ModelBuilder,
        P::Model: 'static,
        V::Model: 'static,
    {
        config.validate()?;
        let plan = StepPlan::new(num_examples, &config.training)?;
        let [actor, reference, reward, critic] = rlhf_roles(config);
        let training = &config.training;
        let model = &config.model;

        let actor = build_role(
            runtime, policy_builder, &actor, actor_tokenizer, model, training, &plan, world_size,
        )?;
        let reference = build_role(
            runtime, policy_builder, &reference, actor_tokenizer, model, training, &plan, world_size,
        )?;
        let reward = build_role(
            runtime, value_builder, &reward, reward_tokenizer, model, training, &plan, world_size,
        )?;
        let critic = build_role(
            runtime, value_builder, &critic, reward_tokenizer, model, training, &plan, world_size,
        )?;

        tracing::info!(
            "RLHF engines ready: {} updates per epoch, {} total, {} warmup",
            plan.updates_per_epoch,
            plan.total_updates,
            plan.warmup_updates
        );
        Ok(Self {
            actor,
            reference,
            reward,
            critic,
        })
    }

    /// Engines in construction order.
    pub fn engines(&self) -> [&dyn TrainingEngine; 4] {
        [
            self.actor.engine.as_ref(),
            self.reference.engine.as_ref(),
            self.reward.engine.as_ref(),
            self.critic.engine.as_ref(),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(stage: PartitionStage, lr: f64) -> RoleSettings {
        RoleSettings {
            model_path: PathBuf::from("/ckpt/actor"),
            zero_stage: stage,
            offload: true,
            learning_rate: lr,
        }
    }

    #[test]
    fn test_frozen_roles_use_parameter_partitioning() {
        let actor = settings(PartitionStage::Gradients, 2e-6);
        let reference = RoleDescriptor::reference(&actor);
        assert!(!reference.trainable);
        assert_eq!(reference.stage, PartitionStage::Parameters);
        assert!(reference.offload);
        assert_eq!(reference.checkpoint, Some(PathBuf::from("/ckpt/actor")));

        let reward = RoleDescriptor::reward(&actor);
        assert_eq!(reward.role, ModelRole::Reward);
        assert!(!reward.trainable);
    }

    #[test]
    fn test_trained_roles_keep_their_stage() {
        let critic = RoleDescriptor::critic(&settings(PartitionStage::OptimizerStates, 5e-6));
        assert!(critic.trainable);
        assert_eq!(critic.stage, PartitionStage::OptimizerStates);
        assert!((critic.learning_rate - 5e-6).abs() < 1e-15);
    }

    #[test]
    fn test_load_config_is_stage_two() {
        let training = TrainingConfig {
            per_device_train_batch_size: 2,
            gradient_accumulation_steps: 4,
            ..Default::default()
        };
        let actor = RoleDescriptor::actor(&settings(PartitionStage::Parameters, 1e-5));
        let load = actor.load_config(&training, 8);
        assert_eq!(load.stage, PartitionStage::Gradients);
        assert_eq!(load.train_batch_size, 64);

        let run = actor.runtime_config(&training, 8);
        assert_eq!(run.stage, PartitionStage::Parameters);

        let reference = RoleDescriptor::reference(&settings(PartitionStage::Gradients, 1e-5));
        assert_eq!(reference.runtime_config(&training, 8).gradient_accumulation_steps, 1);
    }

    #[test]
    fn test_dpo_checkpoint_only_for_default_architecture() {
        let training = TrainingConfig::default();
        let mut model = ModelConfig::default();
        assert!(RoleDescriptor::dpo_policy(&model, &training).checkpoint.is_some());

        model.model_architecture = ModelArchitecture::Llava;
        assert!(RoleDescriptor::dpo_policy(&model, &training).checkpoint.is_none());
        let reference = RoleDescriptor::dpo_reference(&model, &training);
        assert_eq!(reference.stage, PartitionStage::Parameters);
    }

    #[test]
    fn test_step_plan() {
        let training = TrainingConfig {
            num_train_epochs: 3,
            gradient_accumulation_steps: 4,
            num_warmup_steps: 0.1,
            ..Default::default()
        };
        let plan = StepPlan::new(10, &training).unwrap();
        assert_eq!(plan.updates_per_epoch, 3);
        assert_eq!(plan.total_updates, 9);
        assert_eq!(plan.warmup_updates, 0);

        let training = TrainingConfig {
            num_warmup_steps: 5.0,
            ..training
        };
        assert_eq!(StepPlan::new(10, &training).unwrap().warmup_updates, 5);
    }

    fn tiny_tokenizer() -> Tokenizer {
        let json = serde_json::json!({
            "version": "1.0",
            "truncation": null,
            "padding": null,
            "added_tokens": [],
            "normalizer": null,
            "pre_tokenizer": {"type": "Whitespace"},
            "post_processor": null,
            "decoder": null,
            "model": {"type": "WordLevel", "vocab": {"<unk>": 0, "hi": 1}, "unk_token": "<unk>"}
        });
        Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_dpo_roles_pad_on_the_left() {
        let training = TrainingConfig::default();
        let model = ModelConfig::default();
        let base = tiny_tokenizer();
        assert_eq!(base.padding_side(), PaddingSide::Right);

        for descriptor in [
            RoleDescriptor::dpo_policy(&model, &training),
            RoleDescriptor::dpo_reference(&model, &training),
        ] {
            assert_eq!(descriptor.tokenizer, TokenizerSetup::LeftPadded);
            let handed = descriptor.tokenizer.before_build(&base);
            assert_eq!(handed.padding_side(), PaddingSide::Left);
            // A builder that resets padding still ends up left-padded.
            let built = descriptor
                .tokenizer
                .after_build(tiny_tokenizer().with_padding_side(PaddingSide::Right));
            assert_eq!(built.padding_side(), PaddingSide::Left);
        }
    }

    #[test]
    fn test_value_roles_pad_right_with_bos_and_eos() {
        let critic_settings = settings(PartitionStage::Gradients, 5e-6);
        for descriptor in [
            RoleDescriptor::reward(&critic_settings),
            RoleDescriptor::critic(&critic_settings),
        ] {
            let handed = descriptor
                .tokenizer
                .before_build(&tiny_tokenizer().with_padding_side(PaddingSide::Left));
            assert_eq!(handed.padding_side(), PaddingSide::Left);

            let built = descriptor.tokenizer.after_build(handed);
            assert_eq!(built.padding_side(), PaddingSide::Right);
            assert!(built.add_bos_token());
            assert!(built.add_eos_token());
        }

        let actor = RoleDescriptor::actor(&settings(PartitionStage::Gradients, 1e-5));
        assert_eq!(actor.tokenizer, TokenizerSetup::AsBuilt);
        let built = actor
            .tokenizer
            .after_build(tiny_tokenizer().with_padding_side(PaddingSide::Left));
        assert_eq!(built.padding_side(), PaddingSide::Left);
        assert!(!built.add_eos_token());
    }

    #[test]
    fn test_rlhf_role_order() {
        let config = RlhfRunConfig {
            data: Default::default(),
            model: Default::default(),
            training: Default::default(),
            actor: settings(PartitionStage::Gradients, 1e-5),
            critic: settings(PartitionStage::Gradients, 5e-6),
        };
        let roles: Vec<ModelRole> = rlhf_roles(&config).iter().map(|d| d.role).collect();
        assert_eq!(
            roles,
            vec![ModelRole::Actor, ModelRole::Reference, ModelRole::Reward, ModelRole::Critic]
        );
    }
}
