//! Model collaborator contracts.
//!
//! Architectures live outside this crate. A [`ModelBuilder`] turns a text tokenizer, the model
//! configuration and a runtime configuration into a [`BuiltModel`]: the model, its image
//! processor and the tokenizer it expects.

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::error::Exception;
use mlx_rs::module::ModuleParameters;
use mlx_rs::Array;
use vlpo_core::{ModelConfig, ModelRole, Result};
use vlpo_data::{ImageProcessor, Tokenizer};
use vlpo_distributed::RuntimeConfig;

/// Named parameter tensors.
pub type ParameterMap = HashMap<Rc<str>, Array>;

/// Keyword inputs for one forward pass.
#[derive(Debug, Clone)]
pub struct ModelInputs {
    /// `[B, L]` token ids.
    pub input_ids: Array,
    /// `[B, L]` attention mask.
    pub attention_mask: Array,
    /// `[B, L]` labels, when the model computes its own loss.
    pub labels: Option<Array>,
    /// Pixel values, laid out per architecture.
    pub pixel_values: Option<Array>,
    /// `[B]` images per row.
    pub image_num: Option<Array>,
    /// `[B, 2]` original image sizes.
    pub image_sizes: Option<Array>,
    /// Tile grid ids.
    pub aspect_ratio_ids: Option<Array>,
    /// Tile masks.
    pub aspect_ratio_mask: Option<Array>,
}

impl ModelInputs {
    /// Text-only inputs.
    pub fn text(input_ids: Array, attention_mask: Array) -> Self {
        Self {
            input_ids,
            attention_mask,
            labels: None,
            pixel_values: None,
            image_num: None,
            image_sizes: None,
            aspect_ratio_ids: None,
            aspect_ratio_mask: None,
        }
    }
}

/// Output of one forward pass.
#[derive(Debug, Clone)]
pub struct ModelOutput {
    /// Loss computed by the model, if labels were passed.
    pub loss: Option<Array>,
    /// `[B, L', V]` logits over the full merged sequence.
    pub logits: Array,
    /// `[B, L, V]` logits with image-feature positions removed, aligned with `input_ids`.
    pub logits_drop_image: Option<Array>,
}

impl ModelOutput {
    /// Output carrying only logits.
    pub fn from_logits(logits: Array) -> Self {
        Self {
            loss: None,
            logits,
            logits_drop_image: None,
        }
    }

    /// Detach every tensor from the autodiff graph.
    pub fn stop_gradient(self) -> std::result::Result<Self, Exception> {
        Ok(Self {
            loss: self.loss.map(|l| mlx_rs::stop_gradient(&l)).transpose()?,
            logits: mlx_rs::stop_gradient(&self.logits)?,
            logits_drop_image: self
                .logits_drop_image
                .map(|l| mlx_rs::stop_gradient(&l))
                .transpose()?,
        })
    }
}

/// A vision-language model with named parameters.
pub trait VisionLanguageModel: ModuleParameters {
    /// Run a forward pass.
    fn forward(&mut self, inputs: &ModelInputs) -> std::result::Result<ModelOutput, Exception>;
}

/// Everything a builder returns for one role.
pub struct BuiltModel<M> {
    /// The model.
    pub model: M,
    /// Image processor matching the vision tower.
    pub image_processor: ImageProcessor,
    /// Tokenizer the model expects.
    pub tokenizer: Tokenizer,
}

/// Constructs models for a role.
pub trait ModelBuilder {
    /// Model type produced.
    type Model: VisionLanguageModel;

    /// Build a model under `runtime`.
    fn build(
        &self,
        role: ModelRole,
        text_tokenizer: &Tokenizer,
        config: &ModelConfig,
        runtime: &RuntimeConfig,
    ) -> Result<BuiltModel<Self::Model>>;
}
