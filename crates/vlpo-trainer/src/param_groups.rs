//! Parameter grouping for trained roles.
//!
//! Parameters split four ways: weight decay on or off, and base or pretrained-component
//! learning rate. Biases and norm weights never decay. Embeddings count as pretrained
//! components and may use a smaller learning rate.

use vlpo_core::TrainingConfig;

/// One of the four optimizer groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParameterGroupKind {
    /// Base learning rate, weight decay applied.
    Decay,
    /// Base learning rate, no weight decay.
    NoDecay,
    /// Pretrained-component learning rate, weight decay applied.
    PretrainedDecay,
    /// Pretrained-component learning rate, no weight decay.
    PretrainedNoDecay,
}

impl ParameterGroupKind {
    /// All kinds in group order.
    pub const ALL: [Self; 4] = [
        Self::Decay,
        Self::NoDecay,
        Self::PretrainedDecay,
        Self::PretrainedNoDecay,
    ];

    /// Position in [`Self::ALL`].
    pub fn index(self) -> usize {
        match self {
            Self::Decay => 0,
            Self::NoDecay => 1,
            Self::PretrainedDecay => 2,
            Self::PretrainedNoDecay => 3,
        }
    }

    /// Whether weight decay applies.
    pub fn decays(self) -> bool {
        matches!(self, Self::Decay | Self::PretrainedDecay)
    }

    /// Whether the pretrained-component learning rate applies.
    pub fn is_pretrained(self) -> bool {
        matches!(self, Self::PretrainedDecay | Self::PretrainedNoDecay)
    }

    fn from_flags(no_decay: bool, pretrained: bool) -> Self {
        match (pretrained, no_decay) {
            (false, false) => Self::Decay,
            (false, true) => Self::NoDecay,
            (true, false) => Self::PretrainedDecay,
            (true, true) => Self::PretrainedNoDecay,
        }
    }

    fn description(self) -> &'static str {
        match self {
            Self::Decay => "decay",
            Self::NoDecay => "no_decay",
            Self::PretrainedDecay => "pretrained_decay",
            Self::PretrainedNoDecay => "pretrained_no_decay",
        }
    }
}

/// A group of parameters with shared optimizer settings.
#[derive(Debug, Clone)]
pub struct ParameterGroup {
    /// Which group this is.
    pub kind: ParameterGroupKind,
    /// Parameter names in this group.
    pub param_names: Vec<String>,
    /// Learning rate for this group.
    pub learning_rate: f64,
    /// Weight decay for this group.
    pub weight_decay: f64,
}

impl ParameterGroup {
    fn new(kind: ParameterGroupKind, learning_rate: f64, weight_decay: f64) -> Self {
        Self {
            kind,
            param_names: Vec::new(),
            learning_rate,
            weight_decay,
        }
    }

    /// Number of parameters in this group.
    pub fn len(&self) -> usize {
        self.param_names.len()
    }

    /// Check if group is empty.
    pub fn is_empty(&self) -> bool {
        self.param_names.is_empty()
    }
}

/// Parameter grouping configuration.
#[derive(Debug, Clone)]
pub struct ParameterGroupConfig {
    /// Learning rate for ordinary parameters.
    pub base_lr: f64,
    /// Learning rate for pretrained components; `None` means the base learning rate.
    pub pretrained_lr: Option<f64>,
    /// Weight decay for decaying groups.
    pub weight_decay: f64,
    /// Substrings marking parameters exempt from weight decay.
    pub no_decay_patterns: Vec<String>,
    /// Substrings marking pretrained components.
    pub pretrained_patterns: Vec<String>,
}

impl Default for ParameterGroupConfig {
    fn default() -> Self {
        Self {
            base_lr: 1e-3,
            pretrained_lr: None,
            weight_decay: 0.0,
            no_decay_patterns: vec![
                "bias".to_string(),
                "layernorm.weight".to_string(),
                "norm.weight".to_string(),
                "ln_".to_string(),
            ],
            pretrained_patterns: vec!["embed".to_string()],
        }
    }
}

impl ParameterGroupConfig {
    /// Create a config with the given base learning rate.
    pub fn new(base_lr: f64) -> Self {
        Self {
            base_lr,
            ..Default::default()
        }
    }

    /// Groups for a model trained with `training`.
    pub fn from_training(training: &TrainingConfig) -> Self {
        Self::for_role(training, training.learning_rate)
    }

    /// Groups for a role trained at `base_lr` with the remaining settings of `training`.
    ///
    /// A zero pretraining-component rate follows `base_lr`.
    pub fn for_role(training: &TrainingConfig, base_lr: f64) -> Self {
        let pretrained = if training.learning_rate_pretraining_components == 0.0 {
            base_lr
        } else {
            training.learning_rate_pretraining_components
        };
        Self::new(base_lr)
            .with_weight_decay(training.weight_decay)
            .with_pretrained_lr(pretrained)
    }

    /// Set the pretrained-component learning rate.
    pub fn with_pretrained_lr(mut self, lr: f64) -> Self {
        self.pretrained_lr = if (lr - self.base_lr).abs() > 1e-12 {
            Some(lr)
        } else {
            None
        };
        self
    }

    /// Set the weight decay.
    pub fn with_weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Group a parameter name belongs to.
    pub fn classify(&self, name: &str) -> ParameterGroupKind {
        let lower = name.to_lowercase();
        let no_decay = self.no_decay_patterns.iter().any(|p| lower.contains(p.as_str()));
        let pretrained = self.pretrained_patterns.iter().any(|p| lower.contains(p.as_str()));
        ParameterGroupKind::from_flags(no_decay, pretrained)
    }

    /// Learning rate of a group.
    pub fn learning_rate(&self, kind: ParameterGroupKind) -> f64 {
        if kind.is_pretrained() {
            self.pretrained_lr.unwrap_or(self.base_lr)
        } else {
            self.base_lr
        }
    }

    /// Weight decay of a group.
    pub fn weight_decay(&self, kind: ParameterGroupKind) -> f64 {
        if kind.decays() {
            self.weight_decay
        } else {
            0.0
        }
    }
}

/// Builder for creating parameter groups from model parameter names.
pub struct ParameterGroupBuilder {
    config: ParameterGroupConfig,
    groups: Vec<ParameterGroup>,
}

impl ParameterGroupBuilder {
    /// Create a new builder with the given config.
    pub fn new(config: ParameterGroupConfig) -> Self {
        let groups = ParameterGroupKind::ALL
            .iter()
            .map(|&kind| {
                ParameterGroup::new(kind, config.learning_rate(kind), config.weight_decay(kind))
            })
            .collect();
        Self { config, groups }
    }

    /// Classify a parameter by name.
    pub fn add_parameter(&mut self, name: &str) {
        let kind = self.config.classify(name);
        self.groups[kind.index()].param_names.push(name.to_string());
    }

    /// Add all parameters from a name iterator.
    pub fn add_parameters<'a>(&mut self, names: impl Iterator<Item = &'a str>) {
        for name in names {
            self.add_parameter(name);
        }
    }

    /// Non-empty groups, in group order.
    pub fn build(self) -> Vec<ParameterGroup> {
        self.groups.into_iter().filter(|g| !g.is_empty()).collect()
    }

    /// Get summary of parameter grouping.
    pub fn summary(&self) -> String {
        let mut out = String::from("Parameter groups:");
        for g in &self.groups {
            out.push_str(&format!(
                "\n  - {}: {} params (lr={:.2e}, wd={})",
                g.kind.description(),
                g.len(),
                g.learning_rate,
                g.weight_decay
            ));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let config = ParameterGroupConfig::new(1e-3).with_pretrained_lr(1e-5);
        assert_eq!(
            config.classify("language_model.layers.0.mlp.up_proj.weight"),
            ParameterGroupKind::Decay
        );
        assert_eq!(
            config.classify("language_model.layers.0.mlp.up_proj.bias"),
            ParameterGroupKind::NoDecay
        );
        assert_eq!(
            config.classify("vision.encoder.LayerNorm.weight"),
            ParameterGroupKind::NoDecay
        );
        assert_eq!(
            config.classify("language_model.embed_tokens.weight"),
            ParameterGroupKind::PretrainedDecay
        );
        assert_eq!(
            config.classify("vision.embeddings.patch_embedding.bias"),
            ParameterGroupKind::PretrainedNoDecay
        );
    }

    #[test]
    fn test_group_hyperparameters() {
        let config = ParameterGroupConfig::new(1e-3)
            .with_pretrained_lr(1e-5)
            .with_weight_decay(0.1);
        assert_eq!(config.learning_rate(ParameterGroupKind::PretrainedNoDecay), 1e-5);
        assert_eq!(config.learning_rate(ParameterGroupKind::NoDecay), 1e-3);
        assert_eq!(config.weight_decay(ParameterGroupKind::NoDecay), 0.0);
        assert_eq!(config.weight_decay(ParameterGroupKind::PretrainedDecay), 0.1);
    }

    #[test]
    fn test_zero_pretraining_lr_means_base() {
        let training = TrainingConfig {
            learning_rate: 2e-4,
            learning_rate_pretraining_components: 0.0,
            ..Default::default()
        };
        let config = ParameterGroupConfig::from_training(&training);
        assert_eq!(config.pretrained_lr, None);
        assert_eq!(config.learning_rate(ParameterGroupKind::PretrainedDecay), 2e-4);
    }

    #[test]
    fn test_builder_drops_empty_groups() {
        let mut builder = ParameterGroupBuilder::new(ParameterGroupConfig::default());
        builder.add_parameters(["a.weight", "a.bias", "b.weight"].into_iter());
        assert!(builder.summary().contains("decay: 2 params"));
        let groups = builder.build();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].kind, ParameterGroupKind::Decay);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].kind, ParameterGroupKind::NoDecay);
    }
}
