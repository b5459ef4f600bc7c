//! Common type definitions.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::VlpoError;

/// Label value marking a position as excluded from the loss.
pub const PAD_LABEL: i64 = -100;

/// Token id written into every position of a candidate row that is missing or invalid.
pub const INVALID_TOKEN_ID: i32 = -1;

/// Vision-language architecture family.
///
/// Selects image layout, placeholder expansion and the model adapter used by the training step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ModelArchitecture {
    /// Vision encoder + projection + causal decoder with in-sequence image tokens.
    #[default]
    #[serde(rename = "default")]
    Default,
    /// LLaVA 1.5 style model.
    #[serde(rename = "llava")]
    Llava,
    /// LLaVA-NeXT with any-resolution patches.
    #[serde(rename = "llava_next")]
    LlavaNext,
    /// Llama 3.2 Vision with tiled cross-attention images.
    #[serde(rename = "llama-3.2-vision")]
    Llama32Vision,
}

impl ModelArchitecture {
    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Llava => "llava",
            Self::LlavaNext => "llava_next",
            Self::Llama32Vision => "llama-3.2-vision",
        }
    }
}

impl fmt::Display for ModelArchitecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelArchitecture {
    type Err = VlpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "llava" => Ok(Self::Llava),
            "llava_next" => Ok(Self::LlavaNext),
            "llama-3.2-vision" => Ok(Self::Llama32Vision),
            other => Err(VlpoError::Config(format!(
                "unknown model architecture '{other}'"
            ))),
        }
    }
}

/// Chat template selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ChatTemplateKind {
    /// Plain `### Question / ### Answer` layout.
    #[default]
    #[serde(rename = "default")]
    Default,
    /// Llama-2 `[INST]` format.
    #[serde(rename = "llama_2")]
    Llama2,
    /// Llama-3 header format.
    #[serde(rename = "llama_3")]
    Llama3,
    /// Vicuna `USER: / ASSISTANT:` format.
    #[serde(rename = "vicuna")]
    Vicuna,
    /// LLaVA 1.5 format.
    #[serde(rename = "llava")]
    Llava,
    /// LLaVA-NeXT (Mistral instruct) format.
    #[serde(rename = "llava_next")]
    LlavaNext,
    /// Llama 3.2 Vision format.
    #[serde(rename = "llama-3.2-vision")]
    Llama32Vision,
}

impl ChatTemplateKind {
    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Llama2 => "llama_2",
            Self::Llama3 => "llama_3",
            Self::Vicuna => "vicuna",
            Self::Llava => "llava",
            Self::LlavaNext => "llava_next",
            Self::Llama32Vision => "llama-3.2-vision",
        }
    }
}

impl fmt::Display for ChatTemplateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChatTemplateKind {
    type Err = VlpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "llama_2" => Ok(Self::Llama2),
            "llama_3" => Ok(Self::Llama3),
            "vicuna" => Ok(Self::Vicuna),
            "llava" => Ok(Self::Llava),
            "llava_next" => Ok(Self::LlavaNext),
            "llama-3.2-vision" => Ok(Self::Llama32Vision),
            other => Err(VlpoError::Config(format!("unknown chat template '{other}'"))),
        }
    }
}

/// Degree to which optimizer state, gradients and parameters are sharded across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum PartitionStage {
    /// Every worker holds full replicas.
    #[default]
    None,
    /// Optimizer state partitioned.
    OptimizerStates,
    /// Optimizer state and gradients partitioned.
    Gradients,
    /// Optimizer state, gradients and parameters partitioned.
    Parameters,
}

impl PartitionStage {
    /// Numeric stage (0-3).
    pub fn as_u8(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::OptimizerStates => 1,
            Self::Gradients => 2,
            Self::Parameters => 3,
        }
    }

    /// Whether parameters are sharded, so a checkpoint needs every rank.
    pub fn partitions_parameters(&self) -> bool {
        matches!(self, Self::Parameters)
    }
}

impl TryFrom<u8> for PartitionStage {
    type Error = VlpoError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::OptimizerStates),
            2 => Ok(Self::Gradients),
            3 => Ok(Self::Parameters),
            other => Err(VlpoError::Config(format!(
                "partition stage must be 0-3, got {other}"
            ))),
        }
    }
}

impl From<PartitionStage> for u8 {
    fn from(stage: PartitionStage) -> Self {
        stage.as_u8()
    }
}

impl FromStr for PartitionStage {
    type Err = VlpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value: u8 = s
            .trim()
            .parse()
            .map_err(|_| VlpoError::Config(format!("invalid partition stage '{s}'")))?;
        Self::try_from(value)
    }
}

impl fmt::Display for PartitionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// Mixed-precision mode handed to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// IEEE half precision.
    #[default]
    Fp16,
    /// Brain floating point.
    Bf16,
}

impl FromStr for Precision {
    type Err = VlpoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fp16" => Ok(Self::Fp16),
            "bf16" => Ok(Self::Bf16),
            other => Err(VlpoError::Config(format!("unknown precision '{other}'"))),
        }
    }
}

/// Model roles in preference training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelRole {
    /// Trained policy.
    Actor,
    /// Frozen snapshot of the actor's initial checkpoint.
    Reference,
    /// Frozen reward model.
    Reward,
    /// Trained value model.
    Critic,
}

impl ModelRole {
    /// Lowercase role name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Actor => "actor",
            Self::Reference => "ref",
            Self::Reward => "reward",
            Self::Critic => "critic",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_architecture_names_round_trip() {
        for arch in [
            ModelArchitecture::Default,
            ModelArchitecture::Llava,
            ModelArchitecture::LlavaNext,
            ModelArchitecture::Llama32Vision,
        ] {
            assert_eq!(arch.as_str().parse::<ModelArchitecture>().unwrap(), arch);
        }
        assert!("llava-2".parse::<ModelArchitecture>().is_err());
    }

    #[test]
    fn test_template_serde_names() {
        let kind: ChatTemplateKind = serde_yaml::from_str("llama-3.2-vision").unwrap();
        assert_eq!(kind, ChatTemplateKind::Llama32Vision);
        let kind: ChatTemplateKind = serde_yaml::from_str("llama_2").unwrap();
        assert_eq!(kind, ChatTemplateKind::Llama2);
    }

    #[test]
    fn test_partition_stage_from_number() {
        let stage: PartitionStage = serde_yaml::from_str("3").unwrap();
        assert_eq!(stage, PartitionStage::Parameters);
        assert!(stage.partitions_parameters());
        assert!(!PartitionStage::Gradients.partitions_parameters());
        assert!(serde_yaml::from_str::<PartitionStage>("4").is_err());
        assert_eq!("2".parse::<PartitionStage>().unwrap(), PartitionStage::Gradients);
    }
}
