//! Configuration types for vlpo.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    ChatTemplateKind, ModelArchitecture, PartitionStage, Precision, Result, VlpoError,
};

/// Annotation dataset flavours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DatasetKind {
    /// Multi-turn conversations, one candidate per item.
    #[serde(rename = "llava")]
    Conversation,
    /// Ranked answers, one candidate per rank.
    #[serde(rename = "llava_comparison")]
    Comparison,
    /// Prompt-only records for rollout generation.
    #[serde(rename = "llava_ppo")]
    Prompt,
}

impl FromStr for DatasetKind {
    type Err = VlpoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "llava" => Ok(Self::Conversation),
            "llava_comparison" => Ok(Self::Comparison),
            "llava_ppo" => Ok(Self::Prompt),
            other => Err(VlpoError::Config(format!("unknown dataset name '{other}'"))),
        }
    }
}

/// How many annotations to draw from one dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(try_from = "SampleLimitRepr", into = "SampleLimitRepr")]
pub enum SampleLimit {
    /// Every annotation.
    #[default]
    All,
    /// A seeded random subset of this size.
    Count(usize),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum SampleLimitRepr {
    Number(usize),
    Text(String),
}

impl TryFrom<SampleLimitRepr> for SampleLimit {
    type Error = VlpoError;

    fn try_from(value: SampleLimitRepr) -> Result<Self> {
        match value {
            SampleLimitRepr::Number(n) => Ok(Self::Count(n)),
            SampleLimitRepr::Text(s) => s.parse(),
        }
    }
}

impl From<SampleLimit> for SampleLimitRepr {
    fn from(value: SampleLimit) -> Self {
        match value {
            SampleLimit::All => Self::Text("all".into()),
            SampleLimit::Count(n) => Self::Number(n),
        }
    }
}

impl FromStr for SampleLimit {
    type Err = VlpoError;

    fn from_str(s: &str) -> Result<Self> {
        if s == "all" {
            return Ok(Self::All);
        }
        s.parse::<usize>()
            .map(Self::Count)
            .map_err(|_| VlpoError::Config(format!("dataset sample limit must be 'all' or a count, got '{s}'")))
    }
}

impl fmt::Display for SampleLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str("all"),
            Self::Count(n) => write!(f, "{n}"),
        }
    }
}

/// One resolved dataset entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSpec {
    /// Dataset flavour.
    pub kind: DatasetKind,
    /// Annotation file.
    pub path: PathBuf,
    /// Subset size.
    pub samples: SampleLimit,
    /// Annotations grouped into one item.
    pub concatenate: usize,
}

/// Data pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Annotation files, one per dataset name (a single path is shared by all names).
    #[serde(default)]
    pub data_path: Vec<PathBuf>,

    /// Directory receiving the first processed samples as text, if set.
    #[serde(default)]
    pub data_debug_path: Option<PathBuf>,

    /// Directory holding the images referenced by annotations.
    #[serde(default)]
    pub image_folder: PathBuf,

    /// Datasets to combine.
    #[serde(default = "default_dataset_names")]
    pub dataset_names: Vec<DatasetKind>,

    /// Samples drawn per dataset (a single value applies to all).
    #[serde(default = "default_dataset_samples")]
    pub dataset_samples: Vec<SampleLimit>,

    /// Annotations concatenated per item (a single value applies to all).
    #[serde(default = "default_concatenate")]
    pub dataset_concatenate_samples: Vec<usize>,

    /// Upper bound on images per merged sample.
    #[serde(default = "default_max_images")]
    pub max_num_image_per_sample: usize,

    /// Ranked candidates emitted per comparison annotation.
    #[serde(default = "default_ranked")]
    pub ranked_candidate_num: usize,

    /// Maximum tokens per sequence.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,

    /// Mask instruction tokens out of the loss.
    #[serde(default = "default_true")]
    pub ignore_instruction: bool,

    /// Chat template used to format turns.
    #[serde(default)]
    pub template: ChatTemplateKind,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_path: Vec::new(),
            data_debug_path: None,
            image_folder: PathBuf::new(),
            dataset_names: default_dataset_names(),
            dataset_samples: default_dataset_samples(),
            dataset_concatenate_samples: default_concatenate(),
            max_num_image_per_sample: default_max_images(),
            ranked_candidate_num: default_ranked(),
            max_seq_len: default_max_seq_len(),
            ignore_instruction: true,
            template: ChatTemplateKind::default(),
        }
    }
}

impl DataConfig {
    /// Pair every dataset name with its path, sample limit and concatenate count.
    ///
    /// Single-valued lists broadcast to every dataset; any other length mismatch is rejected.
    pub fn resolve_datasets(&self) -> Result<Vec<DatasetSpec>> {
        let n = self.dataset_names.len();
        if n == 0 {
            return Err(VlpoError::Config("at least one dataset name is required".into()));
        }
        let paths = broadcast("data_path", &self.data_path, n)?;
        let samples = broadcast("dataset_samples", &self.dataset_samples, n)?;
        let concatenate = broadcast(
            "dataset_concatenate_samples",
            &self.dataset_concatenate_samples,
            n,
        )?;

        self.dataset_names
            .iter()
            .zip(paths)
            .zip(samples.into_iter().zip(concatenate))
            .map(|((kind, path), (samples, concatenate))| {
                if concatenate == 0 {
                    return Err(VlpoError::Config(
                        "dataset_concatenate_samples must be at least 1".into(),
                    ));
                }
                Ok(DatasetSpec {
                    kind: *kind,
                    path,
                    samples,
                    concatenate,
                })
            })
            .collect()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.data_path.is_empty() {
            return Err(VlpoError::Config("data_path is required".into()));
        }
        if self.image_folder.as_os_str().is_empty() {
            return Err(VlpoError::Config("image_folder is required".into()));
        }
        if self.ranked_candidate_num < 2 {
            return Err(VlpoError::Config(format!(
                "ranked_candidate_num must be at least 2, got {}",
                self.ranked_candidate_num
            )));
        }
        if self.max_num_image_per_sample == 0 {
            return Err(VlpoError::Config(
                "max_num_image_per_sample must be at least 1".into(),
            ));
        }
        if self.max_seq_len < 2 {
            return Err(VlpoError::Config("max_seq_len must be at least 2".into()));
        }
        self.resolve_datasets().map(|_| ())
    }
}

fn broadcast<T: Clone>(name: &str, values: &[T], n: usize) -> Result<Vec<T>> {
    match values.len() {
        len if len == n => Ok(values.to_vec()),
        1 => Ok(vec![values[0].clone(); n]),
        len => Err(VlpoError::Config(format!(
            "{name} has {len} entries but {n} datasets are configured; give one value or one per dataset"
        ))),
    }
}

/// Low-rank adapter settings forwarded to the model builder.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct LoraSettings {
    /// Rank for the language decoder (0 disables).
    #[serde(default)]
    pub lang_lora_dim: usize,
    /// Module name pattern in the language decoder.
    #[serde(default = "default_lang_lora_module")]
    pub lang_lora_module_name: String,
    /// Rank for the vision encoder (0 disables).
    #[serde(default)]
    pub vis_lora_dim: usize,
    /// Module name pattern in the vision encoder.
    #[serde(default = "default_vis_lora_module")]
    pub vis_lora_module_name: String,
    /// Freeze everything except adapter weights.
    #[serde(default)]
    pub only_optimize_lora: bool,
}

/// Model construction configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Architecture family.
    #[serde(default)]
    pub model_architecture: ModelArchitecture,

    /// Language model identifier or path.
    #[serde(default)]
    pub lm_model_name_or_path: String,

    /// Vision encoder identifier or path.
    #[serde(default = "default_vision_model")]
    pub vision_model_name_or_path: String,

    /// Directory holding the initial `pytorch_model.bin`.
    #[serde(default = "default_checkpoint")]
    pub from_checkpoint: PathBuf,

    /// Enable activation checkpointing in the model.
    #[serde(default)]
    pub gradient_checkpointing: bool,

    /// Adapter settings.
    #[serde(default)]
    pub lora: LoraSettings,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_architecture: ModelArchitecture::default(),
            lm_model_name_or_path: String::new(),
            vision_model_name_or_path: default_vision_model(),
            from_checkpoint: default_checkpoint(),
            gradient_checkpointing: false,
            lora: LoraSettings::default(),
        }
    }
}

/// Training hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Micro batch size per device, in dataset items.
    #[serde(default = "default_batch_size")]
    pub per_device_train_batch_size: usize,

    /// Base learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Learning rate for pretrained components; 0 means the base learning rate.
    #[serde(default)]
    pub learning_rate_pretraining_components: f64,

    /// Weight decay for decaying parameter groups.
    #[serde(default)]
    pub weight_decay: f64,

    /// Number of training epochs.
    #[serde(default = "default_epochs")]
    pub num_train_epochs: usize,

    /// Micro steps per optimizer update.
    #[serde(default = "default_one")]
    pub gradient_accumulation_steps: usize,

    /// Learning rate schedule.
    #[serde(default)]
    pub lr_scheduler_type: LrSchedulerType,

    /// Warmup: an absolute step count when > 1, a fraction of total steps otherwise.
    #[serde(default)]
    pub num_warmup_steps: f64,

    /// Checkpoint output directory.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,

    /// Random seed.
    #[serde(default = "default_seed")]
    pub seed: u64,

    /// Partition stage for the trained model.
    #[serde(default)]
    pub zero_stage: PartitionStage,

    /// Offload optimizer state to host memory.
    #[serde(default)]
    pub offload: bool,

    /// Mixed-precision mode.
    #[serde(default)]
    pub precision: Precision,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            per_device_train_batch_size: default_batch_size(),
            learning_rate: default_lr(),
            learning_rate_pretraining_components: 0.0,
            weight_decay: 0.0,
            num_train_epochs: default_epochs(),
            gradient_accumulation_steps: default_one(),
            lr_scheduler_type: LrSchedulerType::default(),
            num_warmup_steps: 0.0,
            output_dir: default_output_dir(),
            seed: default_seed(),
            zero_stage: PartitionStage::default(),
            offload: false,
            precision: Precision::default(),
        }
    }
}

impl TrainingConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.per_device_train_batch_size == 0 {
            return Err(VlpoError::Config("per_device_train_batch_size must be positive".into()));
        }
        if self.gradient_accumulation_steps == 0 {
            return Err(VlpoError::Config("gradient_accumulation_steps must be positive".into()));
        }
        if self.learning_rate <= 0.0 {
            return Err(VlpoError::Config("learning_rate must be positive".into()));
        }
        if self.learning_rate_pretraining_components < 0.0 {
            return Err(VlpoError::Config(
                "learning_rate_pretraining_components must not be negative".into(),
            ));
        }
        if self.num_warmup_steps < 0.0 {
            return Err(VlpoError::Config("num_warmup_steps must not be negative".into()));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(VlpoError::Config("output_dir is required".into()));
        }
        Ok(())
    }

    /// Learning rate applied to pretrained components.
    pub fn pretraining_components_lr(&self) -> f64 {
        if self.learning_rate_pretraining_components == 0.0 {
            self.learning_rate
        } else {
            self.learning_rate_pretraining_components
        }
    }
}

/// DPO objective settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DpoSettings {
    /// Temperature applied to the log-ratio margin.
    #[serde(default = "default_beta")]
    pub beta: f64,
    /// Probability that a preference label is flipped, in [0, 1).
    #[serde(default)]
    pub label_smoothing: f64,
}

impl Default for DpoSettings {
    fn default() -> Self {
        Self {
            beta: default_beta(),
            label_smoothing: 0.0,
        }
    }
}

/// Full configuration for a DPO run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DpoRunConfig {
    /// Data pipeline.
    #[serde(default)]
    pub data: DataConfig,
    /// Model construction.
    #[serde(default)]
    pub model: ModelConfig,
    /// Optimization.
    #[serde(default)]
    pub training: TrainingConfig,
    /// Objective.
    #[serde(default)]
    pub dpo: DpoSettings,
}

impl DpoRunConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| VlpoError::Serialization(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.data.validate()?;
        self.training.validate()?;
        if self.dpo.beta <= 0.0 {
            return Err(VlpoError::Config("DPO beta must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.dpo.label_smoothing) {
            return Err(VlpoError::Config(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.dpo.label_smoothing
            )));
        }
        Ok(())
    }
}

/// Per-role sharding and optimization settings for trained roles.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoleSettings {
    /// Checkpoint directory holding `pytorch_model.bin`.
    pub model_path: PathBuf,
    /// Partition stage once training starts.
    #[serde(default)]
    pub zero_stage: PartitionStage,
    /// Offload optimizer state to host memory.
    #[serde(default)]
    pub offload: bool,
    /// Learning rate for this role.
    #[serde(default = "default_role_lr")]
    pub learning_rate: f64,
}

/// Full configuration for standing up the four RLHF models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RlhfRunConfig {
    /// Data pipeline (prompt dataset).
    #[serde(default)]
    pub data: DataConfig,
    /// Model construction shared by all roles.
    #[serde(default)]
    pub model: ModelConfig,
    /// Optimization shared by trained roles.
    #[serde(default)]
    pub training: TrainingConfig,
    /// Actor settings; the reference model loads from the same checkpoint.
    pub actor: RoleSettings,
    /// Critic settings; the reward model loads from the same checkpoint.
    pub critic: RoleSettings,
}

impl RlhfRunConfig {
    /// Load configuration from a YAML file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| VlpoError::Serialization(e.to_string()))
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        self.training.validate()?;
        for (name, role) in [("actor", &self.actor), ("critic", &self.critic)] {
            if role.learning_rate <= 0.0 {
                return Err(VlpoError::Config(format!("{name} learning_rate must be positive")));
            }
            if role.model_path.as_os_str().is_empty() {
                return Err(VlpoError::Config(format!("{name} model_path is required")));
            }
        }
        Ok(())
    }
}

/// Learning rate scheduler type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LrSchedulerType {
    /// Linear decay to zero.
    Linear,
    /// Cosine annealing.
    #[default]
    Cosine,
    /// Cosine with hard restarts.
    CosineWithRestarts,
    /// Polynomial decay.
    Polynomial,
    /// Constant, no warmup.
    Constant,
    /// Linear warmup, then constant.
    ConstantWithWarmup,
}

impl FromStr for LrSchedulerType {
    type Err = VlpoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "cosine" => Ok(Self::Cosine),
            "cosine_with_restarts" => Ok(Self::CosineWithRestarts),
            "polynomial" => Ok(Self::Polynomial),
            "constant" => Ok(Self::Constant),
            "constant_with_warmup" => Ok(Self::ConstantWithWarmup),
            other => Err(VlpoError::Config(format!("unknown lr scheduler '{other}'"))),
        }
    }
}

fn default_dataset_names() -> Vec<DatasetKind> {
    vec![DatasetKind::Comparison]
}
fn default_dataset_samples() -> Vec<SampleLimit> {
    vec![SampleLimit::All]
}
fn default_concatenate() -> Vec<usize> {
    vec![1]
}
fn default_max_images() -> usize {
    8
}
fn default_ranked() -> usize {
    2
}
fn default_max_seq_len() -> usize {
    4096
}
fn default_true() -> bool {
    true
}
fn default_lang_lora_module() -> String {
    "model.layers.".into()
}
fn default_vis_lora_module() -> String {
    "encoder.layers.".into()
}
fn default_vision_model() -> String {
    "openai/clip-vit-large-patch14".into()
}
fn default_checkpoint() -> PathBuf {
    PathBuf::from("./basemodel/")
}
fn default_batch_size() -> usize {
    2
}
fn default_lr() -> f64 {
    1e-3
}
fn default_role_lr() -> f64 {
    1e-5
}
fn default_epochs() -> usize {
    6
}
fn default_one() -> usize {
    1
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("./output")
}
fn default_seed() -> u64 {
    1235
}
fn default_beta() -> f64 {
    0.1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_follow_training_script() {
        let config = DpoRunConfig::default();
        assert_eq!(config.training.per_device_train_batch_size, 2);
        assert_eq!(config.training.num_train_epochs, 6);
        assert_eq!(config.training.seed, 1235);
        assert_eq!(config.data.max_seq_len, 4096);
        assert_eq!(config.data.ranked_candidate_num, 2);
        assert_eq!(config.data.max_num_image_per_sample, 8);
        assert!((config.dpo.beta - 0.1).abs() < 1e-12);
        assert_eq!(config.training.lr_scheduler_type, LrSchedulerType::Cosine);
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
data:
  data_path: [annotations.json]
  image_folder: images/
  dataset_names: [llava_comparison, llava]
  dataset_samples: [all, 100]
  template: llama_3
model:
  model_architecture: llava_next
training:
  zero_stage: 3
  num_warmup_steps: 0.1
dpo:
  beta: 0.2
  label_smoothing: 0.1
"#;
        let config = DpoRunConfig::from_yaml(yaml).unwrap();
        config.validate().unwrap();
        assert_eq!(config.model.model_architecture, ModelArchitecture::LlavaNext);
        assert_eq!(config.training.zero_stage, PartitionStage::Parameters);
        assert_eq!(config.data.template, ChatTemplateKind::Llama3);

        let specs = config.data.resolve_datasets().unwrap();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].kind, DatasetKind::Comparison);
        assert_eq!(specs[1].samples, SampleLimit::Count(100));
        assert_eq!(specs[1].path, PathBuf::from("annotations.json"));
        assert_eq!(specs[1].concatenate, 1);
    }

    #[test]
    fn test_broadcast_mismatch_rejected() {
        let config = DataConfig {
            data_path: vec!["a.json".into()],
            dataset_names: vec![
                DatasetKind::Comparison,
                DatasetKind::Conversation,
                DatasetKind::Conversation,
            ],
            dataset_samples: vec![SampleLimit::All, SampleLimit::Count(3)],
            ..Default::default()
        };
        assert!(matches!(config.resolve_datasets(), Err(VlpoError::Config(_))));
    }

    #[test]
    fn test_label_smoothing_range() {
        let mut config = DpoRunConfig::default();
        config.data.data_path = vec!["a.json".into()];
        config.data.image_folder = "img".into();
        config.dpo.label_smoothing = 1.0;
        assert!(config.validate().is_err());
        config.dpo.label_smoothing = 0.3;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_pretraining_lr_zero_means_base() {
        let mut config = TrainingConfig::default();
        assert_eq!(config.pretraining_components_lr(), config.learning_rate);
        config.learning_rate_pretraining_components = 1e-5;
        assert_eq!(config.pretraining_components_lr(), 1e-5);
    }

    #[test]
    fn test_sample_limit_parsing() {
        assert_eq!("all".parse::<SampleLimit>().unwrap(), SampleLimit::All);
        assert_eq!("12".parse::<SampleLimit>().unwrap(), SampleLimit::Count(12));
        assert!("some".parse::<SampleLimit>().is_err());
    }
}
