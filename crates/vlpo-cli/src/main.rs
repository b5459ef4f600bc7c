//! vlpo CLI - preference training for vision-language models.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use vlpo_core::{
    ChatTemplateKind, DpoRunConfig, ModelArchitecture, PartitionStage, Precision, RlhfRunConfig,
    VlpoError,
};
use vlpo_data::{
    build_dataset, ChatTemplate, DatasetResources, DistributedSampler, ImageProcessor,
    ImageTokenLayout, PreferenceCollator, PreferenceDataLoader, PreferenceDataset, Tokenizer,
    WorkerContext,
};
use vlpo_trainer::{rlhf_roles, RoleDescriptor, StepPlan};

/// Image tokens per image for the built-in architecture (a 16x16 patch grid).
const DEFAULT_IMAGE_TOKENS: usize = 256;

#[derive(Parser)]
#[command(name = "vlpo")]
#[command(author, version, about = "Preference training for vision-language models", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a policy with Direct Preference Optimization
    Dpo(DpoArgs),

    /// Validate an RLHF configuration and print the plan for each model role
    RlhfInit {
        /// Path to the RLHF configuration file (YAML)
        #[arg(short, long)]
        config: PathBuf,

        /// Number of prompt examples across all workers
        #[arg(long)]
        num_examples: usize,

        /// Number of workers
        #[arg(long, default_value = "1")]
        world_size: usize,
    },
}

#[derive(Args)]
struct DpoArgs {
    /// Path to training configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Annotation file (repeat for several datasets)
    #[arg(long = "data-path")]
    data_path: Vec<PathBuf>,

    /// Folder holding the annotation images
    #[arg(long)]
    image_folder: Option<PathBuf>,

    /// Directory holding the initial checkpoint
    #[arg(long)]
    from_checkpoint: Option<PathBuf>,

    /// Directory holding tokenizer.json (defaults to the language model path)
    #[arg(long)]
    tokenizer: Option<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output_dir: Option<PathBuf>,

    /// Per-device batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Number of epochs
    #[arg(long)]
    epochs: Option<usize>,

    /// Learning rate
    #[arg(long)]
    learning_rate: Option<f64>,

    /// DPO temperature
    #[arg(long)]
    beta: Option<f64>,

    /// DPO label smoothing
    #[arg(long)]
    label_smoothing: Option<f64>,

    /// Partition stage (0-3)
    #[arg(long)]
    zero_stage: Option<PartitionStage>,

    /// Mixed precision (fp16, bf16)
    #[arg(long)]
    precision: Option<Precision>,

    /// Chat template
    #[arg(long)]
    template: Option<ChatTemplateKind>,

    /// Model architecture
    #[arg(long)]
    model_architecture: Option<ModelArchitecture>,

    /// Image tokens per image for the built-in architecture
    #[arg(long, default_value_t = DEFAULT_IMAGE_TOKENS)]
    image_tokens: usize,

    /// Build the datasets and loader, print the step plan and exit
    #[arg(long)]
    dry_run: bool,
}

impl DpoArgs {
    /// YAML configuration with command-line overrides applied.
    fn resolve(&self) -> anyhow::Result<DpoRunConfig> {
        let mut config = match &self.config {
            Some(path) => DpoRunConfig::from_yaml_file(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => DpoRunConfig::default(),
        };

        if !self.data_path.is_empty() {
            config.data.data_path = self.data_path.clone();
        }
        if let Some(dir) = &self.image_folder {
            config.data.image_folder = dir.clone();
        }
        if let Some(template) = self.template {
            config.data.template = template;
        }
        if let Some(dir) = &self.from_checkpoint {
            config.model.from_checkpoint = dir.clone();
        }
        if let Some(arch) = self.model_architecture {
            config.model.model_architecture = arch;
        }
        if let Some(dir) = &self.output_dir {
            config.training.output_dir = dir.clone();
        }
        if let Some(n) = self.batch_size {
            config.training.per_device_train_batch_size = n;
        }
        if let Some(n) = self.epochs {
            config.training.num_train_epochs = n;
        }
        if let Some(lr) = self.learning_rate {
            config.training.learning_rate = lr;
        }
        if let Some(stage) = self.zero_stage {
            config.training.zero_stage = stage;
        }
        if let Some(precision) = self.precision {
            config.training.precision = precision;
        }
        if let Some(beta) = self.beta {
            config.dpo.beta = beta;
        }
        if let Some(ls) = self.label_smoothing {
            config.dpo.label_smoothing = ls;
        }

        config.validate()?;
        Ok(config)
    }

    fn tokenizer_path(&self, config: &DpoRunConfig) -> PathBuf {
        let dir = self
            .tokenizer
            .clone()
            .unwrap_or_else(|| PathBuf::from(&config.model.lm_model_name_or_path));
        if dir.extension().is_some_and(|ext| ext == "json") {
            dir
        } else {
            dir.join("tokenizer.json")
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dpo(args) => run_dpo(&args),
        Commands::RlhfInit {
            config,
            num_examples,
            world_size,
        } => run_rlhf_init(&config, num_examples, world_size),
    }
}

fn run_dpo(args: &DpoArgs) -> anyhow::Result<()> {
    let config = args.resolve()?;
    tracing::info!(
        "DPO: beta={}, label_smoothing={}, stage={}, precision={:?}",
        config.dpo.beta,
        config.dpo.label_smoothing,
        config.training.zero_stage.as_u8(),
        config.training.precision
    );

    let tokenizer_path = args.tokenizer_path(&config);
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .with_context(|| format!("failed to load tokenizer from {}", tokenizer_path.display()))?;
    let mut loader = build_loader(&config, tokenizer, args.image_tokens)?;
    let plan = StepPlan::new(loader.num_batches(), &config.training)?;

    println!("Examples per worker:  {}", loader.len());
    println!("Micro batches/epoch:  {}", plan.batches_per_epoch);
    println!("Updates per epoch:    {}", plan.updates_per_epoch);
    println!("Epochs:               {}", plan.num_epochs);
    println!("Total updates:        {}", plan.total_updates);
    println!("Warmup updates:       {}", plan.warmup_updates);

    let policy = RoleDescriptor::dpo_policy(&config.model, &config.training);
    let reference = RoleDescriptor::dpo_reference(&config.model, &config.training);
    print_roles(&[policy, reference], &config.training, plan.total_updates, 1);

    if args.dry_run {
        let mut worker = WorkerContext::new(0, 1);
        if let Some(dir) = &config.data.data_debug_path {
            worker = worker.with_debug_dump(dir);
        }
        if let Some(batch) = loader.next_batch(&mut worker)? {
            let trainable = batch.trainable_rows()?;
            println!();
            println!(
                "First batch: {} rows x {} tokens, {} trainable, {} with images",
                batch.input_ids.len(),
                batch.seq_len,
                trainable.indices.len(),
                batch.image_num.iter().filter(|&&n| n > 0).count()
            );
        }
        return Ok(());
    }
    Err(VlpoError::Config(format!(
        "no model builder is linked for architecture '{}'; use --dry-run to check the data pipeline",
        config.model.model_architecture.as_str()
    ))
    .into())
}

fn build_loader(
    config: &DpoRunConfig,
    tokenizer: Tokenizer,
    image_tokens: usize,
) -> anyhow::Result<PreferenceDataLoader> {
    let arch = config.model.model_architecture;
    let template = ChatTemplate::new(config.data.template);
    let layout = ImageTokenLayout::from_tokenizer(&tokenizer, &template, arch, image_tokens)?;
    let resources = DatasetResources {
        tokenizer: Arc::new(tokenizer),
        processor: Arc::new(ImageProcessor::for_architecture(arch)),
        template,
        layout,
    };

    let dataset = build_dataset(&config.data, config.training.seed, &resources)?;
    let collator = PreferenceCollator::new(
        &resources.tokenizer,
        &resources.layout,
        resources.processor.clone(),
        config.data.max_seq_len,
        dataset.candidates_per_item(),
    )?;
    let sampler = DistributedSampler::new(dataset.len(), 0, 1, config.training.seed);
    Ok(PreferenceDataLoader::new(
        Box::new(dataset),
        collator,
        sampler,
        config.training.per_device_train_batch_size,
    ))
}

fn run_rlhf_init(path: &Path, num_examples: usize, world_size: usize) -> anyhow::Result<()> {
    let config = RlhfRunConfig::from_yaml_file(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    config.validate()?;

    let per_worker = num_examples.div_ceil(world_size.max(1));
    let batches = per_worker.div_ceil(config.training.per_device_train_batch_size.max(1));
    let plan = StepPlan::new(batches, &config.training)?;
    println!("Examples:             {num_examples}");
    println!("Updates per epoch:    {}", plan.updates_per_epoch);
    println!("Total updates:        {}", plan.total_updates);

    print_roles(&rlhf_roles(&config), &config.training, plan.total_updates, world_size);
    Ok(())
}

fn print_roles(
    roles: &[RoleDescriptor],
    training: &vlpo_core::TrainingConfig,
    total_updates: usize,
    world_size: usize,
) {
    println!();
    println!("{:<10} {:>5} {:>7} {:>9} {:>8}  checkpoint", "role", "stage", "offload", "lr", "steps");
    for role in roles {
        let runtime = role.runtime_config(training, world_size);
        let (lr, steps) = if role.trainable {
            (format!("{:.2e}", role.learning_rate), total_updates.to_string())
        } else {
            ("-".to_string(), "-".to_string())
        };
        println!(
            "{:<10} {:>5} {:>7} {:>9} {:>8}  {}",
            role.role.as_str(),
            runtime.stage.as_u8(),
            runtime.offload,
            lr,
            steps,
            role.checkpoint
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
}
