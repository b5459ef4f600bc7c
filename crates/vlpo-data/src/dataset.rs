//! Preference datasets built from annotation files.
//!
//! Every dataset item yields a fixed number of candidates laid out in rank order, so a
//! batch of items is a sequence of equally sized candidate groups.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde_json::json;
use vlpo_core::{
    DataConfig, DatasetKind, DatasetSpec, NumericWarning, Result, SampleLimit, VlpoError,
};

use crate::annotation::{load_annotations, Annotation};
use crate::candidate::{merge_all_images, Candidate, ImageTokenLayout, Segment};
use crate::chat_templates::{clean_question, ChatTemplate};
use crate::context::WorkerContext;
use crate::image_processing::{ImageProcessor, ProcessedImage};
use crate::record::{concatenate_turns, RecordBuilder, TextPair};
use crate::tokenizer::Tokenizer;

/// A source of candidate groups.
pub trait PreferenceDataset: Send + Sync {
    /// Number of items.
    fn len(&self) -> usize;

    /// Whether there are no items.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Candidates produced per item.
    fn candidates_per_item(&self) -> usize;

    /// Build the candidates of one item in rank order.
    fn get(&self, index: usize, ctx: &mut WorkerContext) -> Result<Vec<Candidate>>;
}

/// Shared collaborators used to turn annotations into candidates.
#[derive(Debug, Clone)]
pub struct DatasetResources {
    /// Policy tokenizer.
    pub tokenizer: Arc<Tokenizer>,
    /// Image processor of the model architecture.
    pub processor: Arc<ImageProcessor>,
    /// Chat template.
    pub template: ChatTemplate,
    /// Image placeholder expansion.
    pub layout: ImageTokenLayout,
}

/// Dataset construction options shared by every dataset flavour.
#[derive(Debug, Clone)]
pub struct DatasetOptions {
    /// Directory holding annotation images.
    pub image_folder: PathBuf,
    /// Maximum tokens per sequence.
    pub max_seq_len: usize,
    /// Mask instruction tokens.
    pub ignore_instruction: bool,
    /// Maximum images per merged sample.
    pub max_num_image_per_sample: usize,
    /// Candidates per comparison item.
    pub ranked_candidate_num: usize,
    /// Seed for subsampling and mixing.
    pub seed: u64,
}

impl DatasetOptions {
    /// Options taken from a data configuration.
    pub fn from_config(config: &DataConfig, seed: u64) -> Self {
        Self {
            image_folder: config.image_folder.clone(),
            max_seq_len: config.max_seq_len,
            ignore_instruction: config.ignore_instruction,
            max_num_image_per_sample: config.max_num_image_per_sample,
            ranked_candidate_num: config.ranked_candidate_num,
            seed,
        }
    }
}

/// Loaded annotations grouped into items.
#[derive(Debug, Clone)]
struct AnnotationSource {
    groups: Vec<Vec<Annotation>>,
    image_folder: PathBuf,
}

impl AnnotationSource {
    fn open(path: &Path, samples: SampleLimit, concatenate: usize, options: &DatasetOptions) -> Result<Self> {
        if !options.image_folder.is_dir() {
            return Err(VlpoError::Data(format!(
                "image directory {} not found",
                options.image_folder.display()
            )));
        }
        let annotations = limit_samples(load_annotations(path)?, samples, options.seed);
        let groups = annotations
            .chunks(concatenate.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();
        Ok(Self {
            groups,
            image_folder: options.image_folder.clone(),
        })
    }

    fn group(&self, index: usize) -> Result<&[Annotation]> {
        self.groups.get(index).map(Vec::as_slice).ok_or_else(|| {
            VlpoError::Data(format!(
                "item {index} out of range for {} items",
                self.groups.len()
            ))
        })
    }

    fn load_image(&self, ann: &Annotation, processor: &ImageProcessor) -> Result<Option<ProcessedImage>> {
        match &ann.image {
            Some(name) => processor.preprocess(self.image_folder.join(name)).map(Some),
            None => Ok(None),
        }
    }
}

/// Keep a seeded random subset of annotations, preserving file order.
fn limit_samples(annotations: Vec<Annotation>, limit: SampleLimit, seed: u64) -> Vec<Annotation> {
    let n = match limit {
        SampleLimit::All => return annotations,
        SampleLimit::Count(n) => n,
    };
    if n >= annotations.len() {
        if n > annotations.len() {
            tracing::warn!(
                "Requested {} samples but only {} annotations are available",
                n,
                annotations.len()
            );
        }
        return annotations;
    }

    let mut order: Vec<usize> = (0..annotations.len()).collect();
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    order.shuffle(&mut rng);
    let mut keep = vec![false; annotations.len()];
    for &i in &order[..n] {
        keep[i] = true;
    }
    annotations
        .into_iter()
        .zip(keep)
        .filter_map(|(ann, k)| k.then_some(ann))
        .collect()
}

fn record_zero_image(candidates: &[Candidate], index: usize, ctx: &mut WorkerContext) {
    let mut valid = candidates.iter().filter(|c| c.is_valid()).peekable();
    if valid.peek().is_some() && valid.all(|c| c.image_num == 0) {
        ctx.record_warning(NumericWarning::ZeroImageSample { index });
    }
}

/// Multi-turn conversations; one candidate per item.
///
/// Each item groups `concatenate` annotations whose turns and images are merged into one
/// sequence.
pub struct ConversationDataset {
    source: AnnotationSource,
    builder: RecordBuilder,
    resources: DatasetResources,
    max_images: usize,
}

impl ConversationDataset {
    /// Open a conversation annotation file.
    pub fn new(
        path: impl AsRef<Path>,
        samples: SampleLimit,
        concatenate: usize,
        options: &DatasetOptions,
        resources: DatasetResources,
    ) -> Result<Self> {
        let source = AnnotationSource::open(path.as_ref(), samples, concatenate, options)?;
        let builder = RecordBuilder::new(resources.tokenizer.clone(), options.max_seq_len)
            .with_ignore_instruction(options.ignore_instruction);
        Ok(Self {
            source,
            builder,
            resources,
            max_images: options.max_num_image_per_sample,
        })
    }
}

impl PreferenceDataset for ConversationDataset {
    fn len(&self) -> usize {
        self.source.groups.len()
    }

    fn candidates_per_item(&self) -> usize {
        1
    }

    fn get(&self, index: usize, ctx: &mut WorkerContext) -> Result<Vec<Candidate>> {
        let template = &self.resources.template;
        let tokenizer = &self.resources.tokenizer;
        let mut segments = Vec::new();

        for (ann_idx, ann) in self.source.group(index)?.iter().enumerate() {
            let image = self.source.load_image(ann, &self.resources.processor)?;
            let mut turns = Vec::new();
            let mut texts = Vec::new();

            for (turn_idx, (question, answer)) in ann.question_answer_pairs()?.into_iter().enumerate() {
                let first_turn = turn_idx == 0;
                let question = if first_turn {
                    clean_question(question)
                } else {
                    question.to_string()
                };
                let text = TextPair {
                    instruction: template.prompt(
                        &question,
                        first_turn && image.is_some(),
                        first_turn && ann_idx == 0,
                    ),
                    answer: format!("{answer}{}", template.end_of_turn()),
                };
                turns.push(self.builder.tokenize(&text)?);
                texts.push(text);
            }
            ctx.dump_sample(&texts)?;

            segments.push(Segment {
                tokens: concatenate_turns(turns, tokenizer.bos_token_id(), tokenizer.eos_token_id()),
                image,
            });
        }

        let candidates = vec![merge_all_images(segments, &self.resources.layout, self.max_images)?];
        record_zero_image(&candidates, index, ctx);
        Ok(candidates)
    }
}

/// Ranked comparisons; `ranked_candidate_num` candidates per item in rank order.
///
/// Missing ranks become invalid candidates and extra ranks are dropped.
pub struct ComparisonDataset {
    source: AnnotationSource,
    builder: RecordBuilder,
    resources: DatasetResources,
    max_images: usize,
    ranked_candidate_num: usize,
}

impl ComparisonDataset {
    /// Open a comparison annotation file.
    pub fn new(
        path: impl AsRef<Path>,
        samples: SampleLimit,
        options: &DatasetOptions,
        resources: DatasetResources,
    ) -> Result<Self> {
        let source = AnnotationSource::open(path.as_ref(), samples, 1, options)?;
        let builder = RecordBuilder::new(resources.tokenizer.clone(), options.max_seq_len)
            .with_ignore_instruction(options.ignore_instruction);
        Ok(Self {
            source,
            builder,
            resources,
            max_images: options.max_num_image_per_sample,
            ranked_candidate_num: options.ranked_candidate_num,
        })
    }
}

impl PreferenceDataset for ComparisonDataset {
    fn len(&self) -> usize {
        self.source.groups.len()
    }

    fn candidates_per_item(&self) -> usize {
        self.ranked_candidate_num
    }

    fn get(&self, index: usize, ctx: &mut WorkerContext) -> Result<Vec<Candidate>> {
        let template = &self.resources.template;
        let ann = self
            .source
            .group(index)?
            .first()
            .ok_or_else(|| VlpoError::Data(format!("item {index} is empty")))?;

        let image = self.source.load_image(ann, &self.resources.processor)?;
        let (question, answers) = ann.ranked_answers()?;
        let instruction = template.prompt(&clean_question(question), image.is_some(), true);
        ctx.dump_sample(&json!({ "instruction": instruction, "answers": answers }))?;

        if answers.len() > self.ranked_candidate_num {
            tracing::debug!(
                "annotation {} has {} ranked answers, keeping {}",
                ann.id,
                answers.len(),
                self.ranked_candidate_num
            );
        }

        let mut candidates = Vec::with_capacity(self.ranked_candidate_num);
        for answer in answers.iter().take(self.ranked_candidate_num) {
            let text = TextPair {
                instruction: instruction.clone(),
                answer: format!("{answer}{}", template.end_of_turn()),
            };
            let segment = Segment {
                tokens: self.builder.tokenize(&text)?,
                image: image.clone(),
            };
            candidates.push(merge_all_images(vec![segment], &self.resources.layout, self.max_images)?);
        }
        candidates.resize_with(self.ranked_candidate_num, Candidate::missing);

        record_zero_image(&candidates, index, ctx);
        Ok(candidates)
    }
}

/// Prompt-only records for rollout generation; one candidate per item.
///
/// The instruction is tokenized alone without a trailing EOS.
pub struct PromptDataset {
    source: AnnotationSource,
    builder: RecordBuilder,
    resources: DatasetResources,
    max_images: usize,
}

impl PromptDataset {
    /// Open a prompt annotation file.
    pub fn new(
        path: impl AsRef<Path>,
        samples: SampleLimit,
        options: &DatasetOptions,
        resources: DatasetResources,
    ) -> Result<Self> {
        let source = AnnotationSource::open(path.as_ref(), samples, 1, options)?;
        let builder = RecordBuilder::new(resources.tokenizer.clone(), options.max_seq_len)
            .with_ignore_instruction(options.ignore_instruction)
            .with_add_eos(false);
        Ok(Self {
            source,
            builder,
            resources,
            max_images: options.max_num_image_per_sample,
        })
    }
}

impl PreferenceDataset for PromptDataset {
    fn len(&self) -> usize {
        self.source.groups.len()
    }

    fn candidates_per_item(&self) -> usize {
        1
    }

    fn get(&self, index: usize, ctx: &mut WorkerContext) -> Result<Vec<Candidate>> {
        let ann = self
            .source
            .group(index)?
            .first()
            .ok_or_else(|| VlpoError::Data(format!("item {index} is empty")))?;

        let image = self.source.load_image(ann, &self.resources.processor)?;
        let question = clean_question(ann.first_question()?);
        let instruction = self.resources.template.prompt(&question, image.is_some(), true);
        ctx.dump_sample(&json!({ "instruction": instruction }))?;

        let segment = Segment {
            tokens: self.builder.tokenize_prompt(&instruction)?,
            image,
        };
        let candidates = vec![merge_all_images(vec![segment], &self.resources.layout, self.max_images)?];
        record_zero_image(&candidates, index, ctx);
        Ok(candidates)
    }
}

/// Several datasets mixed into one, shuffled once with the run seed.
pub struct ConcatDataset {
    parts: Vec<Box<dyn PreferenceDataset>>,
    index: Vec<(usize, usize)>,
    candidates_per_item: usize,
}

impl ConcatDataset {
    /// Mix `parts`; every part must yield the same number of candidates per item.
    pub fn new(parts: Vec<Box<dyn PreferenceDataset>>, seed: u64) -> Result<Self> {
        let candidates_per_item = parts.first().map(|p| p.candidates_per_item()).unwrap_or(1);
        if let Some(bad) = parts
            .iter()
            .find(|p| p.candidates_per_item() != candidates_per_item)
        {
            return Err(VlpoError::Config(format!(
                "cannot mix datasets yielding {} and {} candidates per item",
                candidates_per_item,
                bad.candidates_per_item()
            )));
        }

        let mut index: Vec<(usize, usize)> = parts
            .iter()
            .enumerate()
            .flat_map(|(p, part)| (0..part.len()).map(move |i| (p, i)))
            .collect();
        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        index.shuffle(&mut rng);

        Ok(Self {
            parts,
            index,
            candidates_per_item,
        })
    }
}

impl PreferenceDataset for ConcatDataset {
    fn len(&self) -> usize {
        self.index.len()
    }

    fn candidates_per_item(&self) -> usize {
        self.candidates_per_item
    }

    fn get(&self, index: usize, ctx: &mut WorkerContext) -> Result<Vec<Candidate>> {
        let &(part, inner) = self.index.get(index).ok_or_else(|| {
            VlpoError::Data(format!("item {index} out of range for {} items", self.index.len()))
        })?;
        self.parts[part].get(inner, ctx)
    }
}

/// Build and mix every dataset named in the configuration.
pub fn build_dataset(config: &DataConfig, seed: u64, resources: &DatasetResources) -> Result<ConcatDataset> {
    let options = DatasetOptions::from_config(config, seed);
    let mut parts: Vec<Box<dyn PreferenceDataset>> = Vec::new();

    for DatasetSpec {
        kind,
        path,
        samples,
        concatenate,
    } in config.resolve_datasets()?
    {
        let part: Box<dyn PreferenceDataset> = match kind {
            DatasetKind::Conversation => Box::new(ConversationDataset::new(
                &path,
                samples,
                concatenate,
                &options,
                resources.clone(),
            )?),
            DatasetKind::Comparison => {
                Box::new(ComparisonDataset::new(&path, samples, &options, resources.clone())?)
            }
            DatasetKind::Prompt => {
                Box::new(PromptDataset::new(&path, samples, &options, resources.clone())?)
            }
        };
        tracing::info!("Dataset {} ({:?}): {} items", path.display(), kind, part.len());
        parts.push(part);
    }

    ConcatDataset::new(parts, seed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(n: usize) -> Vec<Annotation> {
        (0..n)
            .map(|i| Annotation {
                id: i.to_string(),
                image: None,
                conversations: Vec::new(),
            })
            .collect()
    }

    #[test]
    fn test_limit_samples_is_seeded_and_ordered() {
        let a = limit_samples(annotations(20), SampleLimit::Count(5), 7);
        let b = limit_samples(annotations(20), SampleLimit::Count(5), 7);
        assert_eq!(a, b);
        assert_eq!(a.len(), 5);
        let ids: Vec<usize> = a.iter().map(|x| x.id.parse().unwrap()).collect();
        let mut sorted = ids.clone();
        sorted.sort_unstable();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_limit_samples_all_and_oversized() {
        assert_eq!(limit_samples(annotations(3), SampleLimit::All, 1).len(), 3);
        assert_eq!(limit_samples(annotations(3), SampleLimit::Count(10), 1).len(), 3);
    }

    struct Fixed {
        items: usize,
        per_item: usize,
    }

    impl PreferenceDataset for Fixed {
        fn len(&self) -> usize {
            self.items
        }
        fn candidates_per_item(&self) -> usize {
            self.per_item
        }
        fn get(&self, _index: usize, _ctx: &mut WorkerContext) -> Result<Vec<Candidate>> {
            Ok(vec![Candidate::missing(); self.per_item])
        }
    }

    #[test]
    fn test_concat_mixes_all_items() {
        let parts: Vec<Box<dyn PreferenceDataset>> = vec![
            Box::new(Fixed { items: 3, per_item: 2 }),
            Box::new(Fixed { items: 4, per_item: 2 }),
        ];
        let mixed = ConcatDataset::new(parts, 1).unwrap();
        assert_eq!(mixed.len(), 7);
        let mut ctx = WorkerContext::new(0, 1);
        for i in 0..7 {
            assert_eq!(mixed.get(i, &mut ctx).unwrap().len(), 2);
        }
        assert!(mixed.get(7, &mut ctx).is_err());
    }

    #[test]
    fn test_concat_rejects_mixed_group_sizes() {
        let parts: Vec<Box<dyn PreferenceDataset>> = vec![
            Box::new(Fixed { items: 3, per_item: 2 }),
            Box::new(Fixed { items: 4, per_item: 1 }),
        ];
        assert!(matches!(ConcatDataset::new(parts, 1), Err(VlpoError::Config(_))));
    }
}
