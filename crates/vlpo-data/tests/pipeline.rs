//! End-to-end tests of the preference data pipeline on files.

use std::path::Path;
use std::sync::Arc;

use image::{Rgb, RgbImage};
use vlpo_core::{
    ChatTemplateKind, DataConfig, DatasetKind, ModelArchitecture, NumericWarning, SampleLimit,
    VlpoError, PAD_LABEL,
};
use vlpo_data::{
    build_dataset, ChatTemplate, ComparisonDataset, ConversationDataset, DatasetOptions,
    DatasetResources, DistributedSampler, ImageLayoutMode, ImageProcessor, ImageProcessorConfig,
    ImageTokenLayout, PaddingSide, PreferenceCollator, PreferenceDataLoader, PreferenceDataset,
    PromptDataset, Tokenizer, WorkerContext,
};

const WORDS: &[&str] = &[
    "the", "cat", "sat", "dog", "ran", "a", "bird", "flew", "what", "is", "this", "###",
    ":", "Question", "Answer", "Image",
];
const TOKENS_PER_IMAGE: usize = 3;

fn tokenizer() -> Tokenizer {
    let special = ["<pad>", "<s>", "</s>", "<unk>", "<image>", "<im_patch>"];
    let mut vocab = serde_json::Map::new();
    let mut added = Vec::new();
    for (id, token) in special.iter().enumerate() {
        vocab.insert(token.to_string(), id.into());
        added.push(serde_json::json!({
            "id": id, "content": token, "single_word": false, "lstrip": false,
            "rstrip": false, "normalized": false, "special": true
        }));
    }
    for word in WORDS {
        let next = vocab.len();
        vocab.entry(word.to_string()).or_insert(next.into());
    }
    let json = serde_json::json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": added,
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "<unk>"}
    });
    Tokenizer::from_bytes(json.to_string().as_bytes()).unwrap()
}

fn resources(side: PaddingSide) -> DatasetResources {
    let tokenizer = tokenizer().with_padding_side(side);
    let template = ChatTemplate::new(ChatTemplateKind::Default);
    let layout = ImageTokenLayout::from_tokenizer(
        &tokenizer,
        &template,
        ModelArchitecture::Default,
        TOKENS_PER_IMAGE,
    )
    .unwrap();
    let processor = ImageProcessor::new(ImageProcessorConfig {
        size: (4, 4),
        mode: ImageLayoutMode::Single,
        ..Default::default()
    });
    DatasetResources {
        tokenizer: Arc::new(tokenizer),
        processor: Arc::new(processor),
        template,
        layout,
    }
}

fn write_image(dir: &Path, name: &str) {
    RgbImage::from_pixel(6, 6, Rgb([10, 20, 30]))
        .save(dir.join(name))
        .unwrap();
}

fn options(image_folder: &Path) -> DatasetOptions {
    DatasetOptions {
        image_folder: image_folder.to_path_buf(),
        max_seq_len: 512,
        ignore_instruction: true,
        max_num_image_per_sample: 8,
        ranked_candidate_num: 2,
        seed: 1235,
    }
}

fn comparison_file(dir: &Path) -> std::path::PathBuf {
    let path = dir.join("comparison.json");
    std::fs::write(
        &path,
        r#"[
            {"id": "c0", "image": "img.png", "conversations": [
                {"from": "human", "value": "<image>\nwhat is this"},
                {"from": "gpt", "value": ["the cat sat", "the dog ran", "a bird flew"]}]},
            {"id": "c1", "image": "img.png", "conversations": [
                {"from": "human", "value": "what is this\n<image>"},
                {"from": "gpt", "value": ["a bird flew"]}]},
            {"id": "c2", "conversations": [
                {"from": "human", "value": "what is this"},
                {"from": "gpt", "value": ["the cat sat", "the dog ran"]}]}
        ]"#,
    )
    .unwrap();
    path
}

#[test]
fn test_ranked_candidates_keep_rank_order() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "img.png");
    let path = comparison_file(dir.path());
    let res = resources(PaddingSide::Right);
    let tok = res.tokenizer.clone();
    let dataset =
        ComparisonDataset::new(&path, SampleLimit::All, &options(dir.path()), res).unwrap();
    let mut ctx = WorkerContext::new(0, 1);

    let candidates = dataset.get(0, &mut ctx).unwrap();
    assert_eq!(candidates.len(), 2);
    let answers: Vec<String> = candidates
        .iter()
        .map(|c| {
            let targets: Vec<u32> = c
                .labels
                .iter()
                .filter(|&&l| l != PAD_LABEL)
                .map(|&l| l as u32)
                .collect();
            tok.decode(&targets).unwrap()
        })
        .collect();
    assert_eq!(answers, vec!["the cat sat", "the dog ran"]);

    for c in &candidates {
        c.check_alignment().unwrap();
        assert_eq!(c.image_num, 1);
        assert_eq!(c.images.len(), 1);
    }
}

#[test]
fn test_image_block_has_k_masked_positions() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "img.png");
    let path = comparison_file(dir.path());
    let res = resources(PaddingSide::Right);
    let layout = res.layout;
    let dataset =
        ComparisonDataset::new(&path, SampleLimit::All, &options(dir.path()), res).unwrap();
    let mut ctx = WorkerContext::new(0, 1);

    let candidate = &dataset.get(0, &mut ctx).unwrap()[0];
    let block: Vec<usize> = candidate
        .input_ids
        .iter()
        .enumerate()
        .filter(|(_, &id)| id == layout.image_token_id)
        .map(|(i, _)| i)
        .collect();
    assert_eq!(block.len(), TOKENS_PER_IMAGE);
    assert!(block.iter().all(|&i| candidate.labels[i] == PAD_LABEL));
    assert!(block.iter().all(|&i| candidate.attention_mask[i] == 1));
    assert!(!candidate.input_ids.contains(&layout.placeholder_id));
}

#[test]
fn test_short_rank_list_pads_with_invalid_candidates() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "img.png");
    let path = comparison_file(dir.path());
    let res = resources(PaddingSide::Left);
    let collator = PreferenceCollator::new(
        &res.tokenizer,
        &res.layout,
        res.processor.clone(),
        512,
        2,
    )
    .unwrap();
    let dataset =
        ComparisonDataset::new(&path, SampleLimit::All, &options(dir.path()), res).unwrap();
    let mut ctx = WorkerContext::new(0, 1);

    let short = dataset.get(1, &mut ctx).unwrap();
    assert!(short[0].is_valid());
    assert!(!short[1].is_valid());

    let full = dataset.get(0, &mut ctx).unwrap();
    let batch = collator.collate(vec![short, full]).unwrap();
    let kept = batch.trainable_rows().unwrap();
    assert_eq!(kept.indices, vec![2, 3]);
    assert_eq!(
        kept.warnings,
        vec![NumericWarning::DegeneratePairGroup { group: 0, valid: 1 }]
    );
    let tensors = batch.to_tensors(&kept.indices).unwrap();
    assert_eq!(tensors.pixel_values.shape(), &[2, 3, 4, 4]);
}

#[test]
fn test_text_only_sample_warns() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "img.png");
    let path = comparison_file(dir.path());
    let dataset = ComparisonDataset::new(
        &path,
        SampleLimit::All,
        &options(dir.path()),
        resources(PaddingSide::Right),
    )
    .unwrap();
    let mut ctx = WorkerContext::new(0, 1);

    let candidates = dataset.get(2, &mut ctx).unwrap();
    assert!(candidates.iter().all(|c| c.image_num == 0));
    assert_eq!(
        ctx.warnings(),
        &[NumericWarning::ZeroImageSample { index: 2 }]
    );
}

#[test]
fn test_multi_turn_conversation_concatenation() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "img.png");
    let path = dir.path().join("conv.jsonl");
    std::fs::write(
        &path,
        concat!(
            r#"{"image": "img.png", "conversations": [{"from": "human", "value": "<image>\nwhat is this"}, {"from": "gpt", "value": "the cat"}, {"from": "human", "value": "what is this"}, {"from": "gpt", "value": "a dog"}]}"#,
            "\n",
            r#"{"image": "img.png", "conversations": [{"from": "human", "value": "<image>\nwhat is this"}, {"from": "gpt", "value": "a bird"}]}"#,
            "\n"
        ),
    )
    .unwrap();

    let res = resources(PaddingSide::Right);
    let tok = res.tokenizer.clone();
    let dataset =
        ConversationDataset::new(&path, SampleLimit::All, 2, &options(dir.path()), res).unwrap();
    assert_eq!(dataset.len(), 1);
    let mut ctx = WorkerContext::new(0, 1);

    let candidates = dataset.get(0, &mut ctx).unwrap();
    assert_eq!(candidates.len(), 1);
    let c = &candidates[0];
    assert_eq!(c.image_num, 2);
    let bos = tok.bos_token_id().unwrap() as i32;
    let eos = tok.eos_token_id().unwrap() as i32;
    // one conversation per annotation, each keeps a single BOS and EOS
    assert_eq!(c.input_ids.iter().filter(|&&t| t == bos).count(), 2);
    assert_eq!(c.input_ids.iter().filter(|&&t| t == eos).count(), 2);
    c.check_alignment().unwrap();
}

#[test]
fn test_prompt_dataset_masks_everything() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "img.png");
    let path = comparison_file(dir.path());
    let res = resources(PaddingSide::Left);
    let tok = res.tokenizer.clone();
    let dataset = PromptDataset::new(&path, SampleLimit::All, &options(dir.path()), res).unwrap();
    let mut ctx = WorkerContext::new(0, 1);

    let candidate = &dataset.get(0, &mut ctx).unwrap()[0];
    assert!(candidate.labels.iter().all(|&l| l == PAD_LABEL));
    let eos = tok.eos_token_id().unwrap() as i32;
    assert_ne!(candidate.input_ids.last(), Some(&eos));
}

#[test]
fn test_missing_image_folder_is_data_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = comparison_file(dir.path());
    let err = ComparisonDataset::new(
        &path,
        SampleLimit::All,
        &options(&dir.path().join("missing")),
        resources(PaddingSide::Right),
    )
    .err()
    .unwrap();
    assert!(matches!(err, VlpoError::Data(_)));
}

#[test]
fn test_loader_shards_and_batches() {
    let dir = tempfile::tempdir().unwrap();
    write_image(dir.path(), "img.png");
    let path = comparison_file(dir.path());
    let config = DataConfig {
        data_path: vec![path],
        image_folder: dir.path().to_path_buf(),
        dataset_names: vec![DatasetKind::Comparison],
        max_seq_len: 512,
        ..Default::default()
    };
    let res = resources(PaddingSide::Right);
    let debug_dir = dir.path().join("debug");

    let mut total_rows = 0;
    let mut seen = std::collections::HashSet::new();
    for rank in 0..2 {
        let dataset = build_dataset(&config, 1235, &res).unwrap();
        let sampler = DistributedSampler::new(dataset.len(), rank, 2, 1235);
        for index in sampler.indices(0) {
            assert!(seen.insert(index), "item {index} assigned to two ranks");
        }
        let collator =
            PreferenceCollator::new(&res.tokenizer, &res.layout, res.processor.clone(), 512, 2)
                .unwrap();
        let mut loader = PreferenceDataLoader::new(Box::new(dataset), collator, sampler, 1);
        assert_eq!(loader.len(), 3 / 2);
        assert_eq!(loader.num_batches(), 1);

        let mut ctx = WorkerContext::new(rank, 2).with_debug_dump(&debug_dir);
        while let Some(batch) = loader.next_batch(&mut ctx).unwrap() {
            assert_eq!(batch.num_rows() % 2, 0);
            total_rows += batch.num_rows();
        }
        assert_eq!(ctx.debug_dump().unwrap().counter(), 1);
    }
    // 3 items, the odd one dropped, 2 candidates each
    assert_eq!(seen.len(), 2);
    assert_eq!(total_rows, 4);
    assert!(debug_dir.join("gpu_rank1_debug0.json").exists());
}
