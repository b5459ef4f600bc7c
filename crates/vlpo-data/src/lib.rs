//! Preference data pipeline for vlpo.
//!
//! This crate provides:
//! - Annotation loading (LLaVA-style JSON and JSONL)
//! - Chat templates and the record builder with instruction masking
//! - Candidate assembly and image placeholder expansion
//! - Image preprocessing per architecture
//! - Batch collation, trainable-row filtering and tensor conversion
//! - Distributed sampling and the per-worker data loader

#![warn(missing_docs)]

pub mod annotation;
pub mod candidate;
pub mod chat_templates;
pub mod collator;
pub mod context;
pub mod dataloader;
pub mod dataset;
pub mod image_processing;
pub mod record;
pub mod sampler;
pub mod tokenizer;

pub use annotation::*;
pub use candidate::*;
pub use chat_templates::{clean_question, ChatTemplate};
pub use collator::*;
pub use context::*;
pub use dataloader::*;
pub use dataset::*;
pub use image_processing::*;
pub use record::*;
pub use sampler::*;
pub use tokenizer::{PaddingSide, Tokenizer};
