//! Preference record builder.
//!
//! Turns instruction/answer text into aligned token ids, attention mask and labels.
//! Instruction tokens are masked with [`PAD_LABEL`] so only answers contribute to the loss.

use std::sync::Arc;

use serde::Serialize;
use vlpo_core::{Result, VlpoError, PAD_LABEL};

use crate::tokenizer::Tokenizer;

/// Instruction and answer of one turn, already formatted by a chat template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TextPair {
    /// Formatted instruction.
    pub instruction: String,
    /// Answer including its end-of-turn marker.
    pub answer: String,
}

/// Token ids with aligned mask and labels. All three vectors have equal length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenizedText {
    /// Token ids.
    pub input_ids: Vec<i32>,
    /// 1 for real tokens.
    pub attention_mask: Vec<i32>,
    /// Target ids, or [`PAD_LABEL`] where masked.
    pub labels: Vec<i64>,
}

impl TokenizedText {
    /// Unmasked sequence where labels equal ids.
    pub fn from_ids(ids: &[u32]) -> Self {
        let input_ids: Vec<i32> = ids.iter().map(|&id| id as i32).collect();
        Self {
            attention_mask: vec![1; input_ids.len()],
            labels: input_ids.iter().map(|&id| id as i64).collect(),
            input_ids,
        }
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether the sequence is empty.
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Mask the first `n` labels.
    pub fn mask_prefix(&mut self, n: usize) {
        let n = n.min(self.labels.len());
        self.labels[..n].fill(PAD_LABEL);
    }

    /// Mask every label.
    pub fn mask_all(&mut self) {
        self.labels.fill(PAD_LABEL);
    }

    /// Keep at most `max_len` tokens.
    pub fn truncate(&mut self, max_len: usize) {
        self.input_ids.truncate(max_len);
        self.attention_mask.truncate(max_len);
        self.labels.truncate(max_len);
    }

    /// Append a token that is a training target.
    pub fn push(&mut self, id: i32) {
        self.input_ids.push(id);
        self.attention_mask.push(1);
        self.labels.push(id as i64);
    }

    /// Append another sequence.
    pub fn extend(&mut self, other: TokenizedText) {
        self.input_ids.extend(other.input_ids);
        self.attention_mask.extend(other.attention_mask);
        self.labels.extend(other.labels);
    }

    /// Drop the last token if it equals `id`.
    pub fn strip_last(&mut self, id: i32) {
        if self.input_ids.last() == Some(&id) {
            self.input_ids.pop();
            self.attention_mask.pop();
            self.labels.pop();
        }
    }

    /// Drop the first token if it equals `id`.
    pub fn strip_first(&mut self, id: i32) {
        if self.input_ids.first() == Some(&id) {
            self.input_ids.remove(0);
            self.attention_mask.remove(0);
            self.labels.remove(0);
        }
    }

    /// Ids at positions that carry a training target.
    pub fn target_ids(&self) -> Vec<u32> {
        self.labels
            .iter()
            .filter(|&&l| l != PAD_LABEL)
            .map(|&l| l as u32)
            .collect()
    }
}

/// Tokenizes turns according to one masking and EOS policy.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    tokenizer: Arc<Tokenizer>,
    max_seq_len: usize,
    ignore_instruction: bool,
    add_eos: bool,
}

impl RecordBuilder {
    /// Builder masking instructions and appending EOS.
    pub fn new(tokenizer: Arc<Tokenizer>, max_seq_len: usize) -> Self {
        Self {
            tokenizer,
            max_seq_len,
            ignore_instruction: true,
            add_eos: true,
        }
    }

    /// Set whether instruction tokens are masked out of the loss.
    pub fn with_ignore_instruction(mut self, ignore: bool) -> Self {
        self.ignore_instruction = ignore;
        self
    }

    /// Set whether sequences end with EOS.
    pub fn with_add_eos(mut self, add_eos: bool) -> Self {
        self.add_eos = add_eos;
        self
    }

    /// Underlying tokenizer.
    pub fn tokenizer(&self) -> &Tokenizer {
        &self.tokenizer
    }

    /// Maximum sequence length.
    pub fn max_seq_len(&self) -> usize {
        self.max_seq_len
    }

    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = self.tokenizer.encode_sequence(text)?;
        ids.truncate(self.max_seq_len);
        Ok(ids)
    }

    fn eos(&self) -> Result<i32> {
        self.tokenizer
            .eos_token_id()
            .map(|id| id as i32)
            .ok_or_else(|| VlpoError::Tokenizer("tokenizer has no EOS token".into()))
    }

    /// Tokenize instruction and answer jointly.
    ///
    /// Labels cover the answer span only when instructions are ignored. EOS is appended if
    /// enabled, missing and there is room left under the length limit.
    pub fn tokenize(&self, text: &TextPair) -> Result<TokenizedText> {
        let full = format!("{}{}", text.instruction, text.answer);
        let mut record = TokenizedText::from_ids(&self.encode(&full)?);

        if self.add_eos {
            let eos = self.eos()?;
            if record.input_ids.last() != Some(&eos) && record.len() < self.max_seq_len {
                record.push(eos);
            }
        }

        if self.ignore_instruction {
            let instruction_len = self.encode(&text.instruction)?.len();
            record.mask_prefix(instruction_len);
        }
        Ok(record)
    }

    /// Tokenize an instruction on its own, as a generation prompt.
    ///
    /// A trailing EOS is removed unless EOS is enabled. Labels equal the ids, or are fully
    /// masked when instructions are ignored.
    pub fn tokenize_prompt(&self, instruction: &str) -> Result<TokenizedText> {
        let mut record = TokenizedText::from_ids(&self.encode(instruction)?);
        let eos = self.tokenizer.eos_token_id().map(|id| id as i32);

        match (self.add_eos, eos) {
            (false, Some(eos)) => record.strip_last(eos),
            (true, Some(eos)) => {
                if record.input_ids.last() != Some(&eos) && record.len() < self.max_seq_len {
                    record.push(eos);
                }
            }
            (true, None) => return Err(VlpoError::Tokenizer("tokenizer has no EOS token".into())),
            (false, None) => {}
        }

        if self.ignore_instruction {
            record.mask_all();
        }
        Ok(record)
    }
}

/// Join the turns of one conversation into a single sequence.
///
/// BOS is stripped from every turn but the first and EOS from every turn but the last,
/// so no segment boundary appears mid-conversation.
pub fn concatenate_turns(
    turns: Vec<TokenizedText>,
    bos: Option<u32>,
    eos: Option<u32>,
) -> TokenizedText {
    let count = turns.len();
    if count == 1 {
        return turns.into_iter().next().unwrap_or_default();
    }

    let mut joined = TokenizedText::default();
    for (idx, mut turn) in turns.into_iter().enumerate() {
        if idx + 1 < count {
            if let Some(eos) = eos {
                turn.strip_last(eos as i32);
            }
        }
        if idx > 0 {
            if let Some(bos) = bos {
                turn.strip_first(bos as i32);
            }
        }
        joined.extend(turn);
    }
    joined
}
