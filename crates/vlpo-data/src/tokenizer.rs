//! Tokenizer integration.

use std::path::Path;

use vlpo_core::{Result, VlpoError};

/// Side on which sequences are padded to a common length.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PaddingSide {
    /// Pad tokens precede the sequence.
    Left,
    /// Pad tokens follow the sequence.
    #[default]
    Right,
}

/// Wrapper around the tokenizers library.
///
/// Carries the padding side and the BOS/EOS policy that the record builder and collator
/// follow, so a single value fully describes how text becomes a padded row.
#[derive(Clone)]
pub struct Tokenizer {
    inner: tokenizers::Tokenizer,
    padding_side: PaddingSide,
    add_bos_token: bool,
    add_eos_token: bool,
}

impl std::fmt::Debug for Tokenizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tokenizer")
            .field("vocab_size", &self.vocab_size())
            .field("padding_side", &self.padding_side)
            .field("add_bos_token", &self.add_bos_token)
            .field("add_eos_token", &self.add_eos_token)
            .finish()
    }
}

impl Tokenizer {
    fn wrap(inner: tokenizers::Tokenizer) -> Self {
        Self {
            inner,
            padding_side: PaddingSide::Right,
            add_bos_token: true,
            add_eos_token: false,
        }
    }

    /// Load a tokenizer from a local file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_file(path)
            .map_err(|e| VlpoError::Tokenizer(e.to_string()))?;
        Ok(Self::wrap(inner))
    }

    /// Load a tokenizer from bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let inner = tokenizers::Tokenizer::from_bytes(bytes)
            .map_err(|e| VlpoError::Tokenizer(e.to_string()))?;
        Ok(Self::wrap(inner))
    }

    /// Set the padding side.
    pub fn with_padding_side(mut self, side: PaddingSide) -> Self {
        self.padding_side = side;
        self
    }

    /// Set whether BOS is prepended and EOS appended by [`Self::encode_sequence`].
    pub fn with_special_tokens(mut self, add_bos: bool, add_eos: bool) -> Self {
        self.add_bos_token = add_bos;
        self.add_eos_token = add_eos;
        self
    }

    /// Padding side.
    pub fn padding_side(&self) -> PaddingSide {
        self.padding_side
    }

    /// Whether sequences start with BOS.
    pub fn add_bos_token(&self) -> bool {
        self.add_bos_token
    }

    /// Whether sequences end with EOS.
    pub fn add_eos_token(&self) -> bool {
        self.add_eos_token
    }

    /// Encode text to token IDs without special tokens.
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .inner
            .encode(text, false)
            .map_err(|e| VlpoError::Tokenizer(e.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }

    /// Encode a full sequence, applying the BOS/EOS policy.
    pub fn encode_sequence(&self, text: &str) -> Result<Vec<u32>> {
        let mut ids = Vec::new();
        if self.add_bos_token {
            if let Some(bos) = self.bos_token_id() {
                ids.push(bos);
            }
        }
        ids.extend(self.encode(text)?);
        if self.add_eos_token {
            if let Some(eos) = self.eos_token_id() {
                if ids.last() != Some(&eos) {
                    ids.push(eos);
                }
            }
        }
        Ok(ids)
    }

    /// Decode token IDs to text, skipping special tokens.
    pub fn decode(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, true)
            .map_err(|e| VlpoError::Tokenizer(e.to_string()))
    }

    /// Decode token IDs to text without skipping special tokens.
    pub fn decode_with_special_tokens(&self, ids: &[u32]) -> Result<String> {
        self.inner
            .decode(ids, false)
            .map_err(|e| VlpoError::Tokenizer(e.to_string()))
    }

    /// Get vocabulary size.
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(true)
    }

    /// Look up a single token.
    pub fn token_to_id(&self, token: &str) -> Option<u32> {
        self.inner.token_to_id(token)
    }

    /// Look up a token that must exist in the vocabulary.
    pub fn require_token_id(&self, token: &str) -> Result<u32> {
        self.inner
            .token_to_id(token)
            .ok_or_else(|| VlpoError::Tokenizer(format!("token '{token}' is not in the vocabulary")))
    }

    /// Get pad token ID if available.
    ///
    /// Tries common pad token names, falls back to EOS token.
    pub fn pad_token_id(&self) -> Option<u32> {
        self.inner
            .token_to_id("<pad>")
            .or_else(|| self.inner.token_to_id("[PAD]"))
            .or_else(|| self.inner.token_to_id("<|pad|>"))
            .or_else(|| self.inner.token_to_id("<|finetune_right_pad_id|>"))
            .or_else(|| self.eos_token_id())
    }

    /// Get EOS token ID if available.
    pub fn eos_token_id(&self) -> Option<u32> {
        self.inner
            .token_to_id("</s>")
            .or_else(|| self.inner.token_to_id("<|end_of_text|>"))
            .or_else(|| self.inner.token_to_id("<|endoftext|>"))
            .or_else(|| self.inner.token_to_id("<eos>"))
    }

    /// Get BOS token ID if available.
    pub fn bos_token_id(&self) -> Option<u32> {
        self.inner
            .token_to_id("<s>")
            .or_else(|| self.inner.token_to_id("<|begin_of_text|>"))
            .or_else(|| self.inner.token_to_id("<bos>"))
    }
}

/// Helpers for building small in-memory tokenizers in tests.
#[cfg(test)]
pub(crate) mod testing {
    use super::Tokenizer;

    const SPECIAL: &[&str] = &["<pad>", "<s>", "</s>", "<unk>", "<image>", "<im_patch>"];

    /// Build a whitespace word-level tokenizer over the special tokens plus `words`.
    pub fn word_level(words: &[&str]) -> Tokenizer {
        let mut vocab = serde_json::Map::new();
        let mut added = Vec::new();
        for (id, token) in SPECIAL.iter().enumerate() {
            vocab.insert((*token).to_string(), id.into());
            added.push(serde_json::json!({
                "id": id, "content": token, "single_word": false, "lstrip": false,
                "rstrip": false, "normalized": false, "special": true
            }));
        }
        for word in words {
            let next = vocab.len();
            vocab.entry((*word).to_string()).or_insert(next.into());
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
}
