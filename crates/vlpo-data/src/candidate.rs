//! Candidates and image placeholder expansion.

use vlpo_core::{ModelArchitecture, Result, VlpoError, INVALID_TOKEN_ID, PAD_LABEL};

use crate::chat_templates::ChatTemplate;
use crate::image_processing::ProcessedImage;
use crate::record::TokenizedText;
use crate::tokenizer::Tokenizer;

/// Token repeated to fill an image block when the vocabulary has one.
pub const IMAGE_PATCH_TOKEN: &str = "<im_patch>";

/// How an image placeholder is expanded into image-feature positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageTokenLayout {
    /// Placeholder emitted by the chat template.
    pub placeholder_id: i32,
    /// Id written at every image-feature position.
    pub image_token_id: i32,
    /// Image-feature positions per image.
    pub tokens_per_image: usize,
}

impl ImageTokenLayout {
    /// Explicit layout.
    pub fn new(placeholder_id: i32, image_token_id: i32, tokens_per_image: usize) -> Self {
        Self {
            placeholder_id,
            image_token_id,
            tokens_per_image: tokens_per_image.max(1),
        }
    }

    /// Layout for an architecture.
    ///
    /// The default architecture fills `tokens_per_image` positions with the patch token (or
    /// the placeholder itself when the vocabulary has none). LLaVA-family and Llama 3.2 Vision
    /// models expand image features internally and keep a single placeholder position.
    pub fn from_tokenizer(
        tokenizer: &Tokenizer,
        template: &ChatTemplate,
        arch: ModelArchitecture,
        tokens_per_image: usize,
    ) -> Result<Self> {
        let placeholder_id = tokenizer.require_token_id(template.image_token())? as i32;
        match arch {
            ModelArchitecture::Default => {
                let image_token_id = tokenizer
                    .token_to_id(IMAGE_PATCH_TOKEN)
                    .map(|id| id as i32)
                    .unwrap_or(placeholder_id);
                Ok(Self::new(placeholder_id, image_token_id, tokens_per_image))
            }
            _ => Ok(Self::new(placeholder_id, placeholder_id, 1)),
        }
    }

    /// Ids whose label must never be trained on.
    pub fn image_token_ids(&self) -> Vec<i32> {
        if self.placeholder_id == self.image_token_id {
            vec![self.placeholder_id]
        } else {
            vec![self.placeholder_id, self.image_token_id]
        }
    }
}

/// One tokenized annotation before image expansion.
#[derive(Debug, Clone)]
pub struct Segment {
    /// Tokens with at most one unexpanded placeholder.
    pub tokens: TokenizedText,
    /// Image backing the placeholder.
    pub image: Option<ProcessedImage>,
}

/// One fully tokenized realization of an annotation.
#[derive(Debug, Clone)]
pub struct Candidate {
    /// Token ids.
    pub input_ids: Vec<i32>,
    /// 1 for real tokens.
    pub attention_mask: Vec<i32>,
    /// Targets, [`PAD_LABEL`] where masked.
    pub labels: Vec<i64>,
    /// Images in placeholder order.
    pub images: Vec<ProcessedImage>,
    /// Number of expanded image placeholders.
    pub image_num: usize,
    valid: bool,
}

impl Candidate {
    /// Stand-in for a ranked slot that has no answer. Collates to a row of [`INVALID_TOKEN_ID`].
    pub fn missing() -> Self {
        Self {
            input_ids: Vec::new(),
            attention_mask: Vec::new(),
            labels: Vec::new(),
            images: Vec::new(),
            image_num: 0,
            valid: false,
        }
    }

    /// Whether this candidate holds real tokens.
    pub fn is_valid(&self) -> bool {
        self.valid && self.input_ids.first() != Some(&INVALID_TOKEN_ID)
    }

    /// Number of tokens.
    pub fn len(&self) -> usize {
        self.input_ids.len()
    }

    /// Whether there are no tokens.
    pub fn is_empty(&self) -> bool {
        self.input_ids.is_empty()
    }

    /// Check that ids, mask and labels line up and every trained label is attended.
    pub fn check_alignment(&self) -> Result<()> {
        let n = self.input_ids.len();
        if self.attention_mask.len() != n || self.labels.len() != n {
            return Err(VlpoError::shape(
                "candidate alignment",
                vec![n, n, n],
                vec![n, self.attention_mask.len(), self.labels.len()],
            ));
        }
        if let Some(pos) = self
            .labels
            .iter()
            .zip(&self.attention_mask)
            .position(|(&l, &m)| l != PAD_LABEL && m != 1)
        {
            return Err(VlpoError::Data(format!(
                "label at position {pos} is trained but not attended"
            )));
        }
        Ok(())
    }
}

/// Expand the placeholder of every segment and concatenate them into one candidate.
///
/// The first placeholder of each segment becomes the layout's block of image tokens with
/// attention 1 and labels [`PAD_LABEL`]; the segment's image is appended in the same order.
pub fn merge_all_images(
    segments: Vec<Segment>,
    layout: &ImageTokenLayout,
    max_images: usize,
) -> Result<Candidate> {
    let mut merged = Candidate {
        valid: true,
        ..Candidate::missing()
    };

    for segment in segments {
        let Segment { mut tokens, image } = segment;

        if let Some(pos) = tokens
            .input_ids
            .iter()
            .position(|&id| id == layout.placeholder_id)
        {
            let image = image.ok_or_else(|| {
                VlpoError::Data("image placeholder present but the annotation has no image".into())
            })?;
            merged.image_num += 1;
            if merged.image_num > max_images {
                return Err(VlpoError::Data(format!(
                    "sample has more than {max_images} images"
                )));
            }

            let k = layout.tokens_per_image;
            tokens
                .input_ids
                .splice(pos..=pos, std::iter::repeat(layout.image_token_id).take(k));
            tokens
                .attention_mask
                .splice(pos..=pos, std::iter::repeat(1).take(k));
            tokens
                .labels
                .splice(pos..=pos, std::iter::repeat(PAD_LABEL).take(k));
            merged.images.push(image);
        }

        merged.input_ids.extend(tokens.input_ids);
        merged.attention_mask.extend(tokens.attention_mask);
        merged.labels.extend(tokens.labels);
    }

    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_image() -> ProcessedImage {
        ProcessedImage {
            pixels: mlx_rs::Array::from_slice(&[0.0f32; 12], &[1, 3, 2, 2]),
            image_size: None,
            aspect_ratio_id: None,
            aspect_ratio_mask: None,
        }
    }

    fn segment(ids: &[i32], image: bool) -> Segment {
        let tokens = TokenizedText {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            labels: ids.iter().map(|&i| i as i64).collect(),
        };
        Segment {
            tokens,
            image: image.then(fixture_image),
        }
    }

    #[test]
    fn test_placeholder_expands_to_k_masked_positions() {
        let layout = ImageTokenLayout::new(4, 5, 3);
        let merged = merge_all_images(vec![segment(&[1, 4, 10, 11], true)], &layout, 8).unwrap();
        assert_eq!(merged.input_ids, vec![1, 5, 5, 5, 10, 11]);
        assert_eq!(merged.attention_mask, vec![1; 6]);
        assert_eq!(merged.labels[1..4], [PAD_LABEL; 3]);
        assert_eq!(merged.labels.iter().filter(|&&l| l == PAD_LABEL).count(), 3);
        assert_eq!(merged.image_num, 1);
        assert_eq!(merged.images.len(), 1);
        merged.check_alignment().unwrap();
    }

    #[test]
    fn test_only_first_placeholder_expands() {
        let layout = ImageTokenLayout::new(4, 5, 2);
        let merged = merge_all_images(vec![segment(&[4, 10, 4], true)], &layout, 8).unwrap();
        assert_eq!(merged.input_ids, vec![5, 5, 10, 4]);
    }

    #[test]
    fn test_multi_image_segments() {
        let layout = ImageTokenLayout::new(4, 4, 1);
        let merged = merge_all_images(
            vec![segment(&[4, 10], true), segment(&[11], false), segment(&[4, 12], true)],
            &layout,
            8,
        )
        .unwrap();
        assert_eq!(merged.image_num, 2);
        assert_eq!(merged.input_ids, vec![4, 10, 11, 4, 12]);
        assert_eq!(merged.labels, vec![PAD_LABEL, 10, 11, PAD_LABEL, 12]);
    }

    #[test]
    fn test_text_only_has_zero_images() {
        let layout = ImageTokenLayout::new(4, 4, 1);
        let merged = merge_all_images(vec![segment(&[10, 11], false)], &layout, 8).unwrap();
        assert_eq!(merged.image_num, 0);
        assert!(merged.is_valid());
    }

    #[test]
    fn test_too_many_images() {
        let layout = ImageTokenLayout::new(4, 4, 1);
        let segments = vec![segment(&[4], true), segment(&[4], true)];
        assert!(matches!(
            merge_all_images(segments, &layout, 1),
            Err(VlpoError::Data(_))
        ));
    }

    #[test]
    fn test_placeholder_without_image() {
        let layout = ImageTokenLayout::new(4, 4, 1);
        assert!(merge_all_images(vec![segment(&[4, 10], false)], &layout, 8).is_err());
    }

    #[test]
    fn test_missing_candidate_is_invalid() {
        assert!(!Candidate::missing().is_valid());
    }

    #[test]
    fn test_alignment_violation_detected() {
        let layout = ImageTokenLayout::new(4, 4, 1);
        let mut merged = merge_all_images(vec![segment(&[10, 11], false)], &layout, 8).unwrap();
        merged.attention_mask[1] = 0;
        assert!(merged.check_alignment().is_err());
        merged.labels.pop();
        assert!(matches!(merged.check_alignment(), Err(VlpoError::Shape { .. })));
    }
}
