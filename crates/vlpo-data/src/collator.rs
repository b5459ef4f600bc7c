//! Batch merging and padding for candidate groups.
//!
//! Candidates stay as plain vectors until the trainable rows are known, so filtering
//! happens before any tensor is stacked.

use std::collections::HashSet;
use std::sync::Arc;

use mlx_rs::Array;
use vlpo_core::{NumericWarning, Result, VlpoError, INVALID_TOKEN_ID, PAD_LABEL};

use crate::candidate::{Candidate, ImageTokenLayout};
use crate::image_processing::{ImageProcessor, ProcessedImage};
use crate::tokenizer::{PaddingSide, Tokenizer};

/// Pads candidate groups into one rectangular batch.
#[derive(Debug, Clone)]
pub struct PreferenceCollator {
    pad_token_id: i32,
    padding_side: PaddingSide,
    max_seq_len: usize,
    image_token_ids: HashSet<i64>,
    group_size: usize,
    processor: Arc<ImageProcessor>,
}

impl PreferenceCollator {
    /// Create a collator for groups of `group_size` candidates.
    pub fn new(
        tokenizer: &Tokenizer,
        layout: &ImageTokenLayout,
        processor: Arc<ImageProcessor>,
        max_seq_len: usize,
        group_size: usize,
    ) -> Result<Self> {
        let pad_token_id = tokenizer
            .pad_token_id()
            .ok_or_else(|| VlpoError::Tokenizer("tokenizer has no pad or EOS token".into()))?;
        Ok(Self {
            pad_token_id: pad_token_id as i32,
            padding_side: tokenizer.padding_side(),
            max_seq_len,
            image_token_ids: layout.image_token_ids().into_iter().map(i64::from).collect(),
            group_size: group_size.max(1),
            processor,
        })
    }

    /// Candidates per group.
    pub fn group_size(&self) -> usize {
        self.group_size
    }

    /// Merge items of candidate groups into a padded batch.
    ///
    /// Labels are padded with [`PAD_LABEL`] before ids and mask are padded with the pad token.
    /// Afterwards any label equal to the pad id or an image token, and every label at
    /// position 0, is reset to [`PAD_LABEL`]. Invalid candidates become rows of
    /// [`INVALID_TOKEN_ID`] with no attention.
    pub fn collate(&self, items: Vec<Vec<Candidate>>) -> Result<PreferenceBatch> {
        let mut candidates = Vec::with_capacity(items.len() * self.group_size);
        for item in items {
            if item.len() != self.group_size {
                return Err(VlpoError::shape(
                    "candidates per item",
                    vec![self.group_size],
                    vec![item.len()],
                ));
            }
            candidates.extend(item);
        }
        if candidates.is_empty() {
            return Err(VlpoError::shape("batch rows", vec![self.group_size], vec![0]));
        }

        for candidate in candidates.iter_mut().filter(|c| c.is_valid()) {
            candidate.input_ids.truncate(self.max_seq_len);
            candidate.attention_mask.truncate(self.max_seq_len);
            candidate.labels.truncate(self.max_seq_len);
            candidate.check_alignment()?;
        }

        let seq_len = candidates
            .iter()
            .filter(|c| c.is_valid())
            .map(Candidate::len)
            .max()
            .unwrap_or(1)
            .max(1);

        let rows = candidates.len();
        let mut batch = PreferenceBatch {
            input_ids: Vec::with_capacity(rows),
            attention_mask: Vec::with_capacity(rows),
            labels: Vec::with_capacity(rows),
            images: Vec::with_capacity(rows),
            image_num: Vec::with_capacity(rows),
            group_size: self.group_size,
            seq_len,
            warnings: Vec::new(),
        };

        for candidate in candidates {
            if !candidate.is_valid() {
                batch.input_ids.push(vec![INVALID_TOKEN_ID; seq_len]);
                batch.attention_mask.push(vec![0; seq_len]);
                batch.labels.push(vec![PAD_LABEL; seq_len]);
                batch.images.push(vec![self.processor.placeholder()?]);
                batch.image_num.push(0);
                continue;
            }

            let pad = seq_len - candidate.len();
            let mut labels = self.pad(candidate.labels, pad, PAD_LABEL);
            let input_ids = self.pad(candidate.input_ids, pad, self.pad_token_id);
            let attention_mask = self.pad(candidate.attention_mask, pad, 0);

            for label in labels.iter_mut() {
                if *label == i64::from(self.pad_token_id) || self.image_token_ids.contains(label) {
                    *label = PAD_LABEL;
                }
            }
            if let Some(first) = labels.first_mut() {
                *first = PAD_LABEL;
            }

            let images = if candidate.images.is_empty() {
                vec![self.processor.placeholder()?]
            } else {
                candidate.images
            };

            batch.input_ids.push(input_ids);
            batch.attention_mask.push(attention_mask);
            batch.labels.push(labels);
            batch.images.push(images);
            batch.image_num.push(candidate.image_num);
        }

        if batch.total_images() == 0 {
            let warning = NumericWarning::ZeroImageBatch { rows };
            warning.log();
            batch.warnings.push(warning);
        }
        Ok(batch)
    }

    fn pad<T: Copy>(&self, values: Vec<T>, pad: usize, fill: T) -> Vec<T> {
        if pad == 0 {
            return values;
        }
        let padding = std::iter::repeat(fill).take(pad);
        match self.padding_side {
            PaddingSide::Right => values.into_iter().chain(padding).collect(),
            PaddingSide::Left => padding.chain(values).collect(),
        }
    }
}

/// Rows kept for training after invalid candidates are removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrainableRows {
    /// Row indices in batch order.
    pub indices: Vec<usize>,
    /// Groups dropped for lack of a complete pair.
    pub warnings: Vec<NumericWarning>,
}

/// A padded batch of candidate rows, grouped `group_size` at a time in rank order.
#[derive(Debug, Clone)]
pub struct PreferenceBatch {
    /// Token ids `[rows][seq_len]`.
    pub input_ids: Vec<Vec<i32>>,
    /// Attention mask `[rows][seq_len]`.
    pub attention_mask: Vec<Vec<i32>>,
    /// Labels `[rows][seq_len]`.
    pub labels: Vec<Vec<i64>>,
    /// Images per row; text-only rows hold one zero image.
    pub images: Vec<Vec<ProcessedImage>>,
    /// Expanded image placeholders per row.
    pub image_num: Vec<usize>,
    /// Candidates per source item.
    pub group_size: usize,
    /// Padded length.
    pub seq_len: usize,
    /// Warnings raised while collating.
    pub warnings: Vec<NumericWarning>,
}

/// Batch tensors handed to a model adapter.
#[derive(Debug, Clone)]
pub struct BatchTensors {
    /// `[n, L]` int32.
    pub input_ids: Array,
    /// `[n, L]` int32.
    pub attention_mask: Array,
    /// `[n, L]` int64.
    pub labels: Array,
    /// Pixel views of all images concatenated along axis 0.
    pub pixel_values: Array,
    /// `[n]` int32 image count per row.
    pub image_num: Array,
    /// `[n, 2]` original `(height, width)` for any-resolution images.
    pub image_sizes: Option<Array>,
    /// `[n, 1]` tile grid ids.
    pub aspect_ratio_ids: Option<Array>,
    /// `[n, 1, max_tiles]` tile masks.
    pub aspect_ratio_mask: Option<Array>,
    /// Rows in the tensors.
    pub rows: usize,
}

impl PreferenceBatch {
    /// Number of rows.
    pub fn num_rows(&self) -> usize {
        self.input_ids.len()
    }

    /// Number of candidate groups.
    pub fn num_groups(&self) -> usize {
        self.num_rows() / self.group_size.max(1)
    }

    /// Images across all rows.
    pub fn total_images(&self) -> usize {
        self.image_num.iter().sum()
    }

    /// Rows usable for training.
    ///
    /// A row is usable only if its first token is not [`INVALID_TOKEN_ID`]. For pair groups
    /// (`group_size >= 2`) a group with fewer than two usable rows is dropped with a warning,
    /// and a group with an odd count loses its last usable row, so chosen/rejected parity is
    /// preserved across the kept rows.
    pub fn trainable_rows(&self) -> Result<TrainableRows> {
        let rows = self.num_rows();
        if self.group_size == 0 || rows % self.group_size != 0 {
            return Err(VlpoError::shape(
                "rows per candidate group",
                vec![self.group_size],
                vec![rows],
            ));
        }

        let mut out = TrainableRows::default();
        for (group, start) in (0..rows).step_by(self.group_size).enumerate() {
            let mut valid: Vec<usize> = (start..start + self.group_size)
                .filter(|&i| self.input_ids[i].first() != Some(&INVALID_TOKEN_ID))
                .collect();

            if self.group_size == 1 {
                out.indices.extend(valid);
                continue;
            }
            if valid.len() < 2 {
                out.warnings.push(NumericWarning::DegeneratePairGroup {
                    group,
                    valid: valid.len(),
                });
                continue;
            }
            if valid.len() % 2 == 1 {
                valid.pop();
            }
            out.indices.extend(valid);
        }
        Ok(out)
    }

    /// Stack the selected rows into tensors.
    pub fn to_tensors(&self, rows: &[usize]) -> Result<BatchTensors> {
        if rows.is_empty() {
            return Err(VlpoError::shape("trainable rows", vec![1], vec![0]));
        }
        if let Some(&bad) = rows.iter().find(|&&r| r >= self.num_rows()) {
            return Err(VlpoError::shape("row index", vec![self.num_rows()], vec![bad]));
        }

        let n = rows.len() as i32;
        let len = self.seq_len as i32;
        let ids: Vec<i32> = rows.iter().flat_map(|&r| self.input_ids[r].iter().copied()).collect();
        let mask: Vec<i32> = rows
            .iter()
            .flat_map(|&r| self.attention_mask[r].iter().copied())
            .collect();
        let labels: Vec<i64> = rows.iter().flat_map(|&r| self.labels[r].iter().copied()).collect();

        let pixel_refs: Vec<&Array> = rows
            .iter()
            .flat_map(|&r| self.images[r].iter().map(|img| &img.pixels))
            .collect();
        let pixel_values = mlx_rs::ops::concatenate_axis(&pixel_refs, 0)?;

        let image_num: Vec<i32> = rows.iter().map(|&r| self.image_num[r] as i32).collect();
        let firsts: Vec<Option<&ProcessedImage>> =
            rows.iter().map(|&r| self.images[r].first()).collect();

        let image_sizes = if firsts.iter().flatten().any(|img| img.image_size.is_some()) {
            let sizes: Vec<i32> = firsts
                .iter()
                .flat_map(|img| {
                    let (h, w) = img.and_then(|i| i.image_size).unwrap_or((0, 0));
                    [h as i32, w as i32]
                })
                .collect();
            Some(Array::from_slice(&sizes, &[n, 2]))
        } else {
            None
        };

        let (aspect_ratio_ids, aspect_ratio_mask) =
            if firsts.iter().flatten().any(|img| img.aspect_ratio_id.is_some()) {
                let max_tiles = firsts
                    .iter()
                    .flatten()
                    .filter_map(|img| img.aspect_ratio_mask.as_ref().map(Vec::len))
                    .max()
                    .unwrap_or(1);
                let ids: Vec<i32> = firsts
                    .iter()
                    .map(|img| img.and_then(|i| i.aspect_ratio_id).unwrap_or(1))
                    .collect();
                let masks: Vec<i32> = firsts
                    .iter()
                    .flat_map(|img| {
                        let mut m = img
                            .and_then(|i| i.aspect_ratio_mask.clone())
                            .unwrap_or_default();
                        m.resize(max_tiles, 0);
                        m
                    })
                    .collect();
                (
                    Some(Array::from_slice(&ids, &[n, 1])),
                    Some(Array::from_slice(&masks, &[n, 1, max_tiles as i32])),
                )
            } else {
                (None, None)
            };

        Ok(BatchTensors {
            input_ids: Array::from_slice(&ids, &[n, len]),
            attention_mask: Array::from_slice(&mask, &[n, len]),
            labels: Array::from_slice(&labels, &[n, len]),
            pixel_values,
            image_num: Array::from_slice(&image_num, &[n]),
            image_sizes,
            aspect_ratio_ids,
            aspect_ratio_mask,
            rows: rows.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::{merge_all_images, Segment};
    use crate::image_processing::{ImageLayoutMode, ImageProcessorConfig};
    use crate::record::TokenizedText;
    use crate::tokenizer::testing::word_level;

    const PLACEHOLDER: i32 = 4;

    fn processor() -> Arc<ImageProcessor> {
        Arc::new(ImageProcessor::new(ImageProcessorConfig {
            size: (4, 4),
            mode: ImageLayoutMode::Single,
            ..Default::default()
        }))
    }

    fn collator(side: PaddingSide, group_size: usize) -> PreferenceCollator {
        let tok = word_level(&["a", "b"]).with_padding_side(side);
        let layout = ImageTokenLayout::new(PLACEHOLDER, 5, 2);
        PreferenceCollator::new(&tok, &layout, processor(), 16, group_size).unwrap()
    }

    fn candidate(ids: &[i32], with_image: bool) -> Candidate {
        let tokens = TokenizedText {
            input_ids: ids.to_vec(),
            attention_mask: vec![1; ids.len()],
            labels: ids.iter().map(|&i| i as i64).collect(),
        };
        let image = if with_image {
            Some(processor().placeholder().unwrap())
        } else {
            None
        };
        let layout = ImageTokenLayout::new(PLACEHOLDER, 5, 2);
        merge_all_images(vec![Segment { tokens, image }], &layout, 8).unwrap()
    }

    #[test]
    fn test_right_padding_and_label_cleanup() {
        let c = collator(PaddingSide::Right, 2);
        let batch = c
            .collate(vec![vec![candidate(&[1, 4, 10, 11], true), candidate(&[1, 10], true)]])
            .unwrap();
        assert_eq!(batch.seq_len, 5);
        assert_eq!(batch.input_ids[1], vec![1, 10, 0, 0, 0]);
        assert_eq!(batch.attention_mask[1], vec![1, 1, 0, 0, 0]);
        assert_eq!(batch.labels[1], vec![PAD_LABEL, 10, PAD_LABEL, PAD_LABEL, PAD_LABEL]);
        // image block never trains
        assert_eq!(batch.labels[0], vec![PAD_LABEL, PAD_LABEL, PAD_LABEL, 10, 11]);
        assert_eq!(batch.image_num, vec![1, 0]);
        assert!(batch.warnings.is_empty());
        for (labels, mask) in batch.labels.iter().zip(&batch.attention_mask) {
            for (l, m) in labels.iter().zip(mask) {
                assert!(*l == PAD_LABEL || *m == 1);
            }
        }
    }

    #[test]
    fn test_left_padding() {
        let c = collator(PaddingSide::Left, 1);
        let batch = c
            .collate(vec![vec![candidate(&[1, 10, 11], false)], vec![candidate(&[1, 10], false)]])
            .unwrap();
        assert_eq!(batch.input_ids[1], vec![0, 1, 10]);
        assert_eq!(batch.attention_mask[1], vec![0, 1, 1]);
        assert_eq!(batch.labels[1], vec![PAD_LABEL, 1, 10]);
        assert_eq!(batch.labels[0], vec![PAD_LABEL, 10, 11]);
    }

    #[test]
    fn test_zero_image_batch_warns() {
        let c = collator(PaddingSide::Right, 2);
        let batch = c
            .collate(vec![vec![candidate(&[1, 10], false), candidate(&[1, 11], false)]])
            .unwrap();
        assert_eq!(batch.total_images(), 0);
        assert_eq!(batch.warnings, vec![NumericWarning::ZeroImageBatch { rows: 2 }]);
        let tensors = batch.to_tensors(&[0, 1]).unwrap();
        assert_eq!(tensors.pixel_values.shape(), &[2, 3, 4, 4]);
    }

    #[test]
    fn test_group_size_mismatch_is_shape_error() {
        let c = collator(PaddingSide::Right, 2);
        let err = c.collate(vec![vec![candidate(&[1, 10], false)]]).unwrap_err();
        assert!(matches!(err, VlpoError::Shape { .. }));
    }

    #[test]
    fn test_invalid_rows_are_filtered_per_group() {
        let c = collator(PaddingSide::Left, 2);
        let batch = c
            .collate(vec![
                vec![candidate(&[1, 10], true), Candidate::missing()],
                vec![candidate(&[1, 10], true), candidate(&[1, 11], true)],
            ])
            .unwrap();
        assert_eq!(batch.input_ids[1], vec![INVALID_TOKEN_ID; batch.seq_len]);

        let kept = batch.trainable_rows().unwrap();
        assert_eq!(kept.indices, vec![2, 3]);
        assert_eq!(
            kept.warnings,
            vec![NumericWarning::DegeneratePairGroup { group: 0, valid: 1 }]
        );

        let tensors = batch.to_tensors(&kept.indices).unwrap();
        assert_eq!(tensors.rows, 2);
        assert_eq!(tensors.input_ids.shape(), &[2, batch.seq_len as i32]);
    }

    #[test]
    fn test_odd_group_keeps_leading_pair() {
        let c = collator(PaddingSide::Right, 3);
        let batch = c
            .collate(vec![vec![
                candidate(&[1, 10], false),
                candidate(&[1, 11], false),
                candidate(&[1, 12], false),
            ]])
            .unwrap();
        assert_eq!(batch.trainable_rows().unwrap().indices, vec![0, 1]);
    }

    #[test]
    fn test_to_tensors_rejects_empty_selection() {
        let c = collator(PaddingSide::Right, 1);
        let batch = c.collate(vec![vec![candidate(&[1, 10], false)]]).unwrap();
        assert!(matches!(batch.to_tensors(&[]), Err(VlpoError::Shape { .. })));
    }
}
