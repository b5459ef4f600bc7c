//! Per-architecture input preparation and logit extraction.

use mlx_rs::Array;
use vlpo_core::{ModelArchitecture, Result, VlpoError};
use vlpo_data::BatchTensors;

use crate::model::{ModelInputs, ModelOutput};

/// Maps collated tensors to model inputs and model outputs back to token logits.
pub trait ModelAdapter: Send + Sync {
    /// Architecture served.
    fn architecture(&self) -> ModelArchitecture;

    /// Keyword inputs for the forward pass.
    fn prepare_inputs(&self, batch: &BatchTensors) -> Result<ModelInputs>;

    /// `[B, L, V]` logits aligned with the batch's `input_ids`.
    fn extract_logits(&self, output: &ModelOutput) -> Result<Array>;
}

/// Select the adapter for `arch`.
pub fn adapter_for(arch: ModelArchitecture) -> Box<dyn ModelAdapter> {
    match arch {
        ModelArchitecture::Default => Box::new(DefaultAdapter),
        ModelArchitecture::Llava => Box::new(LlavaAdapter),
        ModelArchitecture::LlavaNext => Box::new(LlavaNextAdapter),
        ModelArchitecture::Llama32Vision => Box::new(Llama32VisionAdapter),
    }
}

/// Built-in architecture: image features are merged in place of the placeholder block, so
/// logits already align with `input_ids`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultAdapter;

impl ModelAdapter for DefaultAdapter {
    fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::Default
    }

    fn prepare_inputs(&self, batch: &BatchTensors) -> Result<ModelInputs> {
        Ok(ModelInputs {
            labels: Some(batch.labels.clone()),
            pixel_values: Some(batch.pixel_values.clone()),
            image_num: Some(batch.image_num.clone()),
            ..ModelInputs::text(batch.input_ids.clone(), batch.attention_mask.clone())
        })
    }

    fn extract_logits(&self, output: &ModelOutput) -> Result<Array> {
        Ok(output.logits.clone())
    }
}

/// LLaVA: one image per row, full attention, logits with image positions dropped.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlavaAdapter;

impl ModelAdapter for LlavaAdapter {
    fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::Llava
    }

    fn prepare_inputs(&self, batch: &BatchTensors) -> Result<ModelInputs> {
        llava_inputs(batch, batch.pixel_values.clone())
    }

    fn extract_logits(&self, output: &ModelOutput) -> Result<Array> {
        drop_image_logits(output)
    }
}

/// LLaVA-NeXT: any-resolution views `[B, 5, C, H, W]` plus original sizes.
#[derive(Debug, Clone, Copy, Default)]
pub struct LlavaNextAdapter;

impl ModelAdapter for LlavaNextAdapter {
    fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::LlavaNext
    }

    fn prepare_inputs(&self, batch: &BatchTensors) -> Result<ModelInputs> {
        let pixels = batch_views(&batch.pixel_values, &[5], "llava_next pixel_values")?;
        let sizes = batch
            .image_sizes
            .as_ref()
            .ok_or_else(|| VlpoError::Training("llava_next batch has no image_sizes".into()))?
            .reshape(&[-1, 2])?;
        let mut inputs = llava_inputs(batch, pixels)?;
        inputs.image_sizes = Some(sizes);
        Ok(inputs)
    }

    fn extract_logits(&self, output: &ModelOutput) -> Result<Array> {
        drop_image_logits(output)
    }
}

/// Llama 3.2 Vision: tiles `[B, 1, T, C, H, W]` with aspect-ratio ids and masks.
#[derive(Debug, Clone, Copy, Default)]
pub struct Llama32VisionAdapter;

impl ModelAdapter for Llama32VisionAdapter {
    fn architecture(&self) -> ModelArchitecture {
        ModelArchitecture::Llama32Vision
    }

    fn prepare_inputs(&self, batch: &BatchTensors) -> Result<ModelInputs> {
        let (ids, mask) = match (&batch.aspect_ratio_ids, &batch.aspect_ratio_mask) {
            (Some(ids), Some(mask)) => (ids.clone(), mask.clone()),
            _ => {
                return Err(VlpoError::Training(
                    "llama-3.2-vision batch has no aspect ratio tensors".into(),
                ))
            }
        };
        let tiles = mask.shape().last().copied().unwrap_or(1);
        let pixels = batch_views(&batch.pixel_values, &[1, tiles], "mllama pixel_values")?;
        Ok(ModelInputs {
            labels: Some(batch.labels.clone()),
            pixel_values: Some(pixels),
            aspect_ratio_ids: Some(ids),
            aspect_ratio_mask: Some(mask),
            ..ModelInputs::text(batch.input_ids.clone(), batch.attention_mask.clone())
        })
    }

    fn extract_logits(&self, output: &ModelOutput) -> Result<Array> {
        Ok(output.logits.clone())
    }
}

fn llava_inputs(batch: &BatchTensors, pixel_values: Array) -> Result<ModelInputs> {
    let attention_mask = mlx_rs::ops::ones::<i32>(batch.input_ids.shape())?;
    Ok(ModelInputs {
        labels: Some(batch.input_ids.clone()),
        pixel_values: Some(pixel_values),
        ..ModelInputs::text(batch.input_ids.clone(), attention_mask)
    })
}

fn drop_image_logits(output: &ModelOutput) -> Result<Array> {
    output
        .logits_drop_image
        .clone()
        .ok_or_else(|| VlpoError::Training("model output has no logits_drop_image".into()))
}

/// Regroup `[N, C, H, W]` views as `[B, lead.., C, H, W]`.
fn batch_views(pixels: &Array, lead: &[i32], context: &str) -> Result<Array> {
    let shape = pixels.shape();
    if shape.len() != 4 {
        return Err(VlpoError::shape(
            context,
            vec![4],
            vec![shape.len()],
        ));
    }
    let per_image: i32 = lead.iter().product();
    if shape[0] % per_image != 0 {
        return Err(VlpoError::shape(
            context,
            vec![per_image as usize],
            vec![shape[0] as usize],
        ));
    }
    let mut target = vec![shape[0] / per_image];
    target.extend_from_slice(lead);
    target.extend_from_slice(&shape[1..]);
    Ok(pixels.reshape(&target)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensors(views: i32, rows: i32) -> BatchTensors {
        let n = (views * rows) as usize;
        BatchTensors {
            input_ids: Array::from_slice(&vec![1i32; (rows * 4) as usize], &[rows, 4]),
            attention_mask: Array::from_slice(&vec![0i32; (rows * 4) as usize], &[rows, 4]),
            labels: Array::from_slice(&vec![-100i64; (rows * 4) as usize], &[rows, 4]),
            pixel_values: Array::from_slice(&vec![0.0f32; n * 3 * 2 * 2], &[views * rows, 3, 2, 2]),
            image_num: Array::from_slice(&vec![1i32; rows as usize], &[rows]),
            image_sizes: Some(Array::from_slice(&vec![8i32; (rows * 2) as usize], &[rows, 2])),
            aspect_ratio_ids: Some(Array::from_slice(&vec![1i32; rows as usize], &[rows, 1])),
            aspect_ratio_mask: Some(Array::from_slice(
                &vec![1i32; (rows * views) as usize],
                &[rows, 1, views],
            )),
            rows: rows as usize,
        }
    }

    #[test]
    fn test_adapter_selection() {
        for arch in [
            ModelArchitecture::Default,
            ModelArchitecture::Llava,
            ModelArchitecture::LlavaNext,
            ModelArchitecture::Llama32Vision,
        ] {
            assert_eq!(adapter_for(arch).architecture(), arch);
        }
    }

    #[test]
    fn test_llava_uses_full_attention_and_ids_as_labels() {
        let inputs = LlavaAdapter.prepare_inputs(&tensors(1, 2)).unwrap();
        inputs.attention_mask.eval().unwrap();
        assert!(inputs.attention_mask.as_slice::<i32>().iter().all(|&m| m == 1));
        let labels = inputs.labels.unwrap();
        labels.eval().unwrap();
        assert!(labels.as_slice::<i32>().iter().all(|&l| l == 1));
    }

    #[test]
    fn test_llava_next_regroups_views() {
        let inputs = LlavaNextAdapter.prepare_inputs(&tensors(5, 2)).unwrap();
        assert_eq!(inputs.pixel_values.unwrap().shape(), &[2, 5, 3, 2, 2]);
        assert_eq!(inputs.image_sizes.unwrap().shape(), &[2, 2]);
    }

    #[test]
    fn test_mllama_regroups_tiles() {
        let inputs = Llama32VisionAdapter.prepare_inputs(&tensors(4, 2)).unwrap();
        assert_eq!(inputs.pixel_values.unwrap().shape(), &[2, 1, 4, 3, 2, 2]);
        assert!(inputs.aspect_ratio_ids.is_some());
    }

    #[test]
    fn test_logit_extraction() {
        let logits = Array::from_slice(&[0.0f32; 8], &[1, 2, 4]);
        let output = ModelOutput::from_logits(logits);
        assert_eq!(DefaultAdapter.extract_logits(&output).unwrap().shape(), &[1, 2, 4]);
        assert!(LlavaAdapter.extract_logits(&output).is_err());
    }
}
