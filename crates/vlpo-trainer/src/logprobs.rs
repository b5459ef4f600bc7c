//! Sequence log-probabilities from model logits.

use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::{Array, Dtype};
use vlpo_core::{Result, VlpoError, PAD_LABEL};

/// Sum of next-token log-probabilities per sequence.
///
/// The distribution at position `t` scores the token at `t + 1`. A position contributes only
/// when the label at `t + 1` is not [`PAD_LABEL`].
///
/// # Arguments
/// * `logits` - `[B, L, V]`
/// * `input_ids` - `[B, L]` tokens the model consumed
/// * `labels` - `[B, L]`
///
/// # Returns
/// `[B]` float32.
pub fn gather_log_probs(logits: &Array, input_ids: &Array, labels: &Array) -> Result<Array> {
    let logits_shape = logits.shape();
    if logits_shape.len() != 3 {
        return Err(VlpoError::shape(
            "logits rank",
            vec![3],
            vec![logits_shape.len()],
        ));
    }
    let (batch, seq_len) = (logits_shape[0], logits_shape[1]);
    for (name, t) in [("input_ids", input_ids), ("labels", labels)] {
        if t.shape() != [batch, seq_len] {
            return Err(VlpoError::shape(
                format!("logits vs {name}"),
                vec![batch as usize, seq_len as usize],
                t.shape().iter().map(|&d| d as usize).collect(),
            ));
        }
    }
    if seq_len < 2 {
        return Ok(mlx_rs::ops::zeros::<f32>(&[batch])?);
    }

    let pred_logits = logits.index((.., ..seq_len - 1, ..));
    let log_probs = mlx_rs::nn::log_softmax(&pred_logits, -1)?;

    let targets = input_ids.index((.., 1..)).as_dtype(Dtype::Int32)?;
    let targets = mlx_rs::ops::maximum(&targets, &Array::from_int(0))?;
    let gathered = log_probs
        .take_along_axis(&targets.expand_dims(-1i32)?, -1)?
        .squeeze_axes(&[-1i32])?;

    let target_labels = labels.index((.., 1..));
    let ignore = Array::from_int(PAD_LABEL as i32).as_dtype(target_labels.dtype())?;
    let mask = target_labels.ne(&ignore)?.as_dtype(Dtype::Float32)?;

    Ok(gathered.multiply(&mask)?.sum_axes(&[1i32], false)?)
}
