//! Direct Preference Optimization loss over ranked candidate pairs.
//!
//! Rows arrive interleaved: row `2i` is the chosen candidate of pair `i` and row `2i + 1`
//! the rejected one. With
//!
//! ```text
//! Δ = (log π(y_w|x) - log π_ref(y_w|x)) - (log π(y_l|x) - log π_ref(y_l|x))
//! ```
//!
//! the per-pair loss with label smoothing `ε` is
//!
//! ```text
//! L = -log σ(βΔ)·(1 - ε) - log σ(-βΔ)·ε
//! ```
//!
//! computed through `softplus` so large margins never underflow, and averaged over pairs.

use mlx_rs::ops::indexing::IndexOp;
use mlx_rs::Array;
use serde::{Deserialize, Serialize};
use vlpo_core::{DpoSettings, Result, VlpoError};

/// DPO configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DpoConfig {
    /// Temperature on the log-ratio margin.
    pub beta: f64,
    /// Probability mass assigned to a flipped preference, in `[0, 1)`.
    pub label_smoothing: f64,
}

impl Default for DpoConfig {
    fn default() -> Self {
        Self {
            beta: 0.1,
            label_smoothing: 0.0,
        }
    }
}

impl From<&DpoSettings> for DpoConfig {
    fn from(settings: &DpoSettings) -> Self {
        Self {
            beta: settings.beta,
            label_smoothing: settings.label_smoothing,
        }
    }
}

impl DpoConfig {
    /// Create a config with the given beta.
    pub fn new(beta: f64) -> Self {
        Self {
            beta,
            ..Default::default()
        }
    }

    /// Set label smoothing.
    pub fn with_label_smoothing(mut self, smoothing: f64) -> Self {
        self.label_smoothing = smoothing;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.beta <= 0.0 {
            return Err(VlpoError::Config("DPO beta must be positive".into()));
        }
        if !(0.0..1.0).contains(&self.label_smoothing) {
            return Err(VlpoError::Config(format!(
                "label_smoothing must be in [0, 1), got {}",
                self.label_smoothing
            )));
        }
        Ok(())
    }
}

/// Loss and implicit rewards for one batch.
#[derive(Debug, Clone)]
pub struct DpoLossOutput {
    /// Scalar mean loss.
    pub loss: Array,
    /// `β·(log π - log π_ref)` on chosen rows, `[P]`.
    pub chosen_rewards: Array,
    /// `β·(log π - log π_ref)` on rejected rows, `[P]`.
    pub rejected_rewards: Array,
}

/// DPO loss.
#[derive(Debug, Clone)]
pub struct DpoLoss {
    config: DpoConfig,
}

impl DpoLoss {
    /// Create the loss after validating `config`.
    pub fn new(config: DpoConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration in use.
    pub fn config(&self) -> &DpoConfig {
        &self.config
    }

    /// Loss over interleaved `[2P]` policy and reference log-probabilities.
    pub fn compute(&self, policy_logps: &Array, reference_logps: &Array) -> Result<DpoLossOutput> {
        if policy_logps.shape() != reference_logps.shape() {
            return Err(VlpoError::shape(
                "policy vs reference log-probs",
                dims(policy_logps),
                dims(reference_logps),
            ));
        }
        let (policy_chosen, policy_rejected) = split_pairs(policy_logps)?;
        let (ref_chosen, ref_rejected) = split_pairs(reference_logps)?;
        self.compute_pairs(&policy_chosen, &policy_rejected, &ref_chosen, &ref_rejected)
    }

    /// Loss over explicit chosen/rejected `[P]` vectors.
    pub fn compute_pairs(
        &self,
        policy_chosen_logps: &Array,
        policy_rejected_logps: &Array,
        ref_chosen_logps: &Array,
        ref_rejected_logps: &Array,
    ) -> Result<DpoLossOutput> {
        let chosen_ratio = policy_chosen_logps.subtract(ref_chosen_logps)?;
        let rejected_ratio = policy_rejected_logps.subtract(ref_rejected_logps)?;

        let beta = Array::from_f32(self.config.beta as f32);
        let logits = chosen_ratio.subtract(&rejected_ratio)?.multiply(&beta)?;
        let loss = self.sigmoid_loss(&logits)?.mean(None)?;

        Ok(DpoLossOutput {
            loss,
            chosen_rewards: chosen_ratio.multiply(&beta)?,
            rejected_rewards: rejected_ratio.multiply(&beta)?,
        })
    }

    fn sigmoid_loss(&self, logits: &Array) -> Result<Array> {
        // -log σ(x) = softplus(-x)
        let pos_loss = mlx_rs::nn::softplus(&logits.negative()?)?;
        if self.config.label_smoothing == 0.0 {
            return Ok(pos_loss);
        }
        let neg_loss = mlx_rs::nn::softplus(logits)?;
        let eps = Array::from_f32(self.config.label_smoothing as f32);
        let keep = Array::from_f32((1.0 - self.config.label_smoothing) as f32);
        Ok(pos_loss.multiply(&keep)?.add(&neg_loss.multiply(&eps)?)?)
    }
}

/// Split interleaved `[2P]` values into even (chosen) and odd (rejected) rows.
pub fn split_pairs(values: &Array) -> Result<(Array, Array)> {
    let shape = values.shape();
    if shape.len() != 1 || shape[0] % 2 != 0 || shape[0] == 0 {
        return Err(VlpoError::shape(
            "interleaved chosen/rejected rows",
            vec![2],
            dims(values),
        ));
    }
    let pairs = values.reshape(&[shape[0] / 2, 2])?;
    Ok((pairs.index((.., 0)), pairs.index((.., 1))))
}

fn dims(a: &Array) -> Vec<usize> {
    a.shape().iter().map(|&d| d as usize).collect()
}

/// Scalar metrics for logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DpoMetrics {
    /// Mean loss.
    pub loss: f32,
    /// Mean chosen reward.
    pub chosen_reward: f32,
    /// Mean rejected reward.
    pub rejected_reward: f32,
    /// Fraction of pairs whose chosen reward beats the rejected one.
    pub reward_accuracy: f32,
}

impl DpoMetrics {
    /// Evaluate metrics from a loss output.
    pub fn from_output(output: &DpoLossOutput) -> Result<Self> {
        let margin = output.chosen_rewards.subtract(&output.rejected_rewards)?;
        let wins = margin
            .gt(&Array::from_f32(0.0))?
            .as_dtype(mlx_rs::Dtype::Float32)?
            .mean(None)?;
        let chosen = output.chosen_rewards.mean(None)?;
        let rejected = output.rejected_rewards.mean(None)?;
        for a in [&output.loss, &chosen, &rejected, &wins] {
            a.eval()?;
        }
        Ok(Self {
            loss: output.loss.item::<f32>(),
            chosen_reward: chosen.item::<f32>(),
            rejected_reward: rejected.item::<f32>(),
            reward_accuracy: wins.item::<f32>(),
        })
    }

    /// Reward margin.
    pub fn margin(&self) -> f32 {
        self.chosen_reward - self.rejected_reward
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scalar(a: &Array) -> f32 {
        a.eval().unwrap();
        a.item::<f32>()
    }

    #[test]
    fn test_config_validation() {
        assert!(DpoConfig::new(0.0).validate().is_err());
        assert!(DpoConfig::new(0.1).with_label_smoothing(1.0).validate().is_err());
        assert!(DpoConfig::new(0.1).with_label_smoothing(0.2).validate().is_ok());
    }

    #[test]
    fn test_reference_scenario() {
        // Δ = 0.5 - (-1.0) = 1.5, βΔ = 0.15, loss = softplus(-0.15)
        let loss = DpoLoss::new(DpoConfig::new(0.1)).unwrap();
        let policy = Array::from_slice(&[-2.0f32, -4.0], &[2]);
        let reference = Array::from_slice(&[-2.5f32, -3.0], &[2]);
        let out = loss.compute(&policy, &reference).unwrap();
        let expected = (1.0f32 + (-0.15f32).exp()).ln();
        assert!((scalar(&out.loss) - expected).abs() < 1e-5);
        assert!((scalar(&out.loss) - 0.6209).abs() < 1e-3);
        assert!((scalar(&out.chosen_rewards) - 0.05).abs() < 1e-6);
        assert!((scalar(&out.rejected_rewards) + 0.1).abs() < 1e-6);
    }

    #[test]
    fn test_label_smoothing_blends_both_directions() {
        let loss = DpoLoss::new(DpoConfig::new(1.0).with_label_smoothing(0.25)).unwrap();
        let policy = Array::from_slice(&[0.0f32, -1.0], &[2]);
        let reference = Array::from_slice(&[0.0f32, 0.0], &[2]);
        let out = loss.compute(&policy, &reference).unwrap();
        let sp = |x: f32| (1.0 + x.exp()).ln();
        let expected = 0.75 * sp(-1.0) + 0.25 * sp(1.0);
        assert!((scalar(&out.loss) - expected).abs() < 1e-5);
    }

    #[test]
    fn test_large_margin_is_finite() {
        let loss = DpoLoss::new(DpoConfig::new(1.0)).unwrap();
        let policy = Array::from_slice(&[-1000.0f32, 1000.0], &[2]);
        let reference = Array::from_slice(&[0.0f32, 0.0], &[2]);
        let value = scalar(&loss.compute(&policy, &reference).unwrap().loss);
        assert!(value.is_finite());
        assert!((value - 2000.0).abs() < 1e-2);
    }

    #[test]
    fn test_pairs_are_averaged() {
        let loss = DpoLoss::new(DpoConfig::new(1.0)).unwrap();
        let policy = Array::from_slice(&[1.0f32, 0.0, 0.0, 1.0], &[4]);
        let reference = Array::from_slice(&[0.0f32; 4], &[4]);
        let out = loss.compute(&policy, &reference).unwrap();
        let sp = |x: f32| (1.0 + x.exp()).ln();
        assert!((scalar(&out.loss) - (sp(-1.0) + sp(1.0)) / 2.0).abs() < 1e-5);

        let metrics = DpoMetrics::from_output(&out).unwrap();
        assert!((metrics.reward_accuracy - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_odd_rows_rejected() {
        let loss = DpoLoss::new(DpoConfig::default()).unwrap();
        let odd = Array::from_slice(&[0.0f32; 3], &[3]);
        assert!(matches!(
            loss.compute(&odd, &odd),
            Err(VlpoError::Shape { .. })
        ));
    }
}
