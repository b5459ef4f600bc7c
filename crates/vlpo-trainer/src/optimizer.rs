//! AdamW with the four parameter groups of [`crate::param_groups`].
//!
//! Each group owns an AdamW instance; parameters are routed by name. The scheduler sets the
//! base learning rate and every group follows proportionally.
//!
//! ```ignore
//! let mut optimizer = GroupedAdamW::new(&ParameterGroupConfig::from_training(&training))?;
//! optimizer.update(&mut model, &grads)?;
//! optimizer.set_learning_rate(scheduler.current_lr() as f32);
//! ```

use std::collections::HashMap;
use std::rc::Rc;

use mlx_rs::{
    array,
    builder::Builder,
    error::{Exception, Result},
    module::{FlattenedModuleParam, ModuleParameters},
    optimizers::{AdamW, AdamWBuilder, Optimizer},
    Array,
};

use crate::param_groups::{ParameterGroupConfig, ParameterGroupKind};

/// AdamW betas used for every trained role.
pub const ADAMW_BETAS: (f32, f32) = (0.9, 0.95);

/// AdamW routing parameters to four groups.
#[derive(Debug)]
pub struct GroupedAdamW {
    optimizers: Vec<AdamW>,
    initial_lrs: Vec<f32>,
    base_lr: f32,
    config: ParameterGroupConfig,
    param_cache: HashMap<Rc<str>, ParameterGroupKind>,
}

impl GroupedAdamW {
    /// Create the optimizer.
    pub fn new(config: &ParameterGroupConfig) -> Result<Self> {
        let mut optimizers = Vec::with_capacity(4);
        let mut initial_lrs = Vec::with_capacity(4);
        for kind in ParameterGroupKind::ALL {
            let lr = config.learning_rate(kind) as f32;
            let optimizer = AdamWBuilder::new(lr)
                .betas(ADAMW_BETAS)
                .eps(1e-8)
                .weight_decay(config.weight_decay(kind) as f32)
                .build()
                .map_err(|_| Exception::custom("Failed to build AdamW group"))?;
            optimizers.push(optimizer);
            initial_lrs.push(lr);
        }

        Ok(Self {
            optimizers,
            initial_lrs,
            base_lr: config.base_lr as f32,
            config: config.clone(),
            param_cache: HashMap::new(),
        })
    }

    /// Group of a parameter, cached per key.
    pub fn group_of(&mut self, name: &Rc<str>) -> ParameterGroupKind {
        if let Some(&kind) = self.param_cache.get(name) {
            return kind;
        }
        let kind = self.config.classify(name);
        self.param_cache.insert(name.clone(), kind);
        kind
    }

    /// Current learning rate of each group, in group order.
    pub fn learning_rates(&self) -> Vec<f32> {
        self.optimizers.iter().map(|o| o.lr.item::<f32>()).collect()
    }

    /// Current base learning rate.
    pub fn learning_rate(&self) -> f32 {
        self.optimizers[ParameterGroupKind::Decay.index()].lr.item::<f32>()
    }

    /// Set the base learning rate; every group keeps its ratio to the base.
    pub fn set_learning_rate(&mut self, lr: f32) {
        for (optimizer, &initial) in self.optimizers.iter_mut().zip(&self.initial_lrs) {
            let scaled = if self.base_lr > 1e-12 {
                initial * lr / self.base_lr
            } else {
                lr
            };
            optimizer.lr = array!(scaled);
        }
    }

    /// Update one parameter.
    pub fn update_single(
        &mut self,
        key: &Rc<str>,
        gradient: &Array,
        parameter: &mut Array,
    ) -> Result<()> {
        let kind = self.group_of(key);
        self.optimizers[kind.index()].update_single(key, gradient, parameter)
    }

    /// Apply `gradients` to the matching parameters of `model`.
    pub fn update<M: ModuleParameters>(
        &mut self,
        model: &mut M,
        gradients: &FlattenedModuleParam,
    ) -> Result<()> {
        let mut params = model.parameters_mut().flatten();
        for (key, grad) in gradients {
            if let Some(param) = params.get_mut(key) {
                self.update_single(key, grad, param)?;
            }
        }
        Ok(())
    }

    /// Parameters with optimizer state in each group.
    pub fn state_counts(&self) -> Vec<usize> {
        self.optimizers.iter().map(|o| o.state.len()).collect()
    }

    /// Get summary of parameter grouping.
    pub fn summary(&self) -> String {
        let lrs = self.learning_rates();
        let counts = self.state_counts();
        let parts: Vec<String> = ParameterGroupKind::ALL
            .iter()
            .map(|k| format!("{:?}: {} params (lr={:.2e})", k, counts[k.index()], lrs[k.index()]))
            .collect();
        format!("GroupedAdamW: {}", parts.join(", "))
    }
}

/// Scale gradients so their global L2 norm is at most `max_norm`; returns the pre-clip norm.
pub fn clip_grad_norm(grads: &mut FlattenedModuleParam, max_norm: f32) -> Result<f32> {
    let mut norm_sq_sum = Array::from_f32(0.0);
    for grad in grads.values() {
        let norm_sq = grad.multiply(grad)?.sum(None)?;
        norm_sq_sum = norm_sq_sum.add(&norm_sq)?;
    }
    let norm = norm_sq_sum.sqrt()?;
    norm.eval()?;
    let value = norm.item::<f32>();

    if max_norm > 0.0 && value > max_norm {
        let scale = Array::from_f32(max_norm / (value + 1e-6));
        for grad in grads.values_mut() {
            *grad = grad.multiply(&scale)?;
        }
    }
    Ok(value)
}
