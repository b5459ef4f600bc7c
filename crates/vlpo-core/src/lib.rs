//! Core types and configuration for vlpo multimodal preference training.
//!
//! This crate provides the pieces shared by every other vlpo crate:
//!
//! - Error and warning types
//! - Architecture, template and partition enums
//! - YAML-backed run configuration
//! - Learning rate schedulers

#![warn(missing_docs)]

mod config;
mod error;
pub mod scheduler;
mod types;

pub use config::*;
pub use error::*;
pub use scheduler::{LearningRateScheduler, SchedulerBuilder};
pub use types::*;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::config::*;
    pub use crate::error::{NumericWarning, Result, VlpoError};
    pub use crate::scheduler::{LearningRateScheduler, SchedulerBuilder};
    pub use crate::types::*;
}
