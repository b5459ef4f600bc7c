//! Per-worker mutable state threaded through data loading.

use std::path::PathBuf;

use serde::Serialize;
use vlpo_core::{NumericWarning, Result};

/// Samples written by a debug dump before it goes quiet.
pub const DEBUG_DUMP_LIMIT: usize = 10;

/// Writes the first processed samples of a worker to disk as JSON text.
#[derive(Debug, Clone)]
pub struct DebugDump {
    dir: PathBuf,
    limit: usize,
    counter: usize,
}

impl DebugDump {
    /// Dump into `dir`, keeping at most [`DEBUG_DUMP_LIMIT`] samples.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            limit: DEBUG_DUMP_LIMIT,
            counter: 0,
        }
    }

    /// Samples processed so far, dumped or not.
    pub fn counter(&self) -> usize {
        self.counter
    }

    fn write<T: Serialize>(&mut self, rank: usize, value: &T) -> Result<()> {
        let counter = self.counter;
        self.counter += 1;
        if counter >= self.limit {
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("gpu_rank{rank}_debug{counter}.json"));
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| vlpo_core::VlpoError::Serialization(e.to_string()))?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// State owned by one data-parallel worker.
#[derive(Debug, Clone, Default)]
pub struct WorkerContext {
    /// Rank of this worker.
    pub rank: usize,
    /// Number of workers.
    pub world_size: usize,
    debug: Option<DebugDump>,
    warnings: Vec<NumericWarning>,
}

impl WorkerContext {
    /// Context for `rank` out of `world_size` workers.
    pub fn new(rank: usize, world_size: usize) -> Self {
        Self {
            rank,
            world_size: world_size.max(1),
            debug: None,
            warnings: Vec::new(),
        }
    }

    /// Enable the debug dump.
    pub fn with_debug_dump(mut self, dir: impl Into<PathBuf>) -> Self {
        self.debug = Some(DebugDump::new(dir));
        self
    }

    /// Debug dump state, if enabled.
    pub fn debug_dump(&self) -> Option<&DebugDump> {
        self.debug.as_ref()
    }

    /// Record one processed sample in the debug dump.
    pub fn dump_sample<T: Serialize>(&mut self, value: &T) -> Result<()> {
        let rank = self.rank;
        match self.debug.as_mut() {
            Some(dump) => dump.write(rank, value),
            None => Ok(()),
        }
    }

    /// Log a warning and keep it for inspection.
    pub fn record_warning(&mut self, warning: NumericWarning) {
        warning.log();
        self.warnings.push(warning);
    }

    /// Warnings recorded so far.
    pub fn warnings(&self) -> &[NumericWarning] {
        &self.warnings
    }

    /// Drain recorded warnings.
    pub fn take_warnings(&mut self) -> Vec<NumericWarning> {
        std::mem::take(&mut self.warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_dump_stops_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = WorkerContext::new(1, 2).with_debug_dump(dir.path());
        for i in 0..(DEBUG_DUMP_LIMIT + 3) {
            ctx.dump_sample(&serde_json::json!({ "i": i })).unwrap();
        }
        assert_eq!(ctx.debug_dump().unwrap().counter(), DEBUG_DUMP_LIMIT + 3);
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, DEBUG_DUMP_LIMIT);
        assert!(dir.path().join("gpu_rank1_debug0.json").exists());
    }

    #[test]
    fn test_warnings_are_recorded() {
        let mut ctx = WorkerContext::new(0, 1);
        ctx.record_warning(NumericWarning::ZeroImageSample { index: 3 });
        assert_eq!(ctx.warnings().len(), 1);
        assert_eq!(ctx.take_warnings().len(), 1);
        assert!(ctx.warnings().is_empty());
    }
}
