//! Process rank awareness for data-parallel runs.
//!
//! Process-group bootstrap and gradient synchronisation happen outside this
//! crate. The engine only needs to know which process it is, so that a single
//! coordinator writes checkpoints and metrics.

use crate::error::{ForceFieldError, Result};

/// Rank and world size of the current process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessContext {
    /// Index of this process.
    pub rank: usize,
    /// Number of cooperating processes.
    pub world_size: usize,
}

impl Default for ProcessContext {
    fn default() -> Self {
        Self::single()
    }
}

impl ProcessContext {
    /// A lone process.
    pub fn single() -> Self {
        Self {
            rank: 0,
            world_size: 1,
        }
    }

    /// Explicit rank and world size.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] unless `rank < world_size`.
    pub fn new(rank: usize, world_size: usize) -> Result<Self> {
        if world_size == 0 || rank >= world_size {
            return Err(ForceFieldError::invalid_config(format!(
                "rank {rank} is outside a world of {world_size} processes"
            )));
        }
        Ok(Self { rank, world_size })
    }

    /// Read `RANK` and `WORLD_SIZE` as set by common launchers. Missing
    /// variables mean a single process.
    ///
    /// # Errors
    ///
    /// Returns [`ForceFieldError::InvalidConfig`] if a variable is not a
    /// number or the pair is inconsistent.
    pub fn from_env() -> Result<Self> {
        let read = |key: &str, default: usize| -> Result<usize> {
            match std::env::var(key) {
                Ok(value) => value.trim().parse().map_err(|_| {
                    ForceFieldError::invalid_config(format!("{key}=`{value}` is not a number"))
                }),
                Err(_) => Ok(default),
            }
        };
        Self::new(read("RANK", 0)?, read("WORLD_SIZE", 1)?)
    }

    /// Whether this process writes shared state.
    pub fn is_coordinator(&self) -> bool {
        self.rank == 0
    }

    /// Whether more than one process takes part.
    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }
}
