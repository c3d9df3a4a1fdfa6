/*!
 * Memory Types
 * Common types for the memory context and pool layer
 */

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Size type for allocation accounting
pub type Size = usize;

/// Memory operation result
pub type MemResult<T> = Result<T, MemError>;

/// Errors surfaced to callers.
///
/// Corruption and precondition violations (double free, wrong-size put,
/// destroying a pool with outstanding allocations) are never returned; they
/// are logged through the diagnostic channel and panic.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemError {
    #[error("out of memory: backend refused {requested} bytes")]
    OutOfMemory { requested: Size },

    #[error("quota exceeded: {used} of {limit} in use, {requested} more requested")]
    QuotaExceeded {
        requested: Size,
        used: Size,
        limit: Size,
    },

    #[error("memory context is shutting down")]
    ShuttingDown,
}

/// Point-in-time statistics for a memory context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemStats {
    pub name: Option<String>,
    pub in_use: Size,
    pub max_in_use: Size,
    pub quota: Size,
    pub hi_water: Size,
    pub lo_water: Size,
    pub live_allocations: usize,
    pub live_records: usize,
    pub pools: Vec<PoolStats>,
}

/// Per-pool statistics reported through the owning context
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStats {
    pub name: Option<String>,
    pub element_size: Size,
    pub allocated: usize,
    pub free_count: usize,
}
