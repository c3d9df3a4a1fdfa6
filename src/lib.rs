/*!
 * dnsmem
 * Memory contexts and fixed-size pools for DNS infrastructure services
 *
 * A memory context is a named, reference-counted arena over a pluggable
 * backend: it enforces a byte quota, optionally records every live
 * allocation for leak and double-free detection, scribbles and guards
 * blocks to catch stray writes, and notifies registered tasks when it is
 * finally torn down. Memory pools layer a fixed-element-size freelist on a
 * context for hot equal-size objects.
 */

pub mod backend;
pub mod config;
pub mod context;
pub mod event;
pub mod pool;
pub mod types;

pub use backend::{Backend, SystemBackend, BLOCK_ALIGN};
pub use config::{debugging, set_debugging, DEBUG_RECORD, DEBUG_TRACE};
pub use context::{
    Allocation, MemoryContext, OnDestroyRejected, FILL_ALLOC, FILL_FREE, GUARD_BYTE, GUARD_SIZE,
    NAME_MAX,
};
pub use event::{Event, Task, EVENT_MCTX_DESTROYED};
pub use pool::{MemoryPool, PoolLock};
pub use types::{MemError, MemResult, MemStats, PoolStats, Size};
