/*!
 * Debugging Configuration
 * Process-wide defaults consulted when contexts are created
 */

use std::sync::atomic::{AtomicU32, Ordering};

/// Log a record on every allocation and free.
pub const DEBUG_TRACE: u32 = 0x0001;

/// Remember every live allocation and match it up on free.
/// Enables the leak dump at context teardown.
pub const DEBUG_RECORD: u32 = 0x0002;

static MEM_DEBUGGING: AtomicU32 = AtomicU32::new(0);

/// Set the process-wide debugging flags.
///
/// Contexts created afterwards seed their own flags from this value;
/// existing contexts are unaffected. Individual contexts may override with
/// [`MemoryContext::set_debugging`](crate::MemoryContext::set_debugging).
pub fn set_debugging(flags: u32) {
    MEM_DEBUGGING.store(flags, Ordering::Relaxed);
}

/// Current process-wide debugging flags.
pub fn debugging() -> u32 {
    MEM_DEBUGGING.load(Ordering::Relaxed)
}
