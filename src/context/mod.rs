/*!
 * Memory Context
 * Named, reference-counted, quota-enforced allocation arena
 */

mod alloc;
mod record;

pub use alloc::{Allocation, FILL_ALLOC, FILL_FREE, GUARD_BYTE, GUARD_SIZE};

use crate::backend::{Backend, SystemBackend};
use crate::config;
use crate::event::{Event, Task};
use crate::pool::PoolShared;
use crate::types::{MemError, MemResult, MemStats, Size};
use log::{error, info};
use parking_lot::Mutex;
use record::RecordTable;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::sync::{Arc, Weak};
use thiserror::Error;

/// Longest name kept for a context or pool; excess characters are dropped.
pub const NAME_MAX: usize = 15;

pub(crate) fn clamp_name(name: &str) -> String {
    name.chars().take(NAME_MAX).collect()
}

/// Rejection returned by [`MemoryContext::on_destroy`] once the context is
/// terminal; hands the event back to the caller.
#[derive(Debug, Error)]
#[error("memory context is shutting down")]
pub struct OnDestroyRejected(pub Event);

pub(crate) struct CtxState {
    refs: u32,
    shutting_down: bool,
    name: Option<String>,
    pub(crate) in_use: Size,
    pub(crate) max_in_use: Size,
    pub(crate) quota: Size,
    pub(crate) hi_water: Size,
    pub(crate) lo_water: Size,
    pub(crate) water_high: bool,
    /// Count of live allocations of either flavor, kept in every mode.
    pub(crate) live: usize,
    pub(crate) trace: bool,
    pub(crate) record: bool,
    pub(crate) fill: bool,
    pub(crate) check_overrun: bool,
    destroy_check: bool,
    pub(crate) records: RecordTable,
    on_destroy: VecDeque<(Arc<dyn Task>, Event)>,
    pools: Vec<Weak<PoolShared>>,
}

pub(crate) struct CtxInner {
    pub(crate) backend: Arc<dyn Backend>,
    /// Advisory chunking hints, retained for API stability.
    init_size: Size,
    target_size: Size,
    pub(crate) state: Mutex<CtxState>,
}

/// Handle to a memory context.
///
/// Handles are obtained from [`create`](MemoryContext::create) and
/// multiplied with [`attach`](MemoryContext::attach); dropping a handle
/// detaches it. The context tears down when the last handle detaches:
/// leaks are checked, the destroy queue drains in FIFO order, and the
/// internal tables are released.
pub struct MemoryContext {
    pub(crate) inner: Arc<CtxInner>,
}

impl MemoryContext {
    /// Create a context over the system allocator.
    ///
    /// The size arguments are advisory chunking hints for the backend and
    /// are not interpreted by this implementation.
    pub fn create(init_size: Size, target_size: Size) -> MemResult<Self> {
        Self::create_extended(init_size, target_size, Arc::new(SystemBackend))
    }

    /// Create a context over a caller-supplied backend.
    pub fn create_extended(
        init_size: Size,
        target_size: Size,
        backend: Arc<dyn Backend>,
    ) -> MemResult<Self> {
        let debugging = config::debugging();
        let ctx = Self {
            inner: Arc::new(CtxInner {
                backend,
                init_size,
                target_size,
                state: Mutex::new(CtxState {
                    refs: 1,
                    shutting_down: false,
                    name: None,
                    in_use: 0,
                    max_in_use: 0,
                    quota: 0,
                    hi_water: 0,
                    lo_water: 0,
                    water_high: false,
                    live: 0,
                    trace: debugging & config::DEBUG_TRACE != 0,
                    record: debugging & config::DEBUG_RECORD != 0,
                    fill: true,
                    check_overrun: false,
                    destroy_check: true,
                    records: RecordTable::default(),
                    on_destroy: VecDeque::new(),
                    pools: Vec::new(),
                }),
            }),
        };
        info!(
            "memory context created (init_size={}, target_size={})",
            init_size, target_size
        );
        Ok(ctx)
    }

    /// Obtain another handle, incrementing the reference count.
    ///
    /// Fails with [`MemError::ShuttingDown`] once [`destroy`](Self::destroy)
    /// has been called on any handle.
    pub fn attach(&self) -> MemResult<Self> {
        let mut st = self.inner.state.lock();
        if st.shutting_down {
            return Err(MemError::ShuttingDown);
        }
        st.refs += 1;
        drop(st);
        Ok(Self {
            inner: Arc::clone(&self.inner),
        })
    }

    /// Schedule teardown: new attaches, allocations, pool creations, and
    /// destroy-queue registrations are refused from here on, and this handle
    /// detaches. Teardown itself happens when the last handle detaches.
    pub fn destroy(self) {
        self.inner.state.lock().shutting_down = true;
    }

    /// Advisory chunk-size hint supplied at creation.
    pub fn init_size(&self) -> Size {
        self.inner.init_size
    }

    /// Advisory steady-state hint supplied at creation.
    pub fn target_size(&self) -> Size {
        self.inner.target_size
    }

    /// Give the context a diagnostic name. At most [`NAME_MAX`] characters
    /// are kept.
    pub fn set_name(&self, name: &str) {
        self.inner.state.lock().name = Some(clamp_name(name));
    }

    pub fn name(&self) -> Option<String> {
        self.inner.state.lock().name.clone()
    }

    /// Maximum bytes the context will allow outstanding; 0 means unlimited.
    ///
    /// Lowering the quota below the current usage is allowed: allocations
    /// are refused until usage drains below the new cap.
    pub fn set_quota(&self, quota: Size) {
        self.inner.state.lock().quota = quota;
    }

    pub fn quota(&self) -> Size {
        self.inner.state.lock().quota
    }

    /// Sum of the sizes of currently live allocations.
    pub fn in_use(&self) -> Size {
        self.inner.state.lock().in_use
    }

    /// High-water mark of [`in_use`](Self::in_use).
    pub fn max_in_use(&self) -> Size {
        self.inner.state.lock().max_in_use
    }

    /// Set the water marks for pressure diagnostics. Climbing above `hi`
    /// logs a one-shot warning; draining to `lo` or below re-arms it.
    /// Both zero disables the mechanism.
    pub fn set_water(&self, hi: Size, lo: Size) {
        assert!(lo <= hi, "lo_water above hi_water");
        let mut st = self.inner.state.lock();
        st.hi_water = hi;
        st.lo_water = lo;
        st.water_high = false;
    }

    /// Control the leak assertion at teardown. On by default; when off,
    /// leaks are dumped to the diagnostic channel instead of panicking.
    pub fn set_destroy_check(&self, check: bool) {
        self.inner.state.lock().destroy_check = check;
    }

    /// Override this context's trace/record flags (see [`crate::config`]).
    ///
    /// Changing the record flag with live allocations would desynchronize
    /// the record table and is refused as a precondition violation.
    pub fn set_debugging(&self, flags: u32) {
        let mut st = self.inner.state.lock();
        let record = flags & config::DEBUG_RECORD != 0;
        if record != st.record && st.live != 0 {
            error!(
                "record flag changed with {} live allocations outstanding",
                st.live
            );
            panic!("debug-record flag changed on an active memory context");
        }
        st.record = record;
        st.trace = flags & config::DEBUG_TRACE != 0;
    }

    /// Enable or disable the trailing guard pattern on new allocations.
    ///
    /// The guard layout must be uniform across live allocations, so the
    /// flag may only change while nothing is outstanding.
    pub fn set_overrun_check(&self, check: bool) {
        let mut st = self.inner.state.lock();
        if check != st.check_overrun && st.live != 0 {
            error!(
                "overrun-check flag changed with {} live allocations outstanding",
                st.live
            );
            panic!("overrun-check flag changed on an active memory context");
        }
        st.check_overrun = check;
    }

    /// Enable or disable the alloc/free fill scribbles. On by default.
    pub fn set_fill(&self, fill: bool) {
        self.inner.state.lock().fill = fill;
    }

    /// Whether `ptr` is a live allocation of this context. Meaningful only
    /// in record mode; otherwise always false.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.inner.state.lock().records.contains(ptr as usize)
    }

    /// Register for notification when the context is finally torn down.
    ///
    /// The event is delivered to `task` exactly once, in registration
    /// order relative to other entries, as the context's final act. On a
    /// terminal context the registration is refused and the event handed
    /// back untouched.
    pub fn on_destroy(
        &self,
        task: Arc<dyn Task>,
        event: Event,
    ) -> Result<(), OnDestroyRejected> {
        let mut st = self.inner.state.lock();
        if st.shutting_down {
            return Err(OnDestroyRejected(event));
        }
        st.on_destroy.push_back((task, event));
        Ok(())
    }

    /// Point-in-time statistics snapshot.
    pub fn stats_snapshot(&self) -> MemStats {
        let (mut stats, pool_refs) = {
            let st = self.inner.state.lock();
            let stats = MemStats {
                name: st.name.clone(),
                in_use: st.in_use,
                max_in_use: st.max_in_use,
                quota: st.quota,
                hi_water: st.hi_water,
                lo_water: st.lo_water,
                live_allocations: st.live,
                live_records: st.records.len(),
                pools: Vec::new(),
            };
            (stats, st.pools.clone())
        };
        // Pool state is read with the context lock released; pool locks
        // nest inside no other lock here.
        for weak in pool_refs {
            if let Some(pool) = weak.upgrade() {
                stats.pools.push(pool.stats());
            }
        }
        stats
    }

    /// Write the human-readable statistics block: a header line with the
    /// counters, one line per attached pool, and in record mode one line
    /// per live allocation with its origin.
    pub fn stats(&self, out: &mut dyn Write) -> io::Result<()> {
        let (header, records, pool_refs) = {
            let st = self.inner.state.lock();
            let header = format!(
                "memory context '{}': in_use={} max_in_use={} quota={} hi_water={} lo_water={}",
                st.name.as_deref().unwrap_or("-"),
                st.in_use,
                st.max_in_use,
                st.quota,
                st.hi_water,
                st.lo_water
            );
            (header, st.records.entries(), st.pools.clone())
        };
        writeln!(out, "{}", header)?;
        for weak in pool_refs {
            if let Some(pool) = weak.upgrade() {
                let ps = pool.stats();
                writeln!(
                    out,
                    "pool '{}': element_size={} allocated={} free_count={}",
                    ps.name.as_deref().unwrap_or("-"),
                    ps.element_size,
                    ps.allocated,
                    ps.free_count
                )?;
            }
        }
        for (ptr, rec) in records {
            writeln!(
                out,
                "{:#x} size={} {}:{}",
                ptr,
                rec.size,
                rec.location.file(),
                rec.location.line()
            )?;
        }
        Ok(())
    }

    pub(crate) fn register_pool(&self, pool: &Arc<PoolShared>) {
        let mut st = self.inner.state.lock();
        st.pools.retain(|w| w.strong_count() > 0);
        st.pools.push(Arc::downgrade(pool));
    }

    pub(crate) fn unregister_pool(&self, pool: &Arc<PoolShared>) {
        let mut st = self.inner.state.lock();
        st.pools.retain(|w| match w.upgrade() {
            Some(p) => !Arc::ptr_eq(&p, pool),
            None => false,
        });
    }

    /// Final teardown, entered exactly once when the refcount hits zero.
    fn teardown(&self) {
        let (name, in_use, live, leaks, destroy_check, queue, pools_alive) = {
            let mut st = self.inner.state.lock();
            st.shutting_down = true;
            let pools_alive = st.pools.iter().filter(|w| w.strong_count() > 0).count();
            (
                st.name.take(),
                st.in_use,
                st.live,
                st.records.entries(),
                st.destroy_check,
                std::mem::take(&mut st.on_destroy),
                pools_alive,
            )
        };
        let name = name.unwrap_or_else(|| "-".to_owned());

        if pools_alive > 0 {
            error!(
                "memory context '{}' torn down with {} pools still attached",
                name, pools_alive
            );
            panic!("memory context torn down with pools still attached");
        }

        if live != 0 || in_use != 0 {
            error!(
                "memory context '{}' torn down with {} live allocations ({} bytes)",
                name, live, in_use
            );
            for (ptr, rec) in &leaks {
                error!(
                    "leaked {:#x} size={} {}:{}",
                    ptr,
                    rec.size,
                    rec.location.file(),
                    rec.location.line()
                );
            }
            if destroy_check {
                panic!("memory context torn down with live allocations");
            }
        }

        for (task, event) in queue {
            task.send(event);
        }
        info!("memory context '{}' destroyed", name);
    }
}

impl Drop for MemoryContext {
    fn drop(&mut self) {
        let last = {
            let mut st = self.inner.state.lock();
            st.refs -= 1;
            st.refs == 0
        };
        if last {
            self.teardown();
        }
    }
}
