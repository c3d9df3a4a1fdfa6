/*!
 * Memory Pool
 * Fixed-element-size freelist layered on a memory context
 */

use crate::context::{clamp_name, Allocation, MemoryContext};
use crate::types::{MemError, MemResult, PoolStats, Size};
use log::error;
use parking_lot::{Mutex, MutexGuard};
use std::panic::Location;
use std::ptr::NonNull;
use std::sync::{Arc, OnceLock};

/// External lock shared by a family of sibling pools.
///
/// Once associated, the lock serializes every get, put, setter, and getter
/// on each pool in the family. It must not be used for anything else;
/// taking it around a pool operation from application code would deadlock.
#[derive(Debug, Default)]
pub struct PoolLock {
    mutex: Mutex<()>,
}

impl PoolLock {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A slot parked on the freelist; the pool owns the block.
struct Slot(NonNull<u8>);

unsafe impl Send for Slot {}

struct PoolState {
    name: Option<String>,
    freelist: Vec<Slot>,
    free_max: usize,
    allocated: usize,
    max_alloc: usize,
    fill_count: usize,
    /// Set on the first get; associate_lock is refused afterwards.
    used: bool,
}

pub(crate) struct PoolShared {
    ctx: MemoryContext,
    element_size: Size,
    family: OnceLock<Arc<PoolLock>>,
    state: Mutex<PoolState>,
}

impl PoolShared {
    fn family_guard(&self) -> Option<MutexGuard<'_, ()>> {
        self.family.get().map(|lock| lock.mutex.lock())
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let st = self.state.lock();
        PoolStats {
            name: st.name.clone(),
            element_size: self.element_size,
            allocated: st.allocated,
            free_count: st.freelist.len(),
        }
    }
}

/// Handle to a memory pool.
///
/// A pool caches released slots of one fixed size so hot equal-size
/// objects (messages, resource records, task events) recycle without a
/// trip through the parent context, and batches its refills to amortize
/// the context lock. Dropping the handle destroys the pool; outstanding
/// allocations at that point are fatal.
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    /// Create a pool of `element_size`-byte slots against `mctx`.
    ///
    /// Defaults: unlimited `max_alloc`, `free_max` 1, `fill_count` 1.
    pub fn create(mctx: &MemoryContext, element_size: Size) -> MemResult<Self> {
        assert!(element_size > 0, "pool element size must be non-zero");
        let ctx = mctx.attach()?;
        let shared = Arc::new(PoolShared {
            ctx,
            element_size,
            family: OnceLock::new(),
            state: Mutex::new(PoolState {
                name: None,
                freelist: Vec::new(),
                free_max: 1,
                allocated: 0,
                max_alloc: usize::MAX,
                fill_count: 1,
                used: false,
            }),
        });
        shared.ctx.register_pool(&shared);
        Ok(Self { shared })
    }

    /// Serialize this pool with `lock`, possibly shared with sibling pools.
    /// May be called at most once, before the first get; a pool without an
    /// associated lock relies on its own internal mutex only.
    pub fn associate_lock(&self, lock: Arc<PoolLock>) {
        {
            let st = self.shared.state.lock();
            assert!(!st.used, "associate_lock after first get");
        }
        if self.shared.family.set(lock).is_err() {
            panic!("pool already has an associated lock");
        }
    }

    /// Take one slot. Pops the freelist when possible; otherwise pulls a
    /// burst of up to `fill_count` slots from the parent context, keeping
    /// the spares on the freelist.
    #[track_caller]
    pub fn get(&self) -> MemResult<Allocation> {
        self.get_traced(Location::caller())
    }

    fn get_traced(&self, caller: &'static Location<'static>) -> MemResult<Allocation> {
        let shared = &self.shared;
        // No pool lock is held across the parent-context calls below, so a
        // custom backend may reenter this pool without deadlocking.
        let fill_count = {
            let _family = shared.family_guard();
            let mut st = shared.state.lock();
            st.used = true;
            if st.allocated >= st.max_alloc {
                return Err(MemError::QuotaExceeded {
                    requested: 1,
                    used: st.allocated,
                    limit: st.max_alloc,
                });
            }
            if let Some(slot) = st.freelist.pop() {
                st.allocated += 1;
                return Ok(Allocation::from_parts(slot.0, shared.element_size));
            }
            // Reserve the outgoing slot so the cap holds while unlocked;
            // refunded if the parent refuses.
            st.allocated += 1;
            st.fill_count
        };

        // Batch refill. The retention cap applies on put only, so the whole
        // burst parks on the freelist; a failed extra just shortens the
        // burst.
        let first = match shared.ctx.get_traced(shared.element_size, caller) {
            Ok(first) => first,
            Err(e) => {
                shared.state.lock().allocated -= 1;
                return Err(e);
            }
        };
        let mut extras = Vec::with_capacity(fill_count - 1);
        for _ in 1..fill_count {
            match shared.ctx.get_traced(shared.element_size, caller) {
                Ok(extra) => extras.push(Slot(extra.into_ptr())),
                Err(_) => break,
            }
        }

        {
            let _family = shared.family_guard();
            let mut st = shared.state.lock();
            st.freelist.extend(extras);
        }
        Ok(Allocation::from_parts(first.into_ptr(), shared.element_size))
    }

    /// Return a slot. Kept on the freelist below `free_max`, otherwise
    /// handed back to the parent context.
    #[track_caller]
    pub fn put(&self, mem: Allocation) {
        let caller = Location::caller();
        let shared = &self.shared;
        if mem.len() != shared.element_size {
            error!(
                "put of a {}-byte block into a pool of {}-byte slots",
                mem.len(),
                shared.element_size
            );
            panic!("pool put size mismatch");
        }
        // A slot past the retention cap goes back to the parent with no
        // pool lock held, mirroring get.
        let overflow = {
            let _family = shared.family_guard();
            let mut st = shared.state.lock();
            if st.allocated == 0 {
                error!("pool put without a matching get");
                panic!("pool put without a matching get");
            }
            st.allocated -= 1;
            if st.freelist.len() < st.free_max {
                st.freelist.push(Slot(mem.into_ptr()));
                None
            } else {
                Some(mem)
            }
        };
        if let Some(mem) = overflow {
            shared.ctx.put_traced(mem, shared.element_size, caller);
        }
    }

    /// Give the pool a diagnostic name. At most
    /// [`NAME_MAX`](crate::context::NAME_MAX) characters are kept.
    pub fn set_name(&self, name: &str) {
        let _family = self.shared.family_guard();
        self.shared.state.lock().name = Some(clamp_name(name));
    }

    pub fn name(&self) -> Option<String> {
        let _family = self.shared.family_guard();
        self.shared.state.lock().name.clone()
    }

    pub fn element_size(&self) -> Size {
        self.shared.element_size
    }

    /// Cap on freelist retention; slots put beyond it return to the parent.
    pub fn set_free_max(&self, limit: usize) {
        let _family = self.shared.family_guard();
        self.shared.state.lock().free_max = limit;
    }

    pub fn free_max(&self) -> usize {
        let _family = self.shared.family_guard();
        self.shared.state.lock().free_max
    }

    pub fn free_count(&self) -> usize {
        let _family = self.shared.family_guard();
        self.shared.state.lock().freelist.len()
    }

    /// Cap on outstanding slots; get fails with quota errors at the cap.
    /// Lowering it below the current count is allowed and simply refuses
    /// new slots until usage drains.
    pub fn set_max_alloc(&self, limit: usize) {
        assert!(limit > 0, "max_alloc must be non-zero");
        let _family = self.shared.family_guard();
        self.shared.state.lock().max_alloc = limit;
    }

    pub fn max_alloc(&self) -> usize {
        let _family = self.shared.family_guard();
        self.shared.state.lock().max_alloc
    }

    pub fn allocated(&self) -> usize {
        let _family = self.shared.family_guard();
        self.shared.state.lock().allocated
    }

    /// Burst size pulled from the parent when the freelist is empty.
    pub fn set_fill_count(&self, count: usize) {
        assert!(count > 0, "fill_count must be non-zero");
        let _family = self.shared.family_guard();
        self.shared.state.lock().fill_count = count;
    }

    pub fn fill_count(&self) -> usize {
        let _family = self.shared.family_guard();
        self.shared.state.lock().fill_count
    }
}

impl Drop for MemoryPool {
    fn drop(&mut self) {
        let shared = &self.shared;
        let slots = {
            let _family = shared.family_guard();
            let mut st = shared.state.lock();
            if st.allocated > 0 {
                error!(
                    "pool '{}' destroyed with {} outstanding allocations",
                    st.name.as_deref().unwrap_or("-"),
                    st.allocated
                );
                panic!("memory pool destroyed with outstanding allocations");
            }
            std::mem::take(&mut st.freelist)
        };
        for slot in slots {
            let mem = Allocation::from_parts(slot.0, shared.element_size);
            shared.ctx.put(mem, shared.element_size);
        }
        shared.ctx.unregister_pool(&self.shared);
    }
}
