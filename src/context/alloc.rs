/*!
 * Allocation Paths
 * Sized and unsized allocation over the context backend
 */

use super::record::RecordFault;
use super::MemoryContext;
use crate::backend::BLOCK_ALIGN;
use crate::types::{MemError, MemResult, Size};
use log::{error, info, trace, warn};
use std::panic::Location;
use std::ptr::{self, NonNull};

/// Scribble written into fresh allocations when fill is on.
pub const FILL_ALLOC: u8 = 0xBE;
/// Scribble written into released allocations when fill is on.
pub const FILL_FREE: u8 = 0xDE;
/// Byte value of the trailing guard pattern.
pub const GUARD_BYTE: u8 = 0xA5;
/// Guard width in bytes.
pub const GUARD_SIZE: usize = 4;

/// Hidden size-prefix width for unsized allocations. A full alignment unit
/// so the caller-visible region keeps [`BLOCK_ALIGN`].
const HEADER_SIZE: usize = BLOCK_ALIGN;

fn guard_size(check_overrun: bool) -> usize {
    if check_overrun {
        GUARD_SIZE
    } else {
        0
    }
}

enum Flavor {
    Sized,
    Unsized,
}

/// An owned block of context memory.
///
/// Not clonable: handing the block back through `put` or `free` consumes
/// the handle, so a stale handle cannot outlive the block. Dropping a
/// handle without returning it leaks the block, which the owning context
/// reports at teardown.
#[derive(Debug)]
pub struct Allocation {
    ptr: NonNull<u8>,
    size: Size,
}

// The holder exclusively owns the block.
unsafe impl Send for Allocation {}

impl Allocation {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// View the block as a mutable byte slice.
    ///
    /// # Safety
    /// The bytes must have been initialized, either by writing through
    /// [`as_ptr`](Self::as_ptr) or by the owning context's fill scribble.
    pub unsafe fn as_mut_slice(&mut self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.size)
    }

    /// Rebuild a handle from raw parts.
    ///
    /// # Safety
    /// `ptr` and `size` must be exactly what a prior `get` or `allocate`
    /// on the same context produced, and no other handle to the block may
    /// be live.
    pub unsafe fn from_raw(ptr: *mut u8, size: Size) -> Self {
        Self {
            ptr: NonNull::new_unchecked(ptr),
            size,
        }
    }

    pub(crate) fn from_parts(ptr: NonNull<u8>, size: Size) -> Self {
        Self { ptr, size }
    }

    pub(crate) fn into_ptr(self) -> NonNull<u8> {
        self.ptr
    }
}

impl MemoryContext {
    /// Sized allocation: the caller remembers `size` and returns it to
    /// [`put`](Self::put).
    #[track_caller]
    pub fn get(&self, size: Size) -> MemResult<Allocation> {
        self.get_traced(size, Location::caller())
    }

    /// Return a sized allocation. `size` must match the original `get`.
    #[track_caller]
    pub fn put(&self, mem: Allocation, size: Size) {
        self.put_traced(mem, size, Location::caller())
    }

    /// Unsized allocation: the context remembers the size in a hidden
    /// prefix so [`free`](Self::free) can recover it.
    #[track_caller]
    pub fn allocate(&self, size: Size) -> MemResult<Allocation> {
        self.allocate_traced(size, Location::caller())
    }

    /// Release an unsized allocation.
    #[track_caller]
    pub fn free(&self, mem: Allocation) {
        self.free_traced(mem, Location::caller())
    }

    /// Duplicate `s` as a NUL-terminated byte string owned by this context.
    /// Released with [`free`](Self::free).
    #[track_caller]
    pub fn strdup(&self, s: &str) -> MemResult<Allocation> {
        let mem = self.allocate_traced(s.len() + 1, Location::caller())?;
        unsafe {
            ptr::copy_nonoverlapping(s.as_ptr(), mem.as_ptr(), s.len());
            *mem.as_ptr().add(s.len()) = 0;
        }
        Ok(mem)
    }

    pub(crate) fn get_traced(
        &self,
        size: Size,
        caller: &'static Location<'static>,
    ) -> MemResult<Allocation> {
        let user = self.obtain(size, Flavor::Sized, caller)?;
        Ok(Allocation::from_parts(user, size))
    }

    pub(crate) fn put_traced(
        &self,
        mem: Allocation,
        size: Size,
        caller: &'static Location<'static>,
    ) {
        if mem.size != size {
            error!(
                "put of {:p}: handle carries size {}, caller passed {}",
                mem.as_ptr(),
                mem.size,
                size
            );
            panic!("memory put size mismatch");
        }
        self.release(mem.into_ptr(), size, Flavor::Sized, caller);
    }

    pub(crate) fn allocate_traced(
        &self,
        size: Size,
        caller: &'static Location<'static>,
    ) -> MemResult<Allocation> {
        let user = self.obtain(size, Flavor::Unsized, caller)?;
        Ok(Allocation::from_parts(user, size))
    }

    fn free_traced(&self, mem: Allocation, caller: &'static Location<'static>) {
        let size = mem.size;
        let user = mem.into_ptr();
        let stored = unsafe { *(user.as_ptr().sub(HEADER_SIZE) as *const usize) };
        if stored != size {
            error!(
                "free of {:p}: size prefix says {}, handle carries {}",
                user.as_ptr(),
                stored,
                size
            );
            panic!("memory corruption detected");
        }
        self.release(user, size, Flavor::Unsized, caller);
    }

    /// Bytes requested from the backend for a caller-visible `size`, never
    /// zero so the backend contract holds.
    fn backend_request(size: Size, flavor: &Flavor, check_overrun: bool) -> Option<Size> {
        let prefix = match flavor {
            Flavor::Sized => 0,
            Flavor::Unsized => HEADER_SIZE,
        };
        let total = prefix
            .checked_add(size)?
            .checked_add(guard_size(check_overrun))?;
        Some(total.max(1))
    }

    /// Common allocation path. Reserves the quota inside the lock, calls
    /// the backend outside it, then applies scribbles, guard, and record.
    fn obtain(
        &self,
        size: Size,
        flavor: Flavor,
        caller: &'static Location<'static>,
    ) -> MemResult<NonNull<u8>> {
        let (fill, check_overrun, total) = {
            let mut st = self.inner.state.lock();
            if st.shutting_down {
                return Err(MemError::ShuttingDown);
            }
            let total = match Self::backend_request(size, &flavor, st.check_overrun) {
                Some(total) => total,
                None => return Err(MemError::OutOfMemory { requested: size }),
            };
            if st.quota != 0 && st.in_use.saturating_add(total) > st.quota {
                return Err(MemError::QuotaExceeded {
                    requested: size,
                    used: st.in_use,
                    limit: st.quota,
                });
            }
            // Reserve before the backend call so concurrent allocations
            // cannot overshoot the quota; refunded on backend failure.
            // The high-water mark and pressure diagnostics wait for the
            // backend to actually deliver.
            st.in_use += size;
            st.live += 1;
            (st.fill, st.check_overrun, total)
        };

        let base = match self.inner.backend.alloc(total) {
            Some(base) => base,
            None => {
                let mut st = self.inner.state.lock();
                st.in_use = st.in_use.saturating_sub(size);
                st.live -= 1;
                if st.water_high && st.in_use <= st.lo_water {
                    st.water_high = false;
                }
                error!("backend refused {} bytes", total);
                return Err(MemError::OutOfMemory { requested: size });
            }
        };

        let user = unsafe {
            let user = match flavor {
                Flavor::Sized => base,
                Flavor::Unsized => {
                    *(base.as_ptr() as *mut usize) = size;
                    NonNull::new_unchecked(base.as_ptr().add(HEADER_SIZE))
                }
            };
            if fill && size > 0 {
                ptr::write_bytes(user.as_ptr(), FILL_ALLOC, size);
            }
            if check_overrun {
                ptr::write_bytes(user.as_ptr().add(size), GUARD_BYTE, GUARD_SIZE);
            }
            user
        };

        let (do_trace, crossed_high, in_use_now) = {
            let mut st = self.inner.state.lock();
            if st.in_use > st.max_in_use {
                st.max_in_use = st.in_use;
            }
            let mut crossed_high = false;
            if st.hi_water != 0 && st.in_use > st.hi_water && !st.water_high {
                st.water_high = true;
                crossed_high = true;
            }
            if st.record {
                st.records.insert(user.as_ptr() as usize, size, caller);
            }
            (st.trace, crossed_high, st.in_use)
        };

        if crossed_high {
            warn!("memory use {} climbed above hi_water", in_use_now);
        }
        if do_trace {
            trace!(
                "get {:p} size={} ({}:{})",
                user.as_ptr(),
                size,
                caller.file(),
                caller.line()
            );
        }
        Ok(user)
    }

    /// Common release path: guard verify, record verify-and-remove, free
    /// scribble, backend free, usage decrement.
    fn release(
        &self,
        user: NonNull<u8>,
        size: Size,
        flavor: Flavor,
        caller: &'static Location<'static>,
    ) {
        let (fill, check_overrun, record, do_trace) = {
            let st = self.inner.state.lock();
            (st.fill, st.check_overrun, st.record, st.trace)
        };

        if check_overrun {
            let tail =
                unsafe { std::slice::from_raw_parts(user.as_ptr().add(size), GUARD_SIZE) };
            if tail.iter().any(|&b| b != GUARD_BYTE) {
                error!(
                    "guard pattern clobbered past {:p} (size {}), freed at {}:{}",
                    user.as_ptr(),
                    size,
                    caller.file(),
                    caller.line()
                );
                panic!("memory corruption detected");
            }
        }

        if record {
            let mut st = self.inner.state.lock();
            match st.records.remove(user.as_ptr() as usize, size) {
                Ok(_) => {}
                Err(RecordFault::Unknown) => {
                    error!(
                        "free of unrecorded pointer {:p} at {}:{} (double free or foreign pointer)",
                        user.as_ptr(),
                        caller.file(),
                        caller.line()
                    );
                    panic!("memory debug-record mismatch");
                }
                Err(RecordFault::SizeMismatch { recorded }) => {
                    error!(
                        "free of {:p} with size {}, recorded size {}",
                        user.as_ptr(),
                        size,
                        recorded
                    );
                    panic!("memory debug-record mismatch");
                }
            }
        }

        unsafe {
            if fill && size > 0 {
                ptr::write_bytes(user.as_ptr(), FILL_FREE, size);
            }
            // The same arithmetic fit when the block was obtained.
            let (base, prefix) = match flavor {
                Flavor::Sized => (user, 0),
                Flavor::Unsized => (
                    NonNull::new_unchecked(user.as_ptr().sub(HEADER_SIZE)),
                    HEADER_SIZE,
                ),
            };
            let total = (prefix + size + guard_size(check_overrun)).max(1);
            self.inner.backend.free(base, total);
        }

        let drained_low = {
            let mut st = self.inner.state.lock();
            st.in_use = st.in_use.saturating_sub(size);
            st.live = st.live.saturating_sub(1);
            if st.water_high && st.in_use <= st.lo_water {
                st.water_high = false;
                true
            } else {
                false
            }
        };
        if drained_low {
            info!("memory use drained back below lo_water");
        }
        if do_trace {
            trace!(
                "put {:p} size={} ({}:{})",
                user.as_ptr(),
                size,
                caller.file(),
                caller.line()
            );
        }
    }
}
