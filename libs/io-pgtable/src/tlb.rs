// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::ptr::NonNull;

use arrayvec::ArrayVec;

use crate::page_alloc::{self, AllocFlags};
use crate::{DeviceHandle, IoPgtable, Iova};

/// TLB maintenance callbacks, plus optional overrides for page table memory allocation.
///
/// Every method receives the cookie the page table was allocated with, so a single
/// implementation can serve many page tables.
///
/// # Execution context
///
/// All methods may be called from contexts that must not sleep or yield (with locks held or
/// from interrupt-like paths). Implementations must run to completion synchronously; in
/// particular [`Self::tlb_sync`] has to poll rather than block.
pub trait TlbOps<C>: Send + Sync {
    /// Invalidate every cached translation of this context.
    fn tlb_flush_all(&self, cookie: &C);

    /// Queue invalidation of `size` bytes starting at `iova`, in steps of `granule`.
    ///
    /// `leaf` is `true` if only last-level entries changed, `false` if intermediate table entries
    /// changed too and any cached walks must be dropped. The invalidation need not have taken
    /// effect until the next [`Self::tlb_sync`].
    fn tlb_add_flush(&self, iova: Iova, size: usize, granule: usize, leaf: bool, cookie: &C);

    /// Wait until all invalidations queued since the last sync have completed.
    fn tlb_sync(&self, cookie: &C);

    /// Allocate `layout.size()` bytes of page table memory aligned to `layout.align()`.
    ///
    /// Returning `None` fails the operation that needed the memory.
    fn alloc_pages_exact(
        &self,
        cookie: &C,
        dev: Option<&DeviceHandle>,
        layout: Layout,
        flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        let _ = (cookie, dev, flags);
        page_alloc::alloc_pages_exact(layout)
    }

    /// Release memory returned by [`Self::alloc_pages_exact`].
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`Self::alloc_pages_exact`] on this object with the same
    /// `layout`, and must not be used afterwards.
    unsafe fn free_pages_exact(
        &self,
        cookie: &C,
        dev: Option<&DeviceHandle>,
        ptr: NonNull<u8>,
        layout: Layout,
    ) {
        let _ = (cookie, dev);
        // Safety: ensured by caller
        unsafe { page_alloc::free_pages_exact(ptr, layout) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TlbRange {
    iova: Iova,
    size: usize,
    granule: usize,
    leaf: bool,
}

enum Flush<const CAP: usize> {
    Ranges(ArrayVec<TlbRange, CAP>),
    All,
}

/// Collects the TLB maintenance required by one operation, so that the operation ends with
/// exactly one synchronisation.
///
/// Finishing the gather issues the table-write barrier, then every queued invalidation (or a
/// single flush of everything once more ranges were queued than fit) and then one sync. It lives
/// on the stack and never allocates.
pub struct Gather<const CAP: usize = 16> {
    flush: Flush<CAP>,
}

impl Default for Gather {
    fn default() -> Self {
        Self::new()
    }
}

impl<const CAP: usize> Gather<CAP> {
    pub const fn new() -> Self {
        Self {
            flush: Flush::Ranges(ArrayVec::new_const()),
        }
    }

    /// Returns `true` if no invalidation has been queued.
    pub fn is_empty(&self) -> bool {
        matches!(&self.flush, Flush::Ranges(ranges) if ranges.is_empty())
    }

    /// Queue invalidation of a range. Contiguous requests of the same kind are merged.
    pub fn add_flush(&mut self, iova: Iova, size: usize, granule: usize, leaf: bool) {
        let Flush::Ranges(ranges) = &mut self.flush else {
            return;
        };

        if let Some(last) = ranges.last_mut()
            && last.granule == granule
            && last.leaf == leaf
            && last.iova.checked_add(last.size) == Some(iova)
        {
            last.size += size;
            return;
        }

        let range = TlbRange {
            iova,
            size,
            granule,
            leaf,
        };

        if ranges.try_push(range).is_err() {
            log::trace!("gather overflowed, falling back to flushing everything");
            self.flush = Flush::All;
        }
    }

    /// Replace all queued invalidations with one of the whole context.
    pub fn flush_all(&mut self) {
        self.flush = Flush::All;
    }

    /// Issue the queued maintenance through `iop`'s callbacks.
    pub fn finish<C>(self, iop: &IoPgtable<C>) {
        iop.table_barrier();

        match self.flush {
            Flush::Ranges(ranges) if ranges.is_empty() => {}
            Flush::Ranges(ranges) => {
                for range in ranges {
                    log::trace!("flushing range {range:?}");
                    iop.tlb_add_flush(range.iova, range.size, range.granule, range.leaf);
                }
                iop.tlb_sync();
            }
            Flush::All => {
                log::trace!("flushing entire context");
                iop.tlb_flush_all();
                iop.tlb_sync();
            }
        }
    }
}
