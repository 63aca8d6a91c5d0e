// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Page table memory.
//!
//! Every table page goes through [`alloc_table`] and [`free_table`]. They route to the
//! [`TlbOps`] allocation hooks when present and to the global allocator otherwise, zero fresh
//! tables, order the zeroing before the table can be published to the walker and keep a count of
//! the outstanding bytes.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::{AllocError, DeviceHandle, Quirks, TlbOps};

bitflags! {
    /// Hints passed to the page allocation hooks.
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct AllocFlags: u32 {
        /// The caller may be in a context that must not sleep.
        const ATOMIC = 1 << 0;
    }
}

static BYTES_ALLOCATED: AtomicUsize = AtomicUsize::new(0);

/// Returns the number of bytes of page table memory currently allocated, across all tables.
pub fn io_pgtable_bytes_allocated() -> usize {
    BYTES_ALLOCATED.load(Ordering::Relaxed)
}

/// The default page allocator, backed by the global allocator. Returned memory is zeroed.
pub fn alloc_pages_exact(layout: Layout) -> Option<NonNull<u8>> {
    debug_assert!(layout.size() > 0);

    // Safety: page table layouts are never zero-sized
    NonNull::new(unsafe { alloc::alloc::alloc_zeroed(layout) })
}

/// Releases memory obtained from [`alloc_pages_exact`].
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc_pages_exact`] with the same `layout` and must not
/// be used afterwards.
pub unsafe fn free_pages_exact(ptr: NonNull<u8>, layout: Layout) {
    // Safety: ensured by caller
    unsafe { alloc::alloc::dealloc(ptr.as_ptr(), layout) }
}

/// Orders all prior table writes before anything the walker may observe next.
///
/// Unnecessary when the walker is coherent with the CPU ([`Quirks::NO_DMA`]).
#[inline]
pub(crate) fn table_barrier(quirks: Quirks) {
    if !quirks.contains(Quirks::NO_DMA) {
        core::sync::atomic::fence(Ordering::SeqCst);
    }
}

/// Allocates a zeroed table of `layout`, through the `tlb` hook if one is installed.
pub(crate) fn alloc_table<C>(
    tlb: Option<&dyn TlbOps<C>>,
    cookie: &C,
    dev: Option<&DeviceHandle>,
    layout: Layout,
    flags: AllocFlags,
    quirks: Quirks,
) -> Result<NonNull<u8>, AllocError> {
    let ptr = match tlb {
        Some(tlb) => tlb.alloc_pages_exact(cookie, dev, layout, flags),
        None => alloc_pages_exact(layout),
    }
    .ok_or(AllocError)?;

    debug_assert!(ptr.as_ptr().addr() & (layout.align() - 1) == 0);

    // Safety: the allocator handed us `layout.size()` bytes of memory we exclusively own
    unsafe {
        ptr.as_ptr().write_bytes(0, layout.size());
    }
    table_barrier(quirks);

    BYTES_ALLOCATED.fetch_add(layout.size(), Ordering::Relaxed);
    log::trace!(
        "allocated table {ptr:?} size={:#x} flags={flags:?}",
        layout.size()
    );

    Ok(ptr)
}

/// Releases a table allocated through [`alloc_table`].
///
/// # Safety
///
/// `ptr` must have been returned by [`alloc_table`] with the same `tlb` and `layout`, and the
/// walker must no longer be able to reach it.
pub(crate) unsafe fn free_table<C>(
    tlb: Option<&dyn TlbOps<C>>,
    cookie: &C,
    dev: Option<&DeviceHandle>,
    ptr: NonNull<u8>,
    layout: Layout,
) {
    log::trace!("freeing table {ptr:?} size={:#x}", layout.size());
    BYTES_ALLOCATED.fetch_sub(layout.size(), Ordering::Relaxed);

    match tlb {
        // Safety: ensured by caller
        Some(tlb) => unsafe { tlb.free_pages_exact(cookie, dev, ptr, layout) },
        // Safety: ensured by caller
        None => unsafe { free_pages_exact(ptr, layout) },
    }
}
