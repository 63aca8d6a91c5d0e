// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::page_alloc::{self, AllocFlags};
use crate::{DeviceHandle, Iova, PhysMap, PhysicalAddress, TlbOps};

/// Where [`RecordingTlb::with_arena`] places its memory in the emulated physical address space.
pub(crate) const ARENA_PHYS_BASE: usize = 0x8000_0000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TlbEvent {
    FlushAll,
    AddFlush {
        iova: Iova,
        size: usize,
        granule: usize,
        leaf: bool,
    },
    Sync,
}

/// Records every TLB callback in order.
pub(crate) struct RecordingTlb {
    events: Mutex<Vec<TlbEvent>>,
    arena: Option<Arena>,
}

impl RecordingTlb {
    pub(crate) fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            arena: None,
        }
    }

    /// Serves table memory from a `size` byte arena that is mapped at [`ARENA_PHYS_BASE`], for
    /// formats that can only address 32 bits worth of tables.
    pub(crate) fn with_arena(size: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            arena: Some(Arena::new(size)),
        }
    }

    /// The physmap to configure alongside this TLB.
    pub(crate) fn physmap(&self) -> PhysMap {
        match &self.arena {
            Some(arena) => PhysMap::new(
                arena.base.as_ptr().addr(),
                PhysicalAddress::new(ARENA_PHYS_BASE),
            ),
            None => PhysMap::identity(),
        }
    }

    pub(crate) fn take_events(&self) -> Vec<TlbEvent> {
        core::mem::take(&mut *self.events.lock())
    }
}

impl<C> TlbOps<C> for RecordingTlb {
    fn tlb_flush_all(&self, _cookie: &C) {
        self.events.lock().push(TlbEvent::FlushAll);
    }

    fn tlb_add_flush(&self, iova: Iova, size: usize, granule: usize, leaf: bool, _cookie: &C) {
        self.events.lock().push(TlbEvent::AddFlush {
            iova,
            size,
            granule,
            leaf,
        });
    }

    fn tlb_sync(&self, _cookie: &C) {
        self.events.lock().push(TlbEvent::Sync);
    }

    fn alloc_pages_exact(
        &self,
        _cookie: &C,
        _dev: Option<&DeviceHandle>,
        layout: Layout,
        _flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        match &self.arena {
            Some(arena) => arena.alloc(layout),
            None => page_alloc::alloc_pages_exact(layout),
        }
    }

    unsafe fn free_pages_exact(
        &self,
        _cookie: &C,
        _dev: Option<&DeviceHandle>,
        ptr: NonNull<u8>,
        layout: Layout,
    ) {
        match &self.arena {
            Some(arena) => arena.free(layout),
            // Safety: ensured by caller
            None => unsafe { page_alloc::free_pages_exact(ptr, layout) },
        }
    }
}

/// A bump allocator over one big block. Memory is only reclaimed when the arena goes away.
struct Arena {
    base: NonNull<u8>,
    layout: Layout,
    next: Mutex<usize>,
    outstanding: AtomicUsize,
}

// Safety: the block is exclusively owned by the arena and handed out in disjoint pieces
unsafe impl Send for Arena {}
// Safety: see above, the bump pointer is behind a mutex
unsafe impl Sync for Arena {}

impl Arena {
    fn new(size: usize) -> Self {
        let layout = Layout::from_size_align(size, 64 * crate::KIB).unwrap();
        // Safety: the layout has a non-zero size
        let base = NonNull::new(unsafe { std::alloc::alloc_zeroed(layout) }).unwrap();

        Self {
            base,
            layout,
            next: Mutex::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    fn alloc(&self, layout: Layout) -> Option<NonNull<u8>> {
        let mut next = self.next.lock();
        let offset = next.next_multiple_of(layout.align());
        if offset + layout.size() > self.layout.size() {
            return None;
        }
        *next = offset + layout.size();
        self.outstanding.fetch_add(layout.size(), Ordering::Relaxed);

        // Safety: in bounds of the block, checked above
        Some(unsafe { self.base.add(offset) })
    }

    fn free(&self, layout: Layout) {
        self.outstanding.fetch_sub(layout.size(), Ordering::Relaxed);
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        assert_eq!(
            self.outstanding.load(Ordering::Relaxed),
            0,
            "page table memory leaked from the arena"
        );
        // Safety: allocated in `Arena::new` with the same layout
        unsafe { std::alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// Allocates page table memory until `successes` allocations were made, then fails every
/// further one. Keeps track of how many bytes are still allocated.
pub(crate) struct FailingAlloc {
    remaining: AtomicUsize,
    outstanding: AtomicUsize,
}

impl FailingAlloc {
    pub(crate) fn new(successes: usize) -> Self {
        Self {
            remaining: AtomicUsize::new(successes),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }
}

impl<C> TlbOps<C> for FailingAlloc {
    fn tlb_flush_all(&self, _cookie: &C) {}

    fn tlb_add_flush(&self, _iova: Iova, _size: usize, _granule: usize, _leaf: bool, _cookie: &C) {
    }

    fn tlb_sync(&self, _cookie: &C) {}

    fn alloc_pages_exact(
        &self,
        _cookie: &C,
        _dev: Option<&DeviceHandle>,
        layout: Layout,
        _flags: AllocFlags,
    ) -> Option<NonNull<u8>> {
        self.remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .ok()?;

        let ptr = page_alloc::alloc_pages_exact(layout)?;
        self.outstanding.fetch_add(layout.size(), Ordering::Relaxed);
        Some(ptr)
    }

    unsafe fn free_pages_exact(
        &self,
        _cookie: &C,
        _dev: Option<&DeviceHandle>,
        ptr: NonNull<u8>,
        layout: Layout,
    ) {
        self.outstanding.fetch_sub(layout.size(), Ordering::Relaxed);
        // Safety: ensured by caller
        unsafe { page_alloc::free_pages_exact(ptr, layout) };
    }
}
