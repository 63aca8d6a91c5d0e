// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::{PhysMap, PhysicalAddress};

/// A raw hardware descriptor that can be read and written atomically in place.
pub trait RawPte: Copy + Eq + core::fmt::Debug {
    /// The all-zero, invalid descriptor.
    const VACANT: Self;

    /// # Safety
    ///
    /// `ptr` must be valid for reads and naturally aligned.
    unsafe fn load(ptr: *mut Self) -> Self;

    /// # Safety
    ///
    /// `ptr` must be valid for writes and naturally aligned.
    unsafe fn store(ptr: *mut Self, pte: Self);

    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes and naturally aligned.
    unsafe fn compare_exchange(ptr: *mut Self, current: Self, new: Self) -> Result<Self, Self>;

    /// Widens the descriptor for diagnostic output.
    fn to_u64(self) -> u64;
}

impl RawPte for u64 {
    const VACANT: Self = 0;

    unsafe fn load(ptr: *mut Self) -> Self {
        // Safety: ensured by caller
        unsafe { AtomicU64::from_ptr(ptr).load(Ordering::Acquire) }
    }

    unsafe fn store(ptr: *mut Self, pte: Self) {
        // Safety: ensured by caller
        unsafe { AtomicU64::from_ptr(ptr).store(pte, Ordering::Release) }
    }

    unsafe fn compare_exchange(ptr: *mut Self, current: Self, new: Self) -> Result<Self, Self> {
        // Safety: ensured by caller
        unsafe {
            AtomicU64::from_ptr(ptr).compare_exchange(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
        }
    }

    fn to_u64(self) -> u64 {
        self
    }
}

impl RawPte for u32 {
    const VACANT: Self = 0;

    unsafe fn load(ptr: *mut Self) -> Self {
        // Safety: ensured by caller
        unsafe { AtomicU32::from_ptr(ptr).load(Ordering::Acquire) }
    }

    unsafe fn store(ptr: *mut Self, pte: Self) {
        // Safety: ensured by caller
        unsafe { AtomicU32::from_ptr(ptr).store(pte, Ordering::Release) }
    }

    unsafe fn compare_exchange(ptr: *mut Self, current: Self, new: Self) -> Result<Self, Self> {
        // Safety: ensured by caller
        unsafe {
            AtomicU32::from_ptr(ptr).compare_exchange(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
        }
    }

    fn to_u64(self) -> u64 {
        u64::from(self)
    }
}

/// A page table. Essentially a fixed-sized list of `P`s living in table memory.
///
/// Entries are only ever accessed atomically, so a `Table` is a plain view that can be freely
/// copied. Keeping the memory alive is up to the page table owning it.
#[derive(Debug)]
pub struct Table<P> {
    base: NonNull<P>,
    entries: usize,
}

impl<P> Clone for Table<P> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P> Copy for Table<P> {}

impl<P: RawPte> Table<P> {
    /// Constructs a `Table` from its raw components: the base pointer and its number of entries.
    ///
    /// # Safety
    ///
    /// 1. `base` must point to `entries` naturally aligned descriptors.
    /// 2. The memory must stay valid for as long as this `Table` (or a copy of it) is used.
    pub const unsafe fn from_raw_parts(base: NonNull<P>, entries: usize) -> Self {
        Self { base, entries }
    }

    /// Constructs a `Table` from the physical address stored in a table descriptor.
    ///
    /// # Safety
    ///
    /// The same requirements as for [`Self::from_raw_parts`] apply to the memory `physmap`
    /// translates `phys` to.
    #[allow(
        clippy::cast_ptr_alignment,
        reason = "table memory is always aligned to the table size"
    )]
    pub unsafe fn from_phys(physmap: &PhysMap, phys: PhysicalAddress, entries: usize) -> Self {
        let ptr = physmap.phys_to_virt(phys).cast::<P>();
        debug_assert!(!ptr.is_null());

        // Safety: ensured by caller
        unsafe { Self::from_raw_parts(NonNull::new_unchecked(ptr), entries) }
    }

    pub const fn entries(&self) -> usize {
        self.entries
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.base.cast()
    }

    /// The memory layout of a table with `entries` descriptors of type `P`, aligned to its size.
    pub fn layout(entries: usize) -> Layout {
        let size = entries * size_of::<P>();
        debug_assert!(size.is_power_of_two());

        // Safety: `size` is a non-zero power of two and therefore a valid alignment
        unsafe { Layout::from_size_align_unchecked(size, size) }
    }

    fn entry_ptr(&self, index: usize) -> *mut P {
        assert!(
            index < self.entries,
            "entry index {index} out of bounds ({})",
            self.entries
        );

        // Safety: `index` is in-bounds, checked above
        unsafe { self.base.as_ptr().add(index) }
    }

    /// Returns the descriptor at `index`.
    pub fn get(&self, index: usize) -> P {
        // Safety: `entry_ptr` only produces in-bounds, aligned pointers into live table memory
        unsafe { P::load(self.entry_ptr(index)) }
    }

    /// Overrides the descriptor at `index`.
    pub fn set(&self, index: usize, pte: P) {
        // Safety: `entry_ptr` only produces in-bounds, aligned pointers into live table memory
        unsafe { P::store(self.entry_ptr(index), pte) }
    }

    /// Replaces the descriptor at `index` with `new` if it still holds `current`.
    ///
    /// # Errors
    ///
    /// Returns the descriptor actually found if it did not match `current`.
    pub fn compare_exchange(&self, index: usize, current: P, new: P) -> Result<P, P> {
        // Safety: `entry_ptr` only produces in-bounds, aligned pointers into live table memory
        unsafe { P::compare_exchange(self.entry_ptr(index), current, new) }
    }
}
