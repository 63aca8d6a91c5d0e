// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::ptr;

use crate::PhysicalAddress;

/// Describes how page table memory, which the CPU accesses through pointers, relates to the
/// physical addresses the IOMMU walks. Table descriptors always store the physical address of the
/// next-level table, and walking the tables from the CPU side translates those back.
///
/// The default is the identity mapping, which is what hosted environments and kernels with a
/// 1:1 mapped physical memory region want.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct PhysMap {
    translation_offset: isize,
}

impl PhysMap {
    /// The identity mapping: a pointer's address is its physical address.
    pub const fn identity() -> Self {
        Self {
            translation_offset: 0,
        }
    }

    /// Construct a new `PhysMap` where CPU address `virt_base` corresponds to physical address
    /// `phys_base`.
    pub fn new(virt_base: usize, phys_base: PhysicalAddress) -> Self {
        #[expect(
            clippy::cast_possible_wrap,
            reason = "this is expected to wrap when the virtual base lies above the physical base"
        )]
        let translation_offset = virt_base.wrapping_sub(phys_base.get()) as isize;

        Self { translation_offset }
    }

    /// Translates a `PhysicalAddress` into a pointer the CPU can use to access table memory.
    #[inline]
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> *mut u8 {
        ptr::with_exposed_provenance_mut(phys.wrapping_offset(self.translation_offset).get())
    }

    /// Translates a pointer to table memory into the `PhysicalAddress` stored in descriptors.
    #[inline]
    pub fn virt_to_phys(&self, virt: *const u8) -> PhysicalAddress {
        PhysicalAddress::new(virt.expose_provenance())
            .wrapping_offset(self.translation_offset.wrapping_neg())
    }
}
