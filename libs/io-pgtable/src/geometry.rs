// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The shape of a table hierarchy: how many levels, how many entries each and how much of the
//! address space one entry covers.

use core::marker::PhantomData;

use arrayvec::ArrayVec;

use crate::{Iova, PhysicalAddress};

#[derive(Debug, Clone)]
pub struct TableGeometry {
    /// Levels ordered from the root to the last level.
    levels: ArrayVec<PageTableLevel, 4>,
    input_address_bits: u32,
}

impl TableGeometry {
    pub fn level(&self, depth: usize) -> &PageTableLevel {
        &self.levels[depth]
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    /// The number of IOVA bits resolved by the whole hierarchy.
    pub const fn input_address_bits(&self) -> u32 {
        self.input_address_bits
    }

    /// Returns the depth of the level whose entries map `size` bytes.
    pub fn depth_of(&self, size: usize) -> Option<usize> {
        self.levels
            .iter()
            .position(|level| level.page_size() == size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageTableLevel {
    /// The number of entries in this page table level
    entries: usize,
    /// Whether entries at this level may map memory directly, rather than only pointing to the
    /// next level.
    supports_leaf: bool,
    /// The number of bits we need to right-shift an [`Iova`] by to
    /// obtain its PTE index for this level. Used by [`Self::pte_index_of`].
    index_shift: u32,
}

impl PageTableLevel {
    /// Returns the number of page table entries of a table at this level.
    ///
    /// Root tables may differ from the rest: they only hold the index bits left over by the lower
    /// levels, or several concatenated tables worth of entries.
    pub const fn entries(&self) -> usize {
        self.entries
    }

    /// The size in bytes of the memory region covered by a page table entry at this level.
    ///
    /// For example, with a 4KiB granule and 512 entries per level:
    /// - last level: 4KiB (2^12)
    /// - one above: 2MiB (2^21)
    /// - two above: 1GiB (2^30)
    pub const fn page_size(&self) -> usize {
        1 << self.index_shift
    }

    /// Extracts the page table entry (PTE) index for a table at this level from the given address.
    pub fn pte_index_of(&self, iova: Iova) -> usize {
        let idx = (iova.get() >> self.index_shift) & (self.entries - 1);
        debug_assert!(idx < self.entries);
        idx
    }

    pub const fn can_map(&self, iova: Iova, phys: PhysicalAddress, len: usize) -> bool {
        let page_size = self.page_size();
        iova.is_aligned_to(page_size)
            && phys.is_aligned_to(page_size)
            && len >= page_size
            && self.supports_leaf
    }
}

/// Used to indicate that a partially-constructed [`TableGeometry`] has no levels yet.
pub struct MissingLevels;

/// Used to indicate that a partially-constructed [`TableGeometry`] has its page tables levels set.
pub struct HasLevels;

pub struct GeometryBuilder<Levels> {
    under_construction: TableGeometry,
    _has: PhantomData<Levels>,
}

impl GeometryBuilder<MissingLevels> {
    pub fn new() -> Self {
        GeometryBuilder {
            under_construction: TableGeometry {
                levels: ArrayVec::new(),
                input_address_bits: 0,
            },
            _has: PhantomData,
        }
    }
}

impl<Levels> GeometryBuilder<Levels> {
    pub fn with_level(
        mut self,
        page_size: usize,
        entries: usize,
        supports_leaf: bool,
    ) -> GeometryBuilder<HasLevels> {
        debug_assert!(page_size.is_power_of_two() && entries.is_power_of_two());

        let lvl = PageTableLevel {
            entries,
            supports_leaf,
            index_shift: page_size.ilog2(),
        };

        assert!(
            self.under_construction.levels.try_push(lvl).is_ok(),
            "too many page table levels"
        );

        GeometryBuilder {
            under_construction: self.under_construction,
            _has: PhantomData,
        }
    }
}

impl GeometryBuilder<HasLevels> {
    pub fn finish(self) -> TableGeometry {
        let mut result = self.under_construction;

        result
            .levels
            .sort_unstable_by_key(|level| core::cmp::Reverse(level.index_shift));

        let root = &result.levels[0];
        result.input_address_bits = root.entries.ilog2() + root.index_shift;

        result
    }
}
