// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The concrete table formats.
//!
//! A format only knows how to install, remove and find single mappings in its own encoding
//! ([`PgtableFormat`]). Argument validation, splitting requests into pages, unwinding failed maps
//! and driving the TLB maintenance protocol are shared by all formats and live in
//! [`crate::pgtable`].

#[cfg(feature = "arm-lpae")]
pub(crate) mod arm_lpae;
#[cfg(feature = "arm-v7s")]
pub(crate) mod arm_v7s;
#[cfg(feature = "av8l-fast")]
pub(crate) mod av8l_fast;

use crate::tlb::Gather;
use crate::{IoPgtable, Iova, MapError, PhysicalAddress, Prot};

/// A leaf descriptor found by walking the tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Leaf {
    /// The raw descriptor.
    pub pte: u64,
    /// The physical base of the page or block.
    pub phys: PhysicalAddress,
    /// The number of bytes translated by this descriptor.
    pub size: usize,
}

/// The primitive operations a table format provides.
pub trait PgtableFormat<C>: Send + Sync {
    fn iop(&self) -> &IoPgtable<C>;

    /// Map exactly one page of `size` bytes, `size` being one of the configured page sizes and
    /// `iova` and `paddr` being aligned to it.
    ///
    /// # Errors
    ///
    /// Returns [`MapError::Exists`] if the page overlaps an existing mapping and
    /// [`MapError::Alloc`] if an intermediate table could not be allocated.
    fn map_page(
        &self,
        iova: Iova,
        paddr: PhysicalAddress,
        size: usize,
        prot: Prot,
        gather: &mut Gather,
    ) -> Result<(), MapError>;

    /// Remove the mapping of the `size` bytes at `iova`, splitting larger blocks as needed.
    ///
    /// Returns the number of bytes removed. Removal stops at the first hole, so this is less than
    /// `size` if the range was not completely mapped.
    fn unmap_page(&self, iova: Iova, size: usize, gather: &mut Gather) -> usize;

    /// Find the leaf descriptor translating `iova`.
    fn lookup(&self, iova: Iova) -> Option<Leaf>;

    /// Whether the leaf descriptor `pte` maps memory coherently with the CPU caches.
    fn is_coherent(&self, pte: u64) -> bool;
}

/// Maps a page of `size` bytes as pages of the next smaller configured size, for when the slot it
/// would occupy already links a lower-level table.
///
/// Linked tables are only ever released when the page table is torn down, as another thread may
/// still be walking them. Anything mapped here is taken back again on failure.
pub(crate) fn map_below<C, F>(
    pgtable: &F,
    iova: Iova,
    paddr: PhysicalAddress,
    size: usize,
    prot: Prot,
    gather: &mut Gather,
) -> Result<(), MapError>
where
    F: PgtableFormat<C> + ?Sized,
{
    let Some(chunk) = smaller_page(pgtable, iova, size) else {
        return Err(MapError::Exists);
    };

    for offset in (0..size).step_by(chunk) {
        let res = pgtable.map_page(iova.add(offset), paddr.add(offset), chunk, prot, gather);

        if let Err(err) = res {
            for done in (0..offset).step_by(chunk) {
                pgtable.unmap_page(iova.add(done), chunk, gather);
            }
            return Err(err);
        }
    }

    Ok(())
}

/// Unmaps `size` bytes below a slot that links a lower-level table, in pages of the next smaller
/// configured size. The table itself stays linked.
pub(crate) fn unmap_below<C, F>(
    pgtable: &F,
    iova: Iova,
    size: usize,
    gather: &mut Gather,
) -> usize
where
    F: PgtableFormat<C> + ?Sized,
{
    let Some(chunk) = smaller_page(pgtable, iova, size) else {
        return 0;
    };

    let mut unmapped = 0;
    while unmapped < size {
        let n = pgtable.unmap_page(iova.add(unmapped), chunk, gather);
        unmapped += n;
        if n < chunk {
            break;
        }
    }

    unmapped
}

/// The largest configured page size below `size` that `iova` is aligned to.
fn smaller_page<C, F>(pgtable: &F, iova: Iova, size: usize) -> Option<usize>
where
    F: PgtableFormat<C> + ?Sized,
{
    pgtable
        .iop()
        .cfg()
        .page_sizes
        .best_fit(iova.get(), size - 1)
}
