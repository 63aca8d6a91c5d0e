// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::alloc::Layout;
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use crate::error::ensure;
use crate::format::PgtableFormat;
use crate::page_alloc::{self, AllocFlags};
use crate::tlb::Gather;
use crate::{
    AllocError, FormatCfg, IoPgtableCfg, Iova, MapError, MapSgError, PhysMap, PhysicalAddress,
    Prot, Quirks,
};

/// The page table formats. Each one is a different hardware encoding of the translation tables.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Format {
    /// ARM long-descriptor, 32-bit (LPAE) stage 1.
    ArmLpae32S1 = 0,
    /// ARM long-descriptor, 32-bit (LPAE) stage 2.
    ArmLpae32S2 = 1,
    /// ARM long-descriptor, AArch64 stage 1.
    ArmLpae64S1 = 2,
    /// ARM long-descriptor, AArch64 stage 2.
    ArmLpae64S2 = 3,
    /// ARM v7 short-descriptor.
    ArmV7s = 4,
    /// AArch64 stage 1 with every table preallocated, so that map and unmap never allocate.
    ///
    /// Not part of the regular enumeration.
    Av8lFast = u32::MAX,
}

impl Format {
    /// The number of regular formats, [`Format::Av8lFast`] excluded.
    pub const NUM_FORMATS: usize = 5;

    pub const fn name(&self) -> &'static str {
        match self {
            Format::ArmLpae32S1 => "ARM 32-bit LPAE stage 1",
            Format::ArmLpae32S2 => "ARM 32-bit LPAE stage 2",
            Format::ArmLpae64S1 => "ARM 64-bit LPAE stage 1",
            Format::ArmLpae64S2 => "ARM 64-bit LPAE stage 2",
            Format::ArmV7s => "ARM v7 short descriptor",
            Format::Av8lFast => "AArch64 fast",
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One physically contiguous segment of a scatter-gather list.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SgEntry {
    pub phys: PhysicalAddress,
    pub len: usize,
}

impl SgEntry {
    pub const fn new(phys: PhysicalAddress, len: usize) -> Self {
        Self { phys, len }
    }
}

/// The operations every page table format provides.
///
/// Obtained from [`alloc_io_pgtable_ops`](crate::alloc_io_pgtable_ops) and released through
/// [`free_io_pgtable_ops`](crate::free_io_pgtable_ops). Callers never need to know which format
/// is in effect.
///
/// Calls may be issued from several threads at once. The tables themselves are never corrupted by
/// that, but the outcome of concurrent calls touching overlapping IOVA ranges is unspecified;
/// serialise those if it matters.
pub trait IoPgtableOps<C>: Send + Sync {
    /// Map the physically contiguous range `paddr..paddr + size` at `iova`.
    ///
    /// The range is split into the largest page sizes allowed by the alignment of `iova` and
    /// `paddr`. A `prot` allowing neither reads nor writes maps nothing, unless the table ignores
    /// permissions altogether ([`Quirks::NO_PERMS`]).
    ///
    /// # Errors
    ///
    /// Fails if the arguments are misaligned or out of range, if part of the range is already
    /// mapped, or if an intermediate table cannot be allocated. Nothing stays mapped on error.
    fn map(&self, iova: Iova, paddr: PhysicalAddress, size: usize, prot: Prot)
    -> Result<(), MapError>;

    /// Unmap up to `size` bytes at `iova` and return the number of bytes actually unmapped.
    ///
    /// Unmapping stops at the first hole, so a short count means the rest of the range was not
    /// mapped (or not mapped at this alignment) and may need a follow-up call. All invalidations
    /// have completed by the time this returns.
    fn unmap(&self, iova: Iova, size: usize) -> usize;

    /// Map each scatter-gather segment in turn, at consecutive IOVAs starting at `iova`. Returns
    /// the total number of bytes mapped.
    ///
    /// # Errors
    ///
    /// Stops at the first segment that cannot be mapped. The segments before it stay mapped and
    /// [`MapSgError::mapped`] reports their total size.
    fn map_sg(&self, iova: Iova, sg: &[SgEntry], prot: Prot) -> Result<usize, MapSgError>;

    /// Translate `iova` by walking the tables, `None` if it is not mapped.
    fn iova_to_phys(&self, iova: Iova) -> Option<PhysicalAddress>;

    /// Returns `true` if device accesses through `iova` are coherent with the CPU caches. Unmapped
    /// addresses are reported as non-coherent.
    fn is_iova_coherent(&self, iova: Iova) -> bool;

    /// Returns the raw last-level descriptor translating `iova`, or `0` if it is not mapped.
    ///
    /// The encoding depends on the format and is only useful for diagnostics.
    fn iova_to_pte(&self, iova: Iova) -> u64;

    /// The page table state shared by all formats.
    fn io_pgtable(&self) -> &IoPgtable<C>;
}

/// The state of one page table instance that is common to all formats.
pub struct IoPgtable<C> {
    fmt: Format,
    cookie: C,
    cfg: IoPgtableCfg<C>,
    iova_range: Range<Iova>,
}

impl<C> IoPgtable<C> {
    pub(crate) fn new(fmt: Format, cookie: C, cfg: IoPgtableCfg<C>) -> Self {
        let iova_range = cfg.effective_iova_range();

        Self {
            fmt,
            cookie,
            cfg,
            iova_range,
        }
    }

    pub const fn fmt(&self) -> Format {
        self.fmt
    }

    /// The caller's cookie, passed to every [`TlbOps`](crate::TlbOps) callback.
    pub const fn cookie(&self) -> &C {
        &self.cookie
    }

    /// The configuration as granted by the allocator.
    pub const fn cfg(&self) -> &IoPgtableCfg<C> {
        &self.cfg
    }

    pub(crate) fn set_format_cfg(&mut self, format_cfg: FormatCfg) {
        self.cfg.format_cfg = Some(format_cfg);
    }

    pub(crate) fn quirks(&self) -> Quirks {
        self.cfg.quirks
    }

    pub(crate) fn physmap(&self) -> &PhysMap {
        &self.cfg.physmap
    }

    pub(crate) fn tlb_flush_all(&self) {
        if let Some(tlb) = &self.cfg.tlb {
            tlb.tlb_flush_all(&self.cookie);
        }
    }

    pub(crate) fn tlb_add_flush(&self, iova: Iova, size: usize, granule: usize, leaf: bool) {
        if let Some(tlb) = &self.cfg.tlb {
            tlb.tlb_add_flush(iova, size, granule, leaf, &self.cookie);
        }
    }

    pub(crate) fn tlb_sync(&self) {
        if let Some(tlb) = &self.cfg.tlb {
            tlb.tlb_sync(&self.cookie);
        }
    }

    pub(crate) fn table_barrier(&self) {
        page_alloc::table_barrier(self.cfg.quirks);
    }

    /// Allocate zeroed table memory through the accounted allocation path.
    pub(crate) fn alloc_pages(
        &self,
        layout: Layout,
        flags: AllocFlags,
    ) -> Result<NonNull<u8>, AllocError> {
        page_alloc::alloc_table(
            self.cfg.tlb.as_deref(),
            &self.cookie,
            self.cfg.iommu_dev.as_ref(),
            layout,
            flags,
            self.cfg.quirks,
        )
    }

    /// # Safety
    ///
    /// `table` must have been allocated through [`Self::alloc_pages`] with the same `layout` and
    /// must no longer be reachable by the walker.
    pub(crate) unsafe fn free_pages(&self, table: NonNull<u8>, layout: Layout) {
        // Safety: ensured by caller
        unsafe {
            page_alloc::free_table(
                self.cfg.tlb.as_deref(),
                &self.cookie,
                self.cfg.iommu_dev.as_ref(),
                table,
                layout,
            );
        }
    }

    fn check_iova(&self, iova: Iova, size: usize) -> Result<(), MapError> {
        let end = iova.checked_add(size).ok_or(MapError::OutOfRange)?;
        ensure!(
            iova >= self.iova_range.start && end <= self.iova_range.end,
            MapError::OutOfRange
        );
        Ok(())
    }

    fn check_map_args(
        &self,
        iova: Iova,
        paddr: PhysicalAddress,
        size: usize,
    ) -> Result<(), MapError> {
        let granule = self
            .cfg
            .page_sizes
            .min_granule()
            .ok_or(MapError::Misaligned)?;
        ensure!(
            (iova.get() | paddr.get() | size) & (granule - 1) == 0,
            MapError::Misaligned
        );

        self.check_iova(iova, size)?;

        let end = paddr.checked_add(size).ok_or(MapError::OutOfRange)?;
        ensure!(
            size == 0 || end.sub(1).fits_in_bits(self.cfg.oas),
            MapError::OutOfRange
        );

        Ok(())
    }

    fn check_unmap_args(&self, iova: Iova, size: usize) -> Result<(), MapError> {
        let granule = self
            .cfg
            .page_sizes
            .min_granule()
            .ok_or(MapError::Misaligned)?;
        ensure!(
            (iova.get() | size) & (granule - 1) == 0,
            MapError::Misaligned
        );

        self.check_iova(iova, size)
    }

    /// Without [`Quirks::NO_PERMS`], mappings that allow neither reads nor writes are dropped.
    fn maps_anything(&self, prot: Prot) -> bool {
        prot.is_accessible() || self.cfg.quirks.contains(Quirks::NO_PERMS)
    }

    fn flush_on_map(&self, gather: &mut Gather, iova: Iova, size: usize) {
        if size > 0 && self.cfg.quirks.contains(Quirks::TLBI_ON_MAP) {
            let granule = self.cfg.page_sizes.min_granule().unwrap_or(size);
            gather.add_flush(iova, size, granule, false);
        }
    }
}

impl<C> fmt::Debug for IoPgtable<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoPgtable")
            .field("fmt", &self.fmt)
            .field("cfg", &self.cfg)
            .field("iova_range", &self.iova_range)
            .finish_non_exhaustive()
    }
}

fn map_pages<C, F>(
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
    let page_sizes = pgtable.iop().cfg.page_sizes;
    let mut mapped = 0;

    while mapped < size {
        let cur_iova = iova.add(mapped);
        let cur_paddr = paddr.add(mapped);

        let res = page_sizes
            .best_fit(cur_iova.get() | cur_paddr.get(), size - mapped)
            .ok_or(MapError::Misaligned)
            .and_then(|pgsize| {
                pgtable.map_page(cur_iova, cur_paddr, pgsize, prot, gather)?;
                Ok(pgsize)
            });

        match res {
            Ok(pgsize) => mapped += pgsize,
            Err(err) => {
                log::debug!("failed to map {cur_iova} -> {cur_paddr}: {err}");

                // leave nothing of this call behind
                if mapped > 0 {
                    let unmapped = unmap_pages(pgtable, iova, mapped, gather);
                    if unmapped != mapped {
                        log::warn!("only took back {unmapped:#x} of {mapped:#x} bytes at {iova}");
                    }
                }

                return Err(err);
            }
        }
    }

    Ok(())
}

fn unmap_pages<C, F>(pgtable: &F, iova: Iova, size: usize, gather: &mut Gather) -> usize
where
    F: PgtableFormat<C> + ?Sized,
{
    let page_sizes = pgtable.iop().cfg.page_sizes;
    let mut unmapped = 0;

    while unmapped < size {
        let cur_iova = iova.add(unmapped);

        let Some(pgsize) = page_sizes.best_fit(cur_iova.get(), size - unmapped) else {
            break;
        };

        let n = pgtable.unmap_page(cur_iova, pgsize, gather);
        unmapped += n;
        if n < pgsize {
            break;
        }
    }

    unmapped
}

impl<C, F> IoPgtableOps<C> for F
where
    F: PgtableFormat<C>,
{
    fn map(
        &self,
        iova: Iova,
        paddr: PhysicalAddress,
        size: usize,
        prot: Prot,
    ) -> Result<(), MapError> {
        let iop = self.iop();
        iop.check_map_args(iova, paddr, size)?;

        if !iop.maps_anything(prot) {
            log::trace!("ignoring map of {iova} without read or write permission");
            return Ok(());
        }

        log::trace!("map {iova} -> {paddr} size={size:#x} prot={prot:?}");

        let mut gather = Gather::new();
        let res = map_pages(self, iova, paddr, size, prot, &mut gather);
        if res.is_ok() {
            iop.flush_on_map(&mut gather, iova, size);
        }
        gather.finish(iop);

        res
    }

    fn unmap(&self, iova: Iova, size: usize) -> usize {
        let iop = self.iop();
        if let Err(err) = iop.check_unmap_args(iova, size) {
            log::warn!("rejecting unmap of {size:#x} bytes at {iova}: {err}");
            return 0;
        }

        log::trace!("unmap {iova} size={size:#x}");

        let mut gather = Gather::new();
        let unmapped = unmap_pages(self, iova, size, &mut gather);
        gather.finish(iop);

        if unmapped == 0 && size > 0 {
            log::warn!("unmap of {size:#x} bytes at {iova} found nothing mapped");
        }

        unmapped
    }

    fn map_sg(&self, iova: Iova, sg: &[SgEntry], prot: Prot) -> Result<usize, MapSgError> {
        let iop = self.iop();
        let mut gather = Gather::new();
        let mut mapped = 0;

        for entry in sg {
            let res = iova
                .checked_add(mapped)
                .ok_or(MapError::OutOfRange)
                .and_then(|cur_iova| {
                    iop.check_map_args(cur_iova, entry.phys, entry.len)?;
                    if iop.maps_anything(prot) {
                        map_pages(self, cur_iova, entry.phys, entry.len, prot, &mut gather)?;
                    }
                    Ok(())
                });

            if let Err(error) = res {
                log::debug!("map_sg stopped after {mapped:#x} bytes: {error}");
                if iop.maps_anything(prot) {
                    iop.flush_on_map(&mut gather, iova, mapped);
                }
                gather.finish(iop);

                return Err(MapSgError { mapped, error });
            }

            mapped += entry.len;
        }

        if iop.maps_anything(prot) {
            iop.flush_on_map(&mut gather, iova, mapped);
        }
        gather.finish(iop);

        Ok(mapped)
    }

    fn iova_to_phys(&self, iova: Iova) -> Option<PhysicalAddress> {
        if !self.iop().iova_range.contains(&iova) {
            return None;
        }

        let leaf = self.lookup(iova)?;
        Some(leaf.phys.add(iova.get() & (leaf.size - 1)))
    }

    fn is_iova_coherent(&self, iova: Iova) -> bool {
        if !self.iop().iova_range.contains(&iova) {
            return false;
        }

        self.lookup(iova)
            .is_some_and(|leaf| self.is_coherent(leaf.pte))
    }

    fn iova_to_pte(&self, iova: Iova) -> u64 {
        if !self.iop().iova_range.contains(&iova) {
            return 0;
        }

        self.lookup(iova).map_or(0, |leaf| leaf.pte)
    }

    fn io_pgtable(&self) -> &IoPgtable<C> {
        self.iop()
    }
}
