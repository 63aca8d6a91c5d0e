// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! ARM long-descriptor (LPAE) translation tables, for both the AArch32 and AArch64 flavours of
//! stage 1 and stage 2 translation.
//!
//! The tables use 4KiB, 16KiB or 64KiB granules with 8 byte descriptors. Every level but the last
//! may hold either a table or a block descriptor, the last level holds page descriptors. The root
//! level only resolves the index bits left over by the lower levels; for stage 2 several root
//! tables may be concatenated to save a level of walk.

use alloc::boxed::Box;
use core::alloc::Layout;
use core::ptr::NonNull;

use crate::config::{ArmLpaeS1Cfg, ArmLpaeS2Cfg};
use crate::error::ensure;
use crate::format::{Leaf, PgtableFormat, map_below, unmap_below};
use crate::geometry::{GeometryBuilder, TableGeometry};
use crate::page_alloc::AllocFlags;
use crate::table::{RawPte, Table};
use crate::tlb::Gather;
use crate::{
    AllocError, ConfigError, Format, FormatCfg, GIB, IoPgtable, IoPgtableCfg, IoPgtableOps, Iova,
    KIB, MIB, MapError, PageSizes, PhysicalAddress, Prot, Quirks,
};

/// Descriptor output addresses are limited to 48 bits.
pub(crate) const MAX_ADDR_BITS: u32 = 48;
/// Stage 2 may concatenate up to this many root tables instead of adding a level.
const S2_MAX_CONCAT_PAGES: usize = 16;

mycelium_bitfield::bitfield! {
    /// A stage 1 descriptor. Table descriptors only use `VALID`, `TABLE`, `ADDRESS` and
    /// `NSTABLE`.
    pub(crate) struct S1Descriptor<u64> {
        const VALID: bool;
        /// Set for table descriptors and for pages at the last level, clear for blocks.
        const TABLE: bool;
        /// Index into the MAIR register, see [`MairAttr`].
        const ATTR_INDX = 3;
        /// The output address is in the non-secure address space.
        const NS: bool;
        /// Accessible from unprivileged accesses.
        const AP_UNPRIV: bool;
        const AP_RDONLY: bool;
        const SH = 2;
        /// Access flag, faults on first access when clear.
        const AF: bool;
        /// Not global, the translation is tagged with the context's ASID.
        const NG: bool;
        /// Bits 12..48 of the output address, or of the next-level table.
        const ADDRESS = 36;
        const _RES0 = 4;
        const CONT: bool;
        const PXN: bool;
        const XN: bool;
        const _IGNORED = 8;
        /// The next-level table is in the non-secure address space.
        const NSTABLE: bool;
    }
}

mycelium_bitfield::bitfield! {
    /// A stage 2 leaf descriptor.
    pub(crate) struct S2Descriptor<u64> {
        const VALID: bool;
        const TABLE: bool;
        const MEM_ATTR = 4;
        const S2AP_READ: bool;
        const S2AP_WRITE: bool;
        const SH = 2;
        const AF: bool;
        const _RES0 = 1;
        const ADDRESS = 36;
        const _RES1 = 4;
        const CONT: bool;
        const _RES2 = 1;
        const XN: bool;
    }
}

mycelium_bitfield::bitfield! {
    /// Stage 1 translation control register (TCR / TTBCR).
    pub(crate) struct Tcr<u64> {
        const T0SZ = 6;
        const _RES0 = 1;
        const EPD0: bool;
        const IRGN0 = 2;
        const ORGN0 = 2;
        const SH0 = 2;
        const TG0 = 2;
        const T1SZ = 6;
        const A1: bool;
        /// Disable walks through TTBR1.
        const EPD1: bool;
        const IRGN1 = 2;
        const ORGN1 = 2;
        const SH1 = 2;
        const TG1 = 2;
        const IPS = 3;
    }
}

mycelium_bitfield::bitfield! {
    /// Stage 2 translation control register (VTCR).
    pub(crate) struct Vtcr<u64> {
        const T0SZ = 6;
        /// Starting level of the walk, encoding depends on the granule.
        const SL0 = 2;
        const IRGN0 = 2;
        const ORGN0 = 2;
        const SH0 = 2;
        const TG0 = 2;
        const PS = 3;
        const _RES0 = 12;
        const RES1: bool;
    }
}

// shareability
const SH_NS: u64 = 0;
const SH_OS: u64 = 2;
const SH_IS: u64 = 3;

// cacheability of table walks
const RGN_NC: u64 = 0;
const RGN_WBWA: u64 = 1;
const RGN_WB: u64 = 3;

/// TCR.EAE, selects the long-descriptor format on AArch32.
const TTBCR_EAE: u64 = 1 << 31;

// stage 2 memory attributes
const MEMATTR_OIWB: u64 = 0xf;
const MEMATTR_NC: u64 = 0x5;
const MEMATTR_DEV: u64 = 0x1;

/// The attribute slots we program into MAIR, and reference from stage 1 leaves.
#[repr(u64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum MairAttr {
    NonCacheable = 0,
    Cached = 1,
    Device = 2,
    UpstreamHint = 3,
    LlcNoWriteAllocate = 4,
}

impl MairAttr {
    const fn encoding(self) -> u64 {
        match self {
            MairAttr::NonCacheable => 0x44,
            MairAttr::Cached => 0xff,
            MairAttr::Device => 0x04,
            MairAttr::UpstreamHint => 0xf4,
            MairAttr::LlcNoWriteAllocate => 0xe4,
        }
    }

    const fn mair() -> u64 {
        let attrs = [
            MairAttr::NonCacheable,
            MairAttr::Cached,
            MairAttr::Device,
            MairAttr::UpstreamHint,
            MairAttr::LlcNoWriteAllocate,
        ];

        let mut mair = 0;
        let mut i = 0;
        while i < attrs.len() {
            mair |= attrs[i].encoding() << (8 * attrs[i] as u64);
            i += 1;
        }
        mair
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Stage {
    S1,
    S2,
}

/// Leaf tables carved out of one contiguous allocation instead of being allocated one by one.
#[derive(Debug)]
pub(crate) struct Prealloc {
    pub(crate) block: NonNull<u8>,
    pub(crate) layout: Layout,
}

pub(crate) struct ArmLpae<C> {
    iop: IoPgtable<C>,
    stage: Stage,
    geometry: TableGeometry,
    granule: usize,
    pgd: Table<u64>,
    pgd_layout: Layout,
    prealloc: Option<Prealloc>,
}

// Safety: all descriptor accesses go through atomics and table memory is owned by the page table,
// so it may be shared and sent across threads as long as the cookie can.
unsafe impl<C: Send> Send for ArmLpae<C> {}
// Safety: see above
unsafe impl<C: Sync> Sync for ArmLpae<C> {}

/// Picks the translation granule from the requested page sizes and narrows them to what that
/// granule provides.
///
/// 4KiB is preferred, then the largest size below it, then the smallest size above it.
pub(crate) fn restrict_page_sizes(requested: PageSizes) -> PageSizes {
    const PAGE_SIZE: usize = 4 * KIB;
    let bits = requested.bits();

    let granule = if bits & PAGE_SIZE != 0 {
        PAGE_SIZE
    } else if bits & (PAGE_SIZE - 1) != 0 {
        1 << (bits & (PAGE_SIZE - 1)).ilog2()
    } else if bits & !(PAGE_SIZE - 1) != 0 {
        1 << (bits & !(PAGE_SIZE - 1)).trailing_zeros()
    } else {
        0
    };

    let supported = match granule {
        granule if granule == 4 * KIB => PageSizes::from_iter([4 * KIB, 2 * MIB, GIB]),
        granule if granule == 16 * KIB => PageSizes::from_iter([16 * KIB, 32 * MIB]),
        granule if granule == 64 * KIB => PageSizes::from_iter([64 * KIB, 512 * MIB]),
        _ => PageSizes::EMPTY,
    };

    requested.intersection(supported)
}

/// The encoding of an output address size in TCR.IPS and VTCR.PS.
fn encode_output_size(oas: u32) -> Result<u64, ConfigError> {
    match oas {
        32 => Ok(0),
        36 => Ok(1),
        40 => Ok(2),
        42 => Ok(3),
        44 => Ok(4),
        48 => Ok(5),
        bits => Err(ConfigError::OutputAddressSize { bits }),
    }
}

/// Lays out the levels for a walk of `ias` bits with a granule of `1 << pg_shift` bytes.
pub(crate) fn build_geometry(
    ias: u32,
    pg_shift: u32,
    page_sizes: PageSizes,
    stage: Stage,
) -> TableGeometry {
    let bits_per_level = pg_shift - 3;
    let va_bits = ias - pg_shift;
    let mut levels = va_bits.div_ceil(bits_per_level);
    let mut pgd_bits = va_bits - bits_per_level * (levels - 1);

    // concatenate root tables rather than walking a fourth level
    if stage == Stage::S2 && levels == 4 && (1 << pgd_bits) <= S2_MAX_CONCAT_PAGES {
        log::debug!("concatenating {} stage 2 root tables", 1usize << pgd_bits);
        levels -= 1;
        pgd_bits += bits_per_level;
    }

    let mut builder = GeometryBuilder::new().with_level(
        1 << (pg_shift + bits_per_level * (levels - 1)),
        1 << pgd_bits,
        page_sizes.contains(1 << (pg_shift + bits_per_level * (levels - 1))),
    );

    for lvl in 1..levels {
        let page_size = 1 << (pg_shift + bits_per_level * (levels - 1 - lvl));
        builder = builder.with_level(page_size, 1 << bits_per_level, page_sizes.contains(page_size));
    }

    let geometry = builder.finish();
    debug_assert_eq!(geometry.input_address_bits(), ias);
    geometry
}

pub(crate) struct Validated {
    pub(crate) page_sizes: PageSizes,
    pub(crate) pg_shift: u32,
    pub(crate) ips: u64,
}

pub(crate) fn validate<C>(
    cfg: &IoPgtableCfg<C>,
    supported_quirks: Quirks,
    max_ias: u32,
    max_oas: u32,
) -> Result<Validated, ConfigError> {
    cfg.check_quirks(supported_quirks)?;

    ensure!(
        cfg.ias <= max_ias,
        ConfigError::InputAddressSize { bits: cfg.ias }
    );
    ensure!(
        cfg.oas <= max_oas,
        ConfigError::OutputAddressSize { bits: cfg.oas }
    );
    let ips = encode_output_size(cfg.oas)?;

    let page_sizes = restrict_page_sizes(cfg.page_sizes);
    let granule = page_sizes.min_granule().ok_or(ConfigError::NoPageSizes)?;
    let pg_shift = granule.ilog2();

    ensure!(
        cfg.ias > pg_shift,
        ConfigError::InputAddressSize { bits: cfg.ias }
    );
    cfg.check_iova_range()?;

    Ok(Validated {
        page_sizes,
        pg_shift,
        ips,
    })
}

/// The table walk attributes (IRGN, ORGN, SH) selected by the configured quirks.
pub(crate) fn walk_attributes(quirks: Quirks) -> (u64, u64, u64) {
    if quirks.contains(Quirks::NON_SHAREABLE) {
        (RGN_WBWA, RGN_WBWA, SH_NS)
    } else if quirks.contains(Quirks::USE_UPSTREAM_HINT) {
        (RGN_NC, RGN_WBWA, SH_OS)
    } else if quirks.contains(Quirks::USE_LLC_NWA) {
        (RGN_NC, RGN_WB, SH_OS)
    } else if quirks.contains(Quirks::NO_DMA) {
        (RGN_WBWA, RGN_WBWA, SH_IS)
    } else {
        (RGN_NC, RGN_NC, SH_OS)
    }
}

const fn granule_encoding(granule: usize) -> u64 {
    match granule {
        granule if granule == 64 * KIB => 1,
        granule if granule == 16 * KIB => 2,
        _ => 0,
    }
}

/// Computes the stage 1 register values for a table rooted at `root`.
pub(crate) fn s1_registers(
    ias: u32,
    ips: u64,
    granule: usize,
    quirks: Quirks,
    root: PhysicalAddress,
) -> ArmLpaeS1Cfg {
    let (irgn, orgn, sh) = walk_attributes(quirks);

    let tcr = Tcr::new()
        .with(Tcr::T0SZ, u64::from(64 - ias))
        .with(Tcr::IRGN0, irgn)
        .with(Tcr::ORGN0, orgn)
        .with(Tcr::SH0, sh)
        .with(Tcr::TG0, granule_encoding(granule))
        .with(Tcr::EPD1, true)
        .with(Tcr::IPS, ips);

    ArmLpaeS1Cfg {
        ttbr: [root.as_u64(), 0],
        tcr: tcr.bits(),
        mair: [MairAttr::mair(), 0],
    }
}

impl<C> ArmLpae<C> {
    /// Builds an empty table hierarchy: only the root table is allocated.
    pub(crate) fn new(
        iop: IoPgtable<C>,
        stage: Stage,
        geometry: TableGeometry,
        granule: usize,
    ) -> Result<Self, AllocError> {
        let pgd_entries = geometry.level(0).entries();
        let pgd_layout = Table::<u64>::layout(pgd_entries);
        let pgd = iop.alloc_pages(pgd_layout, AllocFlags::empty())?;

        log::debug!(
            "{}: {} levels, granule {granule:#x}, {pgd_entries} root entries, page sizes {:?}",
            iop.fmt(),
            geometry.depth(),
            iop.cfg().page_sizes
        );

        let me = Self {
            // Safety: freshly allocated, zeroed and aligned to its size
            pgd: unsafe { Table::from_raw_parts(pgd.cast(), pgd_entries) },
            iop,
            stage,
            geometry,
            granule,
            pgd_layout,
            prealloc: None,
        };

        if !me.pgd_phys().fits_in_bits(MAX_ADDR_BITS) {
            log::warn!("root table at {} is not addressable", me.pgd_phys());
            return Err(AllocError);
        }

        Ok(me)
    }

    pub(crate) fn iop_mut(&mut self) -> &mut IoPgtable<C> {
        &mut self.iop
    }

    pub(crate) fn geometry(&self) -> &TableGeometry {
        &self.geometry
    }

    pub(crate) fn pgd_phys(&self) -> PhysicalAddress {
        self.iop.physmap().virt_to_phys(self.pgd.as_ptr().as_ptr())
    }

    pub(crate) fn set_prealloc(&mut self, prealloc: Prealloc) {
        debug_assert!(self.prealloc.is_none());
        self.prealloc = Some(prealloc);
    }

    fn last_depth(&self) -> usize {
        self.geometry.depth() - 1
    }

    pub(crate) fn is_table(&self, pte: u64, depth: usize) -> bool {
        let desc = S1Descriptor::from_bits(pte);
        depth < self.last_depth() && desc.get(S1Descriptor::VALID) && desc.get(S1Descriptor::TABLE)
    }

    pub(crate) fn table_pte(&self, table: PhysicalAddress) -> u64 {
        S1Descriptor::new()
            .with(S1Descriptor::VALID, true)
            .with(S1Descriptor::TABLE, true)
            .with(S1Descriptor::ADDRESS, table.as_u64() >> 12)
            .with(
                S1Descriptor::NSTABLE,
                self.iop.quirks().contains(Quirks::ARM_NS),
            )
            .bits()
    }

    /// Returns the table a table descriptor at `depth` points to.
    pub(crate) fn table_at(&self, pte: u64, depth: usize) -> Table<u64> {
        debug_assert!(self.is_table(pte, depth));

        // Safety: table descriptors only ever point to tables we allocated for the next level,
        // which stay linked until the page table is dropped
        unsafe {
            Table::from_phys(
                self.iop.physmap(),
                pte_address(pte),
                self.geometry.level(depth + 1).entries(),
            )
        }
    }

    fn leaf_pte(&self, paddr: PhysicalAddress, prot: Prot, depth: usize) -> u64 {
        let page = depth == self.last_depth();
        let quirks = self.iop.quirks();

        match self.stage {
            Stage::S1 => {
                let attr = if prot.contains(Prot::MMIO) {
                    MairAttr::Device
                } else if prot.contains(Prot::CACHE) {
                    MairAttr::Cached
                } else {
                    MairAttr::NonCacheable
                };

                S1Descriptor::new()
                    .with(S1Descriptor::VALID, true)
                    .with(S1Descriptor::TABLE, page)
                    .with(S1Descriptor::ATTR_INDX, attr as u64)
                    .with(S1Descriptor::NS, quirks.contains(Quirks::ARM_NS))
                    .with(S1Descriptor::AP_UNPRIV, !prot.contains(Prot::PRIV))
                    .with(S1Descriptor::AP_RDONLY, !prot.contains(Prot::WRITE))
                    .with(S1Descriptor::SH, SH_IS)
                    .with(S1Descriptor::AF, true)
                    .with(S1Descriptor::NG, true)
                    .with(S1Descriptor::ADDRESS, paddr.as_u64() >> 12)
                    .with(S1Descriptor::XN, prot.contains(Prot::NOEXEC))
                    .bits()
            }
            Stage::S2 => {
                let mem_attr = if prot.contains(Prot::MMIO) {
                    MEMATTR_DEV
                } else if prot.contains(Prot::CACHE) {
                    MEMATTR_OIWB
                } else {
                    MEMATTR_NC
                };

                S2Descriptor::new()
                    .with(S2Descriptor::VALID, true)
                    .with(S2Descriptor::TABLE, page)
                    .with(S2Descriptor::MEM_ATTR, mem_attr)
                    .with(S2Descriptor::S2AP_READ, prot.contains(Prot::READ))
                    .with(S2Descriptor::S2AP_WRITE, prot.contains(Prot::WRITE))
                    .with(S2Descriptor::SH, SH_IS)
                    .with(S2Descriptor::AF, true)
                    .with(S2Descriptor::ADDRESS, paddr.as_u64() >> 12)
                    .with(S2Descriptor::XN, prot.contains(Prot::NOEXEC))
                    .bits()
            }
        }
    }

    /// Allocates a table for the level below `depth`, fills it and links it at `index` in place
    /// of `current`. If another thread changed the slot first, ours is discarded and theirs is
    /// returned.
    fn install_table(
        &self,
        table: Table<u64>,
        index: usize,
        current: u64,
        depth: usize,
        fill: impl Fn(usize) -> u64,
    ) -> Result<Table<u64>, MapError> {
        let entries = self.geometry.level(depth + 1).entries();
        let layout = Table::<u64>::layout(entries);
        let mem = self.iop.alloc_pages(layout, AllocFlags::ATOMIC)?;
        let phys = self.iop.physmap().virt_to_phys(mem.as_ptr());

        if !phys.fits_in_bits(MAX_ADDR_BITS) {
            log::warn!("table at {phys} is not addressable");
            // Safety: never published
            unsafe { self.iop.free_pages(mem, layout) };
            return Err(MapError::Alloc(AllocError));
        }

        // Safety: freshly allocated, zeroed and aligned to its size
        let new = unsafe { Table::from_raw_parts(mem.cast(), entries) };
        for i in 0..entries {
            let pte = fill(i);
            if pte != u64::VACANT {
                new.set(i, pte);
            }
        }
        self.iop.table_barrier();

        match table.compare_exchange(index, current, self.table_pte(phys)) {
            Ok(_) => {
                log::trace!("installed level {} table at {phys}", depth + 1);
                Ok(new)
            }
            Err(found) => {
                // Safety: never published, we lost the race for the slot
                unsafe { self.iop.free_pages(mem, layout) };

                if self.is_table(found, depth) {
                    Ok(self.table_at(found, depth))
                } else {
                    Err(MapError::Exists)
                }
            }
        }
    }

    /// Walks to the table at depth `target`, allocating missing intermediate tables.
    pub(crate) fn walk_alloc(&self, iova: Iova, target: usize) -> Result<Table<u64>, MapError> {
        let mut table = self.pgd;

        // NB: iterate over the levels to have an explicit upper bound on the loop
        for depth in 0..target {
            let index = self.geometry.level(depth).pte_index_of(iova);
            let pte = table.get(index);

            table = if pte == u64::VACANT {
                self.install_table(table, index, pte, depth, |_| u64::VACANT)?
            } else if self.is_table(pte, depth) {
                self.table_at(pte, depth)
            } else {
                log::warn!("{iova} is already mapped by a level {depth} block");
                return Err(MapError::Exists);
            };
        }

        Ok(table)
    }

    /// Replaces the block descriptor `block` at `index` with a next-level table that maps the
    /// same range with the same attributes.
    fn split_block(
        &self,
        table: Table<u64>,
        index: usize,
        depth: usize,
        block: u64,
    ) -> Option<Table<u64>> {
        let next = depth + 1;
        let page_size = self.geometry.level(next).page_size();
        let is_page = next == self.last_depth();
        let base = pte_address(block);

        log::trace!(
            "splitting level {depth} block at {base} into {:#x} byte entries",
            page_size
        );

        let res = self.install_table(table, index, block, depth, |i| {
            S1Descriptor::from_bits(block)
                .with(S1Descriptor::TABLE, is_page)
                .with(S1Descriptor::ADDRESS, base.add(i * page_size).as_u64() >> 12)
                .bits()
        });

        match res {
            Ok(table) => Some(table),
            Err(err) => {
                log::warn!("failed to split block at {base}: {err}");
                None
            }
        }
    }

    /// Frees every table below `table` immediately.
    fn free_subtables(&self, table: Table<u64>, depth: usize) {
        if depth >= self.last_depth() {
            return;
        }

        for index in 0..table.entries() {
            let pte = table.get(index);
            if !self.is_table(pte, depth) {
                continue;
            }

            // preallocated leaf tables are released in one go
            if self.prealloc.is_some() && depth + 1 == self.last_depth() {
                continue;
            }

            let child = self.table_at(pte, depth);
            self.free_subtables(child, depth + 1);

            // Safety: the page table is being torn down, nothing can reach the table anymore
            unsafe {
                self.iop
                    .free_pages(child.as_ptr(), Table::<u64>::layout(child.entries()));
            }
        }
    }
}

fn pte_address(pte: u64) -> PhysicalAddress {
    PhysicalAddress::from_raw(S1Descriptor::from_bits(pte).get(S1Descriptor::ADDRESS) << 12)
}

impl<C> Drop for ArmLpae<C> {
    fn drop(&mut self) {
        self.free_subtables(self.pgd, 0);

        // Safety: the page table is being torn down, nothing can reach the tables anymore
        unsafe {
            if let Some(prealloc) = self.prealloc.take() {
                self.iop.free_pages(prealloc.block, prealloc.layout);
            }
            self.iop.free_pages(self.pgd.as_ptr(), self.pgd_layout);
        }
    }
}

impl<C: Send + Sync> PgtableFormat<C> for ArmLpae<C> {
    fn iop(&self) -> &IoPgtable<C> {
        &self.iop
    }

    fn map_page(
        &self,
        iova: Iova,
        paddr: PhysicalAddress,
        size: usize,
        prot: Prot,
        gather: &mut Gather,
    ) -> Result<(), MapError> {
        let target = self.geometry.depth_of(size).ok_or(MapError::Misaligned)?;
        debug_assert!(self.geometry.level(target).can_map(iova, paddr, size));

        let table = self.walk_alloc(iova, target)?;
        let index = self.geometry.level(target).pte_index_of(iova);
        let new = self.leaf_pte(paddr, prot, target);

        let Err(found) = table.compare_exchange(index, u64::VACANT, new) else {
            return Ok(());
        };

        // the slot still links a table, possibly one emptied by earlier unmaps
        if self.is_table(found, target) {
            log::trace!("mapping {iova} through the level {} table", target + 1);
            return map_below::<C, _>(self, iova, paddr, size, prot, gather);
        }

        log::warn!("{iova} is already mapped");
        Err(MapError::Exists)
    }

    fn unmap_page(&self, iova: Iova, size: usize, gather: &mut Gather) -> usize {
        let Some(target) = self.geometry.depth_of(size) else {
            return 0;
        };

        let mut table = self.pgd;

        // NB: iterate over the levels to have an explicit upper bound on the loop
        for depth in 0..target {
            let index = self.geometry.level(depth).pte_index_of(iova);
            let pte = table.get(index);

            table = if pte == u64::VACANT {
                return 0;
            } else if self.is_table(pte, depth) {
                self.table_at(pte, depth)
            } else {
                match self.split_block(table, index, depth, pte) {
                    Some(table) => table,
                    None => return 0,
                }
            };
        }

        let index = self.geometry.level(target).pte_index_of(iova);
        let pte = table.get(index);
        if pte == u64::VACANT {
            return 0;
        }

        if self.is_table(pte, target) {
            return unmap_below::<C, _>(self, iova, size, gather);
        }

        if table.compare_exchange(index, pte, u64::VACANT).is_err() {
            return 0;
        }
        gather.add_flush(iova, size, size, true);

        size
    }

    fn lookup(&self, iova: Iova) -> Option<Leaf> {
        let mut table = self.pgd;

        // NB: iterate over the levels to have an explicit upper bound on the loop
        for depth in 0..self.geometry.depth() {
            let level = self.geometry.level(depth);
            let pte = table.get(level.pte_index_of(iova));

            if !S1Descriptor::from_bits(pte).get(S1Descriptor::VALID) {
                return None;
            }

            if self.is_table(pte, depth) {
                table = self.table_at(pte, depth);
            } else {
                return Some(Leaf {
                    pte,
                    phys: pte_address(pte),
                    size: level.page_size(),
                });
            }
        }

        None
    }

    fn is_coherent(&self, pte: u64) -> bool {
        match self.stage {
            Stage::S1 => {
                S1Descriptor::from_bits(pte).get(S1Descriptor::ATTR_INDX) == MairAttr::Cached as u64
            }
            Stage::S2 => S2Descriptor::from_bits(pte).get(S2Descriptor::MEM_ATTR) == MEMATTR_OIWB,
        }
    }
}

fn alloc_pgtable<C: Send + Sync + 'static>(
    fmt: Format,
    cfg: &mut IoPgtableCfg<C>,
    cookie: C,
) -> Result<Box<dyn IoPgtableOps<C>>, ConfigError> {
    let (stage, supported_quirks, max_ias, max_oas) = match fmt {
        Format::ArmLpae32S1 => (Stage::S1, Quirks::ARM_NS | Quirks::NO_DMA, 32, 40),
        Format::ArmLpae32S2 => (Stage::S2, Quirks::NO_DMA, 40, 40),
        Format::ArmLpae64S1 => (
            Stage::S1,
            Quirks::ARM_NS | Quirks::NO_DMA | Quirks::WALK_ATTRIBUTES,
            MAX_ADDR_BITS,
            MAX_ADDR_BITS,
        ),
        Format::ArmLpae64S2 => (Stage::S2, Quirks::NO_DMA, MAX_ADDR_BITS, MAX_ADDR_BITS),
        _ => return Err(ConfigError::UnsupportedFormat),
    };
    let is_32bit = matches!(fmt, Format::ArmLpae32S1 | Format::ArmLpae32S2);

    let mut requested = cfg.clone();
    if is_32bit {
        requested.page_sizes = requested
            .page_sizes
            .intersection(PageSizes::from_iter([4 * KIB, 2 * MIB, GIB]));
    }

    let Validated {
        page_sizes,
        pg_shift,
        ips,
    } = validate(&requested, supported_quirks, max_ias, max_oas)?;
    requested.page_sizes = page_sizes;

    let granule = 1usize << pg_shift;
    let geometry = build_geometry(requested.ias, pg_shift, page_sizes, stage);
    let ias = requested.ias;
    let quirks = requested.quirks;

    let iop = IoPgtable::new(fmt, cookie, requested);
    let mut data = ArmLpae::new(iop, stage, geometry, granule)?;
    let root = data.pgd_phys();

    let format_cfg = match stage {
        Stage::S1 => {
            let mut regs = s1_registers(ias, ips, granule, quirks, root);
            if is_32bit {
                regs.tcr = (regs.tcr | TTBCR_EAE) & 0xffff_ffff;
                regs.mair = [regs.mair[0] & 0xffff_ffff, regs.mair[0] >> 32];
            }
            FormatCfg::ArmLpaeS1(regs)
        }
        Stage::S2 => {
            let (irgn, orgn, sh) = walk_attributes(quirks);

            // the starting level is encoded differently for 4KiB granules
            let mut sl = 4 - data.geometry().depth() as u64;
            if granule == 4 * KIB {
                sl += 1;
            }

            let vtcr = Vtcr::new()
                .with(Vtcr::T0SZ, u64::from(64 - ias))
                .with(Vtcr::SL0, !sl & 0x3)
                .with(Vtcr::IRGN0, irgn)
                .with(Vtcr::ORGN0, orgn)
                .with(Vtcr::SH0, sh)
                .with(Vtcr::TG0, granule_encoding(granule))
                .with(Vtcr::PS, ips)
                .with(Vtcr::RES1, true);

            let mut vtcr = vtcr.bits();
            if is_32bit {
                vtcr &= 0xffff_ffff;
            }

            FormatCfg::ArmLpaeS2(ArmLpaeS2Cfg {
                vttbr: root.as_u64(),
                vtcr,
            })
        }
    };

    data.iop_mut().set_format_cfg(format_cfg);
    *cfg = data.iop().cfg().clone();

    Ok(Box::new(data))
}

pub(crate) fn alloc_32_s1<C: Send + Sync + 'static>(
    cfg: &mut IoPgtableCfg<C>,
    cookie: C,
) -> Result<Box<dyn IoPgtableOps<C>>, ConfigError> {
    alloc_pgtable(Format::ArmLpae32S1, cfg, cookie)
}

pub(crate) fn alloc_32_s2<C: Send + Sync + 'static>(
    cfg: &mut IoPgtableCfg<C>,
    cookie: C,
) -> Result<Box<dyn IoPgtableOps<C>>, ConfigError> {
    alloc_pgtable(Format::ArmLpae32S2, cfg, cookie)
}

pub(crate) fn alloc_64_s1<C: Send + Sync + 'static>(
    cfg: &mut IoPgtableCfg<C>,
    cookie: C,
) -> Result<Box<dyn IoPgtableOps<C>>, ConfigError> {
    alloc_pgtable(Format::ArmLpae64S1, cfg, cookie)
}

pub(crate) fn alloc_64_s2<C: Send + Sync + 'static>(
    cfg: &mut IoPgtableCfg<C>,
    cookie: C,
) -> Result<Box<dyn IoPgtableOps<C>>, ConfigError> {
    alloc_pgtable(Format::ArmLpae64S2, cfg, cookie)
}

/// Tears down the whole table hierarchy.
pub(crate) fn free<C>(ops: Box<dyn IoPgtableOps<C>>) {
    log::debug!("freeing {} page table", ops.io_pgtable().fmt());
    drop(ops);
}
