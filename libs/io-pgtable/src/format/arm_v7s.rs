// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! ARM v7 short-descriptor translation tables.
//!
//! Two levels of 32-bit descriptors: a 4096-entry first level of 1MiB sections and a 256-entry
//! second level of 4KiB small pages. 16MiB supersections and 64KiB large pages are encoded as
//! runs of 16 identical descriptors. Both the tables themselves and, unless
//! [`Quirks::ARM_MTK_4GB`] is in effect, the mapped memory must lie below 4GiB.

use alloc::boxed::Box;

use bitflags::bitflags;

use crate::error::ensure;
use crate::format::{Leaf, PgtableFormat, map_below, unmap_below};
use crate::geometry::{GeometryBuilder, PageTableLevel, TableGeometry};
use crate::page_alloc::AllocFlags;
use crate::table::{RawPte, Table};
use crate::tlb::Gather;
use crate::{
    AllocError, ArmV7sCfg, ConfigError, Format, FormatCfg, IoPgtable, IoPgtableCfg,
    IoPgtableOps, Iova, KIB, MIB, MapError, PageSizes, PhysicalAddress, Prot, Quirks,
};

const ADDR_BITS: u32 = 32;
const MTK_ADDR_BITS: u32 = 34;
/// Supersections and large pages are runs of this many identical descriptors.
const CONT_PAGES: usize = 16;

const PTE_TYPE_TABLE: u32 = 1 << 0;
const PTE_TYPE_PAGE: u32 = 1 << 1;
const PTE_TYPE_CONT_PAGE: u32 = 1 << 0;

const ATTR_B: u32 = 1 << 2;
const ATTR_C: u32 = 1 << 3;
const ATTR_NS_TABLE: u32 = 1 << 3;
const ATTR_NS_SECTION: u32 = 1 << 19;
const CONT_SECTION: u32 = 1 << 18;

const TEX_MASK: u32 = 0x7;
/// Large pages keep TEX and XN in different places than small pages.
const CONT_PAGE_TEX_SHIFT: u32 = 6;
const CONT_PAGE_XN_SHIFT: u32 = 15;

const TABLE_MASK: u32 = u32::MAX << 10;

// high physical address bits, only with ARM_MTK_4GB
const MTK_PA_BIT32: u32 = 1 << 9;
const MTK_PA_BIT33: u32 = 1 << 4;

// region attributes
const RGN_WBWA: u32 = 1;

const TTBR_S: u32 = 1 << 1;
const TTBR_NOS: u32 = 1 << 5;

const PRRR_TYPE_DEVICE: u32 = 1;
const PRRR_TYPE_NORMAL: u32 = 2;
const PRRR_DS0: u32 = 1 << 16;
const PRRR_DS1: u32 = 1 << 17;
const PRRR_NS1: u32 = 1 << 19;

bitflags! {
    /// The attribute field of small pages and sections, found at [`Lvl::attr_shift`].
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    struct PteAttr: u32 {
        /// AP[0], used as access flag.
        const AF = 1 << 0;
        /// AP[1]
        const AP_UNPRIV = 1 << 1;
        /// TEX[0], selects the normal memory remap slot instead of the device one.
        const TEX1 = 1 << 2;
        /// AP[2]
        const AP_RDONLY = 1 << 5;
        const S = 1 << 6;
        const NG = 1 << 7;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Lvl {
    /// Sections, supersections and second-level table descriptors.
    One,
    /// Small and large pages.
    Two,
}

impl Lvl {
    const fn depth(self) -> usize {
        match self {
            Lvl::One => 0,
            Lvl::Two => 1,
        }
    }

    const fn shift(self) -> u32 {
        match self {
            Lvl::One => 20,
            Lvl::Two => 12,
        }
    }

    const fn block_size(self) -> usize {
        1 << self.shift()
    }

    const fn entries(self) -> usize {
        match self {
            Lvl::One => 4096,
            Lvl::Two => 256,
        }
    }

    const fn attr_shift(self) -> u32 {
        match self {
            Lvl::One => 10,
            Lvl::Two => 4,
        }
    }

    const fn xn(self) -> u32 {
        match self {
            Lvl::One => 1 << 4,
            Lvl::Two => 1 << 0,
        }
    }

    const fn addr_mask(self) -> u32 {
        u32::MAX << self.shift()
    }
}

#[expect(
    clippy::cast_possible_truncation,
    reason = "the bits above 31 are stored separately, if at all"
)]
const fn low_bits(raw: u64) -> u32 {
    raw as u32
}

const fn is_valid(pte: u32) -> bool {
    pte & 0x3 != 0
}

const fn is_table(pte: u32, lvl: Lvl) -> bool {
    matches!(lvl, Lvl::One) && pte & 0x3 == PTE_TYPE_TABLE
}

const fn is_cont(pte: u32, lvl: Lvl) -> bool {
    match lvl {
        Lvl::One => !is_table(pte, lvl) && pte & CONT_SECTION != 0,
        Lvl::Two => pte & PTE_TYPE_PAGE == 0,
    }
}

/// Turns a section or small page descriptor into one entry of a supersection or large page run.
const fn pte_to_cont(mut pte: u32, lvl: Lvl) -> u32 {
    match lvl {
        Lvl::One => pte | CONT_SECTION,
        Lvl::Two => {
            let xn = pte & lvl.xn();
            let tex = pte & (TEX_MASK << CONT_PAGE_TEX_SHIFT);

            pte ^= xn | tex | PTE_TYPE_PAGE;
            pte | (xn << CONT_PAGE_XN_SHIFT) | (tex << CONT_PAGE_TEX_SHIFT) | PTE_TYPE_CONT_PAGE
        }
    }
}

const fn cont_to_pte(mut pte: u32, lvl: Lvl) -> u32 {
    match lvl {
        Lvl::One => pte & !CONT_SECTION,
        Lvl::Two => {
            let xn = pte & (1 << CONT_PAGE_XN_SHIFT);
            let tex = pte & (TEX_MASK << (2 * CONT_PAGE_TEX_SHIFT));

            pte ^= xn | tex | PTE_TYPE_CONT_PAGE;
            pte | (xn >> CONT_PAGE_XN_SHIFT) | (tex >> CONT_PAGE_TEX_SHIFT) | PTE_TYPE_PAGE
        }
    }
}

pub(crate) struct ArmV7s<C> {
    iop: IoPgtable<C>,
    geometry: TableGeometry,
    pgd: Table<u32>,
}

// Safety: all descriptor accesses go through atomics and table memory is owned by the page table,
// so it may be shared and sent across threads as long as the cookie can.
unsafe impl<C: Send> Send for ArmV7s<C> {}
// Safety: see above
unsafe impl<C: Sync> Sync for ArmV7s<C> {}

impl<C> ArmV7s<C> {
    fn level(&self, lvl: Lvl) -> &PageTableLevel {
        self.geometry.level(lvl.depth())
    }

    /// The level and number of descriptors a page of `size` bytes takes up.
    fn placement(size: usize) -> Option<(Lvl, usize)> {
        match size {
            size if size == Lvl::One.block_size() * CONT_PAGES => Some((Lvl::One, CONT_PAGES)),
            size if size == Lvl::One.block_size() => Some((Lvl::One, 1)),
            size if size == Lvl::Two.block_size() * CONT_PAGES => Some((Lvl::Two, CONT_PAGES)),
            size if size == Lvl::Two.block_size() => Some((Lvl::Two, 1)),
            _ => None,
        }
    }

    fn mtk_4gb(&self) -> bool {
        self.iop.quirks().contains(Quirks::ARM_MTK_4GB)
    }

    fn table_phys(&self, table: Table<u32>) -> Option<u32> {
        let phys = self.iop.physmap().virt_to_phys(table.as_ptr().as_ptr());
        u32::try_from(phys.get()).ok()
    }

    fn table_pte(&self, phys: u32) -> u32 {
        let mut pte = (phys & TABLE_MASK) | PTE_TYPE_TABLE;
        if self.iop.quirks().contains(Quirks::ARM_NS) {
            pte |= ATTR_NS_TABLE;
        }
        pte
    }

    fn table_at(&self, pte: u32) -> Table<u32> {
        debug_assert!(is_table(pte, Lvl::One));

        // Safety: table descriptors only ever point to second-level tables we allocated, which
        // stay linked until the page table is dropped
        unsafe {
            Table::from_phys(
                self.iop.physmap(),
                PhysicalAddress::from_raw(u64::from(pte & TABLE_MASK)),
                Lvl::Two.entries(),
            )
        }
    }

    fn paddr_to_pte(&self, paddr: PhysicalAddress, lvl: Lvl) -> u32 {
        let raw = paddr.as_u64();
        let mut pte = low_bits(raw) & lvl.addr_mask();

        if self.mtk_4gb() {
            if raw & (1 << 32) != 0 {
                pte |= MTK_PA_BIT32;
            }
            if raw & (1 << 33) != 0 {
                pte |= MTK_PA_BIT33;
            }
        }

        pte
    }

    fn pte_to_paddr(&self, pte: u32, lvl: Lvl) -> PhysicalAddress {
        let mask = if is_table(pte, lvl) {
            TABLE_MASK
        } else if is_cont(pte, lvl) {
            lvl.addr_mask().wrapping_mul(16)
        } else {
            lvl.addr_mask()
        };

        let mut paddr = u64::from(pte & mask);
        if self.mtk_4gb() {
            if pte & MTK_PA_BIT32 != 0 {
                paddr |= 1 << 32;
            }
            if pte & MTK_PA_BIT33 != 0 {
                paddr |= 1 << 33;
            }
        }

        PhysicalAddress::from_raw(paddr)
    }

    fn prot_to_pte(&self, prot: Prot, lvl: Lvl) -> u32 {
        let quirks = self.iop.quirks();
        let perms = !quirks.contains(Quirks::NO_PERMS);

        let mut attr = PteAttr::NG | PteAttr::S;
        if !prot.contains(Prot::MMIO) {
            attr |= PteAttr::TEX1;
        }
        if perms {
            attr |= PteAttr::AF;
            if !prot.contains(Prot::PRIV) {
                attr |= PteAttr::AP_UNPRIV;
            }
            if !prot.contains(Prot::WRITE) {
                attr |= PteAttr::AP_RDONLY;
            }
        }

        let mut pte = attr.bits() << lvl.attr_shift();
        if perms && prot.contains(Prot::NOEXEC) {
            pte |= lvl.xn();
        }
        if prot.contains(Prot::MMIO) {
            pte |= ATTR_B;
        } else if prot.contains(Prot::CACHE) {
            pte |= ATTR_B | ATTR_C;
        }

        pte |= PTE_TYPE_PAGE;
        if lvl == Lvl::One && quirks.contains(Quirks::ARM_NS) {
            pte |= ATTR_NS_SECTION;
        }

        pte
    }

    /// Recovers the protection a (non-contiguous) leaf was mapped with.
    fn pte_to_prot(pte: u32, lvl: Lvl) -> Prot {
        let attr = PteAttr::from_bits_truncate(pte >> lvl.attr_shift());
        let mut prot = Prot::READ;

        if !attr.contains(PteAttr::AP_RDONLY) {
            prot |= Prot::WRITE;
        }
        if !attr.contains(PteAttr::AP_UNPRIV) {
            prot |= Prot::PRIV;
        }
        if !attr.contains(PteAttr::TEX1) {
            prot |= Prot::MMIO;
        } else if pte & ATTR_C != 0 {
            prot |= Prot::CACHE;
        }
        if pte & lvl.xn() != 0 {
            prot |= Prot::NOEXEC;
        }

        prot
    }

    /// Links a new second-level table at `index` of the first level in place of `current`,
    /// filled by `fill`. If the slot changed in the meantime our table is discarded, and the
    /// table found there instead is returned.
    fn install_table(
        &self,
        index: usize,
        current: u32,
        fill: impl Fn(usize) -> u32,
    ) -> Result<Table<u32>, MapError> {
        let entries = Lvl::Two.entries();
        let layout = Table::<u32>::layout(entries);
        let mem = self.iop.alloc_pages(layout, AllocFlags::ATOMIC)?;

        // Safety: freshly allocated, zeroed and aligned to its size
        let new = unsafe { Table::<u32>::from_raw_parts(mem.cast(), entries) };

        let Some(phys) = self.table_phys(new) else {
            log::warn!("second-level table {mem:?} is not addressable");
            // Safety: never published
            unsafe { self.iop.free_pages(mem, layout) };
            return Err(MapError::Alloc(AllocError));
        };

        for i in 0..entries {
            let pte = fill(i);
            if pte != u32::VACANT {
                new.set(i, pte);
            }
        }
        self.iop.table_barrier();

        match self.pgd.compare_exchange(index, current, self.table_pte(phys)) {
            Ok(_) => Ok(new),
            Err(found) => {
                // Safety: never published, we lost the race for the slot
                unsafe { self.iop.free_pages(mem, layout) };

                if is_table(found, Lvl::One) {
                    Ok(self.table_at(found))
                } else {
                    Err(MapError::Exists)
                }
            }
        }
    }

    /// Returns the second-level table for `iova`, allocating it if needed.
    fn l2_table_alloc(&self, iova: Iova) -> Result<Table<u32>, MapError> {
        let index = self.level(Lvl::One).pte_index_of(iova);
        let pte = self.pgd.get(index);

        if pte == u32::VACANT {
            self.install_table(index, pte, |_| u32::VACANT)
        } else if is_table(pte, Lvl::One) {
            Ok(self.table_at(pte))
        } else {
            log::warn!("{iova} is already mapped by a section");
            Err(MapError::Exists)
        }
    }

    /// Rewrites the contiguous run containing `index` as individual descriptors.
    fn split_cont(
        &self,
        table: Table<u32>,
        index: usize,
        lvl: Lvl,
        iova: Iova,
        gather: &mut Gather,
    ) {
        let first = index & !(CONT_PAGES - 1);
        let size = lvl.block_size();
        let base = iova.align_down(size * CONT_PAGES);

        let pte = table.get(first);
        let paddr = self.pte_to_paddr(pte, lvl);
        let attrs = cont_to_pte(pte, lvl) & !lvl.addr_mask();

        for i in 0..CONT_PAGES {
            table.set(first + i, attrs | self.paddr_to_pte(paddr.add(i * size), lvl));
        }

        log::trace!("split contiguous run at {base}");
        gather.add_flush(base, size * CONT_PAGES, size, true);
    }

    /// Replaces the section descriptor at `index` with a second-level table of small pages
    /// mapping the same memory with the same attributes.
    fn split_section(&self, index: usize, section: u32) -> Option<Table<u32>> {
        let prot = Self::pte_to_prot(section, Lvl::One);
        let base = self.pte_to_paddr(section, Lvl::One);
        let attrs = self.prot_to_pte(prot, Lvl::Two);

        log::trace!("splitting section at {base} into small pages");

        let res = self.install_table(index, section, |i| {
            attrs | self.paddr_to_pte(base.add(i * Lvl::Two.block_size()), Lvl::Two)
        });

        match res {
            Ok(table) => Some(table),
            Err(err) => {
                log::warn!("failed to split section at {base}: {err}");
                None
            }
        }
    }
}

impl<C> Drop for ArmV7s<C> {
    fn drop(&mut self) {
        for index in 0..self.pgd.entries() {
            let pte = self.pgd.get(index);
            if is_table(pte, Lvl::One) {
                let table = self.table_at(pte);

                // Safety: the page table is being torn down, nothing can reach the table anymore
                unsafe {
                    self.iop
                        .free_pages(table.as_ptr(), Table::<u32>::layout(table.entries()));
                }
            }
        }

        // Safety: see above
        unsafe {
            self.iop
                .free_pages(self.pgd.as_ptr(), Table::<u32>::layout(self.pgd.entries()));
        }
    }
}

impl<C: Send + Sync> PgtableFormat<C> for ArmV7s<C> {
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
        let (lvl, num) = Self::placement(size).ok_or(MapError::Misaligned)?;

        let table = match lvl {
            Lvl::One => self.pgd,
            Lvl::Two => self.l2_table_alloc(iova)?,
        };
        let index = self.level(lvl).pte_index_of(iova);

        let mut pte = self.prot_to_pte(prot, lvl) | self.paddr_to_pte(paddr, lvl);
        if num > 1 {
            pte = pte_to_cont(pte, lvl);
        }

        for i in 0..num {
            let current = table.get(index + i);
            if is_table(current, lvl) {
                // linked second-level tables stay in place, map through them instead
                log::trace!("mapping {iova} through second-level tables");
                return map_below::<C, _>(self, iova, paddr, size, prot, gather);
            } else if current != u32::VACANT {
                log::warn!("{iova} is already mapped");
                return Err(MapError::Exists);
            }
        }

        let block = lvl.block_size();
        for i in 0..num {
            if let Err(found) = table.compare_exchange(index + i, u32::VACANT, pte) {
                log::warn!("lost a race for {}", iova.add(i * block));

                // take back what we already installed
                for j in 0..i {
                    table.set(index + j, u32::VACANT);
                }
                if i > 0 {
                    gather.add_flush(iova, i * block, block, true);
                }

                return if is_table(found, lvl) && i == 0 {
                    map_below::<C, _>(self, iova, paddr, size, prot, gather)
                } else {
                    Err(MapError::Exists)
                };
            }
        }

        Ok(())
    }

    fn unmap_page(&self, iova: Iova, size: usize, gather: &mut Gather) -> usize {
        let Some((lvl, num)) = Self::placement(size) else {
            return 0;
        };

        let table = match lvl {
            Lvl::One => self.pgd,
            Lvl::Two => {
                let index = self.level(Lvl::One).pte_index_of(iova);
                let mut pte = self.pgd.get(index);

                if !is_valid(pte) {
                    return 0;
                } else if is_table(pte, Lvl::One) {
                    self.table_at(pte)
                } else {
                    if is_cont(pte, Lvl::One) {
                        self.split_cont(self.pgd, index, Lvl::One, iova, gather);
                        pte = self.pgd.get(index);
                    }

                    match self.split_section(index, pte) {
                        Some(table) => table,
                        None => return 0,
                    }
                }
            }
        };

        let index = self.level(lvl).pte_index_of(iova);
        let first = table.get(index);
        if !is_valid(first) {
            return 0;
        }

        // anything but one whole contiguous run is taken apart entry by entry
        if is_table(first, lvl) || (num > 1 && !is_cont(first, lvl)) {
            return unmap_below::<C, _>(self, iova, size, gather);
        }
        if num == 1 && is_cont(first, lvl) {
            self.split_cont(table, index, lvl, iova, gather);
        }

        let block = lvl.block_size();
        let mut unmapped = 0;
        for i in 0..num {
            let pte = table.get(index + i);
            if !is_valid(pte)
                || is_table(pte, lvl)
                || table.compare_exchange(index + i, pte, u32::VACANT).is_err()
            {
                break;
            }
            unmapped += block;
        }

        if unmapped > 0 {
            gather.add_flush(iova, unmapped, block, true);
        }

        unmapped
    }

    fn lookup(&self, iova: Iova) -> Option<Leaf> {
        let mut lvl = Lvl::One;
        let mut pte = self.pgd.get(self.level(lvl).pte_index_of(iova));

        if is_table(pte, lvl) {
            lvl = Lvl::Two;
            pte = self.table_at(pte).get(self.level(lvl).pte_index_of(iova));
        }

        if !is_valid(pte) {
            return None;
        }

        let size = if is_cont(pte, lvl) {
            lvl.block_size() * CONT_PAGES
        } else {
            lvl.block_size()
        };

        Some(Leaf {
            pte: pte.to_u64(),
            phys: self.pte_to_paddr(pte, lvl),
            size,
        })
    }

    fn is_coherent(&self, pte: u64) -> bool {
        pte & u64::from(ATTR_C) != 0
    }
}

const fn prrr_tr(n: u32, ty: u32) -> u32 {
    (ty & 0x3) << (n * 2)
}

const fn prrr_nos(n: u32) -> u32 {
    1 << (n + 24)
}

const fn nmrr_ir(n: u32, attr: u32) -> u32 {
    (attr & 0x3) << (n * 2)
}

const fn nmrr_or(n: u32, attr: u32) -> u32 {
    (attr & 0x3) << (n * 2 + 16)
}

const fn ttbr_irgn(attr: u32) -> u32 {
    ((attr & 0x1) << 6) | ((attr & 0x2) >> 1)
}

const fn ttbr_orgn(attr: u32) -> u32 {
    (attr & 0x3) << 3
}

pub(crate) fn alloc<C: Send + Sync + 'static>(
    cfg: &mut IoPgtableCfg<C>,
    cookie: C,
) -> Result<Box<dyn IoPgtableOps<C>>, ConfigError> {
    let mut requested = cfg.clone();

    requested.check_quirks(
        Quirks::ARM_NS
            | Quirks::NO_PERMS
            | Quirks::TLBI_ON_MAP
            | Quirks::ARM_MTK_4GB
            | Quirks::NO_DMA,
    )?;
    // the high address bits take the place of permission bits
    ensure!(
        !requested.quirks.contains(Quirks::ARM_MTK_4GB)
            || requested.quirks.contains(Quirks::NO_PERMS),
        ConfigError::IncompatibleQuirks
    );

    let max_oas = if requested.quirks.contains(Quirks::ARM_MTK_4GB) {
        MTK_ADDR_BITS
    } else {
        ADDR_BITS
    };
    ensure!(
        requested.ias <= ADDR_BITS,
        ConfigError::InputAddressSize {
            bits: requested.ias
        }
    );
    ensure!(
        requested.oas <= max_oas,
        ConfigError::OutputAddressSize {
            bits: requested.oas
        }
    );

    requested.page_sizes = requested
        .page_sizes
        .intersection(PageSizes::from_iter([4 * KIB, 64 * KIB, MIB, 16 * MIB]));
    ensure!(!requested.page_sizes.is_empty(), ConfigError::NoPageSizes);
    requested.check_iova_range()?;

    let geometry = GeometryBuilder::new()
        .with_level(Lvl::One.block_size(), Lvl::One.entries(), true)
        .with_level(Lvl::Two.block_size(), Lvl::Two.entries(), true)
        .finish();

    let iop = IoPgtable::new(Format::ArmV7s, cookie, requested);
    let entries = Lvl::One.entries();
    let mem = iop.alloc_pages(Table::<u32>::layout(entries), AllocFlags::empty())?;

    let mut data = ArmV7s {
        // Safety: freshly allocated, zeroed and aligned to its size
        pgd: unsafe { Table::from_raw_parts(mem.cast(), entries) },
        iop,
        geometry,
    };

    let Some(root) = data.table_phys(data.pgd) else {
        log::warn!("root table {mem:?} is not addressable");
        return Err(ConfigError::Alloc(AllocError));
    };

    let format_cfg = ArmV7sCfg {
        ttbr: [
            root | TTBR_S | TTBR_NOS | ttbr_irgn(RGN_WBWA) | ttbr_orgn(RGN_WBWA),
            0,
        ],
        tcr: 0,
        prrr: prrr_tr(1, PRRR_TYPE_DEVICE)
            | prrr_tr(4, PRRR_TYPE_NORMAL)
            | prrr_tr(7, PRRR_TYPE_NORMAL)
            | PRRR_DS0
            | PRRR_DS1
            | PRRR_NS1
            | prrr_nos(7),
        nmrr: nmrr_ir(7, RGN_WBWA) | nmrr_or(7, RGN_WBWA),
    };

    log::debug!(
        "{}: root at {root:#x}, page sizes {:?}",
        data.iop.fmt(),
        data.iop.cfg().page_sizes
    );

    data.iop.set_format_cfg(FormatCfg::ArmV7s(format_cfg));
    *cfg = data.iop.cfg().clone();

    Ok(Box::new(data))
}

pub(crate) fn free<C>(ops: Box<dyn IoPgtableOps<C>>) {
    log::debug!("freeing {} page table", ops.io_pgtable().fmt());
    drop(ops);
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::SgEntry;
    use crate::test_utils::{ARENA_PHYS_BASE, RecordingTlb, TlbEvent};

    const RW: Prot = Prot::READ.union(Prot::WRITE);

    fn setup(quirks: Quirks, oas: u32) -> (Arc<RecordingTlb>, IoPgtableCfg<()>) {
        let tlb = Arc::new(RecordingTlb::with_arena(MIB));
        let cfg = IoPgtableCfg::<()>::new(
            PageSizes::from_iter([4 * KIB, 64 * KIB, MIB, 2 * MIB, 16 * MIB]),
            32,
            oas,
        )
        .with_quirks(quirks)
        .with_physmap(tlb.physmap())
        .with_tlb(tlb.clone());

        (tlb, cfg)
    }

    #[test]
    fn registers_and_page_sizes() {
        let (_tlb, mut cfg) = setup(Quirks::empty(), 32);
        let _ops = alloc(&mut cfg, ()).unwrap();

        assert_eq!(
            cfg.page_sizes,
            PageSizes::from_iter([4 * KIB, 64 * KIB, MIB, 16 * MIB])
        );

        let regs = cfg.format_cfg().and_then(FormatCfg::arm_v7s).unwrap();
        let root = u32::try_from(ARENA_PHYS_BASE).unwrap();
        assert_eq!(regs.ttbr, [root | 0x6a, 0]);
        assert_eq!(regs.tcr, 0);
        assert_eq!(regs.prrr, 0x800b_8204);
        assert_eq!(regs.nmrr, 0x4000_4000);
    }

    #[test]
    fn rejects_unsupported_configs() {
        let (_tlb, mut cfg) = setup(Quirks::ARM_MTK_4GB, 34);
        assert!(matches!(
            alloc(&mut cfg, ()),
            Err(ConfigError::IncompatibleQuirks)
        ));

        let (_tlb, mut cfg) = setup(Quirks::empty(), 34);
        assert!(matches!(
            alloc(&mut cfg, ()),
            Err(ConfigError::OutputAddressSize { bits: 34 })
        ));

        let (_tlb, mut cfg) = setup(Quirks::NON_SHAREABLE, 32);
        assert!(matches!(
            alloc(&mut cfg, ()),
            Err(ConfigError::UnsupportedQuirks { .. })
        ));

        let (_tlb, mut cfg) = setup(Quirks::empty(), 32);
        cfg.page_sizes = PageSizes::from_iter([2 * MIB]);
        assert!(matches!(alloc(&mut cfg, ()), Err(ConfigError::NoPageSizes)));
    }

    #[test_log::test]
    fn unmap_splits_supersections() {
        let (tlb, mut cfg) = setup(Quirks::empty(), 32);
        let ops = alloc(&mut cfg, ()).unwrap();

        ops.map(
            Iova::new(0x100_0000),
            PhysicalAddress::new(0x1000_0000),
            16 * MIB,
            RW | Prot::CACHE,
        )
        .unwrap();
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x1ff_fff0)),
            Some(PhysicalAddress::new(0x10ff_fff0))
        );
        assert!(tlb.take_events().is_empty());

        assert_eq!(ops.unmap(Iova::new(0x150_1000), 4 * KIB), 4 * KIB);
        assert_eq!(
            tlb.take_events(),
            [
                TlbEvent::AddFlush {
                    iova: Iova::new(0x100_0000),
                    size: 16 * MIB,
                    granule: MIB,
                    leaf: true
                },
                TlbEvent::AddFlush {
                    iova: Iova::new(0x150_1000),
                    size: 4 * KIB,
                    granule: 4 * KIB,
                    leaf: true
                },
                TlbEvent::Sync
            ]
        );

        assert_eq!(ops.iova_to_phys(Iova::new(0x150_1000)), None);
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x150_2000)),
            Some(PhysicalAddress::new(0x1050_2000))
        );
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x180_0123)),
            Some(PhysicalAddress::new(0x1080_0123))
        );
        assert!(ops.is_iova_coherent(Iova::new(0x150_2000)));
        assert!(ops.is_iova_coherent(Iova::new(0x180_0000)));
    }

    #[test]
    fn large_pages() {
        let (tlb, mut cfg) = setup(Quirks::empty(), 32);
        let ops = alloc(&mut cfg, ()).unwrap();

        ops.map(
            Iova::new(0x1_0000),
            PhysicalAddress::new(0x2_0000),
            64 * KIB,
            RW | Prot::NOEXEC,
        )
        .unwrap();

        let pte = ops.iova_to_pte(Iova::new(0x1_f004));
        assert_eq!(pte & 0x3, 0x1);
        assert_ne!(pte & (1 << 15), 0);
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x1_f004)),
            Some(PhysicalAddress::new(0x2_f004))
        );

        assert_eq!(ops.unmap(Iova::new(0x1_3000), 4 * KIB), 4 * KIB);
        assert_eq!(
            tlb.take_events(),
            [
                TlbEvent::AddFlush {
                    iova: Iova::new(0x1_0000),
                    size: 64 * KIB,
                    granule: 4 * KIB,
                    leaf: true
                },
                TlbEvent::AddFlush {
                    iova: Iova::new(0x1_3000),
                    size: 4 * KIB,
                    granule: 4 * KIB,
                    leaf: true
                },
                TlbEvent::Sync
            ]
        );

        // now a run of small pages, XN back in bit 0
        let pte = ops.iova_to_pte(Iova::new(0x1_2000));
        assert_eq!(pte & 0x3, 0x3);
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x1_2008)),
            Some(PhysicalAddress::new(0x2_2008))
        );
        assert_eq!(ops.iova_to_phys(Iova::new(0x1_3000)), None);
    }

    #[test]
    fn section_maps_through_an_emptied_table() {
        let (tlb, mut cfg) = setup(Quirks::empty(), 32);
        let ops = alloc(&mut cfg, ()).unwrap();

        ops.map(Iova::new(0x10_0000), PhysicalAddress::new(0x1000), 4 * KIB, RW)
            .unwrap();
        assert_eq!(ops.unmap(Iova::new(0x10_0000), 4 * KIB), 4 * KIB);
        tlb.take_events();

        // the second-level table stays, the section goes in as large pages
        ops.map(
            Iova::new(0x10_0000),
            PhysicalAddress::new(0x100_0000),
            MIB,
            RW,
        )
        .unwrap();
        assert!(tlb.take_events().is_empty());
        assert_eq!(ops.iova_to_pte(Iova::new(0x1f_0000)) & 0x3, 0x1);
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x1f_f010)),
            Some(PhysicalAddress::new(0x10f_f010))
        );

        assert_eq!(ops.unmap(Iova::new(0x10_0000), MIB), MIB);
        assert_eq!(ops.iova_to_phys(Iova::new(0x10_0000)), None);
        assert_eq!(ops.iova_to_phys(Iova::new(0x1f_f000)), None);
    }

    #[test]
    fn unmap_counts_only_mapped_bytes() {
        let (_tlb, mut cfg) = setup(Quirks::empty(), 32);
        let ops = alloc(&mut cfg, ()).unwrap();

        // two sections at the start of a supersection-sized range
        ops.map(
            Iova::new(0x100_0000),
            PhysicalAddress::new(0x1000_0000),
            2 * MIB,
            RW,
        )
        .unwrap();
        assert_eq!(ops.unmap(Iova::new(0x100_0000), 16 * MIB), 2 * MIB);
        assert_eq!(ops.iova_to_phys(Iova::new(0x110_0000)), None);

        // a hole in front of the only page in a second-level table
        ops.map(Iova::new(0x20_1000), PhysicalAddress::new(0x1000), 4 * KIB, RW)
            .unwrap();
        assert_eq!(ops.unmap(Iova::new(0x20_0000), MIB), 0);
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x20_1000)),
            Some(PhysicalAddress::new(0x1000))
        );
    }

    #[test]
    fn mtk_high_address_bits() {
        let (_tlb, mut cfg) = setup(Quirks::ARM_MTK_4GB | Quirks::NO_PERMS, 34);
        let ops = alloc(&mut cfg, ()).unwrap();

        ops.map(
            Iova::new(0x1000),
            PhysicalAddress::new(0x3_0000_2000),
            4 * KIB,
            Prot::READ,
        )
        .unwrap();

        let pte = ops.iova_to_pte(Iova::new(0x1000));
        assert_ne!(pte & u64::from(MTK_PA_BIT32), 0);
        assert_ne!(pte & u64::from(MTK_PA_BIT33), 0);
        // no permission bits without permissions
        assert_eq!(pte & ((1 << 9) | (1 << 5)), 1 << 9);
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x1010)),
            Some(PhysicalAddress::new(0x3_0000_2010))
        );
    }

    #[test]
    fn invalidates_on_map() {
        let (tlb, mut cfg) = setup(Quirks::TLBI_ON_MAP, 32);
        let ops = alloc(&mut cfg, ()).unwrap();

        ops.map(Iova::new(0x1000), PhysicalAddress::new(0x1000), 4 * KIB, RW)
            .unwrap();
        assert_eq!(
            tlb.take_events(),
            [
                TlbEvent::AddFlush {
                    iova: Iova::new(0x1000),
                    size: 4 * KIB,
                    granule: 4 * KIB,
                    leaf: false
                },
                TlbEvent::Sync
            ]
        );
    }

    #[test]
    fn no_perms_maps_regardless_of_prot() {
        let (_tlb, mut cfg) = setup(Quirks::NO_PERMS, 32);
        let ops = alloc(&mut cfg, ()).unwrap();

        ops.map(
            Iova::new(0x1000),
            PhysicalAddress::new(0x5000),
            4 * KIB,
            Prot::empty(),
        )
        .unwrap();
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x1008)),
            Some(PhysicalAddress::new(0x5008))
        );

        let sg = [SgEntry::new(PhysicalAddress::new(0x20_0000), MIB)];
        assert_eq!(ops.map_sg(Iova::new(0x10_0000), &sg, Prot::empty()), Ok(MIB));
        assert_eq!(
            ops.iova_to_phys(Iova::new(0x10_0010)),
            Some(PhysicalAddress::new(0x20_0010))
        );
    }

    #[test]
    fn non_secure_descriptors() {
        let (tlb, mut cfg) = setup(Quirks::ARM_NS, 32);
        let ops = alloc(&mut cfg, ()).unwrap();

        ops.map(
            Iova::new(0x10_0000),
            PhysicalAddress::new(0x100_0000),
            MIB,
            RW,
        )
        .unwrap();
        ops.map(Iova::new(0x20_0000), PhysicalAddress::new(0x1000), 4 * KIB, RW)
            .unwrap();

        assert_ne!(
            ops.iova_to_pte(Iova::new(0x10_0000)) & u64::from(ATTR_NS_SECTION),
            0
        );

        let ttbr = cfg.format_cfg().and_then(FormatCfg::arm_v7s).unwrap().ttbr[0];
        // Safety: the root table lives as long as `ops`, and is only read here
        let pgd = unsafe {
            Table::<u32>::from_phys(
                &tlb.physmap(),
                PhysicalAddress::from_raw(u64::from(ttbr & TABLE_MASK)),
                Lvl::One.entries(),
            )
        };
        let pte = pgd.get(2);
        assert!(is_table(pte, Lvl::One));
        assert_ne!(pte & ATTR_NS_TABLE, 0);
    }

    #[test]
    fn concurrent_section_and_page_in_one_slot() {
        let (_tlb, mut cfg) = setup(Quirks::empty(), 32);
        let ops = alloc(&mut cfg, ()).unwrap();

        for _ in 0..64 {
            let (section, page) = std::thread::scope(|s| {
                let section = s.spawn(|| {
                    ops.map(
                        Iova::new(0x10_0000),
                        PhysicalAddress::new(0x100_0000),
                        MIB,
                        RW,
                    )
                });
                let page = s.spawn(|| {
                    ops.map(Iova::new(0x10_1000), PhysicalAddress::new(0x1000), 4 * KIB, RW)
                });
                (section.join().unwrap(), page.join().unwrap())
            });

            match (section, page) {
                (Ok(()), Err(MapError::Exists)) => {
                    assert_eq!(
                        ops.iova_to_phys(Iova::new(0x10_1000)),
                        Some(PhysicalAddress::new(0x100_1000))
                    );
                    assert_eq!(ops.unmap(Iova::new(0x10_0000), MIB), MIB);
                }
                (Err(MapError::Exists), Ok(())) => {
                    assert_eq!(
                        ops.iova_to_phys(Iova::new(0x10_1000)),
                        Some(PhysicalAddress::new(0x1000))
                    );
                    assert_eq!(ops.iova_to_phys(Iova::new(0x10_0000)), None);
                    assert_eq!(ops.unmap(Iova::new(0x10_1000), 4 * KIB), 4 * KIB);
                }
                res => panic!("unexpected outcome {res:?}"),
            }

            assert_eq!(ops.iova_to_phys(Iova::new(0x10_1000)), None);
        }
    }
}
