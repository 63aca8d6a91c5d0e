// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! AArch64 stage 1 tables for hot DMA paths.
//!
//! Uses the regular long-descriptor encoding with a 4KiB granule and three levels, but allocates
//! every table covering the IOVA range up front. The last-level tables live in one contiguous
//! block, so `map` and `unmap` never have to allocate and the IOMMU driver can find the
//! descriptor of any IOVA by plain arithmetic on [`Av8lFastCfg::pmds`].

use alloc::boxed::Box;
use core::alloc::Layout;
use core::ops::Range;

use crate::error::ensure;
use crate::format::PgtableFormat;
use crate::format::arm_lpae::{
    ArmLpae, MAX_ADDR_BITS, Prealloc, Stage, Validated, build_geometry, s1_registers, validate,
};
use crate::page_alloc::AllocFlags;
use crate::table::Table;
use crate::{
    AllocError, Av8lFastCfg, ConfigError, Format, FormatCfg, IoPgtable, IoPgtableCfg,
    IoPgtableOps, Iova, KIB, PageSizes, PhysicalAddress, Quirks,
};

const PAGE_SIZE: usize = 4 * KIB;
/// Three levels of 4KiB tables resolve at most 39 bits, anything below 31 would need only two.
const IAS_RANGE: Range<u32> = 31..40;

pub(crate) fn alloc<C: Send + Sync + 'static>(
    cfg: &mut IoPgtableCfg<C>,
    cookie: C,
) -> Result<Box<dyn IoPgtableOps<C>>, ConfigError> {
    let mut requested = cfg.clone();

    ensure!(
        requested.page_sizes.contains(PAGE_SIZE),
        ConfigError::NoPageSizes
    );
    requested.page_sizes = PageSizes::from_iter([PAGE_SIZE]);

    ensure!(
        IAS_RANGE.contains(&requested.ias),
        ConfigError::InputAddressSize {
            bits: requested.ias
        }
    );

    let Validated {
        page_sizes,
        pg_shift,
        ips,
    } = validate(
        &requested,
        Quirks::NO_DMA | Quirks::WALK_ATTRIBUTES,
        IAS_RANGE.end - 1,
        MAX_ADDR_BITS,
    )?;
    requested.page_sizes = page_sizes;

    let geometry = build_geometry(requested.ias, pg_shift, page_sizes, Stage::S1);
    debug_assert_eq!(geometry.depth(), 3);

    let range = requested.effective_iova_range();
    let ias = requested.ias;
    let quirks = requested.quirks;

    let iop = IoPgtable::new(Format::Av8lFast, cookie, requested);
    let mut data = ArmLpae::new(iop, Stage::S1, geometry, PAGE_SIZE)?;
    let pmds = prealloc_leaf_tables(&mut data, &range)?;

    let regs = s1_registers(ias, ips, PAGE_SIZE, quirks, data.pgd_phys());
    data.iop_mut()
        .set_format_cfg(FormatCfg::Av8lFast(Av8lFastCfg {
            ttbr: regs.ttbr,
            tcr: regs.tcr,
            mair: regs.mair,
            pmds,
        }));
    *cfg = data.iop().cfg().clone();

    Ok(Box::new(data))
}

/// Allocates the last-level tables for `range` as one block and links them, along with every
/// intermediate table above them. Returns the physical address of the block.
fn prealloc_leaf_tables<C: Send + Sync>(
    data: &mut ArmLpae<C>,
    range: &Range<Iova>,
) -> Result<PhysicalAddress, AllocError> {
    let leaf_depth = data.geometry().depth() - 1;
    let table_depth = leaf_depth - 1;
    let span = data.geometry().level(table_depth).page_size();
    let table_size = Table::<u64>::layout(data.geometry().level(leaf_depth).entries()).size();

    let start = range.start.align_down(span);
    let end = range.end.align_up(span);
    let count = end.offset_from_unsigned(start) / span;

    let layout =
        Layout::from_size_align(count * table_size, table_size).map_err(|_| AllocError)?;
    let block = data.iop().alloc_pages(layout, AllocFlags::empty())?;
    // from here on the block is released together with the page table
    data.set_prealloc(Prealloc { block, layout });

    let base = data.iop().physmap().virt_to_phys(block.as_ptr());
    ensure!(
        base.add(layout.size() - 1).fits_in_bits(MAX_ADDR_BITS),
        AllocError
    );

    for i in 0..count {
        let iova = start.add(i * span);
        let table = data.walk_alloc(iova, table_depth).map_err(|_| AllocError)?;
        let index = data.geometry().level(table_depth).pte_index_of(iova);

        table.set(index, data.table_pte(base.add(i * table_size)));
    }
    data.iop().table_barrier();

    log::debug!(
        "preallocated {count} leaf tables at {base} covering {start}..{}",
        start.add(count * span)
    );

    Ok(base)
}
