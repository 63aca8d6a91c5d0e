// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Dispatch from a [`Format`] to the allocator that understands it.

use alloc::boxed::Box;

#[cfg(feature = "arm-lpae")]
use crate::format::arm_lpae;
#[cfg(feature = "arm-v7s")]
use crate::format::arm_v7s;
#[cfg(feature = "av8l-fast")]
use crate::format::av8l_fast;
use crate::{ConfigError, Format, IoPgtableCfg, IoPgtableOps};

type AllocFn<C> = fn(&mut IoPgtableCfg<C>, C) -> Result<Box<dyn IoPgtableOps<C>>, ConfigError>;
type FreeFn<C> = fn(Box<dyn IoPgtableOps<C>>);

/// The entry points of one format.
struct InitFns<C> {
    alloc: AllocFn<C>,
    free: FreeFn<C>,
}

impl<C> InitFns<C> {
    const fn new(alloc: AllocFn<C>, free: FreeFn<C>) -> Self {
        Self { alloc, free }
    }
}

/// Returns the entry points for `fmt`, or `None` if support for it was not compiled in.
fn init_fns<C: Send + Sync + 'static>(fmt: Format) -> Option<InitFns<C>> {
    match fmt {
        #[cfg(feature = "arm-lpae")]
        Format::ArmLpae32S1 => Some(InitFns::new(arm_lpae::alloc_32_s1, arm_lpae::free)),
        #[cfg(feature = "arm-lpae")]
        Format::ArmLpae32S2 => Some(InitFns::new(arm_lpae::alloc_32_s2, arm_lpae::free)),
        #[cfg(feature = "arm-lpae")]
        Format::ArmLpae64S1 => Some(InitFns::new(arm_lpae::alloc_64_s1, arm_lpae::free)),
        #[cfg(feature = "arm-lpae")]
        Format::ArmLpae64S2 => Some(InitFns::new(arm_lpae::alloc_64_s2, arm_lpae::free)),
        #[cfg(feature = "arm-v7s")]
        Format::ArmV7s => Some(InitFns::new(arm_v7s::alloc, arm_v7s::free)),
        #[cfg(feature = "av8l-fast")]
        Format::Av8lFast => Some(InitFns::new(av8l_fast::alloc, arm_lpae::free)),
        #[allow(
            unreachable_patterns,
            reason = "only reachable when a format is compiled out"
        )]
        _ => None,
    }
}

/// Allocate a page table of format `fmt`.
///
/// On success `cfg` is updated to what the format granted: [`IoPgtableCfg::page_sizes`] is
/// narrowed to the supported page sizes and [`IoPgtableCfg::format_cfg`] holds the register values
/// the IOMMU must be programmed with. `cookie` is handed to every [`TlbOps`](crate::TlbOps)
/// callback made on behalf of the returned table.
///
/// # Errors
///
/// Returns an error if the format is not available, if it cannot satisfy the requested page
/// sizes, address widths or quirks, or if the root table cannot be allocated. `cfg` is left
/// untouched in that case.
pub fn alloc_io_pgtable_ops<C: Send + Sync + 'static>(
    fmt: Format,
    cfg: &mut IoPgtableCfg<C>,
    cookie: C,
) -> Result<Box<dyn IoPgtableOps<C>>, ConfigError> {
    let Some(fns) = init_fns::<C>(fmt) else {
        log::debug!("page table format {fmt} is not supported");
        return Err(ConfigError::UnsupportedFormat);
    };

    let ops = (fns.alloc)(cfg, cookie)?;
    debug_assert_eq!(ops.io_pgtable().fmt(), fmt);

    log::debug!(
        "allocated {fmt} page table, ias={} oas={} page sizes {:?}",
        cfg.ias,
        cfg.oas,
        cfg.page_sizes
    );

    Ok(ops)
}

/// Free a page table allocated by [`alloc_io_pgtable_ops`].
///
/// The whole TLB context is invalidated before the table memory is released. The caller must make
/// sure that the IOMMU no longer walks this table, for example by detaching it from all devices.
pub fn free_io_pgtable_ops<C: Send + Sync + 'static>(ops: Box<dyn IoPgtableOps<C>>) {
    let iop = ops.io_pgtable();
    iop.tlb_flush_all();

    match init_fns::<C>(iop.fmt()) {
        Some(fns) => (fns.free)(ops),
        // only formats with entry points can be allocated in the first place
        None => drop(ops),
    }
}
