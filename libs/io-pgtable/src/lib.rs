// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(test), no_std)]

//! IOMMU page tables.
//!
//! IOMMU drivers allocate a page table through [`alloc_io_pgtable_ops`], naming the hardware
//! [`Format`] and describing what they need in an [`IoPgtableCfg`]. The returned
//! [`IoPgtableOps`] maps, unmaps and translates IOVAs without the driver knowing anything about
//! the format's encoding. Tables are released again through [`free_io_pgtable_ops`].
//!
//! ## TLB maintenance
//!
//! Every change that removes or narrows a translation is followed by invalidations the driver
//! performs through its [`TlbOps`]: one [`TlbOps::tlb_add_flush`] per changed range and a single
//! [`TlbOps::tlb_sync`] at the end of the operation. By the time `unmap` returns the stale
//! translations are gone.
//!
//! ## Concurrency
//!
//! All operations take `&self`. Intermediate tables are installed with a compare-and-swap and,
//! once linked, stay linked until the page table is freed. Unmapping a range clears the leaves
//! below a table rather than unlinking it, and a larger page requested over a linked table is
//! mapped as smaller pages through it. Concurrent calls therefore never observe freed table
//! memory or corrupt the structure, but the outcome of concurrent calls touching overlapping IOVA
//! ranges is unspecified.

extern crate alloc;

mod address;
mod address_range;
mod config;
mod error;
mod format;
mod geometry;
mod page_alloc;
mod pgtable;
mod physmap;
mod prot;
mod registry;
mod table;
#[cfg(test)]
mod test_utils;
mod tlb;

pub use address::{Iova, PhysicalAddress};
pub use address_range::AddressRangeExt;
pub use config::{
    ArmLpaeS1Cfg, ArmLpaeS2Cfg, ArmV7sCfg, Av8lFastCfg, DeviceHandle, FormatCfg, IoPgtableCfg,
    PageSizes, Quirks,
};
pub use error::{AllocError, ConfigError, MapError, MapSgError};
pub use format::Leaf;
pub use page_alloc::{AllocFlags, io_pgtable_bytes_allocated};
pub use pgtable::{Format, IoPgtable, IoPgtableOps, SgEntry};
pub use physmap::PhysMap;
pub use prot::Prot;
pub use registry::{alloc_io_pgtable_ops, free_io_pgtable_ops};
pub use tlb::{Gather, TlbOps};

pub const KIB: usize = 1024;
pub const MIB: usize = KIB * 1024;
pub const GIB: usize = MIB * 1024;
