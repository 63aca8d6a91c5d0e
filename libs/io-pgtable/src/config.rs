// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;

use bitflags::bitflags;

use crate::error::{ConfigError, ensure};
use crate::{AddressRangeExt, Iova, PhysMap, TlbOps};

bitflags! {
    /// Deviations from a format's nominal behaviour, required by specific hardware.
    ///
    /// A format that does not understand one of the requested quirks refuses to allocate.
    #[derive(Debug, Copy, Clone, Hash, PartialEq, Eq)]
    pub struct Quirks: u64 {
        /// Set the non-secure bits in every descriptor, even when running non-secure.
        const ARM_NS = 1 << 0;
        /// Ignore the requested permissions and map everything with the format's fixed
        /// permission profile.
        const NO_PERMS = 1 << 1;
        /// Invalidate the TLB after `map` as well, the hardware may cache non-present entries.
        const TLBI_ON_MAP = 1 << 2;
        /// Borrow two descriptor bits as physical address bits 32 and 33.
        const ARM_MTK_4GB = 1 << 3;
        /// The table walker is coherent with the CPU, skip the table-write barriers.
        const NO_DMA = 1 << 4;
        /// Walk the tables with non-shareable cacheable attributes.
        const NON_SHAREABLE = 1 << 5;
        /// Leave the table walk attributes to the upstream hardware default.
        const USE_UPSTREAM_HINT = 1 << 6;
        /// Walk the tables as write-back, no-write-allocate.
        const USE_LLC_NWA = 1 << 7;
    }
}

impl Quirks {
    /// Quirks that select the table walk memory attributes, at most one of them may be set.
    pub const WALK_ATTRIBUTES: Quirks = Quirks::NON_SHAREABLE
        .union(Quirks::USE_UPSTREAM_HINT)
        .union(Quirks::USE_LLC_NWA);
}

/// A bitmap of page sizes, bit `n` set means pages of `1 << n` bytes.
#[derive(Default, Copy, Clone, Hash, PartialEq, Eq)]
pub struct PageSizes(usize);

impl PageSizes {
    pub const EMPTY: Self = Self(0);

    pub const fn from_bits(bits: usize) -> Self {
        Self(bits)
    }

    pub const fn bits(&self) -> usize {
        self.0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Returns `true` if `size` is one of the page sizes in this set.
    pub const fn contains(&self, size: usize) -> bool {
        size.is_power_of_two() && self.0 & size != 0
    }

    #[must_use]
    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// The smallest page size in this set, the granule every address and size must be a
    /// multiple of.
    pub const fn min_granule(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(1 << self.0.trailing_zeros())
        }
    }

    /// The largest page size in this set.
    pub const fn max_page_size(&self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(1 << self.0.ilog2())
        }
    }

    /// Returns the largest page size that is no larger than `len` and to which `addr` is aligned.
    pub const fn best_fit(&self, addr: usize, len: usize) -> Option<usize> {
        let mut candidates = self.0;

        // sizes larger than the remaining length
        if len < 1 << (usize::BITS - 1) {
            let limit = (len + 1).next_power_of_two();
            candidates &= limit.wrapping_sub(1);
        }

        // sizes the address is not aligned to
        if addr != 0 {
            let align = 1usize << addr.trailing_zeros();
            candidates &= (align << 1).wrapping_sub(1);
        }

        if candidates == 0 {
            None
        } else {
            Some(1 << candidates.ilog2())
        }
    }

    /// Iterates over all page sizes in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + use<> {
        let bits = self.0;
        (0..usize::BITS)
            .map(|shift| 1usize << shift)
            .filter(move |size| bits & size != 0)
    }
}

impl FromIterator<usize> for PageSizes {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        Self(iter.into_iter().fold(0, |acc, size| {
            debug_assert!(size.is_power_of_two());
            acc | size
        }))
    }
}

impl fmt::Debug for PageSizes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("PageSizes")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

/// An opaque identifier for the DMA addressing context that owns the page table memory.
///
/// Passed through to the page allocation hooks unexamined.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle(usize);

impl DeviceHandle {
    pub const fn new(id: usize) -> Self {
        Self(id)
    }

    pub const fn id(&self) -> usize {
        self.0
    }
}

/// Register values for a stage-1 ARM long-descriptor table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArmLpaeS1Cfg {
    pub ttbr: [u64; 2],
    pub tcr: u64,
    pub mair: [u64; 2],
}

/// Register values for a stage-2 ARM long-descriptor table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArmLpaeS2Cfg {
    pub vttbr: u64,
    pub vtcr: u64,
}

/// Register values for an ARM v7 short-descriptor table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ArmV7sCfg {
    pub ttbr: [u32; 2],
    pub tcr: u32,
    pub nmrr: u32,
    pub prrr: u32,
}

/// Register values for a fast-path AArch64 table, plus the location of its preallocated leaf
/// tables.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Av8lFastCfg {
    pub ttbr: [u64; 2],
    pub tcr: u64,
    pub mair: [u64; 2],
    /// Physical base of the contiguous block holding every last-level table, in IOVA order.
    pub pmds: crate::PhysicalAddress,
}

/// The hardware register payload produced by a format allocator. Exactly one variant is ever
/// populated and it always matches the format of the owning page table.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FormatCfg {
    ArmLpaeS1(ArmLpaeS1Cfg),
    ArmLpaeS2(ArmLpaeS2Cfg),
    ArmV7s(ArmV7sCfg),
    Av8lFast(Av8lFastCfg),
}

impl FormatCfg {
    pub const fn arm_lpae_s1(&self) -> Option<&ArmLpaeS1Cfg> {
        match self {
            FormatCfg::ArmLpaeS1(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub const fn arm_lpae_s2(&self) -> Option<&ArmLpaeS2Cfg> {
        match self {
            FormatCfg::ArmLpaeS2(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub const fn arm_v7s(&self) -> Option<&ArmV7sCfg> {
        match self {
            FormatCfg::ArmV7s(cfg) => Some(cfg),
            _ => None,
        }
    }

    pub const fn av8l_fast(&self) -> Option<&Av8lFastCfg> {
        match self {
            FormatCfg::Av8lFast(cfg) => Some(cfg),
            _ => None,
        }
    }
}

/// Configuration for a page table.
///
/// The caller fills in everything except the format payload and hands the configuration to
/// [`alloc_io_pgtable_ops`](crate::alloc_io_pgtable_ops). On success the allocator narrows
/// [`Self::page_sizes`] to what the format actually provides and publishes the register values
/// the IOMMU must be programmed with through [`Self::format_cfg`].
pub struct IoPgtableCfg<C> {
    pub quirks: Quirks,
    pub page_sizes: PageSizes,
    /// Input (IOVA) address width in bits.
    pub ias: u32,
    /// Output (physical) address width in bits.
    pub oas: u32,
    /// TLB maintenance and page allocation callbacks. `None` if invalidation is handled entirely
    /// outside of the page table code.
    pub tlb: Option<Arc<dyn TlbOps<C>>>,
    pub iommu_dev: Option<DeviceHandle>,
    /// The IOVAs this table may describe, everything below `1 << ias` if `None`.
    pub iova_range: Option<Range<Iova>>,
    /// How table memory addresses are translated to the physical addresses stored in
    /// descriptors.
    pub physmap: PhysMap,
    pub(crate) format_cfg: Option<FormatCfg>,
}

impl<C> IoPgtableCfg<C> {
    pub fn new(page_sizes: PageSizes, ias: u32, oas: u32) -> Self {
        Self {
            quirks: Quirks::empty(),
            page_sizes,
            ias,
            oas,
            tlb: None,
            iommu_dev: None,
            iova_range: None,
            physmap: PhysMap::identity(),
            format_cfg: None,
        }
    }

    #[must_use]
    pub fn with_quirks(mut self, quirks: Quirks) -> Self {
        self.quirks = quirks;
        self
    }

    #[must_use]
    pub fn with_tlb(mut self, tlb: Arc<dyn TlbOps<C>>) -> Self {
        self.tlb = Some(tlb);
        self
    }

    #[must_use]
    pub fn with_iommu_dev(mut self, dev: DeviceHandle) -> Self {
        self.iommu_dev = Some(dev);
        self
    }

    #[must_use]
    pub fn with_iova_range(mut self, range: Range<Iova>) -> Self {
        self.iova_range = Some(range);
        self
    }

    #[must_use]
    pub fn with_physmap(mut self, physmap: PhysMap) -> Self {
        self.physmap = physmap;
        self
    }

    /// The register values published by the allocator, `None` before a successful allocation.
    pub fn format_cfg(&self) -> Option<&FormatCfg> {
        self.format_cfg.as_ref()
    }

    /// Returns the range of IOVAs this table may describe.
    pub fn effective_iova_range(&self) -> Range<Iova> {
        let limit = if self.ias >= usize::BITS {
            Iova::MAX
        } else {
            Iova::new(1 << self.ias)
        };

        match &self.iova_range {
            Some(range) => range.clone().intersect(Iova::MIN..limit),
            None => Iova::MIN..limit,
        }
    }

    pub(crate) fn check_quirks(&self, supported: Quirks) -> Result<(), ConfigError> {
        let unsupported = self.quirks.difference(supported);
        if !unsupported.is_empty() {
            log::debug!("rejecting unsupported quirks {unsupported:?}");
            return Err(ConfigError::UnsupportedQuirks {
                quirks: unsupported,
            });
        }

        if self.quirks.intersection(Quirks::WALK_ATTRIBUTES).bits().count_ones() > 1 {
            log::debug!(
                "rejecting conflicting walk attribute quirks {:?}",
                self.quirks.intersection(Quirks::WALK_ATTRIBUTES)
            );
            return Err(ConfigError::IncompatibleQuirks);
        }

        Ok(())
    }

    pub(crate) fn check_iova_range(&self) -> Result<(), ConfigError> {
        if let Some(range) = &self.iova_range {
            ensure!(!range.is_empty(), ConfigError::InvalidIovaRange);
            ensure!(
                range.end.sub(1).fits_in_bits(self.ias),
                ConfigError::InvalidIovaRange
            );
        }

        Ok(())
    }
}

impl<C> Clone for IoPgtableCfg<C> {
    fn clone(&self) -> Self {
        Self {
            quirks: self.quirks,
            page_sizes: self.page_sizes,
            ias: self.ias,
            oas: self.oas,
            tlb: self.tlb.clone(),
            iommu_dev: self.iommu_dev,
            iova_range: self.iova_range.clone(),
            physmap: self.physmap,
            format_cfg: self.format_cfg,
        }
    }
}

impl<C> fmt::Debug for IoPgtableCfg<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoPgtableCfg")
            .field("quirks", &self.quirks)
            .field("page_sizes", &self.page_sizes)
            .field("ias", &self.ias)
            .field("oas", &self.oas)
            .field("tlb", &self.tlb.as_ref().map(|_| "TlbOps"))
            .field("iommu_dev", &self.iommu_dev)
            .field("iova_range", &self.iova_range)
            .field("physmap", &self.physmap)
            .field("format_cfg", &self.format_cfg)
            .finish()
    }
}
