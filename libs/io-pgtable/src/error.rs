// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt::{Display, Formatter};

use crate::Quirks;

/// Page table memory could not be allocated.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllocError;

impl Display for AllocError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str("page table memory allocation failed")
    }
}

impl core::error::Error for AllocError {}

/// Reasons a format can refuse to allocate a page table for a given configuration.
///
/// No page table and no partially narrowed configuration is observable after any of these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// The requested format is not compiled into this build.
    UnsupportedFormat,
    /// The format does not understand some of the requested quirks.
    UnsupportedQuirks { quirks: Quirks },
    /// The requested quirks are individually supported but cannot be combined.
    IncompatibleQuirks,
    /// The input (IOVA) address width is not supported by the format.
    InputAddressSize { bits: u32 },
    /// The output (physical) address width is not supported by the format.
    OutputAddressSize { bits: u32 },
    /// None of the requested page sizes can be provided by the format.
    NoPageSizes,
    /// The valid IOVA range is empty or does not fit the input address width.
    InvalidIovaRange,
    /// The initial table hierarchy could not be allocated.
    Alloc(AllocError),
}

impl From<AllocError> for ConfigError {
    fn from(err: AllocError) -> Self {
        ConfigError::Alloc(err)
    }
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            ConfigError::UnsupportedFormat => {
                write!(f, "page table format is not supported by this build")
            }
            ConfigError::UnsupportedQuirks { quirks } => {
                write!(f, "format does not support quirks {quirks:?}")
            }
            ConfigError::IncompatibleQuirks => write!(f, "requested quirks are mutually exclusive"),
            ConfigError::InputAddressSize { bits } => {
                write!(f, "unsupported input address size of {bits} bits")
            }
            ConfigError::OutputAddressSize { bits } => {
                write!(f, "unsupported output address size of {bits} bits")
            }
            ConfigError::NoPageSizes => write!(f, "no supported page size was requested"),
            ConfigError::InvalidIovaRange => write!(f, "invalid IOVA range"),
            ConfigError::Alloc(err) => write!(f, "failed to allocate initial tables: {err}"),
        }
    }
}

impl core::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            ConfigError::Alloc(err) => Some(err),
            _ => None,
        }
    }
}

/// Reasons a `map` call can fail. The table is left exactly as it was before the call.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MapError {
    /// The IOVA, physical address or size is not a multiple of the smallest page size.
    Misaligned,
    /// The IOVA or physical address range lies outside the configured address space.
    OutOfRange,
    /// Part of the range is already mapped.
    Exists,
    /// An intermediate table could not be allocated.
    Alloc(AllocError),
}

impl From<AllocError> for MapError {
    fn from(err: AllocError) -> Self {
        MapError::Alloc(err)
    }
}

impl Display for MapError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            MapError::Misaligned => write!(f, "address or size is not aligned to a supported page size"),
            MapError::OutOfRange => write!(f, "address range is outside the translatable range"),
            MapError::Exists => write!(f, "address range is already mapped"),
            MapError::Alloc(err) => write!(f, "failed to allocate intermediate table: {err}"),
        }
    }
}

impl core::error::Error for MapError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        match self {
            MapError::Alloc(err) => Some(err),
            _ => None,
        }
    }
}

/// A `map_sg` call stopped partway through its scatter list.
///
/// The first `mapped` bytes stay mapped and it is up to the caller to unmap them.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MapSgError {
    /// Number of bytes mapped before the failing segment.
    pub mapped: usize,
    /// Why the failing segment could not be mapped.
    pub error: MapError,
}

impl Display for MapSgError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "scatter-gather mapping failed after {} bytes: {}",
            self.mapped, self.error
        )
    }
}

impl core::error::Error for MapSgError {
    fn source(&self) -> Option<&(dyn core::error::Error + 'static)> {
        Some(&self.error)
    }
}

macro_rules! ensure {
    ($cond:expr, $error:expr) => {
        if !$cond {
            return Err($error);
        }
    };
}
pub(crate) use ensure;
