// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::{Iova, PhysicalAddress};

/// Helpers for IOVA and physical address ranges.
pub trait AddressRangeExt {
    type Address;

    fn from_start_len(start: Self::Address, len: usize) -> Self;

    /// Returns the length of the address range, in bytes. Empty and inverted ranges have length 0.
    fn len(&self) -> usize;

    /// Returns `true` if there exists an address present in both ranges.
    fn overlaps(&self, other: &Self) -> bool;

    /// Returns the intersection of `self` and `other`, an empty range if they do not overlap.
    #[must_use]
    fn intersect(self, other: Self) -> Self;

    /// Shrinks the range to the largest `align` aligned range within it.
    #[must_use]
    fn align_in(self, align: usize) -> Self;

    /// Grows the range to the smallest `align` aligned range containing it.
    #[must_use]
    fn align_out(self, align: usize) -> Self;
}

macro_rules! impl_address_range {
    ($address_ty:ident) => {
        impl AddressRangeExt for ::core::ops::Range<$address_ty> {
            type Address = $address_ty;

            fn from_start_len(start: Self::Address, len: usize) -> Self {
                start..start.add(len)
            }

            fn len(&self) -> usize {
                if self.is_empty() {
                    0
                } else {
                    self.end.offset_from_unsigned(self.start)
                }
            }

            fn overlaps(&self, other: &Self) -> bool {
                self.start < other.end && other.start < self.end
            }

            fn intersect(self, other: Self) -> Self {
                let start = ::core::cmp::max(self.start, other.start);
                let end = ::core::cmp::min(self.end, other.end);

                if start < end { start..end } else { start..start }
            }

            fn align_in(self, align: usize) -> Self {
                let start = self.start.align_up(align);
                let end = self.end.align_down(align);

                if start < end { start..end } else { start..start }
            }

            fn align_out(self, align: usize) -> Self {
                self.start.align_down(align)..self.end.align_up(align)
            }
        }
    };
}

impl_address_range!(Iova);
impl_address_range!(PhysicalAddress);
