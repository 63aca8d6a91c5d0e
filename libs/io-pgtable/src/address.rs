// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

macro_rules! impl_address_from {
    ($address_ty:ident, $int_ty:ident) => {
        impl From<$int_ty> for $address_ty {
            fn from(value: $int_ty) -> Self {
                $address_ty(usize::from(value))
            }
        }
    };
}

macro_rules! impl_address_try_from {
    ($address_ty:ident, $int_ty:ident) => {
        impl TryFrom<$int_ty> for $address_ty {
            type Error = <usize as TryFrom<$int_ty>>::Error;

            fn try_from(value: $int_ty) -> Result<Self, Self::Error> {
                usize::try_from(value).map($address_ty)
            }
        }
    };
}

macro_rules! impl_address {
    ($address_ty:ident) => {
        impl $address_ty {
            pub const MAX: Self = Self(usize::MAX);
            pub const MIN: Self = Self(usize::MIN);

            #[must_use]
            pub const fn new(n: usize) -> Self {
                Self(n)
            }

            #[inline]
            pub const fn get(&self) -> usize {
                self.0
            }

            /// Returns the address as the raw 64-bit value written into hardware descriptors
            /// and registers.
            #[inline]
            pub const fn as_u64(&self) -> u64 {
                self.0 as u64
            }

            /// Adds an unsigned offset to this address, panicking if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn add(self, offset: usize) -> Self {
                Self(self.0 + offset)
            }

            /// Subtracts an unsigned offset from this address, panicking if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn sub(self, offset: usize) -> Self {
                Self(self.0 - offset)
            }

            /// Adds an unsigned offset to this address, returning `None` if overflow occurred.
            #[must_use]
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(n) => Some(Self(n)),
                    None => None,
                }
            }

            /// Adds a signed offset in bytes to this address, wrapping around at the boundary of the type.
            #[must_use]
            #[inline]
            pub const fn wrapping_offset(self, offset: isize) -> Self {
                Self(self.0.wrapping_add_signed(offset))
            }

            /// Calculates the distance between two addresses in bytes, _where it's known that `self`
            /// is equal to or greater than `origin`_.
            ///
            /// # Panics
            ///
            /// Panics if `self` is less than `origin`.
            #[must_use]
            #[inline]
            pub const fn offset_from_unsigned(self, origin: Self) -> usize {
                let (a, b) = self.0.overflowing_sub(origin.0);
                if b {
                    panic!("attempt to subtract with overflow")
                } else {
                    a
                }
            }

            #[must_use]
            #[inline]
            pub const fn is_aligned_to(&self, align: usize) -> bool {
                assert!(
                    align.is_power_of_two(),
                    "is_aligned_to: align is not a power-of-two"
                );

                self.0 & (align - 1) == 0
            }

            #[must_use]
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                if !align.is_power_of_two() {
                    panic!("checked_align_up: align is not a power-of-two");
                }

                let aligned = Self(self.0.wrapping_add(align - 1) & 0usize.wrapping_sub(align));
                debug_assert!(aligned.is_aligned_to(align));
                aligned
            }

            #[must_use]
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                if !align.is_power_of_two() {
                    panic!("checked_align_up: align is not a power-of-two");
                }

                let aligned = Self(self.0 & 0usize.wrapping_sub(align));
                debug_assert!(aligned.is_aligned_to(align));
                debug_assert!(aligned.0 <= self.0);
                aligned
            }

            /// Returns `true` if this address can be expressed with `bits` bits.
            #[must_use]
            #[inline]
            pub const fn fits_in_bits(&self, bits: u32) -> bool {
                bits >= usize::BITS || self.0 >> bits == 0
            }
        }

        impl_address_from!($address_ty, usize);
        impl_address_from!($address_ty, u8);
        impl_address_from!($address_ty, u16);
        impl_address_try_from!($address_ty, u32);
        impl_address_try_from!($address_ty, u64);

        impl ::core::fmt::Display for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_fmt(format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
            }
        }

        impl ::core::fmt::Debug for $address_ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.debug_tuple(stringify!($address_ty))
                    .field(&format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
                    .finish()
            }
        }
    };
}

/// An I/O virtual address: a coordinate in the address space a device sees, the input to
/// translation.
#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Iova(usize);
impl_address!(Iova);

/// An address in the output (physical) address space of the translation.
#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(usize);
impl_address!(PhysicalAddress);

impl PhysicalAddress {
    /// Constructs a `PhysicalAddress` from a raw value read out of a hardware descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `raw` does not fit into a `usize` on this host.
    #[must_use]
    pub fn from_raw(raw: u64) -> Self {
        Self(usize::try_from(raw).expect("physical address exceeds host pointer width"))
    }
}
