// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ptr::NonNull;

/// An address handed out by (or given to) a heap backend.
///
/// Addresses are plain integers rather than pointers because the video heap may describe memory
/// in a different address space that this CPU cannot dereference. Turning an address back into a
/// pointer is left to whoever knows the address is reachable (see [`Address::as_mut_ptr`]).
#[repr(transparent)]
#[derive(Default, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Address(usize);

impl Address {
    /// The null address, used wherever the allocator ABI would return or accept `NULL`.
    pub const NULL: Self = Self(0);

    #[must_use]
    pub const fn new(n: usize) -> Self {
        Self(n)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    #[inline]
    pub fn from_ptr<T: ?Sized>(ptr: *const T) -> Self {
        Self(ptr.expose_provenance())
    }

    #[must_use]
    #[inline]
    pub fn from_non_null<T: ?Sized>(ptr: NonNull<T>) -> Self {
        Self(ptr.cast::<u8>().as_ptr().expose_provenance())
    }

    #[inline]
    pub fn as_ptr(self) -> *const u8 {
        core::ptr::with_exposed_provenance(self.0)
    }

    #[inline]
    pub fn as_mut_ptr(self) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(self.0)
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

    #[must_use]
    #[inline]
    pub const fn checked_add(self, offset: usize) -> Option<Self> {
        match self.0.checked_add(offset) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Calculates the distance between two addresses in bytes, _where it’s known that `self`
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

    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn is_aligned_to(self, align: usize) -> bool {
        assert!(
            align.is_power_of_two(),
            "is_aligned_to: align is not a power-of-two"
        );

        self.0 & (align - 1) == 0
    }

    /// Rounds this address up to `align`, returning `None` if that would overflow.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two.
    #[must_use]
    #[inline]
    pub const fn checked_align_up(self, align: usize) -> Option<Self> {
        assert!(
            align.is_power_of_two(),
            "checked_align_up: align is not a power-of-two"
        );

        match crate::align_up(self.0, align) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_fmt(format_args!("{:#018x}", self.0)) // 18 digits to account for the leading 0x
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address")
            .field(&format_args!("{:#018x}", self.0))
            .finish()
    }
}
