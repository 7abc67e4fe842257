// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;
use core::ops::Range;
use core::slice;

use crate::Address;

/// A span of raw memory that lives for the rest of the program, e.g. a linker-provided heap
/// section or a block carved out of another heap.
///
/// `RawRegion` implements `AsRef<[u8]>`/`AsMut<[u8]>` so it can serve as storage for the backends
/// that keep metadata in memory ([`FixedRangeHeap`](crate::FixedRangeHeap) and the control block of
/// [`FixedBlockCountHeap`](crate::FixedBlockCountHeap)).
pub struct RawRegion {
    base: Address,
    len: usize,
}

impl RawRegion {
    /// # Safety
    ///
    /// `base..base + len` must be valid for reads and writes, must not be accessed through any
    /// other path except the addresses the owning heap hands out, and must remain valid for as
    /// long as the returned region (and any heap built on top of it) is alive.
    pub const unsafe fn new(base: Address, len: usize) -> Self {
        Self { base, len }
    }

    pub const fn base(&self) -> Address {
        self.base
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn range(&self) -> Range<Address> {
        self.base..self.base.add(self.len)
    }
}

impl fmt::Debug for RawRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawRegion")
            .field("base", &self.base)
            .field("len", &self.len)
            .finish()
    }
}

impl AsRef<[u8]> for RawRegion {
    fn as_ref(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }

        // Safety: validity and exclusivity of the span are guaranteed by the caller of `new`
        unsafe { slice::from_raw_parts(self.base.as_ptr(), self.len) }
    }
}

impl AsMut<[u8]> for RawRegion {
    fn as_mut(&mut self) -> &mut [u8] {
        if self.len == 0 {
            return &mut [];
        }

        // Safety: validity and exclusivity of the span are guaranteed by the caller of `new`
        unsafe { slice::from_raw_parts_mut(self.base.as_mut_ptr(), self.len) }
    }
}
