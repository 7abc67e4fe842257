// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

#![cfg_attr(not(test), no_std)]

//! Pluggable heap management for targets that may lack a system allocator or need to manage a
//! second, physically separate memory region (e.g. video memory).
//!
//! Three interchangeable backends implement [`HeapBackend`]:
//!
//! - [`DynamicHeap`] wraps a [`Platform`] allocator, optionally tracking each allocation's size in
//!   a 4-byte prefix when the platform cannot report it.
//! - [`FixedRangeHeap`] is a first-fit allocator over one contiguous region, keeping its block
//!   headers *in-band* right before each payload and coalescing neighbours on free.
//! - [`FixedBlockCountHeap`] manages a payload region it never touches, keeping all bookkeeping in
//!   a separate control block made of two bounded descriptor arrays.
//!
//! [`MemorySubsystem`] owns one backend for the system heap and optionally a second one for the
//! video heap and forwards the allocate/free/size API to them.
//!
//! ## Features
//!
//! `fixed-range` and `fixed-block-count` compile the in-memory backends, `dynamic` allows the
//! subsystem to bind the platform allocator. All three are on by default. A subsystem asked for a
//! backend that is not compiled in binds a dummy backend or reports
//! [`Error::BackendUnavailable`]. `alloc` adds [`GlobalPlatform`](crate::GlobalPlatform).
//!
//! ## Threading
//!
//! Nothing in this crate locks. All operations take `&mut self` and callers that share a heap
//! between execution contexts (threads, interrupt handlers) must serialize access themselves.

#[cfg(feature = "alloc")]
extern crate alloc;

mod address;
mod backend;
mod dynamic;
mod error;
#[cfg(feature = "fixed-block-count")]
mod fixed_block_count;
#[cfg(feature = "fixed-range")]
mod fixed_range;
mod region;
mod subsystem;
#[cfg(test)]
mod test_utils;

pub use address::Address;
pub use backend::{Backend, BackendKind, HeapBackend, HeapUsage};
#[cfg(feature = "alloc")]
pub use dynamic::GlobalPlatform;
pub use dynamic::{DynamicHeap, Platform, SIZE_PREFIX};
pub use error::Error;
#[cfg(feature = "fixed-block-count")]
pub use fixed_block_count::{
    ControlHeader, Extent, ExtentDescriptor, FixedBlockCountHeap, PAYLOAD_ALIGN,
};
#[cfg(feature = "fixed-range")]
pub use fixed_range::{BlockInfo, Blocks, FixedRangeHeap, HEADER_SIZE, MINIMUM_BLOCKSIZE};
pub use region::RawRegion;
pub use subsystem::{Architecture, MemoryConfig, MemorySubsystem, RegionConfig, State, VideoConfig};

pub type Result<T> = core::result::Result<T, Error>;

pub const KIB: usize = 1024;

/// Rounds `value` up to the next multiple of `align`, returning `None` on overflow.
///
/// `align` must be a power of two.
#[inline]
pub(crate) const fn align_up(value: usize, align: usize) -> Option<usize> {
    debug_assert!(align.is_power_of_two());
    let mask = align - 1;
    match value.checked_add(mask) {
        Some(v) => Some(v & !mask),
        None => None,
    }
}

/// Reads the native-endian machine word at `offset` of `bytes`.
#[cfg(any(feature = "fixed-range", feature = "fixed-block-count"))]
pub(crate) fn read_word(bytes: &[u8], offset: usize) -> usize {
    let mut word = [0; size_of::<usize>()];
    word.copy_from_slice(&bytes[offset..offset + size_of::<usize>()]);
    usize::from_ne_bytes(word)
}

#[cfg(any(feature = "fixed-range", feature = "fixed-block-count"))]
pub(crate) fn write_word(bytes: &mut [u8], offset: usize, value: usize) {
    bytes[offset..offset + size_of::<usize>()].copy_from_slice(&value.to_ne_bytes());
}
