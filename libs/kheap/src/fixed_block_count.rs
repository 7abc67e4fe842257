// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Allocator for memory that cannot hold its own bookkeeping.
//!
//! The payload region is never read or written, it may even live in a different address space
//! (e.g. memory only reachable through a graphics accelerator). All state lives in a separate
//! *control block* with the following layout:
//!
//! ```text
//! | ControlHeader | free_list: [ExtentDescriptor; N] | used_list: [ExtentDescriptor; N] |
//! ```
//!
//! The size of that block is part of the contract with callers that preallocate it, see
//! [`FixedBlockCountHeap::required_control_bytes`].
//!
//! A descriptor with a zero `addr` is an empty slot. Every live allocation occupies one used-list
//! slot, so at most `N` allocations can be live at once no matter how much payload is left.

use core::fmt;
use core::ops::Range;

use static_assertions::const_assert_eq;

use crate::backend::{HeapBackend, HeapUsage};
use crate::{Address, Error, Result, read_word, write_word};

/// Payload addresses and allocation sizes are multiples of this.
pub const PAYLOAD_ALIGN: usize = 64;

const WORD: usize = size_of::<usize>();
const DESCRIPTOR_SIZE: usize = size_of::<ExtentDescriptor>();
const HEADER_SIZE: usize = size_of::<ControlHeader>();

/// A `{addr, size}` span as stored in the control block.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtentDescriptor {
    pub addr: usize,
    pub size: usize,
}

/// The header at the start of the control block.
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ControlHeader {
    /// Address of the free-list array.
    pub free_list: usize,
    /// Address of the used-list array.
    pub used_list: usize,
    /// Number of slots in each array minus one.
    pub max_index: usize,
}

const_assert_eq!(DESCRIPTOR_SIZE, 2 * WORD);
const_assert_eq!(HEADER_SIZE, 3 * WORD);

impl ExtentDescriptor {
    const EMPTY: Self = Self { addr: 0, size: 0 };

    const fn is_empty(self) -> bool {
        self.addr == 0
    }

    const fn end(self) -> usize {
        self.addr + self.size
    }
}

/// A non-empty descriptor as yielded by [`FixedBlockCountHeap::free_extents`] and
/// [`FixedBlockCountHeap::used_extents`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub addr: Address,
    pub size: usize,
}

impl Extent {
    pub const fn range(&self) -> Range<Address> {
        self.addr..self.addr.add(self.size)
    }
}

#[derive(Clone, Copy)]
enum List {
    Free,
    Used,
}

/// Bounded-descriptor heap over an untouched payload region, with bookkeeping in the control
/// block `S`.
pub struct FixedBlockCountHeap<S> {
    control: S,
    max_blocks: usize,
    /// The 64-byte aligned part of the payload region.
    payload: Range<Address>,
}

impl<S> FixedBlockCountHeap<S> {
    /// Number of control block bytes needed to track `max_blocks` simultaneous allocations:
    /// `2 * max_blocks * size_of::<ExtentDescriptor>() + size_of::<ControlHeader>()`.
    ///
    /// Saturates at `usize::MAX` for block counts no control block could hold.
    pub const fn required_control_bytes(max_blocks: usize) -> usize {
        max_blocks
            .saturating_mul(2 * DESCRIPTOR_SIZE)
            .saturating_add(HEADER_SIZE)
    }

    pub const fn max_blocks(&self) -> usize {
        self.max_blocks
    }

    /// The managed payload range, after alignment.
    pub fn payload(&self) -> Range<Address> {
        self.payload.clone()
    }

    pub fn control(&self) -> &S {
        &self.control
    }

    fn slot_offset(&self, list: List, slot: usize) -> usize {
        debug_assert!(slot < self.max_blocks);
        let list = match list {
            List::Free => HEADER_SIZE,
            List::Used => HEADER_SIZE + self.max_blocks * DESCRIPTOR_SIZE,
        };
        list + slot * DESCRIPTOR_SIZE
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> FixedBlockCountHeap<S> {
    /// Lays out the control block in `control` and hands out
    /// `payload_base..payload_base + payload_size` in 64-byte aligned chunks.
    ///
    /// # Errors
    ///
    /// - [`Error::ZeroBlockCount`] if `max_blocks` is zero.
    /// - [`Error::RegionTooSmall`] if `control` is smaller than
    ///   [`required_control_bytes(max_blocks)`](Self::required_control_bytes) or nothing is left
    ///   of the payload after aligning its start.
    /// - [`Error::InvalidPointer`] if `payload_base` is null or the payload wraps around the
    ///   address space.
    pub fn new(
        mut control: S,
        payload_base: Address,
        payload_size: usize,
        max_blocks: usize,
    ) -> Result<Self> {
        if max_blocks == 0 {
            return Err(Error::ZeroBlockCount);
        }

        let required = Self::required_control_bytes(max_blocks);
        let size = control.as_ref().len();
        if size < required {
            return Err(Error::RegionTooSmall { size, required });
        }

        if payload_base.is_null() || payload_base.checked_add(payload_size).is_none() {
            return Err(Error::InvalidPointer(payload_base));
        }

        let aligned = payload_base
            .checked_align_up(PAYLOAD_ALIGN)
            .ok_or(Error::InvalidPointer(payload_base))?;
        let padding = aligned.offset_from_unsigned(payload_base);
        if padding >= payload_size {
            return Err(Error::RegionTooSmall {
                size: payload_size,
                required: padding + PAYLOAD_ALIGN,
            });
        }
        let payload = aligned..aligned.add(payload_size - padding);

        control.as_mut()[..required].fill(0);

        let mut this = Self {
            control,
            max_blocks,
            payload,
        };

        let control_base = Address::from_ptr(this.control.as_ref().as_ptr());
        this.write_header(ControlHeader {
            free_list: control_base.add(this.slot_offset(List::Free, 0)).get(),
            used_list: control_base.add(this.slot_offset(List::Used, 0)).get(),
            max_index: max_blocks - 1,
        });
        this.write(
            List::Free,
            0,
            ExtentDescriptor {
                addr: this.payload.start.get(),
                size: payload_size - padding,
            },
        );

        log::debug!(
            "fixed block count heap over {:?} with {max_blocks} slots (control block at {control_base})",
            this.payload
        );

        Ok(this)
    }

    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if size == 0 {
            return None;
        }
        let size = crate::align_up(size, PAYLOAD_ALIGN)?;

        let Some(used_slot) = self.find(List::Used, ExtentDescriptor::is_empty) else {
            log::warn!(
                "all {} used slots are taken, cannot allocate {size} bytes",
                self.max_blocks
            );
            return None;
        };

        let Some(free_slot) = self.find(List::Free, |extent| {
            !extent.is_empty() && extent.size >= size
        }) else {
            log::warn!("out of memory, no free extent of {size} bytes");
            return None;
        };

        let extent = self.read(List::Free, free_slot);
        self.write(
            List::Free,
            free_slot,
            ExtentDescriptor {
                addr: extent.addr + size,
                size: extent.size - size,
            },
        );
        self.write(
            List::Used,
            used_slot,
            ExtentDescriptor {
                addr: extent.addr,
                size,
            },
        );

        let addr = Address::new(extent.addr);
        debug_assert!(addr.is_aligned_to(PAYLOAD_ALIGN));
        log::trace!("allocated {size} bytes at {addr}");
        Some(addr)
    }

    /// Releases the allocation at `addr` and returns its size.
    ///
    /// The freed extent is merged into an adjacent free extent, preferring the one that follows
    /// it. If both neighbours are free all three collapse into the following extent's slot.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPointer`] if `addr` is not a live allocation.
    /// - [`Error::CapacityExhausted`] if the extent has no free neighbour and every free-list slot
    ///   is taken. The allocation stays live in that case.
    pub fn free(&mut self, addr: Address) -> Result<usize> {
        if addr.is_null() {
            return Ok(0);
        }

        let Some(used_slot) = self.find(List::Used, |extent| extent.addr == addr.get()) else {
            log::warn!("attempted to free {addr} which is not a live allocation");
            return Err(Error::InvalidPointer(addr));
        };
        let used = self.read(List::Used, used_slot);

        let mut predecessor = None;
        let mut successor = None;
        let mut empty = None;
        for slot in 0..self.max_blocks {
            let extent = self.read(List::Free, slot);

            if extent.is_empty() {
                empty = empty.or(Some(slot));
                continue;
            }
            if predecessor.is_none() && extent.end() == used.addr {
                predecessor = Some((slot, extent));
            }
            if successor.is_none() && extent.addr == used.end() {
                successor = Some((slot, extent));
            }
        }

        match (predecessor, successor) {
            (predecessor, Some((slot, successor))) => {
                let mut merged = ExtentDescriptor {
                    addr: used.addr,
                    size: used.size + successor.size,
                };

                if let Some((pred_slot, pred)) = predecessor {
                    merged.addr = pred.addr;
                    merged.size += pred.size;
                    self.write(List::Free, pred_slot, ExtentDescriptor::EMPTY);
                }

                self.write(List::Free, slot, merged);
            }
            (Some((slot, pred)), None) => {
                self.write(
                    List::Free,
                    slot,
                    ExtentDescriptor {
                        addr: pred.addr,
                        size: pred.size + used.size,
                    },
                );
            }
            (None, None) => {
                let Some(slot) = empty else {
                    log::warn!(
                        "no free slot left to record {} bytes at {addr}, keeping the allocation",
                        used.size
                    );
                    return Err(Error::CapacityExhausted {
                        max_blocks: self.max_blocks,
                    });
                };

                self.write(List::Free, slot, used);
            }
        }

        self.write(List::Used, used_slot, ExtentDescriptor::EMPTY);

        log::trace!("freed {} bytes at {addr}", used.size);
        Ok(used.size)
    }

    fn write_header(&mut self, header: ControlHeader) {
        let bytes = self.control.as_mut();
        write_word(bytes, 0, header.free_list);
        write_word(bytes, WORD, header.used_list);
        write_word(bytes, 2 * WORD, header.max_index);
    }

    fn write(&mut self, list: List, slot: usize, extent: ExtentDescriptor) {
        let offset = self.slot_offset(list, slot);
        let bytes = self.control.as_mut();
        write_word(bytes, offset, extent.addr);
        write_word(bytes, offset + WORD, extent.size);
    }
}

impl<S: AsRef<[u8]>> FixedBlockCountHeap<S> {
    /// Size of the live allocation at `addr`, `0` if there is none.
    pub fn size_of(&self, addr: Address) -> usize {
        if addr.is_null() {
            return 0;
        }

        self.find(List::Used, |extent| extent.addr == addr.get())
            .map_or(0, |slot| self.read(List::Used, slot).size)
    }

    /// The header as currently stored in the control block.
    pub fn control_header(&self) -> ControlHeader {
        let bytes = self.control.as_ref();
        ControlHeader {
            free_list: read_word(bytes, 0),
            used_list: read_word(bytes, WORD),
            max_index: read_word(bytes, 2 * WORD),
        }
    }

    /// Non-empty free-list slots, in slot order.
    pub fn free_extents(&self) -> impl Iterator<Item = Extent> + Clone + '_ {
        self.extents(List::Free)
    }

    /// Live allocations, in slot order.
    pub fn used_extents(&self) -> impl Iterator<Item = Extent> + Clone + '_ {
        self.extents(List::Used)
    }

    pub fn usage(&self) -> HeapUsage {
        let (used, blocks) = self
            .used_extents()
            .fold((0, 0), |(used, blocks), extent| (used + extent.size, blocks + 1));

        HeapUsage {
            used,
            blocks,
            capacity: Some(self.payload.end.offset_from_unsigned(self.payload.start)),
        }
    }

    /// Verifies that the free and used extents exactly partition the payload region.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the header does not match the heap, an extent lies outside
    /// the payload region, two extents overlap, or the extents do not cover the region.
    pub fn check(&self) -> Result<()> {
        if self.control_header().max_index != self.max_blocks - 1 {
            return Err(Error::Corrupted("control header does not match the slot count"));
        }

        let extents = || self.free_extents().chain(self.used_extents());
        let mut total = 0_usize;

        for (i, extent) in extents().enumerate() {
            let Some(end) = extent.addr.checked_add(extent.size) else {
                return Err(Error::Corrupted("extent wraps around the address space"));
            };
            if extent.addr < self.payload.start || end > self.payload.end {
                return Err(Error::Corrupted("extent lies outside the payload region"));
            }

            let range = extent.range();
            let overlaps = extents()
                .skip(i + 1)
                .any(|other| other.addr < range.end && range.start < other.range().end);
            if overlaps {
                return Err(Error::Corrupted("extents overlap"));
            }

            total += extent.size;
        }

        if total == self.payload.end.offset_from_unsigned(self.payload.start) {
            Ok(())
        } else {
            Err(Error::Corrupted("extents do not cover the payload region"))
        }
    }

    fn extents(&self, list: List) -> impl Iterator<Item = Extent> + Clone + '_ {
        (0..self.max_blocks).filter_map(move |slot| {
            let extent = self.read(list, slot);
            (!extent.is_empty()).then_some(Extent {
                addr: Address::new(extent.addr),
                size: extent.size,
            })
        })
    }

    fn find(&self, list: List, pred: impl Fn(ExtentDescriptor) -> bool) -> Option<usize> {
        (0..self.max_blocks).find(|&slot| pred(self.read(list, slot)))
    }

    fn read(&self, list: List, slot: usize) -> ExtentDescriptor {
        let offset = self.slot_offset(list, slot);
        let bytes = self.control.as_ref();
        ExtentDescriptor {
            addr: read_word(bytes, offset),
            size: read_word(bytes, offset + WORD),
        }
    }
}

impl<S: AsRef<[u8]>> fmt::Debug for FixedBlockCountHeap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        struct Extents<I>(I);
        impl<I: Iterator<Item = Extent> + Clone> fmt::Debug for Extents<I> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_list()
                    .entries(self.0.clone().map(|extent| extent.range()))
                    .finish()
            }
        }

        f.debug_struct("FixedBlockCountHeap")
            .field("payload", &self.payload)
            .field("max_blocks", &self.max_blocks)
            .field("free", &Extents(self.free_extents()))
            .field("used", &Extents(self.used_extents()))
            .finish_non_exhaustive()
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> HeapBackend for FixedBlockCountHeap<S> {
    fn allocate(&mut self, size: usize) -> Option<Address> {
        FixedBlockCountHeap::allocate(self, size)
    }

    unsafe fn free(&mut self, addr: Address) -> Result<usize> {
        FixedBlockCountHeap::free(self, addr)
    }

    unsafe fn size_of(&self, addr: Address) -> usize {
        FixedBlockCountHeap::size_of(self, addr)
    }

    fn usage(&self) -> HeapUsage {
        FixedBlockCountHeap::usage(self)
    }
}

#[cfg(test)]
mod tests {
    use std::vec;
    use std::vec::Vec;

    use proptest::prelude::*;

    use super::*;
    use crate::test_utils::{Op, ops};

    /// The payload is never dereferenced, so any aligned address will do.
    const PAYLOAD: Address = Address::new(0x8000_0000);

    type Heap = FixedBlockCountHeap<Vec<u8>>;

    fn heap(payload_size: usize, max_blocks: usize) -> Heap {
        let control = vec![0; Heap::required_control_bytes(max_blocks)];
        FixedBlockCountHeap::new(control, PAYLOAD, payload_size, max_blocks).unwrap()
    }

    fn extents(iter: impl Iterator<Item = Extent>) -> Vec<(usize, usize)> {
        iter.map(|extent| (extent.addr.offset_from_unsigned(PAYLOAD), extent.size))
            .collect()
    }

    #[test]
    fn required_control_bytes() {
        assert_eq!(Heap::required_control_bytes(1), 2 * DESCRIPTOR_SIZE + 3 * WORD);
        assert_eq!(Heap::required_control_bytes(4), 19 * WORD);
        assert_eq!(Heap::required_control_bytes(usize::MAX), usize::MAX);
    }

    #[test_log::test]
    fn control_block_layout() {
        let heap = heap(8192, 4);
        let base = Address::from_ptr(heap.control().as_ptr());

        assert_eq!(
            heap.control_header(),
            ControlHeader {
                free_list: base.add(3 * WORD).get(),
                used_list: base.add(3 * WORD + 4 * DESCRIPTOR_SIZE).get(),
                max_index: 3,
            }
        );
        assert_eq!(extents(heap.free_extents()), [(0, 8192)]);
        assert_eq!(heap.used_extents().count(), 0);
        heap.check().unwrap();
    }

    #[test]
    fn payload_start_is_aligned() {
        let control = vec![0; Heap::required_control_bytes(2)];
        let heap = Heap::new(control, PAYLOAD.add(0x10), 1024, 2).unwrap();

        assert_eq!(heap.payload(), PAYLOAD.add(64)..PAYLOAD.add(0x10 + 1024));
        assert_eq!(
            heap.free_extents().next(),
            Some(Extent {
                addr: PAYLOAD.add(64),
                size: 1024 - 0x30,
            })
        );
    }

    #[test]
    fn rejects_bad_configuration() {
        assert_eq!(
            Heap::new(vec![0; 1024], PAYLOAD, 1024, 0).unwrap_err(),
            Error::ZeroBlockCount
        );

        let required = Heap::required_control_bytes(4);
        assert_eq!(
            Heap::new(vec![0; required - 1], PAYLOAD, 1024, 4).unwrap_err(),
            Error::RegionTooSmall {
                size: required - 1,
                required,
            }
        );

        assert_eq!(
            Heap::new(vec![0; required], Address::NULL, 1024, 4).unwrap_err(),
            Error::InvalidPointer(Address::NULL)
        );

        assert_eq!(
            Heap::new(vec![0; required], PAYLOAD.add(1), 63, 4).unwrap_err(),
            Error::RegionTooSmall {
                size: 63,
                required: 63 + PAYLOAD_ALIGN,
            }
        );
    }

    #[test_log::test]
    fn used_slots_bound_live_allocations() {
        let mut heap = heap(8192, 4);

        let blocks: Vec<_> = (0..4).map(|_| heap.allocate(1024).unwrap()).collect();
        assert_eq!(blocks[0], PAYLOAD);
        assert_eq!(blocks[3], PAYLOAD.add(3 * 1024));

        // plenty of payload left but every used slot is taken
        assert_eq!(heap.allocate(1024), None);
        assert_eq!(heap.usage().free(), Some(4096));

        heap.check().unwrap();
    }

    #[test]
    fn adjacent_frees_share_one_slot() {
        let mut heap = heap(8192, 4);
        let blocks: Vec<_> = (0..4).map(|_| heap.allocate(1024).unwrap()).collect();

        assert_eq!(heap.free(blocks[1]), Ok(1024));
        assert_eq!(heap.free(blocks[2]), Ok(1024));

        // the tail after the fourth block plus the merged span of the middle two
        assert_eq!(extents(heap.free_extents()), [(4096, 4096), (1024, 2048)]);
        assert!(heap.free_extents().count() <= heap.max_blocks());
        heap.check().unwrap();
    }

    #[test]
    fn three_way_merge_reclaims_a_slot() {
        let mut heap = heap(4096, 8);
        let a = heap.allocate(64).unwrap();
        let b = heap.allocate(64).unwrap();
        let c = heap.allocate(64).unwrap();
        let _d = heap.allocate(64).unwrap();

        heap.free(a).unwrap();
        heap.free(c).unwrap();
        assert_eq!(heap.free_extents().count(), 3);

        heap.free(b).unwrap();
        // `b` and `a` were folded into the slot that held `c`
        assert_eq!(extents(heap.free_extents()), [(256, 4096 - 256), (0, 192)]);
        heap.check().unwrap();
    }

    #[test]
    fn allocate_then_free_restores_control_block() {
        let mut heap = heap(8192, 4);
        let pristine = heap.control().clone();

        let a = heap.allocate(100).unwrap();
        assert_eq!(heap.size_of(a), 128);
        assert_eq!(heap.free(a), Ok(128));
        assert_eq!(heap.control(), &pristine);

        // consuming the whole payload leaves an empty extent behind, which is merged back
        let a = heap.allocate(8192).unwrap();
        assert_eq!(heap.allocate(64), None);
        heap.free(a).unwrap();
        assert_eq!(heap.control(), &pristine);
    }

    #[test]
    fn capacity_exhausted_keeps_allocation() {
        let mut heap = heap(320, 2);
        let a = heap.allocate(64).unwrap();
        let _b = heap.allocate(64).unwrap();

        // two free extents, neither of them next to `a`
        heap.write(
            List::Free,
            0,
            ExtentDescriptor {
                addr: PAYLOAD.add(128).get(),
                size: 64,
            },
        );
        heap.write(
            List::Free,
            1,
            ExtentDescriptor {
                addr: PAYLOAD.add(256).get(),
                size: 64,
            },
        );

        assert_eq!(
            heap.free(a),
            Err(Error::CapacityExhausted { max_blocks: 2 })
        );
        assert_eq!(heap.size_of(a), 64);
        assert_eq!(heap.usage().blocks, 2);
    }

    #[test]
    fn unknown_addresses() {
        let mut heap = heap(4096, 4);
        let a = heap.allocate(64).unwrap();

        assert_eq!(heap.size_of(Address::NULL), 0);
        assert_eq!(heap.size_of(a.add(64)), 0);
        assert_eq!(heap.free(Address::NULL), Ok(0));
        assert_eq!(heap.free(a.add(64)), Err(Error::InvalidPointer(a.add(64))));
        assert_eq!(heap.allocate(0), None);

        heap.free(a).unwrap();
        assert_eq!(heap.free(a), Err(Error::InvalidPointer(a)));
        assert_eq!(heap.size_of(a), 0);
    }

    #[test]
    fn backend_trait_has_no_zeroed_allocation() {
        let mut heap = heap(4096, 4);
        assert_eq!(HeapBackend::allocate_zeroed(&mut heap, 64), None);
    }

    #[test]
    fn debug_lists_extents() {
        let mut heap = heap(4096, 2);
        heap.allocate(64).unwrap();

        let debug = format!("{heap:?}");
        assert!(debug.contains("FixedBlockCountHeap"));
        assert!(debug.contains("max_blocks: 2"));
    }

    proptest! {
        #[test]
        fn extents_partition_the_payload(ops in ops(1024, 64)) {
            let mut heap = heap(16 * 1024, 8);
            let mut live = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate(size) => {
                        if let Some(addr) = heap.allocate(size) {
                            prop_assert!(heap.size_of(addr) >= size);
                            live.push(addr);
                        }
                    }
                    Op::Free(idx) if !live.is_empty() => {
                        let idx = idx % live.len();
                        match heap.free(live[idx]) {
                            Ok(_) => {
                                live.swap_remove(idx);
                            }
                            Err(err) => {
                                prop_assert_eq!(err, Error::CapacityExhausted { max_blocks: 8 });
                            }
                        }
                    }
                    Op::Free(_) => {}
                }

                prop_assert_eq!(heap.check(), Ok(()));
                prop_assert_eq!(heap.usage().blocks, live.len());
            }
        }
    }
}
