// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! First-fit allocator over a single contiguous region with in-band block headers.
//!
//! The region is tiled by blocks without gaps. Every block starts with a [`HEADER_SIZE`] byte
//! header `{ last_blk, size }` followed by `size` payload bytes, so the next block starts at
//! `offset + HEADER_SIZE + size`:
//!
//! ```text
//! | last_blk | size | payload ... | last_blk | size | payload ... | ...
//! ^-- block 0 --------------------^-- block 1 ---------------------
//! ```
//!
//! `last_blk` is zero for free blocks. For used blocks it links back to the preceding block (or
//! holds a sentinel for the very first block), which lets `free` find its left neighbour without
//! scanning. Headers are addressed by their offset into the storage, so the metadata stays valid
//! even if the storage itself is moved.
//!
//! Allocation sizes are rounded up to 4 bytes. If carving a block would leave a tail too small to
//! be useful (at most `HEADER_SIZE + MINIMUM_BLOCKSIZE` bytes) the tail is handed out along with
//! the block instead of becoming a new free block. Freeing a block merges it with free immediate
//! neighbours; there is no other compaction.

use core::fmt;

use crate::backend::{HeapBackend, HeapUsage};
use crate::{Address, Error, Result, read_word, write_word};

/// Size of the in-band header preceding every block.
pub const HEADER_SIZE: usize = 2 * size_of::<usize>();
/// Free blocks smaller than this are never created.
pub const MINIMUM_BLOCKSIZE: usize = 4;

const ALIGN: usize = 4;
const WORD: usize = size_of::<usize>();

/// `last_blk` value of a free block.
const FREE: usize = 0;
/// `last_blk` value of the first block of the heap while it is in use.
const NO_PREDECESSOR: usize = usize::MAX;

static_assertions::const_assert!(HEADER_SIZE % ALIGN == 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockHeader {
    last_blk: usize,
    size: usize,
}

impl BlockHeader {
    const fn is_free(self) -> bool {
        self.last_blk == FREE
    }
}

/// Encodes a block offset as a non-zero backward link.
const fn link(offset: usize) -> usize {
    offset + HEADER_SIZE
}

const fn next_offset(offset: usize, size: usize) -> usize {
    offset + HEADER_SIZE + size
}

/// A block as seen by [`FixedRangeHeap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Start of the payload.
    pub addr: Address,
    /// Payload size.
    pub size: usize,
    pub free: bool,
}

/// First-fit heap over the bytes of `S`.
pub struct FixedRangeHeap<S> {
    storage: S,
    /// Managed length, the storage length rounded down to 4.
    len: usize,
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> FixedRangeHeap<S> {
    /// Turns `storage` into an empty heap consisting of one free block.
    ///
    /// Payload addresses are 4-byte aligned relative to the start of `storage`, so the storage
    /// itself should start 4-byte aligned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::RegionTooSmall`] if the storage cannot hold more than two block headers.
    pub fn new(storage: S) -> Result<Self> {
        let size = storage.as_ref().len();
        let len = size & !(ALIGN - 1);

        if len <= 2 * HEADER_SIZE {
            return Err(Error::RegionTooSmall {
                size,
                required: 2 * HEADER_SIZE + ALIGN,
            });
        }

        let mut this = Self { storage, len };
        this.write_header(
            0,
            BlockHeader {
                last_blk: FREE,
                size: len - HEADER_SIZE,
            },
        );

        log::debug!(
            "fixed range heap at {}..={} ({len} bytes)",
            this.base(),
            this.end()
        );

        Ok(this)
    }

    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if size == 0 {
            return None;
        }
        let size = crate::align_up(size, ALIGN)?;

        let mut offset = 0;
        let mut predecessor = NO_PREDECESSOR;

        while offset < self.len {
            let block = self.read_header(offset);

            if block.is_free() && block.size >= size {
                self.carve(offset, block, size, predecessor);

                let addr = self.payload_addr(offset);
                log::trace!("allocated {size} bytes at {addr}");
                return Some(addr);
            }

            predecessor = link(offset);
            offset = next_offset(offset, block.size);
        }

        log::warn!("out of memory, no free block of {size} bytes");
        None
    }

    pub fn allocate_zeroed(&mut self, size: usize) -> Option<Address> {
        let addr = self.allocate(size)?;
        if let Some(payload) = self.payload_mut(addr) {
            payload.fill(0);
        }
        Some(addr)
    }

    /// Marks the free block at `offset` as used with a payload of at least `size` bytes, splitting
    /// off the tail as a new free block if it is large enough.
    fn carve(&mut self, offset: usize, block: BlockHeader, size: usize, predecessor: usize) {
        let leftover = block.size - size;

        let size = if leftover > HEADER_SIZE + MINIMUM_BLOCKSIZE {
            let fragment = next_offset(offset, size);
            let fragment_size = leftover - HEADER_SIZE;

            self.write_header(
                fragment,
                BlockHeader {
                    last_blk: FREE,
                    size: fragment_size,
                },
            );

            let following = next_offset(fragment, fragment_size);
            if following < self.len {
                let mut next = self.read_header(following);
                debug_assert!(!next.is_free(), "free block followed by a free block");
                if !next.is_free() {
                    next.last_blk = link(fragment);
                    self.write_header(following, next);
                }
            }

            size
        } else {
            block.size
        };

        self.write_header(
            offset,
            BlockHeader {
                last_blk: predecessor,
                size,
            },
        );
    }

    /// Frees the block at `addr`, merging it with free neighbours, and returns its payload size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPointer`] if `addr` is not the payload address of a used block of
    /// this heap.
    pub fn free(&mut self, addr: Address) -> Result<usize> {
        if addr.is_null() {
            return Ok(0);
        }

        let Some(offset) = self.block_offset(addr) else {
            log::warn!("attempted to free {addr} which is not a block of this heap");
            return Err(Error::InvalidPointer(addr));
        };

        let block = self.read_header(offset);
        if block.is_free() {
            log::warn!("attempted to free already freed block {addr}");
            return Err(Error::InvalidPointer(addr));
        }

        let mut current = offset;
        let mut merged = BlockHeader {
            last_blk: FREE,
            size: block.size,
        };
        self.write_header(offset, merged);

        if let Some(pred_offset) = self.link_target(block.last_blk) {
            let pred = self.read_header(pred_offset);

            if pred.is_free() {
                merged.size = pred.size + HEADER_SIZE + merged.size;
                self.write_header(pred_offset, merged);
                self.clear_header(offset);
                current = pred_offset;
            }
        }

        let successor = next_offset(current, merged.size);
        if successor < self.len {
            let succ = self.read_header(successor);

            if succ.is_free() {
                merged.size += HEADER_SIZE + succ.size;
                self.write_header(current, merged);
                self.clear_header(successor);
            }
        }

        let following = next_offset(current, merged.size);
        if following < self.len {
            let mut next = self.read_header(following);
            if !next.is_free() {
                next.last_blk = link(current);
                self.write_header(following, next);
            }
        }

        log::trace!("freed {} bytes at {addr}", block.size);
        Ok(block.size)
    }

    /// The payload bytes of the used block at `addr`.
    pub fn payload_mut(&mut self, addr: Address) -> Option<&mut [u8]> {
        let offset = self.block_offset(addr)?;
        let block = self.read_header(offset);
        if block.is_free() {
            return None;
        }

        let start = offset + HEADER_SIZE;
        Some(&mut self.storage.as_mut()[start..start + block.size])
    }

    fn write_header(&mut self, offset: usize, header: BlockHeader) {
        let bytes = self.storage.as_mut();
        write_word(bytes, offset, header.last_blk);
        write_word(bytes, offset + WORD, header.size);
    }

    fn clear_header(&mut self, offset: usize) {
        self.storage.as_mut()[offset..offset + HEADER_SIZE].fill(0);
    }
}

impl<S: AsRef<[u8]>> FixedRangeHeap<S> {
    /// Address of the first byte of the region.
    pub fn base(&self) -> Address {
        Address::from_ptr(self.storage.as_ref().as_ptr())
    }

    /// Address of the last valid byte of the region.
    pub fn end(&self) -> Address {
        self.base().add(self.len - 1)
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    /// Payload size of the block at `addr`, `0` if `addr` cannot be a block of this heap.
    ///
    /// Only bounds and alignment are checked, so an address pointing into the middle of a
    /// payload yields garbage.
    pub fn size_of(&self, addr: Address) -> usize {
        self.header_offset(addr)
            .map_or(0, |offset| self.read_header(offset).size)
    }

    pub fn payload(&self, addr: Address) -> Option<&[u8]> {
        let offset = self.block_offset(addr)?;
        let block = self.read_header(offset);
        if block.is_free() {
            return None;
        }

        let start = offset + HEADER_SIZE;
        Some(&self.storage.as_ref()[start..start + block.size])
    }

    /// Iterates all blocks, used and free, in address order.
    pub fn blocks(&self) -> Blocks<'_, S> {
        Blocks {
            heap: self,
            offset: 0,
        }
    }

    pub fn usage(&self) -> HeapUsage {
        let (used, blocks) = self
            .blocks()
            .filter(|block| !block.free)
            .fold((0, 0), |(used, blocks), block| (used + block.size, blocks + 1));

        HeapUsage {
            used,
            blocks,
            capacity: Some(self.len - HEADER_SIZE),
        }
    }

    /// Walks all headers and verifies the block invariants.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corrupted`] if the blocks do not tile the region exactly, a used block does
    /// not link back to its predecessor, or two free blocks are adjacent.
    pub fn check(&self) -> Result<()> {
        let mut offset = 0;
        let mut prev: Option<(usize, BlockHeader)> = None;

        while offset < self.len {
            if offset + HEADER_SIZE > self.len {
                return Err(Error::Corrupted("block header crosses the end of the heap"));
            }

            let block = self.read_header(offset);

            if block.is_free() {
                if prev.is_some_and(|(_, prev)| prev.is_free()) {
                    return Err(Error::Corrupted("adjacent free blocks were not coalesced"));
                }
            } else {
                let expected = prev.map_or(NO_PREDECESSOR, |(prev, _)| link(prev));
                if block.last_blk != expected {
                    return Err(Error::Corrupted(
                        "backward link does not point at the preceding block",
                    ));
                }
            }

            prev = Some((offset, block));
            offset = offset
                .checked_add(HEADER_SIZE + block.size)
                .ok_or(Error::Corrupted("block size overflows"))?;
        }

        if offset == self.len {
            Ok(())
        } else {
            Err(Error::Corrupted("blocks do not tile the heap"))
        }
    }

    fn payload_addr(&self, offset: usize) -> Address {
        self.base().add(offset + HEADER_SIZE)
    }

    /// Offset of the header belonging to the payload at `addr`, checking only bounds and
    /// alignment.
    fn header_offset(&self, addr: Address) -> Option<usize> {
        let offset = addr
            .get()
            .checked_sub(self.base().get())?
            .checked_sub(HEADER_SIZE)?;

        (offset % ALIGN == 0 && offset + HEADER_SIZE <= self.len).then_some(offset)
    }

    /// Like [`Self::header_offset`] but also walks the heap to make sure a block starts there.
    fn block_offset(&self, addr: Address) -> Option<usize> {
        let offset = self.header_offset(addr)?;

        let mut cur = 0;
        while cur < offset {
            cur = next_offset(cur, self.read_header(cur).size);
        }

        (cur == offset).then_some(offset)
    }

    /// The header offset a backward link points at, if it lies inside the heap.
    fn link_target(&self, last_blk: usize) -> Option<usize> {
        if last_blk == FREE || last_blk == NO_PREDECESSOR {
            return None;
        }

        let offset = last_blk.checked_sub(HEADER_SIZE)?;
        (offset + HEADER_SIZE <= self.len).then_some(offset)
    }

    fn read_header(&self, offset: usize) -> BlockHeader {
        let bytes = self.storage.as_ref();
        BlockHeader {
            last_blk: read_word(bytes, offset),
            size: read_word(bytes, offset + WORD),
        }
    }
}

impl<S: AsRef<[u8]>> fmt::Debug for FixedRangeHeap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FixedRangeHeap")
            .field("base", &self.base())
            .field("len", &self.len)
            .field("blocks", &self.blocks())
            .finish_non_exhaustive()
    }
}

impl<S: AsRef<[u8]> + AsMut<[u8]>> HeapBackend for FixedRangeHeap<S> {
    fn allocate(&mut self, size: usize) -> Option<Address> {
        FixedRangeHeap::allocate(self, size)
    }

    fn allocate_zeroed(&mut self, size: usize) -> Option<Address> {
        FixedRangeHeap::allocate_zeroed(self, size)
    }

    unsafe fn free(&mut self, addr: Address) -> Result<usize> {
        FixedRangeHeap::free(self, addr)
    }

    unsafe fn size_of(&self, addr: Address) -> usize {
        FixedRangeHeap::size_of(self, addr)
    }

    fn usage(&self) -> HeapUsage {
        FixedRangeHeap::usage(self)
    }
}

/// Iterator over the blocks of a [`FixedRangeHeap`].
pub struct Blocks<'a, S> {
    heap: &'a FixedRangeHeap<S>,
    offset: usize,
}

impl<S> Clone for Blocks<'_, S> {
    fn clone(&self) -> Self {
        Self {
            heap: self.heap,
            offset: self.offset,
        }
    }
}

impl<S: AsRef<[u8]>> Iterator for Blocks<'_, S> {
    type Item = BlockInfo;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + HEADER_SIZE > self.heap.len {
            return None;
        }

        let header = self.heap.read_header(self.offset);
        let block = BlockInfo {
            addr: self.heap.payload_addr(self.offset),
            size: header.size,
            free: header.is_free(),
        };

        self.offset = next_offset(self.offset, header.size);
        Some(block)
    }
}

impl<S: AsRef<[u8]>> fmt::Debug for Blocks<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.clone()).finish()
    }
}
