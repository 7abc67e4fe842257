// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::backend::{HeapBackend, HeapUsage};
use crate::{Address, Result};

/// Size of the hidden prefix [`DynamicHeap`] stores in front of every allocation when the platform
/// cannot report allocation sizes.
pub const SIZE_PREFIX: usize = size_of::<u32>();

/// The allocator of the underlying platform (e.g. a C library `malloc` or the `alloc` crate).
///
/// # Safety
///
/// Addresses returned from `allocate(size)` must be valid for reads and writes of `size` bytes
/// and remain valid until they are passed to `deallocate`.
pub unsafe trait Platform {
    /// Whether [`Platform::allocation_size`] reports the size of an allocation. If it does not,
    /// [`DynamicHeap`] records sizes itself.
    const REPORTS_SIZE: bool = false;

    fn allocate(&mut self, size: usize) -> Option<Address>;

    /// # Safety
    ///
    /// `addr` must have been returned by `allocate(size)` on this platform and not been
    /// deallocated since.
    unsafe fn deallocate(&mut self, addr: Address, size: usize);

    /// Only called when [`Platform::REPORTS_SIZE`] is `true`.
    ///
    /// # Safety
    ///
    /// `addr` must be a live allocation of this platform.
    unsafe fn allocation_size(&self, addr: Address) -> usize {
        let _ = addr;
        0
    }
}

/// Heap backend forwarding to a [`Platform`] allocator.
///
/// When the platform cannot report allocation sizes each block carries a 4-byte size prefix: the
/// platform allocation is `size + SIZE_PREFIX` bytes and the returned address points just past
/// the prefix.
pub struct DynamicHeap<P> {
    platform: P,
    /// Payload bytes currently outstanding.
    used: usize,
    /// Live allocations.
    blocks: usize,
}

impl<P> fmt::Debug for DynamicHeap<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicHeap")
            .field("used", &self.used)
            .field("blocks", &self.blocks)
            .finish_non_exhaustive()
    }
}

impl<P> DynamicHeap<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            used: 0,
            blocks: 0,
        }
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    /// The diagnostic counters. The platform's total capacity is unknown.
    pub fn usage(&self) -> HeapUsage {
        HeapUsage {
            used: self.used,
            blocks: self.blocks,
            capacity: None,
        }
    }
}

impl<P: Platform> DynamicHeap<P> {
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if size == 0 {
            return None;
        }

        let (addr, size) = if P::REPORTS_SIZE {
            let addr = self.platform.allocate(size)?;
            // Safety: we just allocated `addr`
            (addr, unsafe { self.platform.allocation_size(addr) })
        } else {
            let Ok(prefix) = u32::try_from(size) else {
                log::warn!("allocation of {size} bytes does not fit the size prefix");
                return None;
            };

            let Some(raw) = self.platform.allocate(size.checked_add(SIZE_PREFIX)?) else {
                log::warn!("platform allocator failed to allocate {size} bytes");
                return None;
            };

            // Safety: the platform guarantees `raw` is valid for `size + SIZE_PREFIX` bytes
            unsafe {
                raw.as_mut_ptr().cast::<u32>().write_unaligned(prefix);
            }

            (raw.add(SIZE_PREFIX), size)
        };

        self.used += size;
        self.blocks += 1;

        log::trace!("allocated {size} bytes at {addr}");
        Some(addr)
    }

    pub fn allocate_zeroed(&mut self, size: usize) -> Option<Address> {
        let addr = self.allocate(size)?;

        // Safety: we just allocated `size` bytes at `addr`
        unsafe {
            addr.as_mut_ptr().write_bytes(0, size);
        }

        Some(addr)
    }

    /// # Errors
    ///
    /// Never fails, the `Result` matches the other backends.
    ///
    /// # Safety
    ///
    /// `addr` must be null or a live allocation of this heap.
    pub unsafe fn free(&mut self, addr: Address) -> Result<usize> {
        if addr.is_null() {
            return Ok(0);
        }

        // Safety: ensured by caller
        let size = unsafe { self.size_of(addr) };

        if P::REPORTS_SIZE {
            // Safety: ensured by caller
            unsafe { self.platform.deallocate(addr, size) }
        } else {
            // Safety: ensured by caller, the prefix was allocated along with the block
            unsafe {
                self.platform
                    .deallocate(addr.sub(SIZE_PREFIX), size + SIZE_PREFIX);
            }
        }

        self.used = self.used.saturating_sub(size);
        self.blocks = self.blocks.saturating_sub(1);

        log::trace!("freed {size} bytes at {addr}");
        Ok(size)
    }

    /// # Safety
    ///
    /// `addr` must be null or a live allocation of this heap.
    pub unsafe fn size_of(&self, addr: Address) -> usize {
        if addr.is_null() {
            return 0;
        }

        if P::REPORTS_SIZE {
            // Safety: ensured by caller
            unsafe { self.platform.allocation_size(addr) }
        } else {
            // Safety: ensured by caller, every block of this heap is preceded by its size prefix
            let prefix = unsafe {
                addr.sub(SIZE_PREFIX)
                    .as_ptr()
                    .cast::<u32>()
                    .read_unaligned()
            };

            usize::try_from(prefix).unwrap_or(usize::MAX)
        }
    }
}

impl<P: Platform> HeapBackend for DynamicHeap<P> {
    fn allocate(&mut self, size: usize) -> Option<Address> {
        DynamicHeap::allocate(self, size)
    }

    fn allocate_zeroed(&mut self, size: usize) -> Option<Address> {
        DynamicHeap::allocate_zeroed(self, size)
    }

    unsafe fn free(&mut self, addr: Address) -> Result<usize> {
        // Safety: ensured by caller
        unsafe { DynamicHeap::free(self, addr) }
    }

    unsafe fn size_of(&self, addr: Address) -> usize {
        // Safety: ensured by caller
        unsafe { DynamicHeap::size_of(self, addr) }
    }

    fn usage(&self) -> HeapUsage {
        DynamicHeap::usage(self)
    }
}

/// [`Platform`] over the global allocator of the `alloc` crate.
///
/// Rust's global allocator needs the size on deallocation and cannot report it, so sizes are kept
/// in the [`DynamicHeap`] prefix.
#[cfg(feature = "alloc")]
#[derive(Debug, Default, Clone, Copy)]
pub struct GlobalPlatform;

#[cfg(feature = "alloc")]
impl GlobalPlatform {
    const ALIGN: usize = align_of::<usize>();
}

// Safety: we forward to the global allocator, which upholds the same contract
#[cfg(feature = "alloc")]
unsafe impl Platform for GlobalPlatform {
    fn allocate(&mut self, size: usize) -> Option<Address> {
        if size == 0 {
            return None;
        }

        let layout = core::alloc::Layout::from_size_align(size, Self::ALIGN).ok()?;
        // Safety: `layout` is non-zero sized
        let ptr = unsafe { alloc::alloc::alloc(layout) };

        core::ptr::NonNull::new(ptr).map(Address::from_non_null)
    }

    unsafe fn deallocate(&mut self, addr: Address, size: usize) {
        let Ok(layout) = core::alloc::Layout::from_size_align(size, Self::ALIGN) else {
            log::error!("deallocating {addr} with impossible size {size}");
            return;
        };

        // Safety: ensured by caller, `layout` matches the one used in `allocate`
        unsafe { alloc::alloc::dealloc(addr.as_mut_ptr(), layout) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockPlatform;

    #[test_log::test]
    fn size_prefix() {
        let mut heap = DynamicHeap::new(MockPlatform::<false>::new());

        let addr = heap.allocate(50).unwrap();

        // the platform saw exactly one allocation of 50 bytes plus the prefix
        let raw = addr.sub(SIZE_PREFIX);
        assert_eq!(heap.platform().allocation(raw), Some(50 + SIZE_PREFIX));
        assert_eq!(heap.platform().live(), 1);

        // Safety: `addr` is a live allocation of `heap`
        unsafe {
            assert_eq!(heap.size_of(addr), 50);
            assert_eq!(heap.free(addr), Ok(50));
        }

        assert_eq!(heap.platform().live(), 0);
        assert_eq!(heap.usage(), HeapUsage::default());
    }

    #[test]
    fn platform_reported_size() {
        let mut heap = DynamicHeap::new(MockPlatform::<true>::new());

        let addr = heap.allocate(50).unwrap();

        // no prefix: the payload is the platform allocation itself
        assert_eq!(heap.platform().allocation(addr), Some(50));
        // Safety: `addr` is a live allocation of `heap`
        unsafe {
            assert_eq!(heap.size_of(addr), 50);
            assert_eq!(heap.free(addr), Ok(50));
        }
        assert_eq!(heap.platform().live(), 0);
    }

    #[test]
    fn counters() {
        let mut heap = DynamicHeap::new(MockPlatform::<false>::new());

        let a = heap.allocate(10).unwrap();
        let b = heap.allocate(20).unwrap();
        assert_eq!(
            heap.usage(),
            HeapUsage {
                used: 30,
                blocks: 2,
                capacity: None,
            }
        );

        // Safety: `a` is a live allocation of `heap`
        unsafe { heap.free(a).unwrap() };
        assert_eq!(heap.usage().used, 20);
        assert_eq!(heap.usage().blocks, 1);

        // Safety: `b` is a live allocation of `heap`
        unsafe { heap.free(b).unwrap() };
        assert_eq!(heap.usage(), HeapUsage::default());
    }

    #[test]
    fn null_and_zero() {
        let mut heap = DynamicHeap::new(MockPlatform::<false>::new());

        assert_eq!(heap.allocate(0), None);
        // Safety: null is always accepted
        unsafe {
            assert_eq!(heap.size_of(Address::NULL), 0);
            assert_eq!(heap.free(Address::NULL), Ok(0));
        }
        assert_eq!(heap.platform().live(), 0);
    }

    #[test]
    fn platform_out_of_memory() {
        let mut heap = DynamicHeap::new(MockPlatform::<false>::with_limit(64));

        let a = heap.allocate(40).unwrap();
        assert_eq!(heap.allocate(40), None);
        assert_eq!(heap.usage().blocks, 1);

        // Safety: `a` is a live allocation of `heap`
        unsafe { heap.free(a).unwrap() };
        assert!(heap.allocate(40).is_some());
    }

    #[test]
    fn zeroed() {
        let mut heap = DynamicHeap::new(MockPlatform::<false>::new());

        let addr = heap.allocate_zeroed(64).unwrap();
        // Safety: we just allocated 64 bytes at `addr`
        let bytes = unsafe { core::slice::from_raw_parts(addr.as_ptr(), 64) };
        assert!(bytes.iter().all(|b| *b == 0));

        // Safety: `addr` is a live allocation of `heap`
        unsafe { heap.free(addr).unwrap() };
    }

    #[cfg(feature = "alloc")]
    #[test]
    fn global_platform() {
        let mut heap = DynamicHeap::new(GlobalPlatform);

        let addr = heap.allocate(100).unwrap();
        // Safety: `addr` is a live allocation of `heap`
        unsafe {
            addr.as_mut_ptr().write_bytes(0xaa, 100);
            assert_eq!(heap.size_of(addr), 100);
            assert_eq!(heap.free(addr), Ok(100));
        }
    }
}
