// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

#[cfg(any(feature = "fixed-range", feature = "fixed-block-count"))]
use crate::RawRegion;
use crate::dynamic::{DynamicHeap, Platform};
#[cfg(feature = "fixed-block-count")]
use crate::fixed_block_count::FixedBlockCountHeap;
#[cfg(feature = "fixed-range")]
use crate::fixed_range::FixedRangeHeap;
use crate::{Address, Result};

/// The allocate/free/size triple every heap backend provides.
///
/// This is the contract external collaborators (e.g. a display-list driver bringing its own video
/// memory manager) implement to plug into the same call sites as the built-in backends.
///
/// The null contract of the allocator ABI is kept: allocation failure of any kind is `None`,
/// `free(Address::NULL)` is `Ok(0)` and `size_of(Address::NULL)` is `0`.
pub trait HeapBackend {
    /// Allocates at least `size` bytes, returning the start of the payload.
    ///
    /// Returns `None` if `size` is zero, no block is large enough, or the backend ran out of
    /// bookkeeping capacity.
    fn allocate(&mut self, size: usize) -> Option<Address>;

    /// Like [`HeapBackend::allocate`] but the payload is filled with zeroes.
    ///
    /// Backends that cannot reach their payload memory return `None`.
    fn allocate_zeroed(&mut self, size: usize) -> Option<Address> {
        let _ = size;
        None
    }

    /// Releases the allocation starting at `addr` and returns its size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPointer`] if the backend can tell that `addr` is not a live
    /// allocation, or [`Error::CapacityExhausted`] if the freed extent cannot be recorded (the
    /// allocation then stays live).
    ///
    /// An address the backend did not hand out is reported, never answered with a freed size of
    /// `0`. Only null yields `Ok(0)`. [`FixedRangeHeap`] and [`FixedBlockCountHeap`] keep their own
    /// bookkeeping and recognize every such address.
    ///
    /// [`FixedRangeHeap`]: crate::FixedRangeHeap
    /// [`FixedBlockCountHeap`]: crate::FixedBlockCountHeap
    /// [`Error::InvalidPointer`]: crate::Error::InvalidPointer
    /// [`Error::CapacityExhausted`]: crate::Error::CapacityExhausted
    ///
    /// # Safety
    ///
    /// `addr` must be null or an address returned by `allocate` on this backend that has not been
    /// freed since. Backends that validate their input turn violations into errors, but backends
    /// that delegate to a platform allocator cannot.
    unsafe fn free(&mut self, addr: Address) -> Result<usize>;

    /// Returns the size of the allocation starting at `addr`, `0` for null or unknown addresses.
    ///
    /// # Safety
    ///
    /// Same requirements as [`HeapBackend::free`].
    unsafe fn size_of(&self, addr: Address) -> usize;

    /// Current usage statistics.
    fn usage(&self) -> HeapUsage;
}

/// Information about the bytes and blocks handed out by a backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapUsage {
    /// Payload bytes of all live allocations.
    pub used: usize,
    /// Number of live allocations.
    pub blocks: usize,
    /// Payload bytes the backend could hand out in total, if it knows.
    pub capacity: Option<usize>,
}

impl HeapUsage {
    pub fn free(&self) -> Option<usize> {
        self.capacity.map(|capacity| capacity.saturating_sub(self.used))
    }
}

/// The backend algorithms a [`MemorySubsystem`](crate::MemorySubsystem) can bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// [`DynamicHeap`]
    Dynamic,
    /// [`FixedRangeHeap`]
    FixedRange,
    /// [`FixedBlockCountHeap`]
    FixedBlockCount,
}

impl BackendKind {
    /// Whether the cargo feature enabling this backend was turned on.
    pub const fn is_compiled_in(self) -> bool {
        match self {
            BackendKind::Dynamic => cfg!(feature = "dynamic"),
            BackendKind::FixedRange => cfg!(feature = "fixed-range"),
            BackendKind::FixedBlockCount => cfg!(feature = "fixed-block-count"),
        }
    }
}

/// A backend bound to one logical heap.
///
/// `Dummy` is what a heap is bound to before configuration or when the requested kind is not
/// compiled in: it never allocates and ignores every free.
///
/// The in-memory backends only exist with their cargo feature. The platform backend is always
/// present because [`Platform`] parameterizes the subsystem; its feature only decides whether it
/// may be bound.
pub enum Backend<P> {
    Dynamic(DynamicHeap<P>),
    #[cfg(feature = "fixed-range")]
    FixedRange(FixedRangeHeap<RawRegion>),
    #[cfg(feature = "fixed-block-count")]
    FixedBlockCount(FixedBlockCountHeap<RawRegion>),
    Dummy,
}

impl<P> Backend<P> {
    pub fn kind(&self) -> Option<BackendKind> {
        match self {
            Backend::Dynamic(_) => Some(BackendKind::Dynamic),
            #[cfg(feature = "fixed-range")]
            Backend::FixedRange(_) => Some(BackendKind::FixedRange),
            #[cfg(feature = "fixed-block-count")]
            Backend::FixedBlockCount(_) => Some(BackendKind::FixedBlockCount),
            Backend::Dummy => None,
        }
    }

    pub fn is_dummy(&self) -> bool {
        matches!(self, Backend::Dummy)
    }
}

impl<P> fmt::Debug for Backend<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Dynamic(heap) => f.debug_tuple("Dynamic").field(&heap.usage()).finish(),
            #[cfg(feature = "fixed-range")]
            Backend::FixedRange(heap) => f.debug_tuple("FixedRange").field(heap).finish(),
            #[cfg(feature = "fixed-block-count")]
            Backend::FixedBlockCount(heap) => f.debug_tuple("FixedBlockCount").field(heap).finish(),
            Backend::Dummy => f.write_str("Dummy"),
        }
    }
}

impl<P: Platform> HeapBackend for Backend<P> {
    fn allocate(&mut self, size: usize) -> Option<Address> {
        match self {
            Backend::Dynamic(heap) => heap.allocate(size),
            #[cfg(feature = "fixed-range")]
            Backend::FixedRange(heap) => heap.allocate(size),
            #[cfg(feature = "fixed-block-count")]
            Backend::FixedBlockCount(heap) => heap.allocate(size),
            Backend::Dummy => None,
        }
    }

    fn allocate_zeroed(&mut self, size: usize) -> Option<Address> {
        match self {
            Backend::Dynamic(heap) => heap.allocate_zeroed(size),
            #[cfg(feature = "fixed-range")]
            Backend::FixedRange(heap) => heap.allocate_zeroed(size),
            #[cfg(feature = "fixed-block-count")]
            Backend::FixedBlockCount(_) => None,
            Backend::Dummy => None,
        }
    }

    unsafe fn free(&mut self, addr: Address) -> Result<usize> {
        match self {
            // Safety: ensured by caller
            Backend::Dynamic(heap) => unsafe { heap.free(addr) },
            #[cfg(feature = "fixed-range")]
            Backend::FixedRange(heap) => heap.free(addr),
            #[cfg(feature = "fixed-block-count")]
            Backend::FixedBlockCount(heap) => heap.free(addr),
            Backend::Dummy => Ok(0),
        }
    }

    unsafe fn size_of(&self, addr: Address) -> usize {
        match self {
            // Safety: ensured by caller
            Backend::Dynamic(heap) => unsafe { heap.size_of(addr) },
            #[cfg(feature = "fixed-range")]
            Backend::FixedRange(heap) => heap.size_of(addr),
            #[cfg(feature = "fixed-block-count")]
            Backend::FixedBlockCount(heap) => heap.size_of(addr),
            Backend::Dummy => 0,
        }
    }

    fn usage(&self) -> HeapUsage {
        match self {
            Backend::Dynamic(heap) => heap.usage(),
            #[cfg(feature = "fixed-range")]
            Backend::FixedRange(heap) => heap.usage(),
            #[cfg(feature = "fixed-block-count")]
            Backend::FixedBlockCount(heap) => heap.usage(),
            Backend::Dummy => HeapUsage::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::MockPlatform;

    #[test]
    fn dummy_is_inert() {
        let mut backend: Backend<MockPlatform> = Backend::Dummy;

        assert!(backend.is_dummy());
        assert_eq!(backend.kind(), None);
        assert_eq!(backend.allocate(16), None);
        assert_eq!(backend.allocate_zeroed(16), None);
        // Safety: the dummy backend never dereferences anything
        unsafe {
            assert_eq!(backend.free(Address::new(0x1000)), Ok(0));
            assert_eq!(backend.free(Address::NULL), Ok(0));
            assert_eq!(backend.size_of(Address::new(0x1000)), 0);
        }
        assert_eq!(backend.usage(), HeapUsage::default());
    }

    #[test]
    #[cfg(all(feature = "dynamic", feature = "fixed-range", feature = "fixed-block-count"))]
    fn default_features_compile_in_every_backend() {
        assert!(BackendKind::Dynamic.is_compiled_in());
        assert!(BackendKind::FixedRange.is_compiled_in());
        assert!(BackendKind::FixedBlockCount.is_compiled_in());
    }

    #[test]
    #[cfg(feature = "fixed-block-count")]
    fn unknown_addresses_are_reported_not_ignored() {
        use crate::{Error, FixedBlockCountHeap, KIB, PAYLOAD_ALIGN, RawRegion};

        let mut control = vec![0u8; FixedBlockCountHeap::<RawRegion>::required_control_bytes(2)];
        let control_base = Address::from_ptr(control.as_mut_ptr());
        // Safety: `control` outlives the backend and is only accessed through it
        let control = unsafe { RawRegion::new(control_base, control.len()) };
        let heap = FixedBlockCountHeap::new(control, Address::new(0x4000_0000), KIB, 2).unwrap();
        let mut backend: Backend<MockPlatform> = Backend::FixedBlockCount(heap);

        let addr = backend.allocate(16).unwrap();
        let unknown = addr.add(PAYLOAD_ALIGN);

        // Safety: the bounded backend never touches its payload region
        unsafe {
            assert_eq!(backend.free(unknown), Err(Error::InvalidPointer(unknown)));
            assert_eq!(backend.free(Address::NULL), Ok(0));
            assert_eq!(backend.free(addr), Ok(PAYLOAD_ALIGN));
            assert_eq!(backend.free(addr), Err(Error::InvalidPointer(addr)));
        }
        assert_eq!(backend.usage().blocks, 0);
    }

    #[test]
    fn usage_free_bytes() {
        let usage = HeapUsage {
            used: 100,
            blocks: 2,
            capacity: Some(400),
        };
        assert_eq!(usage.free(), Some(300));
        assert_eq!(HeapUsage::default().free(), None);
    }
}
