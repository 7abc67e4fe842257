// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::{Ref, RefCell};
use std::collections::HashMap;
use std::rc::Rc;
#[cfg(any(feature = "fixed-range", feature = "fixed-block-count"))]
use std::vec::Vec;

#[cfg(any(feature = "fixed-range", feature = "fixed-block-count"))]
use proptest::prelude::*;

use crate::{Address, Platform};

const MOCK_ALIGN: usize = 8;

/// A [`Platform`] backed by the system allocator that remembers every allocation it handed out.
///
/// Clones share the same ledger so tests can keep a handle after moving the platform into a heap.
#[derive(Clone, Default)]
pub struct MockPlatform<const REPORTS_SIZE: bool = false> {
    inner: Rc<RefCell<MockInner>>,
}

#[derive(Default)]
struct MockInner {
    allocations: HashMap<Address, Layout>,
    limit: Option<usize>,
}

impl Drop for MockInner {
    fn drop(&mut self) {
        for (addr, layout) in self.allocations.drain() {
            // Safety: every entry was allocated from `System` with exactly this layout
            unsafe { System.dealloc(addr.as_mut_ptr(), layout) }
        }
    }
}

impl<const REPORTS_SIZE: bool> MockPlatform<REPORTS_SIZE> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse allocations once `limit` bytes are outstanding.
    pub fn with_limit(limit: usize) -> Self {
        let this = Self::default();
        this.inner.borrow_mut().limit = Some(limit);
        this
    }

    pub fn allocations(&self) -> Ref<'_, HashMap<Address, Layout>> {
        Ref::map(self.inner.borrow(), |inner| &inner.allocations)
    }

    /// Size of the platform allocation at `addr`, if it is live.
    pub fn allocation(&self, addr: Address) -> Option<usize> {
        self.allocations().get(&addr).map(Layout::size)
    }

    pub fn live(&self) -> usize {
        self.allocations().len()
    }

    pub fn outstanding_bytes(&self) -> usize {
        self.allocations().values().map(Layout::size).sum()
    }
}

// Safety: allocations come straight from `System`
unsafe impl<const REPORTS_SIZE: bool> Platform for MockPlatform<REPORTS_SIZE> {
    const REPORTS_SIZE: bool = REPORTS_SIZE;

    fn allocate(&mut self, size: usize) -> Option<Address> {
        let limit = self.inner.borrow().limit;
        if limit.is_some_and(|limit| self.outstanding_bytes() + size > limit) {
            return None;
        }

        let layout = Layout::from_size_align(size, MOCK_ALIGN).ok()?;
        // Safety: `DynamicHeap` never requests zero sized allocations
        let ptr = unsafe { System.alloc(layout) };
        let addr = Address::from_ptr(ptr);
        if addr.is_null() {
            return None;
        }

        self.inner.borrow_mut().allocations.insert(addr, layout);
        Some(addr)
    }

    unsafe fn deallocate(&mut self, addr: Address, size: usize) {
        let layout = self
            .inner
            .borrow_mut()
            .allocations
            .remove(&addr)
            .expect("deallocating unknown address");

        assert_eq!(layout.size(), size, "deallocation size mismatch");

        // Safety: allocated from `System` with exactly this layout
        unsafe { System.dealloc(addr.as_mut_ptr(), layout) }
    }

    unsafe fn allocation_size(&self, addr: Address) -> usize {
        self.allocation(addr).expect("size query for unknown address")
    }
}

/// One step of a randomized allocate/free sequence.
#[cfg(any(feature = "fixed-range", feature = "fixed-block-count"))]
#[derive(Debug, Clone, Copy)]
pub enum Op {
    Allocate(usize),
    /// Free the live allocation at this index (modulo the number of live allocations).
    Free(usize),
}

#[cfg(any(feature = "fixed-range", feature = "fixed-block-count"))]
pub fn ops(max_size: usize, len: usize) -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            (1..=max_size).prop_map(Op::Allocate),
            any::<usize>().prop_map(Op::Free),
        ],
        0..len,
    )
}
