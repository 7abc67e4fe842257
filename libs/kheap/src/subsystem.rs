// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use core::fmt;

use crate::backend::{Backend, BackendKind, HeapBackend, HeapUsage};
use crate::dynamic::{DynamicHeap, Platform};
#[cfg(feature = "fixed-block-count")]
use crate::fixed_block_count::FixedBlockCountHeap;
#[cfg(feature = "fixed-range")]
use crate::fixed_range::FixedRangeHeap;
use crate::{Address, Error, RawRegion, Result};

/// Whether the video heap has its own backend or shares the system heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    /// Video allocations are served by the system heap.
    Unified,
    /// Video memory is a distinct region with its own backend.
    Separated,
}

/// Where and how the system heap lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionConfig {
    pub kind: BackendKind,
    pub base: Address,
    pub size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoConfig {
    pub kind: BackendKind,
    pub base: Address,
    pub size: usize,
    /// Maximum number of live video allocations, only used by
    /// [`BackendKind::FixedBlockCount`].
    pub block_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryConfig {
    pub heap: RegionConfig,
    pub video: VideoConfig,
    pub architecture: Architecture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    /// Configured through [`MemorySubsystem::init_default`].
    DynamicDefault,
    /// Configured through [`MemorySubsystem::init_explicit`].
    Configured,
}

/// The system heap and the video heap of a target, each bound to one backend.
///
/// A subsystem starts out [`State::Uninitialized`] with both heaps bound to the dummy backend and
/// has to be configured exactly once, either with [`init_default`](Self::init_default) or with
/// [`init_explicit`](Self::init_explicit). In the unified architecture the video heap is the
/// system heap.
pub struct MemorySubsystem<P> {
    platform: P,
    state: State,
    heap: Backend<P>,
    /// `None` when the video heap is unified with the system heap.
    video: Option<Backend<P>>,
}

impl<P> fmt::Debug for MemorySubsystem<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemorySubsystem")
            .field("state", &self.state)
            .field("heap", &self.heap)
            .field("video", &self.video)
            .finish_non_exhaustive()
    }
}

impl<P> MemorySubsystem<P> {
    pub const fn new(platform: P) -> Self {
        Self {
            platform,
            state: State::Uninitialized,
            heap: Backend::Dummy,
            video: None,
        }
    }

    pub const fn state(&self) -> State {
        self.state
    }

    pub const fn video_is_unified(&self) -> bool {
        self.video.is_none()
    }

    pub const fn heap_backend(&self) -> &Backend<P> {
        &self.heap
    }

    pub const fn video_backend(&self) -> &Backend<P> {
        match &self.video {
            Some(video) => video,
            None => &self.heap,
        }
    }

    fn video_mut(&mut self) -> &mut Backend<P> {
        match &mut self.video {
            Some(video) => video,
            None => &mut self.heap,
        }
    }
}

impl<P: Platform + Clone> MemorySubsystem<P> {
    /// Binds the system heap to the platform allocator and unifies the video heap with it.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyInitialized`] if the subsystem was configured before.
    /// - [`Error::BackendUnavailable`] if the dynamic backend is not compiled in.
    pub fn init_default(&mut self) -> Result<()> {
        if self.state != State::Uninitialized {
            return Err(Error::AlreadyInitialized);
        }
        if !BackendKind::Dynamic.is_compiled_in() {
            return Err(Error::BackendUnavailable(BackendKind::Dynamic));
        }

        self.heap = Backend::Dynamic(DynamicHeap::new(self.platform.clone()));
        self.video = None;
        self.state = State::DynamicDefault;

        log::debug!("memory subsystem bound to the platform allocator");
        Ok(())
    }

    /// Configures both heaps from `config`.
    ///
    /// In the separated architecture with a [`BackendKind::FixedBlockCount`] video heap, the video
    /// control block is allocated from the freshly configured system heap. Nothing is committed
    /// unless every step succeeds, so on error the subsystem is left as it was.
    ///
    /// # Errors
    ///
    /// - [`Error::AlreadyInitialized`] if the subsystem was configured before.
    /// - [`Error::ZeroSizedHeap`] if the system heap size is zero.
    /// - [`Error::UnsupportedSystemBackend`] if the system heap asks for
    ///   [`BackendKind::FixedBlockCount`], which has no control block to live in.
    /// - [`Error::BackendUnavailable`] if a requested backend is not compiled in.
    /// - [`Error::OutOfMemory`] if the video control block cannot be allocated.
    /// - Any error of [`prepare_manager`](Self::prepare_manager) for either heap.
    ///
    /// # Safety
    ///
    /// Every region `config` describes for a [`BackendKind::FixedRange`] heap must satisfy the
    /// requirements of [`RawRegion::new`] for as long as this subsystem is alive. Regions of a
    /// [`BackendKind::FixedBlockCount`] heap are never accessed and carry no requirements.
    pub unsafe fn init_explicit(&mut self, config: &MemoryConfig) -> Result<()> {
        if self.state != State::Uninitialized {
            return Err(Error::AlreadyInitialized);
        }

        let RegionConfig { kind, base, size } = config.heap;
        if size == 0 {
            return Err(Error::ZeroSizedHeap);
        }
        if kind == BackendKind::FixedBlockCount {
            return Err(Error::UnsupportedSystemBackend(kind));
        }
        if !kind.is_compiled_in() {
            return Err(Error::BackendUnavailable(kind));
        }
        if config.architecture == Architecture::Separated && !config.video.kind.is_compiled_in() {
            return Err(Error::BackendUnavailable(config.video.kind));
        }

        // Safety: ensured by caller
        let mut heap = unsafe { self.prepare_manager(kind, base, size, None, 0)? };

        let video = match config.architecture {
            Architecture::Unified => None,
            Architecture::Separated => {
                // Safety: ensured by caller
                Some(unsafe { self.prepare_video(&mut heap, &config.video)? })
            }
        };

        log::debug!(
            "memory subsystem configured: heap {kind:?} at {base} ({size} bytes), video {:?}",
            config.architecture
        );

        self.heap = heap;
        self.video = video;
        self.state = State::Configured;
        Ok(())
    }

    /// # Safety
    ///
    /// See [`init_explicit`](Self::init_explicit).
    unsafe fn prepare_video(
        &self,
        #[cfg_attr(
            not(feature = "fixed-block-count"),
            expect(unused_variables, reason = "only the bounded video heap uses the system heap")
        )]
        heap: &mut Backend<P>,
        video: &VideoConfig,
    ) -> Result<Backend<P>> {
        match video.kind {
            #[cfg(feature = "fixed-block-count")]
            // Safety: ensured by caller
            BackendKind::FixedBlockCount => unsafe { self.prepare_bounded_video(heap, video) },
            // Safety: ensured by caller
            _ => unsafe { self.prepare_manager(video.kind, video.base, video.size, None, 0) },
        }
    }

    /// Carves the control block of a [`BackendKind::FixedBlockCount`] video heap from `heap` and
    /// builds the video backend over it, releasing the control block again if that fails.
    ///
    /// # Safety
    ///
    /// See [`init_explicit`](Self::init_explicit).
    #[cfg(feature = "fixed-block-count")]
    unsafe fn prepare_bounded_video(
        &self,
        heap: &mut Backend<P>,
        video: &VideoConfig,
    ) -> Result<Backend<P>> {
        if video.block_count == 0 {
            return Err(Error::ZeroBlockCount);
        }

        let required = FixedBlockCountHeap::<RawRegion>::required_control_bytes(video.block_count);
        let Some(control_base) = heap.allocate(required) else {
            log::warn!("cannot allocate {required} byte video control block from the system heap");
            return Err(Error::OutOfMemory);
        };

        // Safety: `heap` just handed out these `required` bytes and they are never freed while the
        // video heap lives, because `heap` and the video heap are committed together
        let control = unsafe { RawRegion::new(control_base, required) };

        // Safety: ensured by caller
        let res = unsafe {
            self.prepare_manager(
                video.kind,
                video.base,
                video.size,
                Some(control),
                video.block_count,
            )
        };

        if res.is_err() {
            // Safety: `control_base` was allocated from `heap` above
            if let Err(err) = unsafe { heap.free(control_base) } {
                log::error!("failed to release video control block {control_base}: {err}");
            }
        }

        res
    }

    /// Builds the backend of `kind` over `base..base + size`.
    ///
    /// `control` is the control block and `block_count` the slot count of a
    /// [`BackendKind::FixedBlockCount`] backend, both are ignored by the other kinds. A kind that
    /// is not compiled in yields [`Backend::Dummy`].
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidPointer`] if a [`BackendKind::FixedRange`] region starts at null.
    /// - [`Error::RegionTooSmall`] if [`BackendKind::FixedBlockCount`] gets no control block.
    /// - Any error of [`FixedRangeHeap::new`](crate::FixedRangeHeap::new) or
    ///   [`FixedBlockCountHeap::new`](crate::FixedBlockCountHeap::new).
    ///
    /// # Safety
    ///
    /// For [`BackendKind::FixedRange`] the region must satisfy the requirements of
    /// [`RawRegion::new`] for as long as the returned backend is alive.
    pub unsafe fn prepare_manager(
        &self,
        kind: BackendKind,
        base: Address,
        size: usize,
        control: Option<RawRegion>,
        block_count: usize,
    ) -> Result<Backend<P>> {
        match kind {
            #[cfg(feature = "dynamic")]
            BackendKind::Dynamic => Ok(Backend::Dynamic(DynamicHeap::new(self.platform.clone()))),
            #[cfg(feature = "fixed-range")]
            BackendKind::FixedRange => {
                if base.is_null() {
                    return Err(Error::InvalidPointer(base));
                }

                // Safety: ensured by caller
                let region = unsafe { RawRegion::new(base, size) };
                Ok(Backend::FixedRange(FixedRangeHeap::new(region)?))
            }
            #[cfg(feature = "fixed-block-count")]
            BackendKind::FixedBlockCount => {
                let Some(control) = control else {
                    return Err(Error::RegionTooSmall {
                        size: 0,
                        required: FixedBlockCountHeap::<RawRegion>::required_control_bytes(
                            block_count,
                        ),
                    });
                };

                Ok(Backend::FixedBlockCount(FixedBlockCountHeap::new(
                    control,
                    base,
                    size,
                    block_count,
                )?))
            }
            #[cfg(not(all(
                feature = "dynamic",
                feature = "fixed-range",
                feature = "fixed-block-count"
            )))]
            _ => {
                let _ = (base, size, control, block_count);
                log::warn!("{kind:?} backend is not compiled in, binding the dummy backend");
                Ok(Backend::Dummy)
            }
        }
    }

    /// Allocates `size` bytes from the system heap.
    ///
    /// Returns `None` if the subsystem is not initialized.
    pub fn allocate(&mut self, size: usize) -> Option<Address> {
        if self.state == State::Uninitialized {
            log::warn!("allocation of {size} bytes before the memory subsystem was initialized");
            return None;
        }

        self.heap.allocate(size)
    }

    pub fn allocate_zeroed(&mut self, size: usize) -> Option<Address> {
        if self.state == State::Uninitialized {
            log::warn!("allocation of {size} bytes before the memory subsystem was initialized");
            return None;
        }

        self.heap.allocate_zeroed(size)
    }

    /// Frees an allocation of the system heap and returns its size.
    ///
    /// # Errors
    ///
    /// [`Error::NotInitialized`] for non-null addresses before initialization, otherwise
    /// whatever the bound backend reports, see [`HeapBackend::free`].
    ///
    /// # Safety
    ///
    /// `addr` must be null or have been returned by [`allocate`](Self::allocate) and not freed
    /// since.
    pub unsafe fn free(&mut self, addr: Address) -> Result<usize> {
        if self.state == State::Uninitialized && !addr.is_null() {
            return Err(Error::NotInitialized);
        }

        // Safety: ensured by caller
        unsafe { self.heap.free(addr) }
    }

    /// # Safety
    ///
    /// Same requirements as [`free`](Self::free).
    pub unsafe fn size_of(&self, addr: Address) -> usize {
        // Safety: ensured by caller
        unsafe { self.heap.size_of(addr) }
    }

    /// Allocates `size` bytes from the video heap.
    pub fn allocate_video(&mut self, size: usize) -> Option<Address> {
        if self.state == State::Uninitialized {
            log::warn!(
                "video allocation of {size} bytes before the memory subsystem was initialized"
            );
            return None;
        }

        self.video_mut().allocate(size)
    }

    /// # Errors
    ///
    /// Same as [`free`](Self::free), for the video heap.
    ///
    /// # Safety
    ///
    /// `addr` must be null or have been returned by [`allocate_video`](Self::allocate_video) and
    /// not freed since.
    pub unsafe fn free_video(&mut self, addr: Address) -> Result<usize> {
        if self.state == State::Uninitialized && !addr.is_null() {
            return Err(Error::NotInitialized);
        }

        // Safety: ensured by caller
        unsafe { self.video_mut().free(addr) }
    }

    /// # Safety
    ///
    /// Same requirements as [`free_video`](Self::free_video).
    pub unsafe fn video_size_of(&self, addr: Address) -> usize {
        // Safety: ensured by caller
        unsafe { self.video_backend().size_of(addr) }
    }

    pub fn heap_usage(&self) -> HeapUsage {
        self.heap.usage()
    }

    pub fn video_usage(&self) -> HeapUsage {
        self.video_backend().usage()
    }
}
