// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::error::{Error, Result};
use bitflags::bitflags;
use psys_sys::ipu_psys_buffer;
use std::{
    alloc::{self, Layout},
    os::fd::RawFd,
    ptr::NonNull,
    slice,
};
use tracing::debug;

bitflags! {
    /// Semantic flags describing where a buffer's memory lives and how the
    /// device may use it.
    #[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MemoryFlags: u32 {
        /// `handle` holds a device handle (DMA-buf descriptor).
        const MEMORY_HANDLE = 1 << 0;
        /// `cpu_ptr` holds a CPU address.
        const CPU_PTR = 1 << 1;
        /// CPU memory is allocated on first use.
        const ALLOCATE_CPU_PTR = 1 << 2;
        /// Copy the user memory into a system allocation at construction.
        const COPY_FROM_USER = 1 << 3;
        const CPU_ONLY = 1 << 4;
        const HARDWARE_ONLY = 1 << 5;
        const READ_ONLY = 1 << 6;
        const WRITE_ONLY = 1 << 7;
        const UNCACHED = 1 << 8;
        const SECURED = 1 << 9;
        /// Registered with the device.
        const MIGRATED = 1 << 10;
        /// Skip cache maintenance when the device maps the buffer.
        const NO_FLUSH = 1 << 11;
        /// CPU memory was allocated by this layer and is freed with the buffer.
        const ALLOCATED = 1 << 12;
        /// Memory is owned by the caller.
        const MEMORY_FROM_USER = 1 << 13;
        /// Protocol metadata only, never registered with the device.
        const PSYS_API = 1 << 14;
        /// Allocation does not need to be zeroed.
        const UNINITIALIZED = 1 << 15;

        const DEVICE_MASK = Self::HARDWARE_ONLY.bits()
            | Self::UNCACHED.bits()
            | Self::SECURED.bits();
    }
}

/// Description of one memory region.
///
/// This is a plain record: the owning [`Buffer`](crate::buffer::Buffer) keeps
/// the allocation alive and drives every state change.
#[derive(Debug, Default, Clone, Copy)]
pub struct MemoryDesc {
    pub size: u32,
    pub cpu_ptr: Option<NonNull<u8>>,
    pub handle: Option<RawFd>,
    pub flags: MemoryFlags,
    /// Kernel-side registration, present once the memory was migrated.
    pub(crate) registration: Option<ipu_psys_buffer>,
}

impl MemoryDesc {
    /// Describes caller-owned CPU memory.
    pub fn from_cpu_ptr(ptr: NonNull<u8>, size: u32) -> Self {
        MemoryDesc {
            size,
            cpu_ptr: Some(ptr),
            flags: MemoryFlags::CPU_PTR,
            ..Default::default()
        }
    }

    /// Describes a caller-owned device handle.
    pub fn from_handle(fd: RawFd, size: u32) -> Self {
        MemoryDesc {
            size,
            handle: Some(fd),
            flags: MemoryFlags::MEMORY_HANDLE,
            ..Default::default()
        }
    }

    pub fn has_memory(&self) -> bool {
        self.flags
            .intersects(MemoryFlags::ALLOCATED | MemoryFlags::MEMORY_FROM_USER)
    }

    pub fn registration(&self) -> Option<ipu_psys_buffer> {
        self.registration
    }

    /// Checks that the flags agree with the fields they describe.
    pub fn validate(&self) -> Result<()> {
        let flags = self.flags;
        let have_memory = self.has_memory();

        if flags.contains(MemoryFlags::CPU_PTR) != self.cpu_ptr.is_some() {
            return Err(Error::InvalidArg(format!(
                "CPU_PTR flag and cpu pointer disagree ({:?})",
                flags
            )));
        }
        if flags.contains(MemoryFlags::MEMORY_HANDLE) != self.handle.is_some() {
            return Err(Error::InvalidArg(format!(
                "MEMORY_HANDLE flag and handle disagree ({:?})",
                flags
            )));
        }
        if flags.contains(MemoryFlags::CPU_ONLY | MemoryFlags::HARDWARE_ONLY) {
            return Err(Error::InvalidArg(
                "CPU_ONLY and HARDWARE_ONLY are exclusive".to_owned(),
            ));
        }
        if !have_memory && flags.intersects(MemoryFlags::MEMORY_HANDLE | MemoryFlags::CPU_PTR) {
            return Err(Error::InvalidArg(
                "memory reference without allocated or user memory".to_owned(),
            ));
        }
        if have_memory
            && flags.intersects(MemoryFlags::ALLOCATE_CPU_PTR | MemoryFlags::COPY_FROM_USER)
        {
            return Err(Error::InvalidArg(format!(
                "memory present but allocation still pending ({:?})",
                flags
            )));
        }
        if have_memory
            && !flags.intersects(
                MemoryFlags::MEMORY_HANDLE | MemoryFlags::CPU_PTR | MemoryFlags::HARDWARE_ONLY,
            )
        {
            return Err(Error::InvalidArg(
                "memory present but neither cpu pointer nor handle".to_owned(),
            ));
        }

        Ok(())
    }
}

pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

pub fn page_align(size: usize) -> usize {
    let page = page_size();
    size.div_ceil(page) * page
}

/// Page-aligned system allocation, freed on drop.
#[derive(Debug)]
pub struct PageAlloc {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is exclusively owned by this value.
unsafe impl Send for PageAlloc {}
unsafe impl Sync for PageAlloc {}

impl PageAlloc {
    /// Allocates at least `size` bytes aligned to the page size, zeroed
    /// unless `zeroed` is false.
    pub fn new(size: usize, zeroed: bool) -> Result<Self> {
        if size == 0 {
            return Err(Error::InvalidArg("zero sized allocation".to_owned()));
        }
        let page = page_size();
        let layout = Layout::from_size_align(page_align(size), page)
            .map_err(|e| Error::InvalidArg(e.to_string()))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe {
            if zeroed {
                alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc(layout)
            }
        };
        let ptr = NonNull::new(raw)
            .ok_or_else(|| Error::NoMemory(format!("failed to allocate {} bytes", size)))?;
        debug!("allocated {} bytes at {:p}", layout.size(), ptr);
        Ok(PageAlloc { ptr, layout })
    }

    pub fn as_ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.layout.size()
    }

    pub fn is_empty(&self) -> bool {
        self.layout.size() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the allocation is live and `len` bytes long.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len()) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: the allocation is live, `len` bytes long and borrowed
        // mutably.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len()) }
    }
}

impl Drop for PageAlloc {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
        debug!("freed {} bytes", self.layout.size());
    }
}
