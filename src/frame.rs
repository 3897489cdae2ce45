// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Caller frames bound to data terminals.

use crate::{
    error::{Error, Result},
    format::{self, FourCC},
};
use dma_heap::{Heap, HeapKind};
use std::{
    ffi::c_void,
    fmt,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    ptr::{null_mut, NonNull},
    slice,
};
use tracing::warn;

/// Geometry of the frames a data terminal carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    pub format: FourCC,
}

impl FrameInfo {
    pub fn new(width: u32, height: u32, format: FourCC) -> Self {
        FrameInfo {
            width,
            height,
            format,
        }
    }

    pub fn bpp(&self) -> u8 {
        format::bpp(self.format)
    }

    pub fn stride(&self) -> u32 {
        format::stride(self.format, self.width)
    }

    pub fn size(&self) -> u32 {
        format::frame_size(self.format, self.width, self.height)
    }

    pub fn area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }
}

impl fmt::Display for FrameInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.format)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMemory {
    /// DMA-buf descriptor.
    Dma(RawFd),
    /// Host address.
    Cpu(NonNull<u8>),
}

/// One caller frame handed to [`iterate`].
///
/// [`iterate`]: crate::controller::ProcessGroupController::iterate
#[derive(Debug, Clone, Copy)]
pub struct FrameBuffer {
    memory: FrameMemory,
    size: u32,
    /// Cache maintenance is needed when the device maps the frame.
    pub flush: bool,
    pub sequence: i64,
}

// SAFETY: the frame is a plain description; the memory it points at is
// only touched by the device or through the caller.
unsafe impl Send for FrameBuffer {}

impl FrameBuffer {
    /// Describes a DMA-buf frame.
    ///
    /// # Safety
    ///
    /// `fd` must refer to at least `size` bytes and stay open for as long
    /// as the controller the frame is handed to keeps it registered.
    pub unsafe fn from_fd(fd: RawFd, size: u32) -> Self {
        FrameBuffer {
            memory: FrameMemory::Dma(fd),
            size,
            flush: false,
            sequence: 0,
        }
    }

    /// Describes a frame in host memory.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for `size` bytes for as long as the controller
    /// the frame is handed to keeps it registered.
    pub unsafe fn from_ptr(ptr: NonNull<u8>, size: u32) -> Self {
        FrameBuffer {
            memory: FrameMemory::Cpu(ptr),
            size,
            flush: false,
            sequence: 0,
        }
    }

    pub fn with_sequence(mut self, sequence: i64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn with_flush(mut self, flush: bool) -> Self {
        self.flush = flush;
        self
    }

    pub fn memory(&self) -> FrameMemory {
        self.memory
    }

    pub fn size(&self) -> u32 {
        self.size
    }
}

/// A frame allocated from the CMA dma-heap.
#[derive(Debug)]
pub struct DmaFrame {
    fd: OwnedFd,
    info: FrameInfo,
}

impl DmaFrame {
    pub fn new(info: FrameInfo) -> Result<Self> {
        let heap = Heap::new(HeapKind::Cma)
            .map_err(|e| Error::Device(format!("cannot open cma heap: {}", e)))?;
        let fd = heap
            .allocate(info.size() as usize)
            .map_err(|e| Error::NoMemory(format!("dma heap allocation of {}: {}", info, e)))?;
        Ok(DmaFrame { fd, info })
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// The frame as handed to a controller.
    pub fn frame_buffer(&self, sequence: i64) -> FrameBuffer {
        // SAFETY: the descriptor is owned by `self` and sized for the frame.
        unsafe { FrameBuffer::from_fd(self.raw_fd(), self.info.size()) }.with_sequence(sequence)
    }

    pub fn mmap(&mut self) -> Result<MappedFrame<'_>> {
        let len = self.info.size() as usize;
        // SAFETY: mapping a dma-buf we own; the result is checked below.
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| Error::Internal("mmap returned null".to_owned()))?;
        Ok(MappedFrame {
            ptr,
            len,
            _frame: self,
        })
    }
}

/// CPU view of a [`DmaFrame`], unmapped on drop.
pub struct MappedFrame<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _frame: &'a mut DmaFrame,
}

impl MappedFrame<'_> {
    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `len` bytes are mapped for the lifetime of `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, borrowed mutably.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for MappedFrame<'_> {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `len` describe the mapping made by `mmap`.
        if unsafe { libc::munmap(self.ptr.as_ptr().cast::<c_void>(), self.len) } != 0 {
            warn!(
                "munmap of {} frame bytes: {}",
                self.len,
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_info_sizes() {
        let info = FrameInfo::new(1920, 1080, FourCC::NV12);
        assert_eq!(info.stride(), 1920);
        assert_eq!(info.size(), 1920 * 1080 * 3 / 2);
        assert_eq!(info.area(), 1920 * 1080);
        assert_eq!(info.to_string(), "1920x1080 NV12");
    }

    #[test]
    fn frame_buffer_builders() {
        let mut bytes = [0u8; 16];
        let ptr = NonNull::new(bytes.as_mut_ptr()).unwrap();
        let frame = unsafe { FrameBuffer::from_ptr(ptr, 16) }
            .with_sequence(7)
            .with_flush(true);
        assert_eq!(frame.memory(), FrameMemory::Cpu(ptr));
        assert_eq!(frame.size(), 16);
        assert_eq!(frame.sequence, 7);
        assert!(frame.flush);
    }

    #[test]
    fn mapping_writes_through_and_unmaps() -> Result<()> {
        let info = FrameInfo::new(64, 4, FourCC::NV12);
        let path = std::env::temp_dir().join(format!("ipu-psys-frame-{}", std::process::id()));
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(u64::from(info.size()))?;

        let mut frame = DmaFrame {
            fd: file.into(),
            info,
        };
        {
            let mut map = frame.mmap()?;
            assert_eq!(map.as_slice().len(), 384);
            map.as_mut_slice().fill(0x5a);
        }
        // a second mapping after the first was released
        assert!(frame.mmap()?.as_slice().iter().all(|b| *b == 0x5a));
        drop(frame);

        let bytes = std::fs::read(&path)?;
        std::fs::remove_file(&path)?;
        assert_eq!(bytes.len(), 384);
        assert!(bytes.iter().all(|b| *b == 0x5a));
        Ok(())
    }
}
