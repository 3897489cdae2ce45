// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    context::Context,
    error::{Error, Result},
    memory::{MemoryDesc, MemoryFlags, PageAlloc},
};
use psys_sys::ipu_psys_buffer;
use std::{
    marker::PhantomData,
    ptr::{self, NonNull},
    slice,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
};
use tracing::{debug, warn};

enum Kind {
    Root { regions: AtomicUsize },
    Region { parent: Weak<Buffer>, offset: u32 },
}

struct Inner {
    desc: MemoryDesc,
    storage: Option<PageAlloc>,
    context: Option<Arc<Context>>,
}

// SAFETY: the descriptor pointers refer either to `storage`, owned here, or
// to caller memory whose lifetime the caller guaranteed when building the
// buffer with `with_user_memory`.
unsafe impl Send for Inner {}

/// Memory that can be handed to the psys device.
///
/// A root buffer owns (or borrows from the caller) one memory region and may
/// be attached to a [`Context`], which registers it with the device. A region
/// is a window into a root: it holds only a weak reference, so resolving a
/// region whose root has been dropped fails instead of touching freed memory.
pub struct Buffer {
    kind: Kind,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let desc = self.lock().desc;
        f.debug_struct("Buffer")
            .field("region", &self.is_region())
            .field("offset", &self.offset())
            .field("size", &desc.size)
            .field("flags", &desc.flags)
            .finish()
    }
}

impl Buffer {
    fn root(desc: MemoryDesc) -> Result<Arc<Buffer>> {
        desc.validate()?;
        Ok(Arc::new(Buffer {
            kind: Kind::Root {
                regions: AtomicUsize::new(0),
            },
            inner: Mutex::new(Inner {
                desc,
                storage: None,
                context: None,
            }),
        }))
    }

    /// Creates a root buffer of `size` bytes. Memory is obtained on first use
    /// when `flags` contains [`MemoryFlags::ALLOCATE_CPU_PTR`].
    pub fn new(size: u32, flags: MemoryFlags) -> Result<Arc<Buffer>> {
        if size == 0 {
            return Err(Error::InvalidArg("zero sized buffer".to_owned()));
        }
        Buffer::root(MemoryDesc {
            size,
            flags,
            ..Default::default()
        })
    }

    /// Creates a root buffer over caller memory described by `user`.
    ///
    /// With [`MemoryFlags::COPY_FROM_USER`] the bytes are copied into a
    /// buffer-owned allocation immediately and `user` is not referenced
    /// afterwards.
    ///
    /// # Safety
    ///
    /// Unless the memory is copied, the pointer or handle in `user` must stay
    /// valid for at least `size` bytes until the buffer is dropped.
    pub unsafe fn with_user_memory(
        size: u32,
        flags: MemoryFlags,
        user: &MemoryDesc,
    ) -> Result<Arc<Buffer>> {
        if size == 0 {
            return Err(Error::InvalidArg("zero sized buffer".to_owned()));
        }
        if user.size < size {
            return Err(Error::Internal(format!(
                "requested {} bytes but user memory holds {}",
                size, user.size
            )));
        }

        let mut desc = MemoryDesc {
            size,
            ..Default::default()
        };

        if user.flags.contains(MemoryFlags::CPU_PTR) {
            let Some(ptr) = user.cpu_ptr else {
                return Err(Error::Internal("CPU_PTR given without pointer".to_owned()));
            };
            if user.flags.contains(MemoryFlags::MEMORY_HANDLE) {
                return Err(Error::Internal(
                    "CPU_PTR conflicts with MEMORY_HANDLE".to_owned(),
                ));
            }
            if flags.contains(MemoryFlags::ALLOCATE_CPU_PTR)
                && !flags.contains(MemoryFlags::COPY_FROM_USER)
            {
                return Err(Error::Internal(
                    "CPU_PTR conflicts with ALLOCATE_CPU_PTR".to_owned(),
                ));
            }
            desc.cpu_ptr = Some(ptr);
            desc.flags |= MemoryFlags::CPU_PTR | MemoryFlags::MEMORY_FROM_USER;
        } else if user.flags.contains(MemoryFlags::MEMORY_HANDLE) {
            let Some(fd) = user.handle else {
                return Err(Error::Internal(
                    "MEMORY_HANDLE given without handle".to_owned(),
                ));
            };
            if flags.contains(MemoryFlags::COPY_FROM_USER) {
                return Err(Error::Internal(
                    "copy from a handle to host memory is not supported".to_owned(),
                ));
            }
            desc.handle = Some(fd);
            desc.flags |= MemoryFlags::MEMORY_HANDLE | MemoryFlags::MEMORY_FROM_USER;
        } else {
            return Err(Error::Internal("user memory has neither pointer nor handle".to_owned()));
        }

        desc.flags |= user.flags | flags;

        let mut storage = None;
        if desc.flags.contains(MemoryFlags::COPY_FROM_USER) {
            let mut alloc = PageAlloc::new(size as usize, false)?;
            if let Some(src) = desc.cpu_ptr {
                // SAFETY: the caller guarantees `size` readable bytes behind
                // `src`; `alloc` holds at least `size` bytes.
                unsafe {
                    ptr::copy_nonoverlapping(
                        src.as_ptr(),
                        alloc.as_mut_slice().as_mut_ptr(),
                        size as usize,
                    )
                };
            }
            desc.cpu_ptr = Some(alloc.as_ptr());
            desc.flags.remove(
                MemoryFlags::COPY_FROM_USER
                    | MemoryFlags::ALLOCATE_CPU_PTR
                    | MemoryFlags::MEMORY_FROM_USER,
            );
            desc.flags.insert(MemoryFlags::CPU_PTR | MemoryFlags::ALLOCATED);
            storage = Some(alloc);
        }

        let buffer = Buffer::root(desc)?;
        buffer.lock().storage = storage;
        Ok(buffer)
    }

    /// Creates a window of `size` bytes at `offset` into `parent`.
    ///
    /// Containment is checked whenever the region's memory is resolved.
    pub fn region(parent: &Arc<Buffer>, offset: u32, size: u32) -> Result<Arc<Buffer>> {
        if size == 0 {
            return Err(Error::InvalidArg("zero sized region".to_owned()));
        }
        let Kind::Root { regions } = &parent.kind else {
            return Err(Error::Internal("nested regions are not allowed".to_owned()));
        };

        let flags = parent.lock().desc.flags;
        regions.fetch_add(1, Ordering::AcqRel);
        Ok(Arc::new(Buffer {
            kind: Kind::Region {
                parent: Arc::downgrade(parent),
                offset,
            },
            inner: Mutex::new(Inner {
                desc: MemoryDesc {
                    size,
                    flags,
                    ..Default::default()
                },
                storage: None,
                context: None,
            }),
        }))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // the guarded data stays consistent across a panic in a caller
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_region(&self) -> bool {
        matches!(self.kind, Kind::Region { .. })
    }

    /// Byte offset into the root; zero for roots.
    pub fn offset(&self) -> u32 {
        match self.kind {
            Kind::Root { .. } => 0,
            Kind::Region { offset, .. } => offset,
        }
    }

    /// The root this region views, `None` for roots or when the root is gone.
    pub fn parent(&self) -> Option<Arc<Buffer>> {
        match &self.kind {
            Kind::Root { .. } => None,
            Kind::Region { parent, .. } => parent.upgrade(),
        }
    }

    /// Number of live regions over this root.
    pub fn region_count(&self) -> usize {
        match &self.kind {
            Kind::Root { regions } => regions.load(Ordering::Acquire),
            Kind::Region { .. } => 0,
        }
    }

    pub fn size(&self) -> u32 {
        self.lock().desc.size
    }

    pub fn flags(&self) -> MemoryFlags {
        self.lock().desc.flags
    }

    pub fn is_migrated(&self) -> bool {
        self.flags().contains(MemoryFlags::MIGRATED)
    }

    /// Kernel registration of this buffer, present once migrated.
    pub fn sys_buffer(&self) -> Option<ipu_psys_buffer> {
        self.lock().desc.registration()
    }

    /// Obtains system memory if allocation was deferred.
    pub fn allocate(&self) -> Result<()> {
        if self.is_region() {
            return Err(Error::Internal("regions do not own memory".to_owned()));
        }
        let mut inner = self.lock();
        Buffer::allocate_locked(&mut inner)
    }

    fn allocate_locked(inner: &mut Inner) -> Result<()> {
        if !inner.desc.flags.contains(MemoryFlags::ALLOCATE_CPU_PTR) {
            return Ok(());
        }

        let alloc = match &inner.context {
            Some(ctx) => ctx.allocate(&mut inner.desc)?,
            None => {
                if inner.desc.flags.intersects(MemoryFlags::DEVICE_MASK) {
                    return Err(Error::InvalidArg(
                        "device memory flags specified, attach a device first".to_owned(),
                    ));
                }
                if inner.desc.cpu_ptr.is_some() {
                    return Err(Error::Internal(
                        "allocation pending but pointer exists".to_owned(),
                    ));
                }
                let zeroed = !inner.desc.flags.contains(MemoryFlags::UNINITIALIZED);
                let alloc = PageAlloc::new(inner.desc.size as usize, zeroed)?;
                inner.desc.cpu_ptr = Some(alloc.as_ptr());
                inner.desc.flags.remove(MemoryFlags::ALLOCATE_CPU_PTR);
                inner.desc.flags.insert(MemoryFlags::CPU_PTR | MemoryFlags::ALLOCATED);
                alloc
            }
        };
        inner.storage = Some(alloc);
        inner.desc.validate()
    }

    /// Attaches the buffer to `context`, allocating pending memory and
    /// registering it with the device.
    pub fn attach_device(&self, context: &Arc<Context>) -> Result<()> {
        if self.is_region() {
            return Err(Error::Internal(
                "only root buffers can be attached to a device".to_owned(),
            ));
        }

        let mut inner = self.lock();
        let Inner { desc, storage, .. } = &mut *inner;
        context.migrate(desc, storage)?;
        desc.validate()?;
        inner.context = Some(context.clone());
        Ok(())
    }

    /// Resolves the memory this buffer describes, allocating on first use.
    ///
    /// Regions resolve through their root, offsetting the CPU pointer and
    /// narrowing the size.
    pub fn memory(&self) -> Result<MemoryDesc> {
        match &self.kind {
            Kind::Root { .. } => {
                let mut inner = self.lock();
                if inner.desc.flags.contains(MemoryFlags::ALLOCATE_CPU_PTR) {
                    Buffer::allocate_locked(&mut inner)?;
                }
                let out = match &inner.context {
                    Some(ctx) => ctx.get_memory(&inner.desc)?,
                    None => inner.desc,
                };
                out.validate()?;
                Ok(out)
            }
            Kind::Region { parent, offset } => {
                let root = parent
                    .upgrade()
                    .ok_or_else(|| Error::Internal("region parent was released".to_owned()))?;
                let mut out = root.memory()?;
                let size = self.lock().desc.size;

                if u64::from(*offset) + u64::from(size) > u64::from(out.size) {
                    return Err(Error::Internal(format!(
                        "region {}+{} does not fit in parent of {} bytes",
                        offset, size, out.size
                    )));
                }
                if let Some(ptr) = out.cpu_ptr {
                    // SAFETY: offset + size lies within the root's memory.
                    out.cpu_ptr = Some(unsafe { NonNull::new_unchecked(ptr.as_ptr().add(*offset as usize)) });
                }
                out.size = size;
                Ok(out)
            }
        }
    }

    /// CPU view of the buffer's memory.
    pub fn map(&self) -> Result<MappedMemory<'_>> {
        let desc = self.memory()?;
        let ptr = desc
            .cpu_ptr
            .ok_or_else(|| Error::Device("buffer has no cpu mapping".to_owned()))?;
        Ok(MappedMemory {
            ptr,
            len: desc.size as usize,
            _buffer: PhantomData,
        })
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        match &self.kind {
            Kind::Root { regions } => {
                let live = regions.load(Ordering::Acquire);
                if live > 0 {
                    warn!("buffer destroyed with {} live regions", live);
                }
            }
            Kind::Region { parent, .. } => {
                if let Some(parent) = parent.upgrade() {
                    if let Kind::Root { regions } = &parent.kind {
                        regions.fetch_sub(1, Ordering::AcqRel);
                    }
                } else {
                    debug!("region parent already released");
                }
            }
        }

        let inner = self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(ctx) = inner.context.take() {
            if let Err(e) = ctx.destroy(&mut inner.desc) {
                warn!("failed to unregister buffer: {}", e);
            }
        }
        if inner.storage.take().is_some() {
            debug!("buffer memory freed");
        }
    }
}

/// Borrowed CPU view of a [`Buffer`].
#[derive(Debug)]
pub struct MappedMemory<'a> {
    ptr: NonNull<u8>,
    len: usize,
    _buffer: PhantomData<&'a Buffer>,
}

impl MappedMemory<'_> {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the buffer resolved `len` bytes at `ptr` and is borrowed for
        // the lifetime of this view.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and this view is borrowed mutably.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}
