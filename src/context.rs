// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::{Error, Result},
    memory::{MemoryDesc, MemoryFlags, PageAlloc},
};
use nix::errno::Errno;
use psys_sys::{
    ipu_psys_buffer, ipu_psys_buffer_base, ipu_psys_capability, ipu_psys_command,
    ipu_psys_event, ipu_psys_manifest, IPU_BUFFER_FLAG_DMA_HANDLE, IPU_BUFFER_FLAG_NO_FLUSH,
    IPU_BUFFER_FLAG_USERPTR,
};
use std::{
    ffi::CStr,
    fmt,
    fs::OpenOptions,
    os::{
        fd::{AsRawFd, OwnedFd, RawFd},
        unix::fs::OpenOptionsExt,
    },
    path::Path,
};
use tracing::{debug, warn};

/// One request to the psys driver.
///
/// Payloads are borrowed for the duration of the call; user pointers embedded
/// in the packed kernel structures are filled in by the transport.
pub enum Request<'a> {
    QueryCapability(&'a mut ipu_psys_capability),
    /// Two-phase manifest read: without `buffer` only `size` is reported.
    GetManifest {
        index: u32,
        size: &'a mut u32,
        buffer: Option<&'a mut [u8]>,
    },
    GetBuffer(&'a mut ipu_psys_buffer),
    PutBuffer(&'a mut ipu_psys_buffer),
    MapBuffer(RawFd),
    UnmapBuffer(RawFd),
    QueueCommand {
        command: &'a mut ipu_psys_command,
        buffers: &'a mut [ipu_psys_buffer],
    },
    DequeueEvent(&'a mut ipu_psys_event),
    CancelCommand(&'a mut ipu_psys_command),
}

impl Request<'_> {
    pub fn name(&self) -> &'static str {
        match self {
            Request::QueryCapability(_) => "QUERYCAP",
            Request::GetManifest { .. } => "GET_MANIFEST",
            Request::GetBuffer(_) => "GETBUF",
            Request::PutBuffer(_) => "PUTBUF",
            Request::MapBuffer(_) => "MAPBUF",
            Request::UnmapBuffer(_) => "UNMAPBUF",
            Request::QueueCommand { .. } => "QCMD",
            Request::DequeueEvent(_) => "DQEVENT",
            Request::CancelCommand(_) => "CMD_CANCEL",
        }
    }
}

/// Transport to the psys driver.
///
/// [`PsysDevice`] talks to the kernel; tests substitute an in-process driver.
pub trait Driver: Send + Sync {
    fn ioctl(&self, request: Request<'_>) -> nix::Result<()>;

    /// Single-descriptor poll, returning the raw syscall result.
    fn poll(&self, events: i16, timeout_ms: i32) -> nix::Result<i32>;

    /// Closes a handle the driver handed out through `GetBuffer`.
    fn close_handle(&self, fd: RawFd) -> nix::Result<()>;
}

/// The psys character device.
#[derive(Debug)]
pub struct PsysDevice {
    fd: OwnedFd,
}

impl PsysDevice {
    /// Opens the device node read/write and non-blocking.
    pub fn open<P: AsRef<Path>>(path: P) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(PsysDevice { fd: file.into() })
    }
}

impl Driver for PsysDevice {
    fn ioctl(&self, request: Request<'_>) -> nix::Result<()> {
        let fd = self.fd.as_raw_fd();
        // SAFETY: `fd` is the open psys device and every payload pointer is
        // derived from a borrow that outlives the call.
        let ret = unsafe {
            match request {
                Request::QueryCapability(cap) => psys_sys::ipu_psys_querycap(fd, cap),
                Request::GetManifest {
                    index,
                    size,
                    buffer,
                } => {
                    let mut manifest = ipu_psys_manifest {
                        index,
                        ..Default::default()
                    };
                    if let Some(buffer) = buffer {
                        manifest.size = buffer.len() as u32;
                        manifest.manifest = buffer.as_mut_ptr() as u64;
                    }
                    let ret = psys_sys::ipu_psys_get_manifest(fd, &mut manifest)?;
                    *size = manifest.size;
                    Ok(ret)
                }
                Request::GetBuffer(buf) => psys_sys::ipu_psys_getbuf(fd, buf),
                Request::PutBuffer(buf) => psys_sys::ipu_psys_putbuf(fd, buf),
                Request::MapBuffer(handle) => psys_sys::ipu_psys_mapbuf(fd, handle),
                Request::UnmapBuffer(handle) => psys_sys::ipu_psys_unmapbuf(fd, handle),
                Request::QueueCommand { command, buffers } => {
                    command.buffers = buffers.as_mut_ptr() as u64;
                    psys_sys::ipu_psys_qcmd(fd, command)
                }
                Request::DequeueEvent(event) => psys_sys::ipu_psys_dqevent(fd, event),
                Request::CancelCommand(command) => psys_sys::ipu_psys_cmd_cancel(fd, command),
            }
        };
        ret.map(drop)
    }

    fn poll(&self, events: i16, timeout_ms: i32) -> nix::Result<i32> {
        let mut fds = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events,
            revents: 0,
        };
        // SAFETY: one valid pollfd entry.
        let ret = unsafe { libc::poll(&mut fds, 1, timeout_ms) };
        Errno::result(ret)
    }

    fn close_handle(&self, fd: RawFd) -> nix::Result<()> {
        // SAFETY: the handle was returned by GETBUF and is owned by the
        // registration being torn down.
        Errno::result(unsafe { libc::close(fd) }).map(drop)
    }
}

/// Device capability as reported by `QUERYCAP`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capability {
    pub version: u32,
    pub driver: String,
    pub dev_model: String,
    pub pg_count: u32,
}

/// Parameter-codec platform derived from the device model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Ipu6,
}

impl Capability {
    /// IPU6 devices are the only ones this layer drives; they always use the
    /// persistent process group protocol.
    pub fn platform(&self) -> Result<Platform> {
        if self.dev_model.starts_with("ipu6") {
            Ok(Platform::Ipu6)
        } else {
            Err(Error::Unsupported(format!(
                "psys device model {}",
                self.dev_model
            )))
        }
    }
}

fn c_string(bytes: &[u8]) -> String {
    match CStr::from_bytes_until_nul(bytes) {
        Ok(s) => s.to_string_lossy().into_owned(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// Owner of one open psys device.
///
/// Opening never fails hard: a context whose device could not be opened
/// reports `is_initialized() == false` and callers are expected to check
/// before issuing requests.
pub struct Context {
    driver: Option<Box<dyn Driver>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

impl Context {
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        match PsysDevice::open(path) {
            Ok(device) => Context {
                driver: Some(Box::new(device)),
            },
            Err(e) => {
                warn!("failed to open {}: {}", path.display(), e);
                Context { driver: None }
            }
        }
    }

    pub fn with_driver(driver: Box<dyn Driver>) -> Self {
        Context {
            driver: Some(driver),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.driver.is_some()
    }

    /// Issues one request, mapping the driver's errno onto [`Error`].
    pub fn do_ioctl(&self, request: Request<'_>) -> Result<()> {
        let driver = self
            .driver
            .as_ref()
            .ok_or_else(|| Error::Device("psys device is not open".to_owned()))?;
        let name = request.name();
        driver.ioctl(request).map_err(|errno| {
            // some are not real errors, leave the verdict to the caller
            debug!("ioctl {} returned {}", name, errno);
            Error::from_errno(errno, name)
        })
    }

    pub fn capabilities(&self) -> Result<Capability> {
        let mut cap = ipu_psys_capability::default();
        self.do_ioctl(Request::QueryCapability(&mut cap))?;
        let (driver, dev_model) = (cap.driver, cap.dev_model);
        Ok(Capability {
            version: cap.version,
            driver: c_string(&driver),
            dev_model: c_string(&dev_model),
            pg_count: cap.pg_count,
        })
    }

    /// Reads manifest `index`. Without `buffer` only the required size is
    /// returned; with one, the manifest is copied into it.
    pub fn manifest(&self, index: u32, buffer: Option<&mut [u8]>) -> Result<u32> {
        let mut size = 0;
        self.do_ioctl(Request::GetManifest {
            index,
            size: &mut size,
            buffer,
        })?;
        Ok(size)
    }

    /// Allocates page-aligned CPU memory for `desc`.
    pub fn allocate(&self, desc: &mut MemoryDesc) -> Result<PageAlloc> {
        if desc.cpu_ptr.is_some() {
            return Err(Error::InvalidArg("cpu pointer already set".to_owned()));
        }

        let zeroed = !desc.flags.contains(MemoryFlags::UNINITIALIZED);
        let alloc = PageAlloc::new(desc.size as usize, zeroed)?;
        desc.cpu_ptr = Some(alloc.as_ptr());
        desc.flags.remove(MemoryFlags::ALLOCATE_CPU_PTR);
        desc.flags.insert(MemoryFlags::CPU_PTR | MemoryFlags::ALLOCATED);
        Ok(alloc)
    }

    /// Allocates pending memory, then registers it with the device unless
    /// the memory is protocol-only.
    pub fn migrate(&self, desc: &mut MemoryDesc, storage: &mut Option<PageAlloc>) -> Result<()> {
        if desc.flags.contains(MemoryFlags::ALLOCATE_CPU_PTR) {
            *storage = Some(self.allocate(desc)?);
        }

        if desc.flags.contains(MemoryFlags::PSYS_API) {
            return Ok(());
        }

        self.register_buffer(desc)
    }

    /// Host view of device-backed memory.
    pub fn get_memory(&self, desc: &MemoryDesc) -> Result<MemoryDesc> {
        if desc.flags.contains(MemoryFlags::HARDWARE_ONLY) {
            return Err(Error::Device(
                "host cannot access hardware only memory".to_owned(),
            ));
        }
        if desc.flags.contains(MemoryFlags::MEMORY_HANDLE)
            && !desc.flags.contains(MemoryFlags::CPU_PTR)
        {
            return Err(Error::Device(
                "host mapping of a bare handle is not supported".to_owned(),
            ));
        }
        Ok(*desc)
    }

    pub fn destroy(&self, desc: &mut MemoryDesc) -> Result<()> {
        self.unregister_buffer(desc)
    }

    /// Turns a CPU pointer or DMA handle into a kernel buffer usable in
    /// commands.
    pub fn register_buffer(&self, desc: &mut MemoryDesc) -> Result<()> {
        if desc.flags.contains(MemoryFlags::MIGRATED) {
            return Err(Error::InvalidArg(
                "buffer already migrated with device".to_owned(),
            ));
        }

        let mut buf = ipu_psys_buffer {
            len: u64::from(desc.size),
            ..Default::default()
        };

        let mut from_getbuf = false;
        if let (true, Some(ptr)) = (desc.flags.contains(MemoryFlags::CPU_PTR), desc.cpu_ptr) {
            buf.base = ipu_psys_buffer_base {
                userptr: ptr.as_ptr() as u64,
            };
            buf.flags |= IPU_BUFFER_FLAG_USERPTR;
            self.do_ioctl(Request::GetBuffer(&mut buf))?;

            let flags = buf.flags;
            if flags & IPU_BUFFER_FLAG_DMA_HANDLE == 0 {
                return Err(Error::Internal(
                    "GETBUF succeeded but returned no dma handle".to_owned(),
                ));
            }
            if flags & IPU_BUFFER_FLAG_USERPTR != 0 {
                return Err(Error::Internal(
                    "GETBUF succeeded but did not consume the userptr".to_owned(),
                ));
            }
            from_getbuf = true;
        } else if let (true, Some(fd)) = (desc.flags.contains(MemoryFlags::MEMORY_HANDLE), desc.handle)
        {
            buf.base = ipu_psys_buffer_base { fd };
            buf.flags |= IPU_BUFFER_FLAG_DMA_HANDLE;
        }

        if desc.flags.contains(MemoryFlags::NO_FLUSH) {
            buf.flags |= IPU_BUFFER_FLAG_NO_FLUSH;
        }

        if let Err(e) = self.do_ioctl(Request::MapBuffer(buf.fd())) {
            if from_getbuf {
                self.close_handle(buf.fd());
            }
            return Err(e);
        }

        debug!(
            "registered buffer {:?} -> fd {} len {}",
            desc.cpu_ptr,
            buf.fd(),
            desc.size
        );
        desc.registration = Some(buf);
        desc.flags.insert(MemoryFlags::MIGRATED);
        Ok(())
    }

    pub fn unregister_buffer(&self, desc: &mut MemoryDesc) -> Result<()> {
        let Some(buf) = desc.registration else {
            return Ok(());
        };
        if buf.flags & IPU_BUFFER_FLAG_DMA_HANDLE == 0 {
            return Err(Error::Device(
                "registered buffer has no dma handle".to_owned(),
            ));
        }

        let fd = buf.fd();
        if let Err(e) = self.do_ioctl(Request::UnmapBuffer(fd)) {
            debug!("cannot unmap buffer fd {}, possibly already unmapped: {}", fd, e);
        }

        desc.registration = None;
        desc.flags.remove(MemoryFlags::MIGRATED);

        if desc.flags.contains(MemoryFlags::CPU_PTR) {
            let mut put = buf;
            if let Err(e) = self.do_ioctl(Request::PutBuffer(&mut put)) {
                debug!("cannot put buffer fd {}: {}", fd, e);
            }
            let driver = self
                .driver
                .as_ref()
                .ok_or_else(|| Error::Device("psys device is not open".to_owned()))?;
            driver
                .close_handle(fd)
                .map_err(|errno| Error::from_errno(errno, "close"))?;
        }
        Ok(())
    }

    fn close_handle(&self, fd: RawFd) {
        if let Some(driver) = &self.driver {
            if let Err(e) = driver.close_handle(fd) {
                warn!("failed to close fd {}: {}", fd, e);
            }
        }
    }

    /// Returns a poller bound to this context's device.
    pub fn poller(&self, events: i16, timeout_ms: i32) -> Poller<'_> {
        Poller {
            context: self,
            events,
            timeout_ms,
        }
    }
}

/// One-shot poll of the device for a fixed event mask and timeout.
#[derive(Debug, Clone, Copy)]
pub struct Poller<'a> {
    context: &'a Context,
    events: i16,
    timeout_ms: i32,
}

impl Poller<'_> {
    /// Returns the number of ready descriptors, zero on timeout.
    pub fn poll(&self) -> Result<i32> {
        let driver = self
            .context
            .driver
            .as_ref()
            .ok_or_else(|| Error::Device("psys device is not open".to_owned()))?;
        driver
            .poll(self.events, self.timeout_ms)
            .map_err(|errno| Error::Device(format!("poll: {}", errno.desc())))
    }
}
