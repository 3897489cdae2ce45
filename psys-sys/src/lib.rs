// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Raw kernel ABI for the IPU processing-system (`ipu-psys`) character device.
//!
//! Every structure in this crate mirrors the driver's uapi header byte for
//! byte: all of them are `#[repr(C, packed)]` and their sizes are checked at
//! compile time. Fields that are user pointers in the C header are carried as
//! `u64`, which matches the 64-bit ABI the IPU platforms run and keeps the
//! structures `Send`.
//!
//! The ioctl entry points are generated with the `nix` ioctl macros and are
//! `unsafe`: the caller must pass a valid open device descriptor and payloads
//! whose embedded pointers stay valid for the duration of the call.

#![allow(non_camel_case_types)]

use core::fmt;
use std::mem::size_of;

/// Default device node exposed by the IPU6 psys driver.
pub const IPU_PSYS_DEVICE: &str = "/dev/ipu-psys0";

pub const IPU_IOC_MAGIC: u8 = b'A';

pub const IPU_PSYS_EVENT_TYPE_CMD_COMPLETE: u32 = 1;
pub const IPU_PSYS_EVENT_TYPE_BUFFER_COMPLETE: u32 = 2;

pub const IPU_BUFFER_FLAG_INPUT: u32 = 1 << 0;
pub const IPU_BUFFER_FLAG_OUTPUT: u32 = 1 << 1;
pub const IPU_BUFFER_FLAG_MAPPED: u32 = 1 << 2;
pub const IPU_BUFFER_FLAG_NO_FLUSH: u32 = 1 << 3;
pub const IPU_BUFFER_FLAG_DMA_HANDLE: u32 = 1 << 4;
pub const IPU_BUFFER_FLAG_USERPTR: u32 = 1 << 5;

pub const IPU_PSYS_CMD_PRIORITY_HIGH: u32 = 0;
pub const IPU_PSYS_CMD_PRIORITY_MED: u32 = 1;
pub const IPU_PSYS_CMD_PRIORITY_LOW: u32 = 2;

/// Command extension protocol without a dynamic kernel bitmap.
pub const PSYS_COMMAND_EXT_PPG_0: u32 = 0;
/// Command extension protocol carrying a dynamic kernel bitmap.
pub const PSYS_COMMAND_EXT_PPG_1: u32 = 1;

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ipu_psys_capability {
    pub version: u32,
    pub driver: [u8; 20],
    pub pg_count: u32,
    pub dev_model: [u8; 32],
    pub reserved: [u32; 17],
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ipu_psys_event {
    pub type_: u32,
    pub user_token: u64,
    pub issue_id: u64,
    pub buffer_idx: u32,
    pub error: u32,
    pub reserved: [i32; 2],
}

/// The `base` member of [`ipu_psys_buffer`]: a DMA handle or a user address,
/// selected by `IPU_BUFFER_FLAG_DMA_HANDLE` / `IPU_BUFFER_FLAG_USERPTR`.
#[repr(C)]
#[derive(Clone, Copy)]
pub union ipu_psys_buffer_base {
    pub fd: libc::c_int,
    pub userptr: u64,
    pub reserved: u64,
}

impl Default for ipu_psys_buffer_base {
    fn default() -> Self {
        Self { reserved: 0 }
    }
}

#[repr(C, packed)]
#[derive(Default, Clone, Copy)]
pub struct ipu_psys_buffer {
    pub len: u64,
    pub base: ipu_psys_buffer_base,
    pub data_offset: u32,
    pub bytes_used: u32,
    pub flags: u32,
    pub reserved: [u32; 2],
}

impl ipu_psys_buffer {
    /// The DMA handle, meaningful once `IPU_BUFFER_FLAG_DMA_HANDLE` is set.
    pub fn fd(&self) -> libc::c_int {
        // SAFETY: every union member is a plain integer; the low 32 bits hold
        // the descriptor on little-endian targets.
        unsafe { self.base.fd }
    }

    pub fn userptr(&self) -> u64 {
        // SAFETY: plain integer member.
        unsafe { self.base.userptr }
    }
}

impl fmt::Debug for ipu_psys_buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let len = self.len;
        let data_offset = self.data_offset;
        let bytes_used = self.bytes_used;
        let flags = self.flags;
        // SAFETY: plain integer member.
        let base = unsafe { self.base.reserved };
        f.debug_struct("ipu_psys_buffer")
            .field("len", &len)
            .field("base", &format_args!("{:#x}", base))
            .field("data_offset", &data_offset)
            .field("bytes_used", &bytes_used)
            .field("flags", &format_args!("{:#x}", flags))
            .finish()
    }
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ipu_psys_command {
    pub issue_id: u64,
    pub user_token: u64,
    pub priority: u32,
    pub pg_manifest: u64,
    pub buffers: u64,
    pub pg: libc::c_int,
    pub pg_manifest_size: u32,
    pub bufcount: u32,
    pub min_psys_freq: u32,
    pub frame_counter: u32,
    pub kernel_enable_bitmap: [u32; 4],
    pub terminal_enable_bitmap: [u32; 4],
    pub routing_enable_bitmap: [u32; 4],
    pub rbm: [u32; 5],
    pub reserved: [u32; 2],
}

#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct ipu_psys_manifest {
    pub index: u32,
    pub size: u32,
    pub manifest: u64,
    pub reserved: [u32; 5],
}

/// Header of the per-command extension record shared with the firmware.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct psys_command_ext_header {
    /// Size of the whole extension record in bytes.
    pub size: u32,
    /// Offset of the payload, always the size of this header.
    pub offset: u32,
    pub version: u32,
    pub reserved: u32,
}

/// Persistent process-group command extension.
#[repr(C, packed)]
#[derive(Debug, Default, Clone, Copy)]
pub struct psys_pg_command {
    pub header: psys_command_ext_header,
    pub frame_counter: u64,
    pub queue_id: u32,
    pub reserved: u32,
    pub dynamic_kernel_bitmap: [u32; 4],
}

const _: () = assert!(size_of::<ipu_psys_capability>() == 128);
const _: () = assert!(size_of::<ipu_psys_event>() == 36);
const _: () = assert!(size_of::<ipu_psys_buffer>() == 36);
const _: () = assert!(size_of::<ipu_psys_command>() == 132);
const _: () = assert!(size_of::<ipu_psys_manifest>() == 36);
const _: () = assert!(size_of::<psys_command_ext_header>() == 16);
const _: () = assert!(size_of::<psys_pg_command>() == 48);

nix::ioctl_read!(
    /// `IPU_IOC_QUERYCAP`
    ipu_psys_querycap,
    IPU_IOC_MAGIC,
    1,
    ipu_psys_capability
);

nix::ioctl_write_int_bad!(
    /// `IPU_IOC_MAPBUF`: the DMA handle is passed by value.
    ipu_psys_mapbuf,
    nix::request_code_readwrite!(IPU_IOC_MAGIC, 2, size_of::<libc::c_int>())
);

nix::ioctl_write_int_bad!(
    /// `IPU_IOC_UNMAPBUF`: the DMA handle is passed by value.
    ipu_psys_unmapbuf,
    nix::request_code_readwrite!(IPU_IOC_MAGIC, 3, size_of::<libc::c_int>())
);

nix::ioctl_readwrite!(
    /// `IPU_IOC_GETBUF`: turns a user pointer into a DMA handle.
    ipu_psys_getbuf,
    IPU_IOC_MAGIC,
    4,
    ipu_psys_buffer
);

nix::ioctl_readwrite!(
    /// `IPU_IOC_PUTBUF`
    ipu_psys_putbuf,
    IPU_IOC_MAGIC,
    5,
    ipu_psys_buffer
);

nix::ioctl_readwrite!(
    /// `IPU_IOC_QCMD`
    ipu_psys_qcmd,
    IPU_IOC_MAGIC,
    6,
    ipu_psys_command
);

nix::ioctl_readwrite!(
    /// `IPU_IOC_DQEVENT`
    ipu_psys_dqevent,
    IPU_IOC_MAGIC,
    7,
    ipu_psys_event
);

nix::ioctl_readwrite!(
    /// `IPU_IOC_CMD_CANCEL`
    ipu_psys_cmd_cancel,
    IPU_IOC_MAGIC,
    8,
    ipu_psys_command
);

nix::ioctl_readwrite!(
    /// `IPU_IOC_GET_MANIFEST`: two-phase, a zero `manifest` pointer only
    /// reports the required size.
    ipu_psys_get_manifest,
    IPU_IOC_MAGIC,
    9,
    ipu_psys_manifest
);
