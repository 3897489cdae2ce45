// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    bitmap::KernelBitmap,
    buffer::Buffer,
    context::{Context, Request},
    error::{Error, Result},
    memory::MemoryFlags,
    wire,
};
use psys_sys::{
    ipu_psys_buffer, ipu_psys_command, psys_command_ext_header, psys_pg_command,
    IPU_BUFFER_FLAG_DMA_HANDLE, PSYS_COMMAND_EXT_PPG_0, PSYS_COMMAND_EXT_PPG_1,
};
use std::{
    mem::size_of,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{trace, warn};

/// Size of the command extension record.
pub const COMMAND_EXT_SIZE: usize = size_of::<psys_pg_command>();
const COMMAND_EXT_HEADER_SIZE: usize = size_of::<psys_command_ext_header>();

static NEXT_ISSUE_ID: AtomicU64 = AtomicU64::new(1);

/// Per-command metadata shared with the firmware through the extension
/// buffer.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CommandExt {
    pub version: u32,
    pub frame_counter: u64,
    pub queue_id: u32,
    pub dynamic_kernel_bitmap: KernelBitmap,
}

impl CommandExt {
    /// Extension carrying a dynamic kernel bitmap.
    pub fn ppg(dynamic_kernel_bitmap: KernelBitmap) -> Self {
        CommandExt {
            version: PSYS_COMMAND_EXT_PPG_1,
            dynamic_kernel_bitmap,
            ..Default::default()
        }
    }

    pub fn write_to(&self, out: &mut [u8]) -> Result<()> {
        wire::write_u32(out, 0, COMMAND_EXT_SIZE as u32)?;
        wire::write_u32(out, 4, COMMAND_EXT_HEADER_SIZE as u32)?;
        wire::write_u32(out, 8, self.version)?;
        wire::write_u32(out, 12, 0)?;
        wire::write_u64(out, 16, self.frame_counter)?;
        wire::write_u32(out, 24, self.queue_id)?;
        wire::write_u32(out, 28, 0)?;
        for (i, word) in self.dynamic_kernel_bitmap.to_words().iter().enumerate() {
            wire::write_u32(out, 32 + i * 4, *word)?;
        }
        Ok(())
    }

    /// Decodes an extension record, checking its header against the size of
    /// the memory it was read from.
    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let size = wire::read_u32(bytes, 0)? as usize;
        let offset = wire::read_u32(bytes, 4)? as usize;
        let version = wire::read_u32(bytes, 8)?;

        if size != bytes.len() || size != COMMAND_EXT_SIZE {
            return Err(Error::InvalidArg(format!(
                "command extension claims {} bytes, memory holds {}",
                size,
                bytes.len()
            )));
        }
        if offset != COMMAND_EXT_HEADER_SIZE {
            return Err(Error::InvalidArg(format!(
                "command extension payload at {}",
                offset
            )));
        }
        if version != PSYS_COMMAND_EXT_PPG_0 && version != PSYS_COMMAND_EXT_PPG_1 {
            return Err(Error::InvalidArg(format!(
                "command extension version {}",
                version
            )));
        }

        let mut words = [0u32; 4];
        for (i, word) in words.iter_mut().enumerate() {
            *word = wire::read_u32(bytes, 32 + i * 4)?;
        }
        Ok(CommandExt {
            version,
            frame_counter: wire::read_u64(bytes, 16)?,
            queue_id: wire::read_u32(bytes, 24)?,
            dynamic_kernel_bitmap: KernelBitmap::from_words(words),
        })
    }
}

/// High level description of a command.
#[derive(Debug, Clone, Default)]
pub struct CommandConfig {
    /// Program group id.
    pub id: u32,
    pub priority: u32,
    /// Minimum processing frequency hint.
    pub psys_frequency: u32,
    pub user_token: u64,
    /// Process group the command runs.
    pub pg: Option<Arc<Buffer>>,
    /// Program group manifest blob, handed to the device by pointer.
    pub pg_manifest_buf: Option<Arc<Buffer>>,
    /// Extension record, see [`CommandExt`].
    pub ext_buf: Option<Arc<Buffer>>,
    /// Deprecated location of the command metadata, used when `ext_buf` is
    /// not set.
    pub pg_params_buf: Option<Arc<Buffer>>,
    /// Terminal buffers in process group terminal order.
    pub buffers: Vec<Option<Arc<Buffer>>>,
}

/// A hardware work descriptor.
#[derive(Debug)]
pub struct Command {
    config: CommandConfig,
    buffer_count: usize,
    cmd: ipu_psys_command,
    sys_buffers: Vec<ipu_psys_buffer>,
}

impl Command {
    /// Creates a command with room for `buffer_count` terminal buffers.
    pub fn new(buffer_count: usize) -> Self {
        let issue_id = NEXT_ISSUE_ID.fetch_add(1, Ordering::Relaxed);
        let cmd = ipu_psys_command {
            issue_id,
            bufcount: buffer_count as u32,
            ..Default::default()
        };
        Command {
            config: CommandConfig {
                buffers: vec![None; buffer_count],
                ..Default::default()
            },
            buffer_count,
            cmd,
            sys_buffers: vec![ipu_psys_buffer::default(); buffer_count],
        }
    }

    pub fn issue_id(&self) -> u64 {
        self.cmd.issue_id
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    /// Kernel-facing representation built by the last [`set_config`].
    ///
    /// [`set_config`]: Command::set_config
    pub fn sys_command(&self) -> ipu_psys_command {
        self.cmd
    }

    pub fn sys_buffers(&self) -> &[ipu_psys_buffer] {
        &self.sys_buffers[..self.cmd.bufcount as usize]
    }

    /// Rebuilds the kernel command from `config`.
    pub fn set_config(&mut self, config: CommandConfig) -> Result<()> {
        if config.buffers.len() > self.buffer_count {
            return Err(Error::InvalidArg(format!(
                "{} buffers for a command created with {}",
                config.buffers.len(),
                self.buffer_count
            )));
        }
        if config.buffers.is_empty() && self.buffer_count > 0 {
            return Err(Error::InvalidArg(
                "buffers cannot be removed from a command created with buffers".to_owned(),
            ));
        }

        self.update_manifest(&config)?;
        self.update_metadata(&config)?;
        self.update_pg(&config)?;
        self.grok_buffers(&config)?;

        self.cmd.user_token = config.user_token;
        self.cmd.priority = config.priority;
        self.cmd.min_psys_freq = config.psys_frequency;
        self.config = config;
        Ok(())
    }

    fn update_manifest(&mut self, config: &CommandConfig) -> Result<()> {
        let Some(manifest) = &config.pg_manifest_buf else {
            self.cmd.pg_manifest = 0;
            self.cmd.pg_manifest_size = 0;
            return Ok(());
        };
        let mem = manifest.memory()?;
        let ptr = mem
            .cpu_ptr
            .ok_or_else(|| Error::InvalidArg("manifest has no cpu memory".to_owned()))?;
        self.cmd.pg_manifest = ptr.as_ptr() as u64;
        self.cmd.pg_manifest_size = mem.size;
        Ok(())
    }

    /// Applies the extension record. Metadata that is not a psys API record
    /// is legacy process group parameters and stays host side.
    fn update_metadata(&mut self, config: &CommandConfig) -> Result<()> {
        let metadata = match (&config.ext_buf, &config.pg_params_buf) {
            (Some(ext), _) => ext,
            (None, Some(params)) => {
                warn!("command metadata in the params buffer is deprecated, use ext_buf");
                params
            }
            (None, None) => return Ok(()),
        };

        let mem = metadata.memory()?;
        if !mem.flags.contains(MemoryFlags::PSYS_API) {
            trace!("{} bytes of legacy process group parameters", mem.size);
            return Ok(());
        }
        let ext = CommandExt::read_from(&metadata.map()?.as_slice()[..mem.size as usize])?;
        if ext.version == PSYS_COMMAND_EXT_PPG_1 {
            self.cmd.kernel_enable_bitmap = ext.dynamic_kernel_bitmap.to_words();
        }
        self.cmd.frame_counter = ext.frame_counter as u32;
        Ok(())
    }

    fn update_pg(&mut self, config: &CommandConfig) -> Result<()> {
        let pg = config
            .pg
            .as_ref()
            .ok_or_else(|| Error::InvalidArg("command without process group".to_owned()))?;
        let sys = pg
            .sys_buffer()
            .ok_or_else(|| Error::InvalidArg("process group is not migrated".to_owned()))?;
        let flags = sys.flags;
        if flags & IPU_BUFFER_FLAG_DMA_HANDLE == 0 {
            return Err(Error::Device(
                "process group memory has no dma handle".to_owned(),
            ));
        }
        self.cmd.pg = sys.fd();
        Ok(())
    }

    /// Copies the kernel registration of every terminal buffer into the
    /// command. Regions are queued as their root, annotated with the region
    /// offset and size.
    fn grok_buffers(&mut self, config: &CommandConfig) -> Result<()> {
        for (slot, sys) in self.sys_buffers.iter_mut().enumerate() {
            let Some(Some(buffer)) = config.buffers.get(slot) else {
                *sys = ipu_psys_buffer::default();
                continue;
            };

            let root = if buffer.is_region() {
                buffer.parent().ok_or_else(|| {
                    Error::InvalidArg(format!("buffer {} has no parent", slot))
                })?
            } else {
                buffer.clone()
            };
            if !root.is_migrated() {
                return Err(Error::InvalidArg(format!(
                    "buffer {} is not migrated",
                    slot
                )));
            }
            let mut reg = root.sys_buffer().ok_or_else(|| {
                Error::InvalidArg(format!("buffer {} has no registration", slot))
            })?;
            reg.data_offset = buffer.offset();
            reg.bytes_used = buffer.size();
            *sys = reg;
        }
        self.cmd.bufcount = config.buffers.len() as u32;
        Ok(())
    }

    /// Queues the command on the device.
    pub fn enqueue(&mut self, context: &Context) -> Result<()> {
        let count = self.cmd.bufcount as usize;
        trace!(
            "enqueue command issue {} with {} buffers",
            self.issue_id(),
            count
        );
        context.do_ioctl(Request::QueueCommand {
            command: &mut self.cmd,
            buffers: &mut self.sys_buffers[..count],
        })
    }

    /// Asks the device to drop the command if it has not run yet.
    pub fn cancel(&mut self, context: &Context) -> Result<()> {
        context.do_ioctl(Request::CancelCommand(&mut self.cmd))
    }
}
