// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Concrete process group instantiated from a manifest.
//!
//! The process group lives in a device buffer and is rewritten before every
//! fragment. Layout (little-endian):
//!
//! | offset | field                          |
//! |--------|--------------------------------|
//! | 0      | `u32` total size               |
//! | 4      | `u32` program group id         |
//! | 8      | `u64` persistent queue token   |
//! | 16     | 128-bit kernel bitmap          |
//! | 32     | 5 x `u32` routing bitmap       |
//! | 52     | `u16` fragment count           |
//! | 54     | `u16` fragment state           |
//! | 56     | `u16` fragment limit           |
//! | 58     | `u8` terminal count            |
//! | 59     | `u8` program count             |
//! | 60     | `u8` queue count               |
//! | 61     | `u8` protocol version          |
//! | 62     | `u16` offset of the terminals  |
//!
//! Each terminal is a 24 byte entry followed, for data terminals, by one
//! 12 byte descriptor per fragment.

use crate::{
    bitmap::{KernelBitmap, RoutingBitmap, ROUTING_BITMAP_WORDS},
    error::{Error, Result},
    fragment::{FragmentDescriptor, FRAGMENT_DESCRIPTOR_SIZE},
    manifest::{ProgramGroupManifest, TerminalType, COL, ROW},
    wire,
};

pub const PROCESS_GROUP_HEADER_SIZE: usize = 64;
pub const TERMINAL_ENTRY_SIZE: usize = 24;

/// Offset of the persistent queue token.
pub const TOKEN_OFFSET: usize = 8;

pub const PROTOCOL_LEGACY: u8 = 0;
pub const PROTOCOL_PPG: u8 = 1;

/// Frame parameters of a data terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FrameParams {
    /// Firmware frame format encoding.
    pub frame_format: u8,
    pub bpp: u8,
    pub bpe: u8,
    pub width: u16,
    pub height: u16,
    pub stride: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Terminal {
    /// Index of the terminal in the manifest.
    pub manifest_index: u16,
    pub terminal_type: TerminalType,
    pub payload_size: u32,
    pub frame: Option<FrameParams>,
    pub fragments: Vec<FragmentDescriptor>,
}

impl Terminal {
    fn encoded_size(&self) -> usize {
        TERMINAL_ENTRY_SIZE + self.fragments.len() * FRAGMENT_DESCRIPTOR_SIZE
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessGroup {
    pub id: u32,
    pub token: u64,
    pub kernel_bitmap: KernelBitmap,
    pub routing_bitmap: RoutingBitmap,
    pub fragment_count: u16,
    pub fragment_state: u16,
    pub fragment_limit: u16,
    pub program_count: u8,
    pub num_queues: u8,
    pub protocol_version: u8,
    pub terminals: Vec<Terminal>,
}

impl ProcessGroup {
    /// Instantiates the terminals of `manifest` that take part with
    /// `kernel_bitmap` enabled. Terminals without kernels are always kept.
    pub fn new(
        manifest: &ProgramGroupManifest,
        kernel_bitmap: KernelBitmap,
        fragment_count: u16,
    ) -> Result<Self> {
        if fragment_count == 0 {
            return Err(Error::InvalidArg("process group without fragments".to_owned()));
        }

        let terminals = manifest
            .terminals
            .iter()
            .enumerate()
            .filter(|(_, t)| t.kernel_bitmap.is_empty() || t.kernel_bitmap.intersects(kernel_bitmap))
            .map(|(index, t)| Terminal {
                manifest_index: index as u16,
                terminal_type: t.terminal_type,
                payload_size: 0,
                frame: t.data.map(|_| FrameParams::default()),
                fragments: if t.terminal_type.is_data() {
                    vec![FragmentDescriptor::default(); fragment_count as usize]
                } else {
                    Vec::new()
                },
            })
            .collect::<Vec<_>>();

        if terminals.len() > u8::MAX as usize {
            return Err(Error::InvalidArg(format!(
                "{} terminals in process group {}",
                terminals.len(),
                manifest.id
            )));
        }

        Ok(ProcessGroup {
            id: manifest.id,
            token: 0,
            kernel_bitmap,
            routing_bitmap: RoutingBitmap::default(),
            fragment_count,
            fragment_state: 0,
            fragment_limit: fragment_count,
            program_count: manifest.program_count,
            num_queues: 0,
            protocol_version: PROTOCOL_LEGACY,
            terminals,
        })
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    /// Position of manifest terminal `manifest_index` inside the group.
    pub fn position(&self, manifest_index: usize) -> Option<usize> {
        self.terminals
            .iter()
            .position(|t| t.manifest_index as usize == manifest_index)
    }

    /// Maps every manifest terminal index to its position in the group;
    /// terminals left out of the group map to `None`.
    pub fn terminal_map(&self, manifest_terminals: usize) -> Vec<Option<usize>> {
        (0..manifest_terminals).map(|i| self.position(i)).collect()
    }

    pub fn terminal_mut(&mut self, manifest_index: usize) -> Option<&mut Terminal> {
        self.terminals
            .iter_mut()
            .find(|t| t.manifest_index as usize == manifest_index)
    }

    /// Bytes needed to hold the encoded group.
    pub fn size(&self) -> usize {
        PROCESS_GROUP_HEADER_SIZE + self.terminals.iter().map(|t| t.encoded_size()).sum::<usize>()
    }

    pub fn write_to(&self, out: &mut [u8]) -> Result<()> {
        let size = self.size();
        if out.len() < size {
            return Err(Error::InvalidArg(format!(
                "process group needs {} bytes, buffer holds {}",
                size,
                out.len()
            )));
        }

        wire::write_u32(out, 0, size as u32)?;
        wire::write_u32(out, 4, self.id)?;
        wire::write_u64(out, TOKEN_OFFSET, self.token)?;
        wire::write_u128(out, 16, self.kernel_bitmap.bits())?;
        for (i, word) in self.routing_bitmap.words().iter().enumerate() {
            wire::write_u32(out, 32 + i * 4, *word)?;
        }
        wire::write_u16(out, 52, self.fragment_count)?;
        wire::write_u16(out, 54, self.fragment_state)?;
        wire::write_u16(out, 56, self.fragment_limit)?;
        wire::write_u8(out, 58, self.terminals.len() as u8)?;
        wire::write_u8(out, 59, self.program_count)?;
        wire::write_u8(out, 60, self.num_queues)?;
        wire::write_u8(out, 61, self.protocol_version)?;
        wire::write_u16(out, 62, PROCESS_GROUP_HEADER_SIZE as u16)?;

        let mut offset = PROCESS_GROUP_HEADER_SIZE;
        for terminal in &self.terminals {
            let entry = terminal.encoded_size();
            wire::write_u16(out, offset, entry as u16)?;
            wire::write_u16(out, offset + 2, terminal.manifest_index)?;
            wire::write_u8(out, offset + 4, terminal.terminal_type as u8)?;
            wire::write_u8(out, offset + 5, 0)?;
            wire::write_u16(out, offset + 6, terminal.fragments.len() as u16)?;
            wire::write_u32(out, offset + 8, terminal.payload_size)?;
            let frame = terminal.frame.unwrap_or_default();
            wire::write_u8(out, offset + 12, frame.frame_format)?;
            wire::write_u8(out, offset + 13, frame.bpp)?;
            wire::write_u8(out, offset + 14, frame.bpe)?;
            wire::write_u8(out, offset + 15, 0)?;
            wire::write_u16(out, offset + 16, frame.width)?;
            wire::write_u16(out, offset + 18, frame.height)?;
            wire::write_u32(out, offset + 20, frame.stride)?;

            let mut at = offset + TERMINAL_ENTRY_SIZE;
            for desc in &terminal.fragments {
                for (i, value) in [
                    desc.dimension[COL],
                    desc.dimension[ROW],
                    desc.index[COL],
                    desc.index[ROW],
                    desc.offset[COL],
                    desc.offset[ROW],
                ]
                .into_iter()
                .enumerate()
                {
                    wire::write_u16(out, at + i * 2, value)?;
                }
                at += FRAGMENT_DESCRIPTOR_SIZE;
            }
            offset += entry;
        }
        Ok(())
    }

    pub fn read_from(bytes: &[u8]) -> Result<Self> {
        let size = wire::read_u32(bytes, 0)? as usize;
        if size > bytes.len() || size < PROCESS_GROUP_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "process group claims {} bytes, buffer holds {}",
                size,
                bytes.len()
            )));
        }

        let mut routing = [0u8; ROUTING_BITMAP_WORDS * 4];
        routing.copy_from_slice(&bytes[32..32 + ROUTING_BITMAP_WORDS * 4]);
        let terminal_count = wire::read_u8(bytes, 58)?;

        let mut terminals = Vec::with_capacity(terminal_count as usize);
        let mut offset = wire::read_u16(bytes, 62)? as usize;
        for _ in 0..terminal_count {
            let entry = wire::read_u16(bytes, offset)? as usize;
            let terminal_type = TerminalType::from_u8(wire::read_u8(bytes, offset + 4)?)?;
            let fragment_count = wire::read_u16(bytes, offset + 6)? as usize;
            if entry != TERMINAL_ENTRY_SIZE + fragment_count * FRAGMENT_DESCRIPTOR_SIZE {
                return Err(Error::Protocol(format!(
                    "terminal entry of {} bytes with {} fragments",
                    entry, fragment_count
                )));
            }

            let frame = if terminal_type.is_data() {
                Some(FrameParams {
                    frame_format: wire::read_u8(bytes, offset + 12)?,
                    bpp: wire::read_u8(bytes, offset + 13)?,
                    bpe: wire::read_u8(bytes, offset + 14)?,
                    width: wire::read_u16(bytes, offset + 16)?,
                    height: wire::read_u16(bytes, offset + 18)?,
                    stride: wire::read_u32(bytes, offset + 20)?,
                })
            } else {
                None
            };

            let mut fragments = Vec::with_capacity(fragment_count);
            let mut at = offset + TERMINAL_ENTRY_SIZE;
            for _ in 0..fragment_count {
                let field = |i: usize| wire::read_u16(bytes, at + i * 2);
                fragments.push(FragmentDescriptor {
                    dimension: [field(0)?, field(1)?],
                    index: [field(2)?, field(3)?],
                    offset: [field(4)?, field(5)?],
                });
                at += FRAGMENT_DESCRIPTOR_SIZE;
            }

            terminals.push(Terminal {
                manifest_index: wire::read_u16(bytes, offset + 2)?,
                terminal_type,
                payload_size: wire::read_u32(bytes, offset + 8)?,
                frame,
                fragments,
            });
            offset += entry;
        }

        Ok(ProcessGroup {
            id: wire::read_u32(bytes, 4)?,
            token: wire::read_u64(bytes, TOKEN_OFFSET)?,
            kernel_bitmap: KernelBitmap::from_bits(wire::read_u128(bytes, 16)?),
            routing_bitmap: RoutingBitmap::from_bytes(&routing),
            fragment_count: wire::read_u16(bytes, 52)?,
            fragment_state: wire::read_u16(bytes, 54)?,
            fragment_limit: wire::read_u16(bytes, 56)?,
            program_count: wire::read_u8(bytes, 59)?,
            num_queues: wire::read_u8(bytes, 60)?,
            protocol_version: wire::read_u8(bytes, 61)?,
            terminals,
        })
    }
}

/// Reads the persistent queue token from an encoded process group.
pub fn read_token(bytes: &[u8]) -> Result<u64> {
    wire::read_u64(bytes, TOKEN_OFFSET)
}

/// Stamps the persistent queue token into an encoded process group.
pub fn write_token(bytes: &mut [u8], token: u64) -> Result<()> {
    wire::write_u64(bytes, TOKEN_OFFSET, token)
}
