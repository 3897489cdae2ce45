// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    bitmap::KernelBitmap,
    error::{Error, Result},
    wire,
};

/// Size of the program-group manifest header.
pub const MANIFEST_HEADER_SIZE: usize = 40;
const TERMINAL_ENTRY_SIZE: usize = 24;
const DATA_TERMINAL_ENTRY_SIZE: usize = 48;

/// Column (width) index of a two-dimensional size.
pub const COL: usize = 0;
/// Row (height) index of a two-dimensional size.
pub const ROW: usize = 1;

/// Terminal type tag as encoded by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TerminalType {
    DataIn = 0,
    DataOut,
    ParamStream,
    ParamCachedIn,
    ParamCachedOut,
    ParamSpatialIn,
    ParamSpatialOut,
    ParamSlicedIn,
    ParamSlicedOut,
    StateIn,
    StateOut,
    Program,
    ProgramControlInit,
}

impl TerminalType {
    pub fn from_u8(value: u8) -> Result<Self> {
        use TerminalType::*;
        Ok(match value {
            0 => DataIn,
            1 => DataOut,
            2 => ParamStream,
            3 => ParamCachedIn,
            4 => ParamCachedOut,
            5 => ParamSpatialIn,
            6 => ParamSpatialOut,
            7 => ParamSlicedIn,
            8 => ParamSlicedOut,
            9 => StateIn,
            10 => StateOut,
            11 => Program,
            12 => ProgramControlInit,
            _ => return Err(Error::Protocol(format!("unknown terminal type {}", value))),
        })
    }

    /// Pixel-carrying terminal.
    pub fn is_data(self) -> bool {
        matches!(self, TerminalType::DataIn | TerminalType::DataOut)
    }

    pub fn is_cached(self) -> bool {
        matches!(self, TerminalType::ParamCachedIn | TerminalType::ParamCachedOut)
    }

    pub fn is_spatial(self) -> bool {
        matches!(
            self,
            TerminalType::ParamSpatialIn | TerminalType::ParamSpatialOut
        )
    }

    pub fn is_program(self) -> bool {
        matches!(self, TerminalType::Program)
    }
}

/// Geometry limits of a data terminal.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DataTerminalInfo {
    pub frame_format_bitmap: u64,
    pub min_size: [u16; 2],
    pub max_size: [u16; 2],
    pub min_fragment_size: [u16; 2],
    pub max_fragment_size: [u16; 2],
}

impl DataTerminalInfo {
    /// Widest fragment the terminal accepts; the frame limit when the
    /// fragment limit is not set.
    pub fn max_fragment_width(&self) -> u16 {
        match self.max_fragment_size[COL] {
            0 => self.max_size[COL],
            w => w,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalManifest {
    pub id: u16,
    pub terminal_type: TerminalType,
    pub kernel_bitmap: KernelBitmap,
    pub data: Option<DataTerminalInfo>,
}

impl TerminalManifest {
    fn entry_size(&self) -> usize {
        if self.data.is_some() {
            DATA_TERMINAL_ENTRY_SIZE
        } else {
            TERMINAL_ENTRY_SIZE
        }
    }
}

/// Decoded program-group manifest.
///
/// The raw blob is kept alongside the decoded fields; commands hand it to the
/// device unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramGroupManifest {
    pub id: u32,
    pub kernel_bitmap: KernelBitmap,
    pub alignment: u8,
    pub kernel_count: u8,
    pub program_count: u8,
    pub subgraph_count: u8,
    pub terminals: Vec<TerminalManifest>,
    raw: Vec<u8>,
}

impl ProgramGroupManifest {
    /// Decodes a manifest blob as returned by the device.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MANIFEST_HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "manifest of {} bytes is smaller than its header",
                bytes.len()
            )));
        }

        let kernel_bitmap = KernelBitmap::from_bits(wire::read_u128(bytes, 0)?);
        let id = wire::read_u32(bytes, 16)?;
        let terminal_offset = wire::read_u16(bytes, 22)? as usize;
        let size = wire::read_u16(bytes, 28)? as usize;
        let alignment = wire::read_u8(bytes, 30)?;
        let kernel_count = wire::read_u8(bytes, 31)?;
        let program_count = wire::read_u8(bytes, 32)?;
        let terminal_count = wire::read_u8(bytes, 33)?;
        let subgraph_count = wire::read_u8(bytes, 34)?;

        if size > bytes.len() {
            return Err(Error::Protocol(format!(
                "manifest claims {} bytes, blob holds {}",
                size,
                bytes.len()
            )));
        }

        let mut terminals = Vec::with_capacity(terminal_count as usize);
        let mut offset = terminal_offset;
        for _ in 0..terminal_count {
            let entry_size = wire::read_u16(bytes, offset)? as usize;
            let id = wire::read_u16(bytes, offset + 2)?;
            let terminal_type = TerminalType::from_u8(wire::read_u8(bytes, offset + 4)?)?;
            let kernel_bitmap = KernelBitmap::from_bits(wire::read_u128(bytes, offset + 8)?);

            let data = if terminal_type.is_data() {
                if entry_size < DATA_TERMINAL_ENTRY_SIZE {
                    return Err(Error::Protocol(format!(
                        "data terminal {} entry of {} bytes",
                        id, entry_size
                    )));
                }
                let dim = |at: usize| -> Result<[u16; 2]> {
                    Ok([
                        wire::read_u16(bytes, offset + at)?,
                        wire::read_u16(bytes, offset + at + 2)?,
                    ])
                };
                Some(DataTerminalInfo {
                    frame_format_bitmap: wire::read_u64(bytes, offset + 24)?,
                    min_size: dim(32)?,
                    max_size: dim(36)?,
                    min_fragment_size: dim(40)?,
                    max_fragment_size: dim(44)?,
                })
            } else {
                None
            };
            if entry_size < TERMINAL_ENTRY_SIZE {
                return Err(Error::Protocol(format!(
                    "terminal {} entry of {} bytes",
                    id, entry_size
                )));
            }

            terminals.push(TerminalManifest {
                id,
                terminal_type,
                kernel_bitmap,
                data,
            });
            offset += entry_size;
        }

        Ok(ProgramGroupManifest {
            id,
            kernel_bitmap,
            alignment,
            kernel_count,
            program_count,
            subgraph_count,
            terminals,
            raw: bytes.to_vec(),
        })
    }

    /// Builds a manifest from its parts, producing the blob the device
    /// would report.
    pub fn new(
        id: u32,
        kernel_bitmap: KernelBitmap,
        program_count: u8,
        terminals: Vec<TerminalManifest>,
    ) -> Result<Self> {
        let mut manifest = ProgramGroupManifest {
            id,
            kernel_bitmap,
            alignment: 4,
            kernel_count: kernel_bitmap.count() as u8,
            program_count,
            subgraph_count: 1,
            terminals,
            raw: Vec::new(),
        };
        manifest.raw = manifest.encode()?;
        Ok(manifest)
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let terminals_size: usize = self.terminals.iter().map(|t| t.entry_size()).sum();
        let size = MANIFEST_HEADER_SIZE + terminals_size;
        let total = u16::try_from(size)
            .map_err(|_| Error::InvalidArg(format!("manifest of {} bytes", size)))?;
        let terminal_count = u8::try_from(self.terminals.len())
            .map_err(|_| Error::InvalidArg("too many terminals".to_owned()))?;

        let mut out = vec![0u8; size];
        wire::write_u128(&mut out, 0, self.kernel_bitmap.bits())?;
        wire::write_u32(&mut out, 16, self.id)?;
        // programs follow the terminals; their layout is opaque here
        wire::write_u16(&mut out, 20, total)?;
        wire::write_u16(&mut out, 22, MANIFEST_HEADER_SIZE as u16)?;
        wire::write_u16(&mut out, 24, total)?;
        wire::write_u16(&mut out, 26, total)?;
        wire::write_u16(&mut out, 28, total)?;
        wire::write_u8(&mut out, 30, self.alignment)?;
        wire::write_u8(&mut out, 31, self.kernel_count)?;
        wire::write_u8(&mut out, 32, self.program_count)?;
        wire::write_u8(&mut out, 33, terminal_count)?;
        wire::write_u8(&mut out, 34, self.subgraph_count)?;

        let mut offset = MANIFEST_HEADER_SIZE;
        for terminal in &self.terminals {
            let entry_size = terminal.entry_size();
            wire::write_u16(&mut out, offset, entry_size as u16)?;
            wire::write_u16(&mut out, offset + 2, terminal.id)?;
            wire::write_u8(&mut out, offset + 4, terminal.terminal_type as u8)?;
            wire::write_u128(&mut out, offset + 8, terminal.kernel_bitmap.bits())?;
            if let Some(data) = &terminal.data {
                wire::write_u64(&mut out, offset + 24, data.frame_format_bitmap)?;
                for (at, dim) in [
                    (32, data.min_size),
                    (36, data.max_size),
                    (40, data.min_fragment_size),
                    (44, data.max_fragment_size),
                ] {
                    wire::write_u16(&mut out, offset + at, dim[COL])?;
                    wire::write_u16(&mut out, offset + at + 2, dim[ROW])?;
                }
            }
            offset += entry_size;
        }
        Ok(out)
    }

    pub fn terminal_count(&self) -> usize {
        self.terminals.len()
    }

    pub fn terminal(&self, index: usize) -> Option<&TerminalManifest> {
        self.terminals.get(index)
    }

    /// The blob exactly as read from the device.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }
}
