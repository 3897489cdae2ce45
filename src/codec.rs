// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Interface to the parameter codec that understands per-kernel payloads.
//!
//! The codec is an external collaborator: this crate only decides which
//! terminals carry payloads, where their memory lives and when encoding and
//! decoding happen.

use crate::{
    bitmap::{KernelBitmap, RoutingBitmap},
    context::Platform,
    error::Result,
    format::FrameFormatType,
    fragment::FragmentDesc,
    manifest::{ProgramGroupManifest, TerminalType},
};

/// Geometry of a main input or output frame.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MainFrame {
    pub width: u32,
    pub height: u32,
    pub bpe: u32,
}

#[derive(Debug, Clone)]
pub struct CodecConfig {
    pub platform: Platform,
    pub manifest: ProgramGroupManifest,
    pub fragment_count: u32,
    /// Manifest indices of data terminals the caller does not use.
    pub disabled_data_terminals: Vec<usize>,
    pub input_main_frame: Option<MainFrame>,
    pub output_main_frame: Option<MainFrame>,
}

/// What one terminal needs from the controller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TerminalRequirement {
    pub section_count: u32,
    /// Payload bytes; zero means the terminal carries no payload.
    pub payload_size: u32,
    pub kernel_bitmap: KernelBitmap,
    /// Kernel ids in the order their sections appear in the payload.
    pub kernel_order: Vec<u8>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Requirements {
    /// Kernels the codec wants enabled.
    pub kernel_bitmap: KernelBitmap,
    /// Indexed by manifest terminal index.
    pub terminals: Vec<TerminalRequirement>,
    /// Largest statistics blob [`ParameterCodec::decode`] can produce.
    pub max_stats_size: u32,
}

/// Payload memory of one terminal handed to the codec.
#[derive(Debug)]
pub struct TerminalPayload<'a> {
    /// Manifest terminal index.
    pub terminal: usize,
    pub data: &'a mut [u8],
}

pub trait ParameterCodec: Send {
    fn init(&mut self, config: &CodecConfig) -> Result<()>;

    /// Computes per-terminal requirements for the given raw parameters.
    /// `frame_formats` is indexed by manifest terminal index.
    fn prepare(
        &mut self,
        parameters: &[u8],
        routing: &RoutingBitmap,
        frame_formats: &[Option<FrameFormatType>],
    ) -> Result<Requirements>;

    /// Pixel geometry of every fragment, indexed by manifest terminal index.
    /// Terminals without pixels get an empty list.
    fn fragment_descriptors(&mut self, fragment_count: u32) -> Result<Vec<Vec<FragmentDesc>>>;

    /// Encodes `parameters` into the payloads, which arrive in terminal
    /// index order.
    fn encode(&mut self, parameters: &[u8], payloads: &mut [TerminalPayload<'_>]) -> Result<()>;

    /// Decodes statistics from the payloads into `statistics`.
    fn decode(
        &mut self,
        payloads: &mut [TerminalPayload<'_>],
        statistics: &mut Vec<u8>,
    ) -> Result<()>;

    fn deinit(&mut self) {}
}

/// Removes kernels whose terminals take no part in the run: kernels of
/// disabled data terminals and of parameter or program terminals whose
/// payload is empty. The program control init terminal is never pruned.
///
/// The result depends only on the manifest and the requirements, so pruning
/// an already pruned bitmap changes nothing.
pub fn prune_dead_terminals(
    bitmap: KernelBitmap,
    manifest: &ProgramGroupManifest,
    requirements: &[TerminalRequirement],
    disabled_data_terminals: &[usize],
) -> KernelBitmap {
    let mut enabled = bitmap.intersection(manifest.kernel_bitmap);

    for (index, terminal) in manifest.terminals.iter().enumerate() {
        let dead = match terminal.terminal_type {
            TerminalType::ProgramControlInit => false,
            t if t.is_data() => disabled_data_terminals.contains(&index),
            t if t.is_cached() || t.is_spatial() || t.is_program() => requirements
                .get(index)
                .map(|r| r.payload_size == 0)
                .unwrap_or(true),
            _ => false,
        };
        if dead {
            enabled = enabled.difference(terminal.kernel_bitmap);
        }
    }
    enabled
}
