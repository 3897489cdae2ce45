// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use ipu_psys::{
    bitmap::RoutingBitmap,
    codec::{CodecConfig, ParameterCodec, Requirements, TerminalPayload, TerminalRequirement},
    context::{Context, Platform},
    controller::{ControllerConfig, ProcessGroupController, State, PG_ID_TNR},
    format::{FourCC, FrameFormatType},
    fragment::{fragment_count, fragment_starts, terminal_descriptors, FragmentDesc},
    frame::{DmaFrame, FrameInfo},
    manifest::ProgramGroupManifest,
    Error,
};
use psys_sys::IPU_PSYS_DEVICE;
use serial_test::serial;
use std::error::Error as StdError;

/// Codec that asks for no payloads at all.
#[derive(Default)]
struct EmptyCodec {
    terminals: usize,
}

impl ParameterCodec for EmptyCodec {
    fn init(&mut self, config: &CodecConfig) -> ipu_psys::Result<()> {
        self.terminals = config.manifest.terminal_count();
        Ok(())
    }

    fn prepare(
        &mut self,
        _parameters: &[u8],
        _routing: &RoutingBitmap,
        _frame_formats: &[Option<FrameFormatType>],
    ) -> ipu_psys::Result<Requirements> {
        Ok(Requirements {
            terminals: vec![TerminalRequirement::default(); self.terminals],
            ..Default::default()
        })
    }

    fn fragment_descriptors(&mut self, fragment_count: u32) -> ipu_psys::Result<Vec<Vec<FragmentDesc>>> {
        Ok(vec![vec![FragmentDesc::default(); fragment_count as usize]; self.terminals])
    }

    fn encode(&mut self, _parameters: &[u8], _payloads: &mut [TerminalPayload<'_>]) -> ipu_psys::Result<()> {
        Ok(())
    }

    fn decode(
        &mut self,
        _payloads: &mut [TerminalPayload<'_>],
        _statistics: &mut Vec<u8>,
    ) -> ipu_psys::Result<()> {
        Ok(())
    }
}

#[test]
fn test_missing_device() {
    let context = Context::open("/nonexistent/ipu-psys0");
    assert!(!context.is_initialized());
    assert!(matches!(context.capabilities(), Err(Error::Device(_))));

    let config = ControllerConfig {
        pg_id: PG_ID_TNR,
        device: "/nonexistent/ipu-psys0".into(),
        ..Default::default()
    };
    let mut ctrl = ProcessGroupController::new(config, Box::<EmptyCodec>::default());
    assert!(ctrl.init().is_err());
    assert_eq!(ctrl.state(), State::Unconfigured);
}

#[test]
fn test_fragment_geometry() -> Result<(), Box<dyn StdError>> {
    // 4K frame through 1536 pixel wide fragments
    assert_eq!(fragment_count(3840, 1536, 64)?, 3);
    let starts = fragment_starts(3840, 1536, 64)?;
    assert_eq!(starts, [0, 1472, 2944]);

    let fragments: Vec<FragmentDesc> = starts
        .iter()
        .map(|&x| FragmentDesc {
            width: 1536,
            height: 2160,
            start_x: x as u16,
            start_y: 0,
        })
        .collect();
    let descriptors = terminal_descriptors(FourCC::NV12, &fragments);
    assert_eq!(descriptors.len(), 3);
    assert_eq!(descriptors[0].dimension, [1536, 2160]);

    let info = FrameInfo::new(3840, 2160, FourCC::NV12);
    assert_eq!(info.size(), 12441600);
    Ok(())
}

#[test]
#[serial]
#[ignore = "requires IPU psys hardware"]
fn test_capability() -> Result<(), Box<dyn StdError>> {
    let context = Context::open(IPU_PSYS_DEVICE);
    let capability = context.capabilities()?;
    println!("{:?}", capability);
    assert_eq!(capability.platform()?, Platform::Ipu6);
    assert!(capability.pg_count > 0);
    Ok(())
}

#[test]
#[serial]
#[ignore = "requires IPU psys hardware"]
fn test_manifests() -> Result<(), Box<dyn StdError>> {
    let context = Context::open(IPU_PSYS_DEVICE);
    let capability = context.capabilities()?;
    let mut parsed = 0;
    for index in 0..capability.pg_count {
        let Ok(size) = context.manifest(index, None) else {
            continue;
        };
        let mut blob = vec![0u8; size as usize];
        context.manifest(index, Some(&mut blob))?;
        let manifest = ProgramGroupManifest::parse(&blob)?;
        assert_eq!(manifest.size(), size as usize);
        parsed += 1;
    }
    assert!(parsed > 0);
    Ok(())
}

#[test]
#[serial]
#[ignore = "requires a CMA dma-heap"]
fn test_dma_frame() -> Result<(), Box<dyn StdError>> {
    let mut frame = DmaFrame::new(FrameInfo::new(1920, 1080, FourCC::NV12))?;
    let mut map = frame.mmap()?;
    map.as_mut_slice().fill(0x80);
    assert_eq!(map.as_slice().len(), 3110400);
    Ok(())
}

#[test]
#[serial]
#[ignore = "requires IPU psys hardware"]
fn test_controller_init() -> Result<(), Box<dyn StdError>> {
    let config = ControllerConfig {
        pg_id: PG_ID_TNR,
        name: "tnr".to_owned(),
        ..Default::default()
    };
    let mut ctrl = ProcessGroupController::new(config, Box::<EmptyCodec>::default());
    ctrl.init()?;
    assert_eq!(ctrl.state(), State::CapabilityKnown);
    ctrl.deinit()?;
    Ok(())
}
