// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use core::fmt;
use std::str::FromStr;

use crate::error::Error;

/// Four character pixel format code.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    pub const YUYV: FourCC = FourCC(*b"YUYV");
    pub const YUY2: FourCC = FourCC(*b"YUY2");
    pub const UYVY: FourCC = FourCC(*b"UYVY");
    pub const YU12: FourCC = FourCC(*b"YU12");
    pub const YV12: FourCC = FourCC(*b"YV12");
    pub const IYUV: FourCC = FourCC(*b"IYUV");
    pub const NV12: FourCC = FourCC(*b"NV12");
    pub const NV21: FourCC = FourCC(*b"NV21");
    pub const NV16: FourCC = FourCC(*b"NV16");
    pub const TILE: FourCC = FourCC(*b"TILE");
    pub const RGBP: FourCC = FourCC(*b"RGBP");
    pub const RGB3: FourCC = FourCC(*b"RGB3");
    pub const RGB4: FourCC = FourCC(*b"RGB4");
    pub const BA10: FourCC = FourCC(*b"BA10");
    pub const BA12: FourCC = FourCC(*b"BA12");
    pub const GRBG8: FourCC = FourCC(*b"GRBG");
    pub const Y032: FourCC = FourCC(*b"y032");
    pub const V420: FourCC = FourCC(*b"V420");
    pub const BV0K: FourCC = FourCC(*b"bV0K");
    pub const BV0G: FourCC = FourCC(*b"bV0G");
    pub const CSL6: FourCC = FourCC(*b"CSL6");
    pub const CS42: FourCC = FourCC(*b"CS42");
    pub const GR10: FourCC = FourCC(*b"GR10");
    pub const RG10: FourCC = FourCC(*b"RG10");
    pub const GB10: FourCC = FourCC(*b"GB10");
    pub const BG10: FourCC = FourCC(*b"BG10");
    pub const P010: FourCC = FourCC(*b"P010");
    pub const P412: FourCC = FourCC(*b"P412");
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Debug for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FourCC({})", self)
    }
}

impl FromStr for FourCC {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes: [u8; 4] = s
            .as_bytes()
            .try_into()
            .map_err(|_| Error::InvalidArg(format!("fourcc {:?} is not 4 bytes", s)))?;
        Ok(FourCC(bytes))
    }
}

/// Frame layouts understood by the psys firmware. Discriminants are the
/// firmware's encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameFormatType {
    Yuv420 = 1,
    Nv12 = 3,
    Nv12TileY = 5,
    Nv21 = 6,
    Nv16 = 9,
    Uyvy = 11,
    Yuyv = 12,
    Rgb565 = 15,
    Rgb888 = 16,
    Rgba888 = 17,
    BayerGrbg = 18,
    BayerRggb = 19,
    BayerBggr = 20,
    BayerGbrg = 21,
    Raw = 23,
    BayerLineInterleaved = 31,
    BayerVectorized = 32,
    YyuvyyVectorized = 36,
    P010 = 38,
}

impl FrameFormatType {
    pub fn is_bayer(self) -> bool {
        matches!(
            self,
            FrameFormatType::BayerGrbg
                | FrameFormatType::BayerRggb
                | FrameFormatType::BayerBggr
                | FrameFormatType::BayerGbrg
        )
    }
}

/// Pixel format description used when configuring data terminals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelFormat {
    pub fourcc: FourCC,
    pub frame_format: FrameFormatType,
    /// Bits per pixel as the firmware counts them.
    pub bpp: u8,
    /// Bits per element.
    pub bpe: u8,
}

const fn entry(fourcc: FourCC, frame_format: FrameFormatType, bpp: u8, bpe: u8) -> PixelFormat {
    PixelFormat {
        fourcc,
        frame_format,
        bpp,
        bpe,
    }
}

static FORMATS: &[PixelFormat] = &[
    entry(FourCC::YUYV, FrameFormatType::Yuyv, 16, 8),
    entry(FourCC::YUY2, FrameFormatType::Yuyv, 16, 8),
    entry(FourCC::UYVY, FrameFormatType::Uyvy, 16, 8),
    entry(FourCC::YU12, FrameFormatType::Yuv420, 12, 8),
    entry(FourCC::YV12, FrameFormatType::Yuv420, 12, 8),
    entry(FourCC::IYUV, FrameFormatType::Yuv420, 12, 8),
    entry(FourCC::NV12, FrameFormatType::Nv12, 12, 8),
    entry(FourCC::NV21, FrameFormatType::Nv21, 12, 8),
    entry(FourCC::TILE, FrameFormatType::Nv12TileY, 12, 8),
    entry(FourCC::NV16, FrameFormatType::Nv16, 16, 8),
    entry(FourCC::RGBP, FrameFormatType::Rgb565, 16, 16),
    entry(FourCC::RGB3, FrameFormatType::Rgb888, 24, 24),
    entry(FourCC::RGB4, FrameFormatType::Rgba888, 24, 24),
    entry(FourCC::BA12, FrameFormatType::Raw, 16, 16),
    entry(FourCC::BA10, FrameFormatType::Raw, 16, 16),
    entry(FourCC::GRBG8, FrameFormatType::Raw, 8, 8),
    entry(FourCC::Y032, FrameFormatType::YyuvyyVectorized, 24, 16),
    entry(FourCC::V420, FrameFormatType::Yuv420, 24, 16),
    entry(FourCC::BV0K, FrameFormatType::BayerVectorized, 16, 16),
    entry(FourCC::BV0G, FrameFormatType::BayerVectorized, 16, 16),
    entry(FourCC::CSL6, FrameFormatType::BayerLineInterleaved, 16, 16),
    entry(FourCC::CS42, FrameFormatType::Yuv420, 18, 12),
    entry(FourCC::GR10, FrameFormatType::BayerGrbg, 16, 16),
    entry(FourCC::RG10, FrameFormatType::BayerRggb, 16, 16),
    entry(FourCC::GB10, FrameFormatType::BayerGbrg, 16, 16),
    entry(FourCC::BG10, FrameFormatType::BayerBggr, 16, 16),
    entry(FourCC::P010, FrameFormatType::P010, 24, 16),
    entry(FourCC::P412, FrameFormatType::Yuv420, 24, 16),
];

pub fn lookup(fourcc: FourCC) -> Option<&'static PixelFormat> {
    FORMATS.iter().find(|f| f.fourcc == fourcc)
}

pub fn frame_format(fourcc: FourCC) -> Option<FrameFormatType> {
    lookup(fourcc).map(|f| f.frame_format)
}

/// Bits per pixel, 8 for unknown formats.
pub fn bpp(fourcc: FourCC) -> u8 {
    lookup(fourcc).map(|f| f.bpp).unwrap_or(8)
}

/// Bits per element, falling back to [`bpp`].
pub fn bpe(fourcc: FourCC) -> u8 {
    lookup(fourcc).map(|f| f.bpe).unwrap_or_else(|| bpp(fourcc))
}

pub const fn align_64(value: u32) -> u32 {
    (value + 63) & !63
}

pub const fn align_8(value: u32) -> u32 {
    (value + 7) & !7
}

/// Line stride in bytes the firmware expects for `fourcc` at `width`.
pub fn stride(fourcc: FourCC, width: u32) -> u32 {
    if fourcc == FourCC::IYUV {
        return width;
    }
    if fourcc == FourCC::YUY2 {
        return align_64(width * 2);
    }

    match frame_format(fourcc) {
        Some(FrameFormatType::BayerGrbg | FrameFormatType::Raw) => align_64(width * 2),
        Some(FrameFormatType::YyuvyyVectorized) => width * 6,
        Some(FrameFormatType::BayerVectorized | FrameFormatType::BayerLineInterleaved) => {
            align_64(width * 4)
        }
        Some(FrameFormatType::Yuv420) => align_64(width * 2),
        Some(FrameFormatType::Nv12) => width,
        Some(FrameFormatType::Yuyv | FrameFormatType::P010) => align_64(width * 2),
        _ => width,
    }
}

/// Bytes needed to hold one frame.
pub fn frame_size(fourcc: FourCC, width: u32, height: u32) -> u32 {
    let stride = stride(fourcc, width);
    match frame_format(fourcc) {
        Some(FrameFormatType::BayerLineInterleaved) => stride * height * 3 / 2,
        Some(FrameFormatType::Nv12 | FrameFormatType::Nv21 | FrameFormatType::Nv12TileY) => {
            stride * height * 3 / 2
        }
        Some(FrameFormatType::Yuv420) if bpp(fourcc) == 12 => stride * height * 3 / 2,
        _ => stride * height,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_lookup() {
        assert_eq!(frame_format(FourCC::NV12), Some(FrameFormatType::Nv12));
        assert_eq!(bpp(FourCC::CS42), 18);
        assert_eq!(bpe(FourCC::CS42), 12);
        let unknown = FourCC(*b"ZZZZ");
        assert_eq!(frame_format(unknown), None);
        assert_eq!(bpp(unknown), 8);
        assert_eq!(bpe(unknown), 8);
        assert!(FrameFormatType::BayerGrbg.is_bayer());
    }

    #[test]
    fn strides() {
        assert_eq!(stride(FourCC::IYUV, 1920), 1920);
        assert_eq!(stride(FourCC::YUY2, 100), 256);
        assert_eq!(stride(FourCC::YUYV, 100), 256);
        assert_eq!(stride(FourCC::BA10, 1000), 2048);
        assert_eq!(stride(FourCC::Y032, 100), 600);
        assert_eq!(stride(FourCC::BV0K, 100), 448);
        assert_eq!(stride(FourCC::NV12, 1921), 1921);
        assert_eq!(stride(FourCC::P010, 1920), 3840);
        assert_eq!(stride(FourCC::RGB3, 640), 640);
    }

    #[test]
    fn frame_sizes() {
        assert_eq!(frame_size(FourCC::NV12, 1920, 1080), 1920 * 1080 * 3 / 2);
        assert_eq!(frame_size(FourCC::CSL6, 100, 10), 448 * 10 * 3 / 2);
        assert_eq!(frame_size(FourCC::YUYV, 64, 2), 128 * 2);
    }

    #[test]
    fn parse_fourcc() {
        assert_eq!("NV12".parse::<FourCC>().ok(), Some(FourCC::NV12));
        assert!("NV1".parse::<FourCC>().is_err());
        assert_eq!(FourCC::BV0K.to_string(), "bV0K");
    }
}
