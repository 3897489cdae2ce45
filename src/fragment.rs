// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Horizontal fragmentation of frames too wide for one hardware pass.

use crate::{
    error::{Error, Result},
    format::{self, align_8, FourCC, FrameFormatType},
    manifest::{COL, ROW},
};

/// Default overlap in pixels between neighbouring fragments.
pub const FRAGMENT_OVERLAP: u32 = 64;

/// Bytes in one DDR word as addressed by the firmware DMA.
pub const DDR_WORD_BYTES: u32 = 64;

/// Number of fragments of at most `max_width` pixels, overlapping by
/// `overlap`, needed to cover `width` pixels.
///
/// ```
/// # use ipu_psys::fragment::fragment_count;
/// // tiles start at 0, 90, 180 and 270
/// assert_eq!(fragment_count(300, 100, 10).unwrap(), 4);
/// ```
pub fn fragment_count(width: u32, max_width: u32, overlap: u32) -> Result<u32> {
    if max_width == 0 {
        return Err(Error::InvalidArg("zero maximum fragment width".to_owned()));
    }
    if width <= max_width {
        return Ok(1);
    }
    if overlap >= max_width {
        return Err(Error::InvalidArg(format!(
            "overlap {} leaves no progress for fragments of {}",
            overlap, max_width
        )));
    }

    let step = max_width - overlap;
    let mut covered = max_width;
    let mut count = 1;
    while covered < width {
        covered += step;
        count += 1;
    }
    Ok(count)
}

/// Start column of every fragment produced by [`fragment_count`].
pub fn fragment_starts(width: u32, max_width: u32, overlap: u32) -> Result<Vec<u32>> {
    let count = fragment_count(width, max_width, overlap)?;
    let step = max_width.saturating_sub(overlap);
    Ok((0..count).map(|i| i * step).collect())
}

/// Pixel geometry of one fragment as computed by the parameter codec.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FragmentDesc {
    pub width: u16,
    pub height: u16,
    pub start_x: u16,
    pub start_y: u16,
}

/// Fragment descriptor as stored in a data terminal of the process group.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FragmentDescriptor {
    /// Fragment size in pixels, `[COL, ROW]`.
    pub dimension: [u16; 2],
    /// Start position in hardware pixel units.
    pub index: [u16; 2],
    /// Start position in bytes (column) and lines (row).
    pub offset: [u16; 2],
}

/// Size of one encoded [`FragmentDescriptor`].
pub const FRAGMENT_DESCRIPTOR_SIZE: usize = 12;

struct Packing {
    bpp: u32,
    vectorized: bool,
    multiplier: u32,
    divider: u32,
}

fn packing(fourcc: FourCC) -> Packing {
    let bpp = u32::from(format::bpp(fourcc));
    let mut packing = Packing {
        bpp,
        vectorized: false,
        multiplier: 1,
        divider: 1,
    };

    match format::frame_format(fourcc) {
        Some(FrameFormatType::BayerVectorized | FrameFormatType::BayerLineInterleaved) => {
            packing.vectorized = true;
            packing.bpp = align_8(bpp);
        }
        Some(FrameFormatType::Raw) => packing.bpp = align_8(bpp),
        Some(f) if f.is_bayer() => packing.bpp = align_8(bpp),
        Some(FrameFormatType::YyuvyyVectorized) => {
            packing.bpp = bpp * 3 / 2;
            packing.multiplier = 3;
            packing.divider = 2;
            packing.vectorized = true;
        }
        _ => {}
    }
    packing
}

/// Converts the codec's pixel geometry into the descriptors of a data
/// terminal carrying `fourcc`.
pub fn terminal_descriptors(fourcc: FourCC, fragments: &[FragmentDesc]) -> Vec<FragmentDescriptor> {
    let packing = packing(fourcc);
    let frame_format = format::frame_format(fourcc);
    let vector = if packing.vectorized { 2 } else { 1 };

    fragments
        .iter()
        .map(|frag| {
            let col = (u32::from(frag.start_x) * packing.multiplier / packing.divider) * vector;
            let row = u32::from(frag.start_y) / vector;

            let col_offset = match frame_format {
                Some(
                    FrameFormatType::Yuv420
                    | FrameFormatType::YyuvyyVectorized
                    | FrameFormatType::BayerVectorized,
                ) => {
                    let pixels_per_word = (DDR_WORD_BYTES * 8 / packing.bpp).max(1);
                    (col / pixels_per_word) * DDR_WORD_BYTES
                        + (col % pixels_per_word) * packing.bpp / 8
                }
                _ => col * packing.bpp / 8,
            };

            let mut desc = FragmentDescriptor::default();
            desc.dimension[COL] = frag.width;
            desc.dimension[ROW] = frag.height;
            desc.index[COL] = col as u16;
            desc.index[ROW] = row as u16;
            desc.offset[COL] = col_offset as u16;
            desc.offset[ROW] = row as u16;
            desc
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlapping_tiles_cover_frame() -> Result<()> {
        assert_eq!(fragment_count(300, 100, 10)?, 4);
        assert_eq!(fragment_starts(300, 100, 10)?, vec![0, 90, 180, 270]);
        assert_eq!(fragment_count(100, 100, 10)?, 1);
        assert_eq!(fragment_count(0, 100, 10)?, 1);
        assert_eq!(fragment_count(101, 100, 10)?, 2);
        Ok(())
    }

    #[test]
    fn no_smaller_count_covers() -> Result<()> {
        for max_width in [64u32, 100, 640, 1024] {
            for overlap in [0u32, 10, 32, 63] {
                for width in (1..4000).step_by(37) {
                    let n = fragment_count(width, max_width, overlap)?;
                    let step = max_width - overlap;
                    assert!(max_width + (n - 1) * step >= width);
                    if n > 1 {
                        assert!(max_width + (n - 2) * step < width);
                    }
                }
            }
        }
        Ok(())
    }

    #[test]
    fn degenerate_overlap_rejected() {
        assert!(matches!(fragment_count(300, 100, 100), Err(Error::InvalidArg(_))));
        assert!(matches!(fragment_count(300, 0, 0), Err(Error::InvalidArg(_))));
        // a single fragment needs no progress
        assert!(fragment_count(80, 100, 200).is_ok());
    }

    #[test]
    fn planar_descriptors() {
        let frags = [
            FragmentDesc {
                width: 100,
                height: 64,
                start_x: 0,
                start_y: 0,
            },
            FragmentDesc {
                width: 100,
                height: 64,
                start_x: 90,
                start_y: 8,
            },
        ];
        let descs = terminal_descriptors(FourCC::NV12, &frags);
        assert_eq!(descs[1].dimension, [100, 64]);
        assert_eq!(descs[1].index, [90, 8]);
        // 90 pixels at 12 bits
        assert_eq!(descs[1].offset, [135, 8]);
    }

    #[test]
    fn vectorized_bayer_descriptors() {
        let frag = FragmentDesc {
            width: 128,
            height: 32,
            start_x: 40,
            start_y: 10,
        };
        let desc = terminal_descriptors(FourCC::BV0K, &[frag])[0];
        assert_eq!(desc.index, [80, 5]);
        // 32 pixels per DDR word at 16 bits
        assert_eq!(desc.offset, [2 * 64 + 16 * 2, 5]);
    }

    #[test]
    fn yyuvyy_descriptors() {
        let frag = FragmentDesc {
            width: 64,
            height: 16,
            start_x: 20,
            start_y: 4,
        };
        let desc = terminal_descriptors(FourCC::Y032, &[frag])[0];
        // (20 * 3 / 2) * 2 columns at 36 bits, 14 pixels per word
        assert_eq!(desc.index, [60, 2]);
        assert_eq!(desc.offset, [4 * 64 + 4 * 36 / 8, 2]);
    }
}
