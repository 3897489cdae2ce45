// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Little-endian field access for blobs shared with the psys firmware.

use crate::error::{Error, Result};

fn field<const N: usize>(bytes: &[u8], offset: usize) -> Result<[u8; N]> {
    let mut out = [0u8; N];
    let slice = offset
        .checked_add(N)
        .and_then(|end| bytes.get(offset..end))
        .ok_or_else(|| {
            Error::Protocol(format!(
                "truncated blob: {} bytes at {} beyond {}",
                N,
                offset,
                bytes.len()
            ))
        })?;
    out.copy_from_slice(slice);
    Ok(out)
}

fn field_mut<const N: usize>(bytes: &mut [u8], offset: usize) -> Result<&mut [u8]> {
    let len = bytes.len();
    offset
        .checked_add(N)
        .and_then(|end| bytes.get_mut(offset..end))
        .ok_or_else(|| {
            Error::Protocol(format!(
                "blob too small: {} bytes at {} beyond {}",
                N, offset, len
            ))
        })
}

pub(crate) fn read_u8(bytes: &[u8], offset: usize) -> Result<u8> {
    Ok(field::<1>(bytes, offset)?[0])
}

pub(crate) fn read_u16(bytes: &[u8], offset: usize) -> Result<u16> {
    Ok(u16::from_le_bytes(field(bytes, offset)?))
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(field(bytes, offset)?))
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(field(bytes, offset)?))
}

pub(crate) fn read_u128(bytes: &[u8], offset: usize) -> Result<u128> {
    Ok(u128::from_le_bytes(field(bytes, offset)?))
}

pub(crate) fn write_u8(bytes: &mut [u8], offset: usize, value: u8) -> Result<()> {
    field_mut::<1>(bytes, offset)?.copy_from_slice(&[value]);
    Ok(())
}

pub(crate) fn write_u16(bytes: &mut [u8], offset: usize, value: u16) -> Result<()> {
    field_mut::<2>(bytes, offset)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: usize, value: u32) -> Result<()> {
    field_mut::<4>(bytes, offset)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u64(bytes: &mut [u8], offset: usize, value: u64) -> Result<()> {
    field_mut::<8>(bytes, offset)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

pub(crate) fn write_u128(bytes: &mut [u8], offset: usize, value: u128) -> Result<()> {
    field_mut::<16>(bytes, offset)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncated_reads_are_protocol_errors() {
        let bytes = [1u8, 2, 3];
        assert_eq!(read_u16(&bytes, 1).ok(), Some(0x0302));
        assert!(matches!(read_u32(&bytes, 0), Err(Error::Protocol(_))));
        assert!(matches!(read_u8(&bytes, usize::MAX - 1), Err(Error::Protocol(_))));
    }

    #[test]
    fn writes_little_endian() -> Result<()> {
        let mut bytes = [0u8; 8];
        write_u32(&mut bytes, 2, 0xdead_beef)?;
        assert_eq!(bytes, [0, 0, 0xef, 0xbe, 0xad, 0xde, 0, 0]);
        assert!(write_u64(&mut bytes, 4, 1).is_err());
        Ok(())
    }
}
