// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use nix::errno::Errno;
use thiserror::Error;

/// Errors reported by the psys resource layer and the process-group
/// controller.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or missing input: bad flag combination, oversized buffer
    /// list, a buffer that cannot be queued.
    #[error("invalid argument: {0}")]
    InvalidArg(String),

    /// Allocation or device registration failed.
    #[error("out of memory: {0}")]
    NoMemory(String),

    /// The device has no such entry (e.g. a manifest index).
    #[error("no entry: {0}")]
    NoEntry(String),

    /// Transport failure reported by the device.
    #[error("device error: {0}")]
    Device(String),

    /// A wait exceeded its budget.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// Header, version or size mismatch in data shared with the device.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// An invariant was violated, such as a region whose root is gone.
    #[error("internal error: {0}")]
    Internal(String),

    /// The device model is not one this layer can drive.
    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Maps an ioctl errno onto the error taxonomy.
    pub(crate) fn from_errno(errno: Errno, what: &str) -> Self {
        let msg = format!("{what}: {}", errno.desc());
        match errno {
            Errno::ENOMEM => Error::NoMemory(msg),
            Errno::EINVAL | Errno::EFAULT => Error::InvalidArg(msg),
            Errno::ENOENT => Error::NoEntry(msg),
            _ => Error::Device(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
