// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # IPU Processing System Library
//!
//! Userspace layer for the processing system (psys) of Intel IPU6 image
//! processing units. It wraps the psys character device and drives program
//! groups on the firmware.
//!
//! ## Features
//!
//! - **Device Context**: Capability and manifest queries, buffer
//!   registration and completion polling over the psys ioctl interface.
//! - **Buffers**: Host or DMA-buf backed memory with sub-regions, migrated
//!   to the device on demand.
//! - **Commands and Events**: Submission of process groups and waiting for
//!   their completion.
//! - **Process Group Controller**: Builds a process group from its
//!   manifest, fragments wide frames and runs frames through a persistent
//!   process group.
//! - **Shared Reference Pool**: Hands temporal reference buffers from a
//!   producing stream to a consuming one.
//!
//! ## Example
//!
//! ```no_run
//! use ipu_psys::context::Context;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let context = Context::open("/dev/ipu-psys0");
//! let capability = context.capabilities()?;
//! println!("{} with {} program groups", capability.dev_model, capability.pg_count);
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: IPU6 psys driver exposing `/dev/ipu-psys0`
//! - **Memory**: CMA dma-heap for frames allocated with [`frame::DmaFrame`]
//!
//! ## Safety
//!
//! This library uses `unsafe` code for the device ioctls and for memory the
//! device shares with the host. Caller memory handed to the device goes
//! through `unsafe` constructors whose contracts state how long it must
//! live.

pub mod bitmap;
pub mod buffer;
pub mod codec;
pub mod command;
pub mod context;
pub mod controller;
pub mod error;
pub mod event;
pub mod format;
pub mod fragment;
pub mod frame;
pub mod manifest;
pub mod memory;
pub mod process_group;
pub mod refer_pool;
pub(crate) mod wire;

#[cfg(test)]
pub(crate) mod mock;

pub use error::{Error, Result};
