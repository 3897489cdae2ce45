// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use psys_sys::IPU_PSYS_DEVICE;
use std::path::PathBuf;

/// Command-line arguments for the psys inspection tool.
///
/// Arguments can be specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// ipu-psys --device /dev/ipu-psys0 --pg-id 189 --json
///
/// export PG_ID=189
/// ipu-psys
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// psys device node
    #[arg(short, long, env = "PSYS_DEVICE", default_value = IPU_PSYS_DEVICE)]
    pub device: PathBuf,

    /// Only list the manifest of this program group
    #[arg(short, long, env = "PG_ID")]
    pub pg_id: Option<u32>,

    /// Print the capability and manifests as JSON
    #[arg(long, env = "JSON")]
    pub json: bool,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Send logs to the systemd journal
    #[arg(long, env = "JOURNALD")]
    pub journald: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}
