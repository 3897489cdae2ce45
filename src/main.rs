// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use ipu_psys::{
    context::{Capability, Context},
    manifest::ProgramGroupManifest,
};
use serde_json::{json, Value};
use std::error::Error;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(args: &Args) -> Result<(), Box<dyn Error>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.verbose { "debug" } else { "info" }));
    let journald = if args.journald {
        Some(tracing_journald::layer()?)
    } else {
        None
    };
    let tracy = if args.tracy {
        tracy_client::Client::start();
        Some(tracing_tracy::TracyLayer::default())
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(journald)
        .with(tracy)
        .init();
    Ok(())
}

/// Reads every manifest the device reports, skipping the ones it refuses.
fn read_manifests(
    context: &Context,
    capability: &Capability,
    pg_id: Option<u32>,
) -> Result<Vec<(u32, ProgramGroupManifest)>, Box<dyn Error>> {
    let mut manifests = Vec::new();
    for index in 0..capability.pg_count {
        let size = match context.manifest(index, None) {
            Ok(0) => {
                warn!("manifest {} is empty", index);
                continue;
            }
            Ok(size) => size,
            Err(e) => {
                debug!("manifest {}: {}", index, e);
                continue;
            }
        };
        let mut blob = vec![0u8; size as usize];
        context.manifest(index, Some(&mut blob))?;
        match ProgramGroupManifest::parse(&blob) {
            Ok(m) if pg_id.map_or(true, |id| id == m.id) => manifests.push((index, m)),
            Ok(_) => {}
            Err(e) => warn!("manifest {} does not parse: {}", index, e),
        }
    }
    Ok(manifests)
}

fn manifest_json(index: u32, manifest: &ProgramGroupManifest) -> Value {
    let terminals: Vec<Value> = manifest
        .terminals
        .iter()
        .enumerate()
        .map(|(i, t)| {
            json!({
                "index": i,
                "id": t.id,
                "type": format!("{:?}", t.terminal_type),
                "kernels": t.kernel_bitmap.iter().collect::<Vec<_>>(),
                "max_fragment_width": t.data.map(|d| d.max_fragment_width()),
            })
        })
        .collect();
    json!({
        "index": index,
        "id": manifest.id,
        "size": manifest.size(),
        "programs": manifest.program_count,
        "kernel_bitmap": manifest.kernel_bitmap.to_string(),
        "terminals": terminals,
    })
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing(&args)?;

    let context = Context::open(&args.device);
    if !context.is_initialized() {
        return Err(format!("cannot open {}", args.device.display()).into());
    }
    let capability = context.capabilities()?;
    info!(
        "{} {} version {}",
        capability.driver, capability.dev_model, capability.version
    );
    if let Err(e) = capability.platform() {
        warn!("{}", e);
    }

    let manifests = read_manifests(&context, &capability, args.pg_id)?;
    if let (Some(id), true) = (args.pg_id, manifests.is_empty()) {
        return Err(format!("program group {} not found", id).into());
    }

    if args.json {
        let out = json!({
            "driver": capability.driver,
            "dev_model": capability.dev_model,
            "version": capability.version,
            "pg_count": capability.pg_count,
            "manifests": manifests
                .iter()
                .map(|(i, m)| manifest_json(*i, m))
                .collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!(
        "{} ({}) with {} program groups",
        capability.dev_model, capability.driver, capability.pg_count
    );
    for (index, manifest) in &manifests {
        println!(
            "[{}] program group {}: {} terminals, {} programs, kernels {}",
            index,
            manifest.id,
            manifest.terminal_count(),
            manifest.program_count,
            manifest.kernel_bitmap
        );
        for (i, terminal) in manifest.terminals.iter().enumerate() {
            match terminal.data {
                Some(data) => println!(
                    "    {:>2} {:?} max fragment width {}",
                    i,
                    terminal.terminal_type,
                    data.max_fragment_width()
                ),
                None => println!("    {:>2} {:?}", i, terminal.terminal_type),
            }
        }
    }
    Ok(())
}
