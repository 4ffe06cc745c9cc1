// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! rtbus-shm-dump - Inspect rtbus shared-memory channel regions
//!
//! Scans `/dev/shm` for channel regions (or takes a specific name) and
//! prints their configuration, ring state, message pool, and role tables.

use clap::Parser;
use colored::Colorize;
use rtbus::{dump_channel, region_size, Channel, DumpOptions};
use std::fs;
use std::path::Path;

/// Inspect rtbus shared-memory channel regions
#[derive(Parser, Debug)]
#[command(name = "rtbus-shm-dump")]
#[command(version)]
#[command(about = "Inspect rtbus shared-memory channel regions")]
struct Args {
    /// Name prefix to scan for under /dev/shm
    #[arg(short, long, default_value = "rtbus_")]
    prefix: String,

    /// Dump the full region contents, not just the header summary
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Also hex-dump message payloads (implies --verbose)
    #[arg(short = 'd', long)]
    dump_data: bool,

    /// Specific channel name to inspect (with or without leading /)
    #[arg()]
    channel: Option<String>,
}

fn main() {
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("{}: {e}", "error".red().bold());
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), Box<dyn std::error::Error>> {
    let names = match &args.channel {
        Some(name) => {
            let name = if name.starts_with('/') {
                name.clone()
            } else {
                format!("/{name}")
            };
            vec![name]
        }
        None => scan_channels(&args.prefix)?,
    };

    if names.is_empty() {
        println!("{}", "no rtbus channel regions found".yellow());
        return Ok(());
    }

    for name in names {
        inspect_channel(&name, args);
        println!();
    }

    Ok(())
}

fn scan_channels(prefix: &str) -> Result<Vec<String>, Box<dyn std::error::Error>> {
    let shm_dir = Path::new("/dev/shm");
    if !shm_dir.exists() {
        return Err("shared memory directory /dev/shm not found".into());
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(shm_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with(prefix) {
            names.push(format!("/{name}"));
        }
    }
    names.sort();
    Ok(names)
}

fn inspect_channel(name: &str, args: &Args) {
    let display = name.trim_start_matches('/');

    let (config, initialized) = match Channel::peek_config(name) {
        Ok(peeked) => peeked,
        Err(e) => {
            println!("  {} {display}: {e}", "UNREADABLE".red());
            return;
        }
    };

    if let Err(e) = config.validate() {
        println!("  {} {display}: {e}", "GARBAGE HEADER".red());
        return;
    }

    let file_size = fs::metadata(format!("/dev/shm/{display}"))
        .map(|m| m.len() as usize)
        .unwrap_or(0);
    let expected_size = region_size(&config);

    let status = if !initialized {
        "UNINITIALIZED".yellow()
    } else if file_size != expected_size {
        "SIZE MISMATCH".red()
    } else {
        "OK".green()
    };

    println!("  [{status}] {} ({file_size} bytes)", display.cyan());
    println!(
        "      queue_size={} message_data_size={} senders={} pinners={} watchers={}",
        config.queue_size,
        config.message_data_size,
        config.num_senders,
        config.num_pinners,
        config.num_watchers,
    );

    if !initialized || file_size != expected_size {
        return;
    }

    if args.verbose || args.dump_data {
        let channel = match Channel::open_or_create(name, config) {
            Ok(channel) => channel,
            Err(e) => {
                println!("      {}: {e}", "attach failed".red());
                return;
            }
        };
        let options = DumpOptions {
            dump_data: args.dump_data,
        };
        let stdout = std::io::stdout();
        if let Err(e) = dump_channel(&channel, &options, &mut stdout.lock()) {
            println!("      {}: {e}", "dump failed".red());
        }
    }
}
