//! Command-line entry point: boot two flat-binary guests and time-share
//! one CPU between them.
//!
//! # Usage
//!
//! ```bash
//! # guest1.bin and guest2.bin from the working directory, weights 7:3, 1 s quantum
//! twinvmm
//!
//! # custom images and shares, 10 ms slices, JSON report on exit
//! twinvmm --image-a a.bin --image-b b.bin --weight-a 2 --weight-b 1 \
//!         --quantum-us 10000 --summary-json
//! ```

use anyhow::Context;
use clap::Parser;
use log::info;
use std::path::PathBuf;
use twinvmm::VmmConfig;

#[derive(Parser)]
#[command(name = "twinvmm")]
#[command(about = "Run two flat-binary KVM guests under a weighted round-robin scheduler")]
#[command(version)]
struct Cli {
    /// JSON configuration file; the flags below override its fields.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Flat binary for the first guest.
    #[arg(long)]
    image_a: Option<PathBuf>,

    /// Flat binary for the second guest.
    #[arg(long)]
    image_b: Option<PathBuf>,

    /// Consecutive quanta the first guest keeps the CPU.
    #[arg(long)]
    weight_a: Option<u32>,

    /// Consecutive quanta the second guest keeps the CPU.
    #[arg(long)]
    weight_b: Option<u32>,

    /// Guest memory per VM, in bytes.
    #[arg(long)]
    memory_size: Option<usize>,

    /// Real-mode segment for every segment register (hex accepted).
    #[arg(long, value_parser = parse_u16)]
    code_start: Option<u16>,

    /// Scheduling quantum in microseconds.
    #[arg(short, long)]
    quantum_us: Option<u64>,

    /// Guest-physical address the images are copied to (hex accepted).
    #[arg(long, value_parser = parse_u64)]
    load_addr: Option<u64>,

    /// Pause after each port I/O exit, in milliseconds.
    #[arg(long)]
    io_delay_ms: Option<u64>,

    /// Stop after this many scheduler turns.
    #[arg(long)]
    max_turns: Option<u64>,

    /// Print the run summary as JSON on stdout when the guests stop.
    #[arg(long)]
    summary_json: bool,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<(VmmConfig, bool)> {
        let mut cfg = match &self.config {
            Some(path) => VmmConfig::from_file(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => VmmConfig::default(),
        };
        if let Some(image) = self.image_a {
            cfg.guests[0].image = image;
        }
        if let Some(image) = self.image_b {
            cfg.guests[1].image = image;
        }
        if let Some(w) = self.weight_a {
            cfg.guests[0].weight = w;
        }
        if let Some(w) = self.weight_b {
            cfg.guests[1].weight = w;
        }
        if let Some(size) = self.memory_size {
            cfg.memory_size = size;
        }
        if let Some(cs) = self.code_start {
            cfg.code_start = cs;
        }
        if let Some(q) = self.quantum_us {
            cfg.quantum_us = q;
        }
        if let Some(addr) = self.load_addr {
            cfg.image_load_addr = addr;
        }
        if let Some(ms) = self.io_delay_ms {
            cfg.io_delay_ms = ms;
        }
        if self.max_turns.is_some() {
            cfg.max_turns = self.max_turns;
        }
        Ok((cfg, self.summary_json))
    }
}

fn parse_int<T>(s: &str, from_hex: fn(&str, u32) -> Result<T, std::num::ParseIntError>) -> Result<T, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => from_hex(hex, 16),
        None => from_hex(s, 10),
    };
    parsed.map_err(|e| format!("{}: {}", s, e))
}

fn parse_u16(s: &str) -> Result<u16, String> {
    parse_int(s, u16::from_str_radix)
}

fn parse_u64(s: &str) -> Result<u64, String> {
    parse_int(s, u64::from_str_radix)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let (cfg, summary_json) = cli.into_config()?;
    let summary = twinvmm::run_vmm(&cfg).context("running guests")?;
    if summary_json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        for report in &summary.vms {
            info!(
                "{}: weight {}, {} turns, {}",
                report.vm,
                report.weight,
                report.turns,
                report.exits.snapshot().trim_end()
            );
        }
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("twinvmm: {:#}", e);
        std::process::exit(1);
    }
}
