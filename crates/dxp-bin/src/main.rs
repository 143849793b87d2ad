//! `dxp-tool`: offline utilities for DXP installations.
//!
//! - `fdd`: search, extend and extract firmware databases
//! - `check`: validate a system configuration and load every firmware image
//!   it references, optionally downloading them to simulated modules
//!
//! # Usage
//!
//! ```bash
//! dxp-tool fdd xia.fdd find --type fippi --pt 2.0 -k reset
//! dxp-tool fdd xia.fdd add --source f01x2p0g.fip --type fippi --ptmin 0.25 --ptmax 1.0 -k reset
//! dxp-tool check dxp.toml --simulate
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use dxp_core::{
    Bus, ChannelSlot, DriverContract, DxpSystem, FirmwareKind, InterfaceConfig, SystemConfig,
};
use dxp_driver_mock::SimulatedBus;
use dxp_driver_xia::{Dxp4c2x, Dxp4c2xDriver, Family, X10pDriver};
use dxp_fdd::FirmwareDatabase;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "dxp-tool")]
#[command(
    about = "Firmware database and configuration utilities for DXP modules",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Operate on a firmware database file
    Fdd {
        /// Path to the .fdd file
        database: PathBuf,

        #[command(subcommand)]
        action: FddCommand,
    },

    /// Validate a system configuration and load its firmware
    Check {
        /// Path to the TOML system configuration
        config: PathBuf,

        /// Download everything to simulated modules after loading
        #[arg(long)]
        simulate: bool,
    },
}

#[derive(Subcommand)]
enum FddCommand {
    /// Find the section serving a peaking time
    Find {
        /// Firmware type (fippi, dsp, ...)
        #[arg(long = "type")]
        firmware_type: String,
        /// Peaking time
        #[arg(long)]
        pt: f64,
        /// Selection keywords
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
    },

    /// Append a firmware file as a new section
    Add {
        /// Firmware file to append
        #[arg(long)]
        source: PathBuf,
        /// Firmware type
        #[arg(long = "type")]
        firmware_type: String,
        /// Lower peaking-time bound
        #[arg(long)]
        ptmin: f64,
        /// Upper peaking-time bound
        #[arg(long)]
        ptmax: f64,
        /// Selection keywords
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
        /// Filter parameter values
        #[arg(long = "filter")]
        filters: Vec<u16>,
        /// Create the database if it does not exist
        #[arg(long)]
        create: bool,
    },

    /// Write the matching firmware to a standalone file
    Extract {
        /// Firmware type
        #[arg(long = "type")]
        firmware_type: String,
        /// Peaking time
        #[arg(long)]
        pt: f64,
        /// Selection keywords
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
        /// Detector type, added to the keywords
        #[arg(long)]
        detector_type: String,
        /// Output directory
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Print the filter parameters serving a peaking time
    Filters {
        /// Firmware type (fippi or fippi_a)
        #[arg(long = "type", default_value = "fippi")]
        firmware_type: String,
        /// Peaking time
        #[arg(long)]
        pt: f64,
        /// Selection keywords
        #[arg(short, long = "keyword")]
        keywords: Vec<String>,
    },

    /// List every section
    List {
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Fdd { database, action } => run_fdd(&database, action),
        Commands::Check { config, simulate } => run_check(&config, simulate),
    }
}

fn run_fdd(database: &Path, action: FddCommand) -> Result<()> {
    let open = || {
        FirmwareDatabase::open(database)
            .with_context(|| format!("Failed to open firmware database {}", database.display()))
    };

    match action {
        FddCommand::Find {
            firmware_type,
            pt,
            keywords,
        } => {
            let fdd = open()?;
            match fdd.find(&firmware_type, pt, None, &keywords)? {
                Some(found) => {
                    let kind = if found.exact { "exact" } else { "partial" };
                    println!("{} ({kind} match, line {})", found.raw_filename, found.record.line);
                }
                None => bail!("No '{firmware_type}' section serves peaking time {pt}"),
            }
        }
        FddCommand::Add {
            source,
            firmware_type,
            ptmin,
            ptmax,
            keywords,
            filters,
            create,
        } => {
            let fdd = if create {
                FirmwareDatabase::create(database)
                    .with_context(|| format!("Failed to create {}", database.display()))?
            } else {
                open()?
            };
            fdd.add_firmware(&source, &firmware_type, ptmin, ptmax, &keywords, &filters)
                .with_context(|| format!("Failed to add {}", source.display()))?;
            println!(
                "Added {} as '{firmware_type}' [{ptmin}, {ptmax}] to {}",
                source.display(),
                database.display()
            );
        }
        FddCommand::Extract {
            firmware_type,
            pt,
            keywords,
            detector_type,
            out_dir,
        } => {
            let path =
                open()?.get_firmware(&firmware_type, pt, &keywords, &detector_type, &out_dir)?;
            println!("{}", path.display());
        }
        FddCommand::Filters {
            firmware_type,
            pt,
            keywords,
        } => {
            let filters = open()?.filter_info(&firmware_type, pt, &keywords)?;
            let values: Vec<String> = filters.iter().map(u16::to_string).collect();
            println!("{} filter parameters: {}", filters.len(), values.join(" "));
        }
        FddCommand::List { json } => {
            let records = open()?.records()?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else {
                for r in &records {
                    println!(
                        "{:>5}  {:<12} ({:>9.4}, {:>9.4}]  [{}]  {} lines  {}",
                        r.line,
                        r.firmware_type,
                        r.ptmin,
                        r.ptmax,
                        r.keywords.join(","),
                        r.payload.len(),
                        r.raw_filename
                    );
                }
                println!("{} sections", records.len());
            }
        }
    }
    Ok(())
}

fn run_check(path: &Path, simulate: bool) -> Result<()> {
    let config = SystemConfig::load(path)
        .with_context(|| format!("Invalid configuration {}", path.display()))?;
    let drivers: Vec<Arc<dyn DriverContract>> = vec![
        Arc::new(X10pDriver::new(config.timing)),
        Arc::new(Dxp4c2xDriver::new(config.timing)),
    ];

    // No physical transports are available offline, so every interface is
    // backed by a simulated bus wide enough for either family.
    let mut system = DxpSystem::from_config(&config, drivers, |iface: &InterfaceConfig| {
        debug!(interface = %iface.name, bus = %iface.bus, "Substituting simulated bus");
        Ok(Arc::new(SimulatedBus::new().with_channels(Dxp4c2x::CHANNELS)) as Arc<dyn Bus>)
    })
    .context("Failed to build the system")?;

    for board in system.registry().boards() {
        println!(
            "module {} ({} on {}): {} channel(s)",
            board.iostring(),
            board.board_type().name(),
            board.interface(),
            board.channel_count()
        );
        for (ch, slot) in board.channels().iter().enumerate() {
            println!("  ch{ch} -> detector {}{}", slot.detector, describe(slot));
        }
    }
    println!("{} distinct firmware image(s) loaded", system.registry().firmware_count());

    if simulate {
        system.download_all().context("Simulated download failed")?;
        for &detector in system.detectors().detectors() {
            println!("detector {detector}: DSP {:?}", system.dsp_state(detector)?);
        }
    }
    info!(path = %path.display(), "Configuration OK");
    Ok(())
}

fn describe(slot: &ChannelSlot) -> String {
    let mut out = String::new();
    if !slot.enabled {
        out.push_str(" [disabled]");
    }
    for kind in [FirmwareKind::Fpga, FirmwareKind::Dsp, FirmwareKind::Defaults] {
        if let Some(image) = slot.firmware(kind) {
            out.push_str(&format!("\n      {kind}: {} ({} words", image.source_id(), image.len()));
            if let Some(symbols) = image.symbols() {
                out.push_str(&format!(", {} symbols", symbols.len()));
            }
            if kind == FirmwareKind::Defaults {
                out.push_str(&format!(", {} values", image.default_values().len()));
            }
            out.push(')');
        }
    }
    out
}
