//! `dxp-core`
//!
//! Hardware-independent core for XIA DXP pulse-processing modules.
//!
//! This crate owns the registry of hardware families, interfaces, boards and
//! loaded firmware; the chunked download engine; the per-board run and
//! control-task state machines; and the detector-addressed [`DxpSystem`]
//! facade. Hardware families plug in through [`DriverContract`] and physical
//! buses through [`Bus`].
//!
//! ## Architecture
//!
//! - **Bus**: raw word transfers to one module ([`Bus`], [`BoardIo`])
//! - **DriverContract**: one implementation per hardware family, selected by name
//! - **ModuleRegistry**: board types, interfaces, boards and deduplicated firmware
//! - **DxpSystem**: detector numbers resolved to board channels
//!
//! ## Key Types
//!
//! - [`FirmwareImage`]: immutable DSP program, FPGA bitstream or defaults set
//! - [`Board`]: one module with its channel slots and run state
//! - [`ControlTaskRunner`]: `begin → wait → data → end` lifecycle
//! - [`DxpError`]: error type with a coarse [`ErrorKind`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use dxp_core::{DxpSystem, SystemConfig};
//!
//! let config = SystemConfig::load("dxp.toml".as_ref())?;
//! let mut system = DxpSystem::from_config(&config, drivers, |iface| make_bus(iface))?;
//! system.download_all()?;
//! system.start_run(false, false)?;
//! ```

pub mod board;
pub mod bus;
pub mod config;
pub mod control_task;
pub mod detector;
pub mod download;
pub mod driver;
pub mod error;
pub mod firmware;
pub mod locate;
pub mod poll;
pub mod registry;
pub mod run;
pub mod symbols;
pub mod system;

pub use board::{ActiveTask, Board, BoardState, ChannelSel, ChannelSlot, DownloadState, RunState};
pub use bus::{BoardIo, Bus, BusHandle, IoBuffer};
pub use config::{InterfaceConfig, ModuleConfig, SearchConfig, SystemConfig, TimingConfig};
pub use control_task::{
    wait_for_busy, ControlTaskRunner, TaskParams, TaskPhase, TaskType, BUSY_SYMBOL,
};
pub use detector::{ChannelAddr, DetectorMap};
pub use download::{chunk_plan, Chunk, DownloadEngine};
pub use driver::{DeviceFault, DriverContract, SymbolWarning};
pub use error::{DxpError, ErrorKind, Result};
pub use firmware::{
    parse_defaults, DefaultValue, FirmwareImage, FirmwareInfo, FirmwareKind, SharedFirmware,
    NULL_SOURCE,
};
pub use locate::FileLocator;
pub use poll::{poll_until, PollPolicy};
pub use registry::ModuleRegistry;
pub use run::RunStatus;
pub use symbols::{combine_words, split_words, Access, Symbol, SymbolLookup, SymbolTable};
pub use system::DxpSystem;
