//! `dxp-driver-xia`
//!
//! Drivers for the XIA DXP digital x-ray processors: the single-channel
//! DXP-X10P and the four-channel DXP-4C2X.
//!
//! ## Modules
//!
//! - [`registers`]: port numbers, memory layout and CSR/RUNTASKS bit layouts
//! - [`parse`]: DSP program and FiPPI bitstream parsers
//! - [`family`]: per-family name and channel count
//!
//! ## Example
//!
//! ```rust,ignore
//! use dxp_core::{ModuleRegistry, TimingConfig};
//! use dxp_driver_xia::{Dxp4c2xDriver, X10pDriver};
//! use std::sync::Arc;
//!
//! let mut registry = ModuleRegistry::new(locator);
//! registry.register_board_type(Arc::new(X10pDriver::new(TimingConfig::default())));
//! registry.register_board_type(Arc::new(Dxp4c2xDriver::new(TimingConfig::default())));
//! ```

pub mod family;
pub mod parse;
pub mod registers;

mod driver;

pub use driver::{Dxp4c2xDriver, X10pDriver, XiaDriver};
pub use family::{Dxp4c2x, Family, X10p};
