//! Simulated DXP hardware for testing without physical modules.
//!
//! [`SimulatedBus`] stands in for a physical transport and models enough of
//! the DXP-X10P and DXP-4C2X (DSP memory, CSR, FiPPI, control tasks, external
//! memory) for the real [`X10pDriver`](dxp_driver_xia::X10pDriver) and
//! [`Dxp4c2xDriver`](dxp_driver_xia::Dxp4c2xDriver) to run against it
//! unchanged.
//!
//! # Components
//!
//! - [`SimulatedBus`]: the bus, with a transfer log and a virtual clock
//! - [`fixtures`]: DSP program, FiPPI and defaults sources matching the
//!   simulator's parameter layout
//! - [`common`]: fault injection ([`ErrorConfig`]), seeded RNG and timing
//!   presets
//!
//! # Example
//!
//! ```rust,ignore
//! use dxp_driver_mock::{fixtures, ErrorConfig, ErrorScenario, SimulatedBus};
//!
//! let bus = SimulatedBus::new()
//!     .with_errors(ErrorConfig::scenario(ErrorScenario::FpgaNeverDone));
//! ```

pub mod common;
pub mod fixtures;
mod sim;

pub use common::{ErrorConfig, ErrorScenario, MockRng};
pub use sim::{
    adc_trace, Direction, DspMode, SimulatedBus, Transfer, BUSY_WORKING, DEFAULT_HISTORY_LEN,
    DEFAULT_HISTORY_START,
};
