//! Shared simulator infrastructure.
//!
//! - **errors**: fault injection
//! - **rng**: seeded random number generator
//! - **timing**: [`TimingConfig`](dxp_core::TimingConfig) presets

pub mod errors;
pub mod rng;
pub mod timing;

pub use errors::{ErrorConfig, ErrorScenario};
pub use rng::MockRng;
