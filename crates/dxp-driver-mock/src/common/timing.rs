//! Timing presets for the simulated bus.
//!
//! The simulator never sleeps: [`SimulatedBus::wait`](crate::SimulatedBus)
//! advances a virtual clock, so even the hardware defaults run instantly.
//! The presets differ in how many polls a timeout allows.

use dxp_core::TimingConfig;
use std::time::Duration;

/// Hardware timing as shipped.
pub fn realistic() -> TimingConfig {
    TimingConfig::default()
}

/// Short budgets for tests that expect a timeout.
pub fn fast() -> TimingConfig {
    TimingConfig {
        fpga_settle: Duration::from_millis(1),
        fpga_done_timeout: Duration::from_millis(10),
        fpga_done_poll: Duration::from_millis(1),
        dsp_arm_wait: Duration::from_millis(1),
        dsp_ready_attempts: 5,
        dsp_ready_interval: Duration::from_millis(1),
        sleep_timeout: Duration::from_millis(10),
        sleep_divisions: 10,
        memory_busy_attempts: 10,
        memory_busy_interval: Duration::from_millis(1),
    }
}
