//! Error injection for the simulated bus.
//!
//! Transfer-level faults ([`ErrorScenario::FailAfterN`],
//! [`ErrorScenario::CommunicationLoss`], random rates) surface as
//! [`DxpError::DeviceIo`] from [`check_operation`](ErrorConfig::check_operation).
//! Behavioural faults ([`ErrorScenario::FpgaNeverDone`],
//! [`ErrorScenario::DspNeverReady`], [`ErrorScenario::ChannelNeverReady`],
//! [`ErrorScenario::RunError`]) are queried by the simulator and change what
//! the module reports instead.

use super::rng::MockRng;
use dxp_core::{DxpError, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Error injection configuration
#[derive(Clone, Debug)]
pub struct ErrorConfig {
    /// Per-operation failure rate (0.0 to 1.0)
    failure_rates: Arc<HashMap<&'static str, f64>>,
    /// Specific failure scenarios
    scenarios: Arc<Vec<ErrorScenario>>,
    /// RNG for failure decisions
    rng: Arc<MockRng>,
    /// State tracking for scenarios
    state: Arc<Mutex<ErrorState>>,
}

/// A scripted fault.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorScenario {
    /// Fail every `operation` after `count` successful ones
    FailAfterN {
        /// `"read"` or `"write"`
        operation: &'static str,
        /// Successful operations before failures start
        count: u32,
    },
    /// First transfer fails and every later one too
    CommunicationLoss,
    /// FiPPI never clears its error bit after a download
    FpgaNeverDone,
    /// DSP never reports BUSY == 0 after boot
    DspNeverReady,
    /// Only the DSP on `channel` never reports BUSY == 0 after boot
    ChannelNeverReady {
        /// Channel whose DSP stays busy
        channel: usize,
    },
    /// DSP boots with a run error latched
    RunError {
        /// `RUNERROR` value
        code: u16,
        /// `ERRINFO` value
        info: u16,
    },
}

#[derive(Default, Debug)]
struct ErrorState {
    operation_counts: HashMap<&'static str, u32>,
    communication_lost: bool,
}

impl ErrorConfig {
    /// No injected errors (default)
    pub fn none() -> Self {
        Self::build(HashMap::new(), Vec::new(), None)
    }

    /// Uniform random transfer failures with a fixed seed
    pub fn random_failures_seeded(rate: f64, seed: Option<u64>) -> Self {
        let mut rates = HashMap::new();
        rates.insert("*", rate);
        Self::build(rates, Vec::new(), seed)
    }

    /// A single scenario
    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    /// Several scenarios
    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self::build(HashMap::new(), scenarios, None)
    }

    /// Custom failure rates per operation
    pub fn with_rates(rates: HashMap<&'static str, f64>) -> Self {
        Self::build(rates, Vec::new(), None)
    }

    fn build(
        rates: HashMap<&'static str, f64>,
        scenarios: Vec<ErrorScenario>,
        seed: Option<u64>,
    ) -> Self {
        Self {
            failure_rates: Arc::new(rates),
            scenarios: Arc::new(scenarios),
            rng: Arc::new(MockRng::new(seed)),
            state: Arc::new(Mutex::new(ErrorState::default())),
        }
    }

    /// Decide whether a transfer on `target` fails.
    pub fn check_operation(&self, target: &str, operation: &'static str) -> Result<()> {
        let mut state = self.state.lock();

        if state.communication_lost {
            return Err(DxpError::device_io(target, "communication lost"));
        }

        for scenario in self.scenarios.iter() {
            match scenario {
                ErrorScenario::FailAfterN { operation: op, count } if *op == operation => {
                    let current = state.operation_counts.entry(operation).or_insert(0);
                    *current += 1;
                    if *current > *count {
                        return Err(DxpError::device_io(
                            target,
                            format!("injected {operation} failure after {count} operations"),
                        ));
                    }
                }
                ErrorScenario::CommunicationLoss => {
                    state.communication_lost = true;
                    return Err(DxpError::device_io(target, "communication lost"));
                }
                _ => {}
            }
        }

        let rate = self
            .failure_rates
            .get(operation)
            .or_else(|| self.failure_rates.get("*"))
            .copied()
            .unwrap_or(0.0);
        if self.rng.should_fail(rate) {
            return Err(DxpError::device_io(
                target,
                format!("random failure on {operation}"),
            ));
        }
        Ok(())
    }

    /// Whether `scenario` is configured.
    pub fn has(&self, scenario: &ErrorScenario) -> bool {
        self.scenarios.contains(scenario)
    }

    /// Run error latched at boot, if any.
    pub fn run_error(&self) -> Option<(u16, u16)> {
        self.scenarios.iter().find_map(|s| match s {
            ErrorScenario::RunError { code, info } => Some((*code, *info)),
            _ => None,
        })
    }

    /// Clear counters and restore communication.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

impl Default for ErrorConfig {
    fn default() -> Self {
        Self::none()
    }
}
