//! System configuration.
//!
//! A [`SystemConfig`] describes interfaces, modules and firmware assignments,
//! plus the timing constants used by download and control-task polling.
//! Sources are layered with figment:
//!
//! 1. Built-in defaults
//! 2. A TOML file
//! 3. `DXP_`-prefixed environment variables (`DXP_TIMING__FPGA_SETTLE=0.1`)
//!
//! # Example
//!
//! ```toml
//! [[interface]]
//! name = "epp"
//! bus = "sim"
//! max_block = 64
//!
//! [[module]]
//! board_type = "dxpx10p"
//! interface = "epp"
//! iostring = "0x378"
//! channels = 1
//! detectors = [0]
//! dsp = "x10p.dsp"
//! fippi = "fxpd0g.fip"
//! defaults = "NULL"
//! ```

use crate::error::{DxpError, Result};
use crate::locate::FileLocator;
use crate::poll::{duration_secs, PollPolicy};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "DXP_";

/// Complete system description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    /// Bus interfaces
    #[serde(rename = "interface")]
    pub interfaces: Vec<InterfaceConfig>,
    /// Modules attached to those interfaces
    #[serde(rename = "module")]
    pub modules: Vec<ModuleConfig>,
    /// Polling and settle times
    pub timing: TimingConfig,
    /// File search roots
    pub search: SearchConfig,
}

/// One bus interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterfaceConfig {
    /// Name referenced by modules
    pub name: String,
    /// Bus implementation to instantiate
    pub bus: String,
    /// Transfer size limit (0 = unlimited)
    #[serde(default)]
    pub max_block: i64,
}

/// One module and its firmware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleConfig {
    /// Hardware family name
    pub board_type: String,
    /// Interface name
    pub interface: String,
    /// Bus address string
    pub iostring: String,
    /// Channel count
    pub channels: usize,
    /// Detector number per channel
    pub detectors: Vec<i32>,
    /// DSP program source id
    #[serde(default)]
    pub dsp: Option<String>,
    /// FPGA bitstream source id
    #[serde(default)]
    pub fippi: Option<String>,
    /// Defaults source id
    #[serde(default)]
    pub defaults: Option<String>,
    /// Channels excluded from acquisition
    #[serde(default)]
    pub disabled_channels: Vec<usize>,
}

/// Settle times and poll budgets for downloads and control tasks.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Wait after asserting FPGA reset
    #[serde(with = "duration_secs")]
    pub fpga_settle: Duration,
    /// Total wait for the FPGA done flag
    #[serde(with = "duration_secs")]
    pub fpga_done_timeout: Duration,
    /// FPGA done flag poll interval
    #[serde(with = "duration_secs")]
    pub fpga_done_poll: Duration,
    /// Wait after arming the DSP boot vector
    #[serde(with = "duration_secs")]
    pub dsp_arm_wait: Duration,
    /// BUSY polls after a DSP download
    pub dsp_ready_attempts: u32,
    /// Interval between those polls
    #[serde(with = "duration_secs")]
    pub dsp_ready_interval: Duration,
    /// Total wait for the DSP to enter or leave sleep
    #[serde(with = "duration_secs")]
    pub sleep_timeout: Duration,
    /// Polls within `sleep_timeout`
    pub sleep_divisions: u32,
    /// BUSY polls per memory transfer chunk
    pub memory_busy_attempts: u32,
    /// Interval between those polls
    #[serde(with = "duration_secs")]
    pub memory_busy_interval: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            fpga_settle: Duration::from_millis(50),
            fpga_done_timeout: Duration::from_secs(1),
            fpga_done_poll: Duration::from_millis(1),
            dsp_arm_wait: Duration::from_millis(1),
            dsp_ready_attempts: 50,
            dsp_ready_interval: Duration::from_millis(500),
            sleep_timeout: Duration::from_secs(2),
            sleep_divisions: 10,
            memory_busy_attempts: 1000,
            memory_busy_interval: Duration::from_millis(1),
        }
    }
}

impl TimingConfig {
    /// Poll policy for the FPGA done flag.
    pub fn fpga_done_policy(&self) -> PollPolicy {
        PollPolicy::from_timeout(self.fpga_done_timeout, self.fpga_done_poll)
    }

    /// Poll policy for DSP readiness after a download.
    pub fn dsp_ready_policy(&self) -> PollPolicy {
        PollPolicy::new(self.dsp_ready_interval, self.dsp_ready_attempts)
    }

    /// Poll policy for entering or leaving DSP sleep.
    pub fn sleep_policy(&self) -> PollPolicy {
        PollPolicy::divided(self.sleep_timeout, self.sleep_divisions)
    }

    /// Poll policy for memory task completion.
    pub fn memory_busy_policy(&self) -> PollPolicy {
        PollPolicy::new(self.memory_busy_interval, self.memory_busy_attempts)
    }
}

/// File search roots; unset roots fall back to `XIAHOME`/`DXPHOME`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Primary installation root
    pub xiahome: Option<PathBuf>,
    /// Secondary installation root
    pub dxphome: Option<PathBuf>,
}

impl SearchConfig {
    /// File locator for these roots.
    pub fn locator(&self) -> FileLocator {
        FileLocator::with_roots(self.xiahome.clone(), self.dxphome.clone())
    }
}

impl SystemConfig {
    /// Load from `path`, layered over defaults and under `DXP_` env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DxpError::Config {
                message: format!("config file not found: {}", path.display()),
            });
        }
        debug!(path = %path.display(), "Loading system config");
        let figment = Figment::from(Serialized::defaults(SystemConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));
        let config = Self::extract(figment)?;
        info!(
            path = %path.display(),
            interfaces = config.interfaces.len(),
            modules = config.modules.len(),
            "Loaded system config"
        );
        Ok(config)
    }

    /// Parse from a TOML string (no environment overrides).
    pub fn from_toml_str(toml: &str) -> Result<Self> {
        let figment =
            Figment::from(Serialized::defaults(SystemConfig::default())).merge(Toml::string(toml));
        Self::extract(figment)
    }

    fn extract(figment: Figment) -> Result<Self> {
        let config: SystemConfig = figment.extract().map_err(|e| DxpError::Config {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DxpError::Config {
            message: e.to_string(),
        })
    }

    /// Cross-field checks.
    pub fn validate(&self) -> Result<()> {
        let mut interfaces = HashSet::new();
        for iface in &self.interfaces {
            if !interfaces.insert(iface.name.as_str()) {
                return Err(config_err(format!("duplicate interface '{}'", iface.name)));
            }
        }

        let mut detectors = HashSet::new();
        for (i, module) in self.modules.iter().enumerate() {
            if module.channels == 0 {
                return Err(config_err(format!(
                    "module {i} ('{}') has no channels",
                    module.iostring
                )));
            }
            if module.detectors.len() != module.channels {
                return Err(config_err(format!(
                    "module {i} ('{}') declares {} channels but {} detectors",
                    module.iostring,
                    module.channels,
                    module.detectors.len()
                )));
            }
            if !interfaces.contains(module.interface.as_str()) {
                return Err(config_err(format!(
                    "module {i} ('{}') references undeclared interface '{}'",
                    module.iostring, module.interface
                )));
            }
            if let Some(&ch) = module.disabled_channels.iter().find(|&&ch| ch >= module.channels) {
                return Err(config_err(format!(
                    "module {i} ('{}') disables nonexistent channel {ch}",
                    module.iostring
                )));
            }
            for &det in &module.detectors {
                if !detectors.insert(det) {
                    return Err(config_err(format!("detector {det} is assigned twice")));
                }
            }
        }
        Ok(())
    }
}

fn config_err(message: String) -> DxpError {
    DxpError::Config { message }
}
