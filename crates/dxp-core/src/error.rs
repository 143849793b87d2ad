//! Error types for DXP module management.
//!
//! Every fallible operation in this crate reports a specific [`DxpError`]
//! variant rather than a generic failure. [`DxpError::kind`] groups variants
//! into broad [`ErrorKind`] classes for callers that only need to branch on
//! the category (retry a bus failure, surface a caller mistake, ...).

use std::fmt;
use thiserror::Error;

/// Result type alias for DXP operations.
pub type Result<T> = std::result::Result<T, DxpError>;

/// Errors that can occur while managing DXP modules and their firmware.
#[derive(Error, Debug)]
pub enum DxpError {
    /// Firmware or configuration source could not be opened or parsed
    #[error("Failed to load '{source_id}': {message}")]
    LoadError { source_id: String, message: String },

    /// Parsed image exceeds the sizing reported by the hardware family
    #[error("'{source_id}' exceeds the {what} limit ({requested} > {limit})")]
    OutOfMemory {
        source_id: String,
        what: &'static str,
        requested: usize,
        limit: usize,
    },

    /// No driver is registered for this board type
    #[error("Unknown board type '{name}'")]
    UnknownBoardType { name: String },

    /// Symbol is absent from the DSP symbol table (and has no multi-word form)
    #[error("Unknown DSP symbol '{name}'")]
    UnknownSymbol { name: String },

    /// Control task selector is not recognized by the hardware family
    #[error("Unknown control task type {code}")]
    UnknownTaskType { code: i32 },

    /// Detector number is not mapped to any board channel
    #[error("Unknown detector {detector}")]
    UnknownDetector { detector: i32 },

    /// Caller passed an invalid argument
    #[error("Bad parameter: {message}")]
    BadParameter { message: String },

    /// Control task was given fewer info words than it requires
    #[error("Control task {task} requires at least {required} info words, got {provided}")]
    InsufficientParams {
        task: String,
        required: usize,
        provided: usize,
    },

    /// Read from a write-only symbol or write to a read-only symbol
    #[error("Access violation on symbol '{name}': {message}")]
    AccessViolation { name: String, message: String },

    /// Bus transfer failed
    #[error("Device I/O error on {target}: {message}")]
    DeviceIo { target: String, message: String },

    /// FPGA never signalled completion after a download
    #[error("FPGA download to '{module}' did not complete after {attempts} polls")]
    FirmwareTimeout { module: String, attempts: u32 },

    /// DSP never reported ready after a download
    #[error(
        "DSP download to '{module}' channel {channel} did not reach ready after {attempts} polls"
    )]
    DownloadTimeout {
        module: String,
        channel: usize,
        attempts: u32,
    },

    /// A bounded readiness poll was exhausted
    #[error("Timed out waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    /// Operation requires that no run is active
    #[error("Run already active on module '{module}'")]
    RunActive { module: String },

    /// A control task is already in progress on this channel
    #[error("Control task already active on module '{module}' channel {channel}")]
    TaskAlreadyActive { module: String, channel: usize },

    /// No control task is in progress on this channel
    #[error("No control task active on module '{module}' channel {channel}")]
    TaskNotActive { module: String, channel: usize },

    /// DSP program must be downloaded before this operation
    #[error("No DSP program loaded on module '{module}' channel {channel}")]
    DspNotLoaded { module: String, channel: usize },

    /// Firmware database insertion clashes with an existing peaking-time range
    #[error("Peaking time range [{ptmin}, {ptmax}] overlaps an existing '{firmware_type}' entry")]
    PeakingTimeOverlap {
        firmware_type: String,
        ptmin: f64,
        ptmax: f64,
    },

    /// Operation is not implemented by this hardware family
    #[error("Operation '{operation}' is not supported by board type '{board_type}'")]
    NotSupported {
        board_type: String,
        operation: &'static str,
    },

    /// System configuration is invalid
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// I/O error from the operating system
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Broad classification of a [`DxpError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Firmware could not be loaded
    Load,
    /// Identity lookup missed (board type, symbol, task, detector)
    Lookup,
    /// Caller misuse
    InvalidParameter,
    /// Symbol access rules were violated
    Permission,
    /// Bus transfer failure
    Communication,
    /// Bounded poll exhausted
    Timeout,
    /// State machine precondition violated
    State,
    /// Invalid configuration
    Configuration,
    /// Operating system I/O
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Load => write!(f, "load"),
            Self::Lookup => write!(f, "lookup"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::Permission => write!(f, "permission"),
            Self::Communication => write!(f, "communication"),
            Self::Timeout => write!(f, "timeout"),
            Self::State => write!(f, "state"),
            Self::Configuration => write!(f, "configuration"),
            Self::Io => write!(f, "io"),
        }
    }
}

impl DxpError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::LoadError { .. } | Self::OutOfMemory { .. } => ErrorKind::Load,
            Self::UnknownBoardType { .. }
            | Self::UnknownSymbol { .. }
            | Self::UnknownTaskType { .. }
            | Self::UnknownDetector { .. } => ErrorKind::Lookup,
            Self::BadParameter { .. }
            | Self::InsufficientParams { .. }
            | Self::NotSupported { .. } => ErrorKind::InvalidParameter,
            Self::AccessViolation { .. } => ErrorKind::Permission,
            Self::DeviceIo { .. } => ErrorKind::Communication,
            Self::FirmwareTimeout { .. } | Self::DownloadTimeout { .. } | Self::Timeout { .. } => {
                ErrorKind::Timeout
            }
            Self::RunActive { .. }
            | Self::TaskAlreadyActive { .. }
            | Self::TaskNotActive { .. }
            | Self::DspNotLoaded { .. }
            | Self::PeakingTimeOverlap { .. } => ErrorKind::State,
            Self::Config { .. } => ErrorKind::Configuration,
            Self::Io(_) => ErrorKind::Io,
        }
    }

    /// Shorthand for a [`DxpError::BadParameter`].
    pub fn bad_parameter(message: impl Into<String>) -> Self {
        Self::BadParameter {
            message: message.into(),
        }
    }

    /// Shorthand for a [`DxpError::DeviceIo`].
    pub fn device_io(target: impl Into<String>, message: impl Into<String>) -> Self {
        Self::DeviceIo {
            target: target.into(),
            message: message.into(),
        }
    }

    /// Returns true for any of the bounded-poll timeout variants.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}
