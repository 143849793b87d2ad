//! Firmware database errors.

use dxp_core::DxpError;
use std::path::PathBuf;

/// Errors raised while searching or maintaining a firmware database.
#[derive(Debug, thiserror::Error)]
pub enum FddError {
    /// No section satisfies the query
    #[error("no firmware in {} matches {query}", database.display())]
    NotFound {
        /// Database file searched
        database: PathBuf,
        /// Human-readable query description
        query: String,
    },

    /// File could not be read, written or removed
    #[error("{}: {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// The database text does not follow the section layout
    #[error("{}:{line}: {message}", path.display())]
    Malformed {
        /// Database file
        path: PathBuf,
        /// 1-based line number
        line: usize,
        /// What was wrong
        message: String,
    },

    /// An insertion's peaking-time range clashes with an existing section
    #[error("'{firmware_type}' range [{ptmin}, {ptmax}] overlaps existing section '{existing}'")]
    PeakingTimeOverlap {
        /// Firmware type being inserted
        firmware_type: String,
        /// Requested lower bound
        ptmin: f64,
        /// Requested upper bound
        ptmax: f64,
        /// Raw filename of the clashing section
        existing: String,
    },

    /// An identical definition is already present
    #[error("firmware definition already exists as '{raw_filename}'")]
    AlreadyExists {
        /// Raw filename of the existing section
        raw_filename: String,
    },

    /// Caller supplied an unusable argument
    #[error("bad parameter: {message}")]
    BadParameter {
        /// Description
        message: String,
    },
}

impl FddError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn bad_parameter(message: impl Into<String>) -> Self {
        Self::BadParameter {
            message: message.into(),
        }
    }
}

/// Result alias for database operations.
pub type Result<T> = std::result::Result<T, FddError>;

impl From<FddError> for DxpError {
    fn from(err: FddError) -> Self {
        match err {
            FddError::PeakingTimeOverlap {
                firmware_type,
                ptmin,
                ptmax,
                ..
            } => DxpError::PeakingTimeOverlap {
                firmware_type,
                ptmin,
                ptmax,
            },
            FddError::BadParameter { message } => DxpError::BadParameter { message },
            FddError::Io { ref path, .. }
            | FddError::Malformed { ref path, .. }
            | FddError::NotFound { database: ref path, .. } => DxpError::LoadError {
                source_id: path.display().to_string(),
                message: err.to_string(),
            },
            FddError::AlreadyExists { ref raw_filename } => DxpError::LoadError {
                source_id: raw_filename.clone(),
                message: err.to_string(),
            },
        }
    }
}
