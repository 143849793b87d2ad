//! Flat-file firmware database (FDD).
//!
//! A firmware database bundles many FiPPI/DSP images into one text file,
//! each tagged with a firmware type, selection keywords and the peaking-time
//! range it serves. [`FirmwareDatabase`] searches it, appends new sections and
//! extracts a matching image to a standalone file that the normal firmware
//! loaders can read.
//!
//! # Example
//!
//! ```rust,ignore
//! use dxp_fdd::FirmwareDatabase;
//!
//! let fdd = FirmwareDatabase::open("xia.fdd")?;
//! let path = fdd.get_firmware("fippi", 2.0, &["reset"], "reset", tmp_dir)?;
//! // ... load `path` ...
//! FirmwareDatabase::clean_firmware(&path)?;
//! ```

mod database;
mod error;
mod record;

pub use database::{FddMatch, FirmwareDatabase, EXTRACT_PREFIX};
pub use error::{FddError, Result};
pub use record::{FddRecord, KeywordMatch, Sections, FILTER_TYPES, SECTION_DELIMITER};
