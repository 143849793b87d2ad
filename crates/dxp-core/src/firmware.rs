//! Firmware images.
//!
//! A [`FirmwareImage`] is immutable once loaded and shared between boards as a
//! [`SharedFirmware`] handle. Three kinds exist: DSP programs (payload plus a
//! [`SymbolTable`]), FPGA bitstreams (payload only) and default-value sets
//! (named parameter values applied after a DSP download).
//!
//! Program and bitstream formats are family-specific and parsed by the
//! driver; the defaults format is shared and parsed by [`parse_defaults`].

use crate::error::{DxpError, Result};
use crate::symbols::SymbolTable;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::BufRead;
use std::sync::Arc;

/// Source id meaning "no defaults file".
pub const NULL_SOURCE: &str = "NULL";

/// Shared, reference-counted firmware handle.
pub type SharedFirmware = Arc<FirmwareImage>;

/// Kind of firmware image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FirmwareKind {
    /// DSP program with symbol table
    Dsp,
    /// FPGA (FiPPI) configuration bitstream
    Fpga,
    /// Default parameter values
    Defaults,
}

impl fmt::Display for FirmwareKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dsp => write!(f, "dsp"),
            Self::Fpga => write!(f, "fippi"),
            Self::Defaults => write!(f, "defaults"),
        }
    }
}

/// Allocation limits reported by a hardware family before parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareInfo {
    /// Longest DSP program, in words
    pub max_program_len: usize,
    /// Most symbols in one table
    pub max_symbols: usize,
    /// Longest symbol name
    pub max_symbol_name_len: usize,
}

/// One `name value` pair from a defaults file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultValue {
    /// Uppercased symbol name
    pub name: String,
    /// Value to write
    pub value: u16,
}

/// Immutable firmware image.
#[derive(Debug, Clone, PartialEq)]
pub struct FirmwareImage {
    source_id: String,
    kind: FirmwareKind,
    payload: Vec<u16>,
    max_len: usize,
    symbols: Option<SymbolTable>,
    defaults: Vec<DefaultValue>,
}

impl FirmwareImage {
    /// DSP program image.
    pub fn program(
        source_id: impl Into<String>,
        payload: Vec<u16>,
        max_len: usize,
        symbols: SymbolTable,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            kind: FirmwareKind::Dsp,
            payload,
            max_len,
            symbols: Some(symbols),
            defaults: Vec::new(),
        }
    }

    /// FPGA bitstream image.
    pub fn bitstream(source_id: impl Into<String>, payload: Vec<u16>) -> Self {
        let max_len = payload.len();
        Self {
            source_id: source_id.into(),
            kind: FirmwareKind::Fpga,
            payload,
            max_len,
            symbols: None,
            defaults: Vec::new(),
        }
    }

    /// Default-value set.
    pub fn defaults(source_id: impl Into<String>, values: Vec<DefaultValue>) -> Self {
        Self {
            source_id: source_id.into(),
            kind: FirmwareKind::Defaults,
            payload: Vec::new(),
            max_len: values.len(),
            symbols: None,
            defaults: values,
        }
    }

    /// Identity used for de-duplication.
    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    /// Image kind.
    pub fn kind(&self) -> FirmwareKind {
        self.kind
    }

    /// Raw payload words.
    pub fn payload(&self) -> &[u16] {
        &self.payload
    }

    /// Payload length in words.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True if the image carries no payload.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Allocation size requested from the family at load time.
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Symbol table of a DSP program.
    pub fn symbols(&self) -> Option<&SymbolTable> {
        self.symbols.as_ref()
    }

    /// Values of a defaults image.
    pub fn default_values(&self) -> &[DefaultValue] {
        &self.defaults
    }
}

/// Parse a defaults file: `name value` lines, `*` comments, terminated by a
/// line reading `END`. Values ending in `h`/`H` are hexadecimal.
pub fn parse_defaults<R: BufRead>(source_id: &str, reader: R) -> Result<FirmwareImage> {
    let mut values = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('*') {
            continue;
        }
        if line.eq_ignore_ascii_case("END") {
            break;
        }
        let mut fields = line.split_whitespace();
        let (Some(name), Some(raw)) = (fields.next(), fields.next()) else {
            return Err(malformed(source_id, lineno, "expected 'name value'"));
        };
        let value = parse_default_value(raw)
            .ok_or_else(|| malformed(source_id, lineno, &format!("invalid value '{raw}'")))?;
        values.push(DefaultValue {
            name: name.to_ascii_uppercase(),
            value,
        });
    }
    Ok(FirmwareImage::defaults(source_id, values))
}

fn parse_default_value(raw: &str) -> Option<u16> {
    if let Some(hex) = raw.strip_suffix(['h', 'H']) {
        return u16::from_str_radix(hex, 16).ok();
    }
    // Decimal values may carry a fractional part; truncate like the DSP does.
    raw.parse::<u16>()
        .ok()
        .or_else(|| {
            raw.parse::<f64>()
                .ok()
                .filter(|v| (0.0..=65535.0).contains(v))
                .map(|v| v as u16)
        })
}

fn malformed(source_id: &str, lineno: usize, message: &str) -> DxpError {
    DxpError::LoadError {
        source_id: source_id.to_string(),
        message: format!("line {}: {message}", lineno + 1),
    }
}
