//! DSP program and FiPPI bitstream source parsers.
//!
//! # DSP program
//!
//! ```text
//! * comment lines start with '*'
//! 3                  <- symbol count
//! BUSY -             <- name, access ('-' read-only, 'w' write-only)
//! GAIN * 10 200      <- name, access, lower bound, upper bound
//! RUNERROR
//! 0A1B2C3D4E5F       <- program: 6 hex digits per instruction
//! ```
//!
//! Each 6-digit instruction becomes two words: the first four digits and the
//! last two. A symbol's address is its position in the table.
//!
//! # FiPPI bitstream
//!
//! Hex byte pairs, packed into 16-bit words low byte first.

use crate::registers::{MAX_DSP_PROGRAM_LEN, MAX_DSP_SYMBOLS, MAX_SYMBOL_NAME_LEN};
use dxp_core::{Access, DxpError, FirmwareImage, FirmwareInfo, Result, Symbol, SymbolTable};
use std::io::BufRead;
use tracing::debug;

/// Family sizing reported before parsing.
pub fn firmware_info() -> FirmwareInfo {
    FirmwareInfo {
        max_program_len: MAX_DSP_PROGRAM_LEN,
        max_symbols: MAX_DSP_SYMBOLS,
        max_symbol_name_len: MAX_SYMBOL_NAME_LEN,
    }
}

/// Parse a DSP program source.
pub fn parse_dsp_program(
    source_id: &str,
    reader: &mut dyn BufRead,
    info: &FirmwareInfo,
) -> Result<FirmwareImage> {
    let mut lines = numbered_lines(source_id, reader);

    let (count_line, count_text) = loop {
        match lines.next().transpose()? {
            Some((_, line)) if is_comment(&line) || line.trim().is_empty() => continue,
            Some(entry) => break entry,
            None => return Err(load_error(source_id, "missing symbol count")),
        }
    };
    let nsymbols: usize = count_text
        .split_whitespace()
        .next()
        .and_then(|t| t.parse().ok())
        .ok_or_else(|| load_error(source_id, format!("line {count_line}: invalid symbol count")))?;
    if nsymbols > info.max_symbols {
        return Err(DxpError::OutOfMemory {
            source_id: source_id.to_string(),
            what: "symbol table",
            requested: nsymbols,
            limit: info.max_symbols,
        });
    }

    let mut table = SymbolTable::new(info.max_symbol_name_len);
    for index in 0..nsymbols {
        let (lineno, line) = lines
            .next()
            .transpose()?
            .ok_or_else(|| {
                load_error(source_id, format!("expected {nsymbols} symbols, found {index}"))
            })?;
        let symbol = parse_symbol_line(&line, index)
            .map_err(|message| load_error(source_id, format!("line {lineno}: {message}")))?;
        if symbol.name.len() > info.max_symbol_name_len {
            return Err(DxpError::OutOfMemory {
                source_id: source_id.to_string(),
                what: "symbol name",
                requested: symbol.name.len(),
                limit: info.max_symbol_name_len,
            });
        }
        table
            .push(symbol)
            .map_err(|e| load_error(source_id, format!("line {lineno}: {e}")))?;
    }

    let mut payload = Vec::new();
    for entry in lines {
        let (lineno, line) = entry?;
        let digits = hex_prefix(&line);
        if digits.is_empty() {
            continue;
        }
        for group in digits.as_bytes().chunks(6) {
            if group.len() != 6 {
                return Err(load_error(
                    source_id,
                    format!("line {lineno}: program word is not 6 hex digits"),
                ));
            }
            let (hi, lo) = group.split_at(4);
            payload.push(hex_word(hi, source_id, lineno)?);
            payload.push(hex_word(lo, source_id, lineno)?);
        }
        if payload.len() > info.max_program_len {
            return Err(DxpError::OutOfMemory {
                source_id: source_id.to_string(),
                what: "program",
                requested: payload.len(),
                limit: info.max_program_len,
            });
        }
    }

    debug!(source_id, symbols = table.len(), words = payload.len(), "Parsed DSP program");
    Ok(FirmwareImage::program(source_id, payload, info.max_program_len, table))
}

/// Parse a FiPPI bitstream source.
pub fn parse_fpga_bitstream(source_id: &str, reader: &mut dyn BufRead) -> Result<FirmwareImage> {
    let mut payload: Vec<u16> = Vec::new();
    let mut low_byte = true;
    for entry in numbered_lines(source_id, reader) {
        let (lineno, line) = entry?;
        if is_comment(&line) {
            continue;
        }
        let digits = hex_prefix(&line);
        for pair in digits.as_bytes().chunks(2) {
            let byte = hex_word(pair, source_id, lineno)?;
            if low_byte {
                payload.push(byte);
            } else if let Some(word) = payload.last_mut() {
                *word |= byte << 8;
            }
            low_byte = !low_byte;
        }
    }
    debug!(source_id, words = payload.len(), "Parsed FiPPI bitstream");
    Ok(FirmwareImage::bitstream(source_id, payload))
}

fn parse_symbol_line(line: &str, index: usize) -> std::result::Result<Symbol, String> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    let name = fields.first().ok_or("empty symbol line")?;
    let access = match fields.get(1) {
        Some(&"-") => Access::ReadOnly,
        Some(a) if a.eq_ignore_ascii_case("w") => Access::WriteOnly,
        _ => Access::ReadWrite,
    };
    let (lower_bound, upper_bound) = match fields.len() {
        1 | 2 => (0, 0),
        3 => return Err(format!("symbol '{name}' has a lower bound but no upper bound")),
        _ => (parse_bound(fields[2], name)?, parse_bound(fields[3], name)?),
    };
    let address = u16::try_from(index).map_err(|_| format!("symbol index {index} out of range"))?;
    Ok(Symbol {
        name: (*name).to_string(),
        address,
        access,
        lower_bound,
        upper_bound,
    })
}

fn parse_bound(text: &str, name: &str) -> std::result::Result<u16, String> {
    text.parse()
        .map_err(|_| format!("symbol '{name}' has invalid bound '{text}'"))
}

fn numbered_lines<'a>(
    source_id: &'a str,
    reader: &'a mut dyn BufRead,
) -> impl Iterator<Item = Result<(usize, String)>> + 'a {
    reader.lines().enumerate().map(move |(i, line)| {
        line.map(|l| (i + 1, l))
            .map_err(|e| load_error(source_id, format!("line {}: {e}", i + 1)))
    })
}

fn is_comment(line: &str) -> bool {
    line.starts_with('*')
}

/// Leading run of hex digits after trimming whitespace.
fn hex_prefix(line: &str) -> &str {
    let trimmed = line.trim();
    let end = trimmed
        .find(|c: char| !c.is_ascii_hexdigit())
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}

fn hex_word(digits: &[u8], source_id: &str, lineno: usize) -> Result<u16> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| u16::from_str_radix(s, 16).ok())
        .ok_or_else(|| load_error(source_id, format!("line {lineno}: invalid hex digits")))
}

fn load_error(source_id: &str, message: impl Into<String>) -> DxpError {
    DxpError::LoadError {
        source_id: source_id.to_string(),
        message: message.into(),
    }
}
