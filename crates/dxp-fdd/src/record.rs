//! Section layout and a streaming section reader.
//!
//! A database is plain text. Anything before the first delimiter is ignored;
//! each section is
//!
//! ```text
//! $$$NEW SECTION$$$
//! <raw source filename>
//! <firmware type>
//! <keyword count k>
//! <k keyword lines>
//! <peaking time min>
//! <peaking time max>
//! <filter count n>
//! <n filter values>
//! <payload lines up to the next delimiter or end of file>
//! ```

use crate::error::{FddError, Result};
use serde::Serialize;
use std::io::{BufRead, Lines};
use std::path::{Path, PathBuf};

/// Line that opens every section.
pub const SECTION_DELIMITER: &str = "$$$NEW SECTION$$$";

/// Firmware types that carry filter parameters.
pub const FILTER_TYPES: [&str; 2] = ["fippi", "fippi_a"];

/// One parsed database section.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FddRecord {
    /// Source filename recorded at insertion
    pub raw_filename: String,
    /// Firmware type (`fippi`, `dsp`, `system_fpga`, ...)
    pub firmware_type: String,
    /// Selection keywords
    pub keywords: Vec<String>,
    /// Lower peaking-time bound (exclusive when searching)
    pub ptmin: f64,
    /// Upper peaking-time bound (inclusive when searching)
    pub ptmax: f64,
    /// Filter parameter values
    pub filters: Vec<u16>,
    /// Firmware text, one entry per line
    #[serde(skip)]
    pub payload: Vec<String>,
    /// Line of the section delimiter
    pub line: usize,
}

/// How a section's keywords relate to a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeywordMatch {
    /// Same number of keywords on both sides
    Exact,
    /// Every section keyword was requested, but the query named more
    Partial,
}

impl FddRecord {
    /// Match this section's keywords against `query`.
    ///
    /// Every keyword the section declares must appear in `query`; a section
    /// without keywords matches anything.
    pub fn keyword_match<S: AsRef<str>>(&self, query: &[S]) -> Option<KeywordMatch> {
        let all_present = self
            .keywords
            .iter()
            .all(|k| query.iter().any(|q| q.as_ref() == k));
        if !all_present {
            return None;
        }
        if self.keywords.len() == query.len() {
            Some(KeywordMatch::Exact)
        } else {
            Some(KeywordMatch::Partial)
        }
    }

    /// True if `pt` lies in `(ptmin, ptmax]`.
    pub fn covers(&self, pt: f64) -> bool {
        pt > self.ptmin && pt <= self.ptmax
    }

    /// True if `[min, max]` shares any interior with this section's range.
    pub fn overlaps(&self, min: f64, max: f64) -> bool {
        !(min >= self.ptmax || max <= self.ptmin)
    }

    /// True for types whose sections carry filter parameters.
    pub fn has_filters(&self) -> bool {
        FILTER_TYPES.contains(&self.firmware_type.as_str())
    }
}

/// Iterator over the sections of a database, in file order.
///
/// Iteration stops after the first malformed section.
pub struct Sections<R> {
    lines: Lines<R>,
    path: PathBuf,
    line: usize,
    at_section: bool,
    done: bool,
}

impl<R: BufRead> Sections<R> {
    /// Read sections from `reader`; `path` is only used in error messages.
    pub fn new(reader: R, path: impl AsRef<Path>) -> Self {
        Self {
            lines: reader.lines(),
            path: path.as_ref().to_path_buf(),
            line: 0,
            at_section: false,
            done: false,
        }
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        match self.lines.next() {
            None => Ok(None),
            Some(Ok(mut line)) => {
                self.line += 1;
                if line.ends_with('\r') {
                    line.pop();
                }
                Ok(Some(line))
            }
            Some(Err(e)) => Err(FddError::io(&self.path, e)),
        }
    }

    fn malformed(&self, message: impl Into<String>) -> FddError {
        FddError::Malformed {
            path: self.path.clone(),
            line: self.line,
            message: message.into(),
        }
    }

    fn header_line(&mut self, what: &str) -> Result<String> {
        self.next_line()?
            .ok_or_else(|| self.malformed(format!("end of file while reading the {what}")))
    }

    fn header_value<T: std::str::FromStr>(&mut self, what: &str) -> Result<T> {
        let text = self.header_line(what)?;
        text.trim()
            .parse()
            .map_err(|_| self.malformed(format!("invalid {what} '{}'", text.trim())))
    }

    fn read_section(&mut self) -> Result<FddRecord> {
        let line = self.line;
        let raw_filename = self.header_line("raw filename")?.trim().to_string();
        let firmware_type = self.header_line("firmware type")?.trim().to_string();
        if firmware_type.is_empty() {
            return Err(self.malformed("empty firmware type"));
        }

        let count: usize = self.header_value("keyword count")?;
        let mut keywords = Vec::with_capacity(count);
        for _ in 0..count {
            keywords.push(self.header_line("keyword list")?.trim().to_string());
        }
        let ptmin: f64 = self.header_value("minimum peaking time")?;
        let ptmax: f64 = self.header_value("maximum peaking time")?;

        let count: usize = self.header_value("filter count")?;
        let mut filters = Vec::with_capacity(count);
        for _ in 0..count {
            filters.push(self.header_value("filter value")?);
        }

        let mut payload = Vec::new();
        while let Some(text) = self.next_line()? {
            if is_delimiter(&text) {
                self.at_section = true;
                break;
            }
            payload.push(text);
        }

        Ok(FddRecord {
            raw_filename,
            firmware_type,
            keywords,
            ptmin,
            ptmax,
            filters,
            payload,
            line,
        })
    }
}

impl<R: BufRead> Iterator for Sections<R> {
    type Item = Result<FddRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        while !self.at_section {
            match self.next_line() {
                Ok(Some(text)) if is_delimiter(&text) => self.at_section = true,
                Ok(Some(_)) => {}
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        self.at_section = false;
        let section = self.read_section();
        if section.is_err() {
            self.done = true;
        }
        Some(section)
    }
}

pub(crate) fn is_delimiter(line: &str) -> bool {
    line.trim_end() == SECTION_DELIMITER
}
