//! Search, insertion and extraction over a database file.
//!
//! Every query is a single forward pass over the sections; the first section
//! that satisfies it wins. Insertion only ever appends.

use crate::error::{FddError, Result};
use crate::record::{
    is_delimiter, FddRecord, KeywordMatch, Sections, FILTER_TYPES, SECTION_DELIMITER,
};
use std::fmt::Write as _;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Prefix of files written by [`FirmwareDatabase::get_firmware`].
pub const EXTRACT_PREFIX: &str = "xia";

/// Result of a successful search.
#[derive(Debug, Clone, PartialEq)]
pub struct FddMatch {
    /// Source filename recorded in the matching section
    pub raw_filename: String,
    /// Whether the section's keyword count equals the query's
    pub exact: bool,
    /// The matching section
    pub record: FddRecord,
}

/// Handle to a firmware database file.
#[derive(Debug, Clone)]
pub struct FirmwareDatabase {
    path: PathBuf,
}

impl FirmwareDatabase {
    /// Open an existing database.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        File::open(&path).map_err(|e| FddError::io(&path, e))?;
        Ok(Self { path })
    }

    /// Open a database, creating an empty file if none exists.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| FddError::io(&path, e))?;
        Ok(Self { path })
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn sections(&self) -> Result<Sections<BufReader<File>>> {
        let file = File::open(&self.path).map_err(|e| FddError::io(&self.path, e))?;
        Ok(Sections::new(BufReader::new(file), &self.path))
    }

    /// Every section, in file order.
    pub fn records(&self) -> Result<Vec<FddRecord>> {
        self.sections()?.collect()
    }

    /// Find the first section of `firmware_type` whose keywords match.
    ///
    /// With `ptmax == None` the section must cover `ptmin` (lower bound
    /// exclusive, upper inclusive) and `Ok(None)` means nothing matched.
    /// With an upper bound the query is a clash check: any keyword-matching
    /// section whose range overlaps `[ptmin, ptmax]` is a
    /// [`FddError::PeakingTimeOverlap`].
    pub fn find<S: AsRef<str>>(
        &self,
        firmware_type: &str,
        ptmin: f64,
        ptmax: Option<f64>,
        keywords: &[S],
    ) -> Result<Option<FddMatch>> {
        match ptmax {
            None => self.search(firmware_type, keywords, |r| r.covers(ptmin)),
            Some(ptmax) => {
                check_range(ptmin, ptmax)?;
                match self.search(firmware_type, keywords, |r| r.overlaps(ptmin, ptmax))? {
                    Some(clash) => Err(overlap(firmware_type, ptmin, ptmax, &clash)),
                    None => Ok(None),
                }
            }
        }
    }

    fn search<S, F>(
        &self,
        firmware_type: &str,
        keywords: &[S],
        accept: F,
    ) -> Result<Option<FddMatch>>
    where
        S: AsRef<str>,
        F: Fn(&FddRecord) -> bool,
    {
        for section in self.sections()? {
            let record = section?;
            if record.firmware_type != firmware_type {
                continue;
            }
            let Some(kind) = record.keyword_match(keywords) else {
                continue;
            };
            if accept(&record) {
                debug!(
                    database = %self.path.display(),
                    raw_filename = %record.raw_filename,
                    line = record.line,
                    exact = kind == KeywordMatch::Exact,
                    "Matched firmware section"
                );
                return Ok(Some(FddMatch {
                    raw_filename: record.raw_filename.clone(),
                    exact: kind == KeywordMatch::Exact,
                    record,
                }));
            }
        }
        Ok(None)
    }

    /// Append a section for `source_file`.
    ///
    /// Fails with [`FddError::AlreadyExists`] if a section with the same type,
    /// keywords and range is present, and with
    /// [`FddError::PeakingTimeOverlap`] if the range clashes with any other
    /// keyword-matching section. Existing sections are never modified.
    pub fn add_firmware<S: AsRef<str>>(
        &self,
        source_file: &Path,
        firmware_type: &str,
        ptmin: f64,
        ptmax: f64,
        keywords: &[S],
        filters: &[u16],
    ) -> Result<()> {
        check_token("firmware type", firmware_type)?;
        for keyword in keywords {
            check_token("keyword", keyword.as_ref())?;
        }
        check_range(ptmin, ptmax)?;

        let clash = self.search(firmware_type, keywords, |r| r.overlaps(ptmin, ptmax))?;
        if let Some(clash) = clash {
            let same_range = clash.record.ptmin == ptmin && clash.record.ptmax == ptmax;
            if clash.exact && same_range {
                return Err(FddError::AlreadyExists {
                    raw_filename: clash.raw_filename,
                });
            }
            return Err(overlap(firmware_type, ptmin, ptmax, &clash));
        }

        let payload = fs::read_to_string(source_file).map_err(|e| FddError::io(source_file, e))?;
        if payload.lines().any(is_delimiter) {
            return Err(FddError::bad_parameter(format!(
                "{} contains a section delimiter line",
                source_file.display()
            )));
        }

        let mut section = String::new();
        let raw_filename = source_file.display().to_string();
        // Writing to a String cannot fail.
        let _ = writeln!(section, "{SECTION_DELIMITER}");
        let _ = writeln!(section, "{raw_filename}");
        let _ = writeln!(section, "{firmware_type}");
        let _ = writeln!(section, "{}", keywords.len());
        for keyword in keywords {
            let _ = writeln!(section, "{}", keyword.as_ref());
        }
        let _ = writeln!(section, "{ptmin:10.4}");
        let _ = writeln!(section, "{ptmax:10.4}");
        let _ = writeln!(section, "{}", filters.len());
        for value in filters {
            let _ = writeln!(section, "{value}");
        }
        for line in payload.lines() {
            let _ = writeln!(section, "{line}");
        }

        self.append(&section)?;
        info!(
            database = %self.path.display(),
            raw_filename = %raw_filename,
            firmware_type,
            ptmin,
            ptmax,
            keywords = keywords.len(),
            "Added firmware section"
        );
        Ok(())
    }

    fn append(&self, text: &str) -> Result<()> {
        let io_err = |e| FddError::io(&self.path, e);
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        let len = file.seek(SeekFrom::End(0)).map_err(io_err)?;
        if len > 0 {
            let mut last = [0u8; 1];
            file.seek(SeekFrom::End(-1)).map_err(io_err)?;
            file.read_exact(&mut last).map_err(io_err)?;
            if last[0] != b'\n' {
                file.write_all(b"\n").map_err(io_err)?;
            }
        }
        file.write_all(text.as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)
    }

    /// Extract the firmware covering `pt` to `out_dir`.
    ///
    /// `detector_type` is appended to `keywords` before searching. The
    /// payload is written to `out_dir/xia<basename of the raw filename>` and
    /// that path is returned.
    pub fn get_firmware<S: AsRef<str>>(
        &self,
        firmware_type: &str,
        pt: f64,
        keywords: &[S],
        detector_type: &str,
        out_dir: &Path,
    ) -> Result<PathBuf> {
        let mut query: Vec<&str> = keywords.iter().map(|k| k.as_ref()).collect();
        query.push(detector_type);

        let found = self
            .find(firmware_type, pt, None, &query)?
            .ok_or_else(|| self.not_found(firmware_type, pt, &query))?;
        let base = basename(&found.raw_filename).ok_or_else(|| FddError::Malformed {
            path: self.path.clone(),
            line: found.record.line + 1,
            message: format!("no file name in '{}'", found.raw_filename),
        })?;

        let target = out_dir.join(format!("{EXTRACT_PREFIX}{base}"));
        let mut text = found.record.payload.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        fs::write(&target, text).map_err(|e| FddError::io(&target, e))?;
        info!(
            raw_filename = %found.raw_filename,
            path = %target.display(),
            exact = found.exact,
            "Extracted firmware"
        );
        Ok(target)
    }

    /// Number of filter parameters of the `fippi`/`fippi_a` section covering `pt`.
    pub fn num_filter<S: AsRef<str>>(
        &self,
        firmware_type: &str,
        pt: f64,
        keywords: &[S],
    ) -> Result<usize> {
        Ok(self.filter_info(firmware_type, pt, keywords)?.len())
    }

    /// Filter parameters of the `fippi`/`fippi_a` section covering `pt`.
    pub fn filter_info<S: AsRef<str>>(
        &self,
        firmware_type: &str,
        pt: f64,
        keywords: &[S],
    ) -> Result<Vec<u16>> {
        if !FILTER_TYPES.contains(&firmware_type) {
            return Err(FddError::bad_parameter(format!(
                "'{firmware_type}' sections carry no filter parameters"
            )));
        }
        let found = self.find(firmware_type, pt, None, keywords)?;
        match found {
            Some(found) => Ok(found.record.filters),
            None => {
                let query: Vec<&str> = keywords.iter().map(|k| k.as_ref()).collect();
                Err(self.not_found(firmware_type, pt, &query))
            }
        }
    }

    /// Remove a file written by [`get_firmware`](Self::get_firmware).
    pub fn clean_firmware(path: &Path) -> Result<()> {
        fs::remove_file(path).map_err(|e| FddError::io(path, e))?;
        debug!(path = %path.display(), "Removed extracted firmware");
        Ok(())
    }

    fn not_found(&self, firmware_type: &str, pt: f64, keywords: &[&str]) -> FddError {
        FddError::NotFound {
            database: self.path.clone(),
            query: format!(
                "'{firmware_type}' at peaking time {pt} with keywords [{}]",
                keywords.join(", ")
            ),
        }
    }
}

fn overlap(firmware_type: &str, ptmin: f64, ptmax: f64, clash: &FddMatch) -> FddError {
    FddError::PeakingTimeOverlap {
        firmware_type: firmware_type.to_string(),
        ptmin,
        ptmax,
        existing: clash.raw_filename.clone(),
    }
}

fn check_range(ptmin: f64, ptmax: f64) -> Result<()> {
    if !ptmin.is_finite() || !ptmax.is_finite() || ptmin >= ptmax {
        return Err(FddError::bad_parameter(format!(
            "invalid peaking time range [{ptmin}, {ptmax}]"
        )));
    }
    Ok(())
}

fn check_token(what: &str, value: &str) -> Result<()> {
    if value.is_empty() || value.chars().any(char::is_whitespace) || is_delimiter(value) {
        return Err(FddError::bad_parameter(format!("invalid {what} '{value}'")));
    }
    Ok(())
}

/// Last path component of a raw filename, accepting either separator, up to
/// the first whitespace.
fn basename(raw: &str) -> Option<&str> {
    let last = raw.rsplit(['/', '\\']).next()?;
    last.split_whitespace().next()
}
