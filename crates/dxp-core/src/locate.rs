//! Firmware and configuration file lookup.
//!
//! Bare file names are resolved against the working directory, two
//! installation roots (`XIAHOME`, `DXPHOME`) and finally an environment
//! variable named after the file itself, in that order.

use crate::error::{DxpError, Result};
use std::env;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Primary installation root variable.
pub const XIAHOME: &str = "XIAHOME";
/// Secondary installation root variable.
pub const DXPHOME: &str = "DXPHOME";

/// Resolves logical file names to readable paths.
#[derive(Debug, Clone, Default)]
pub struct FileLocator {
    xiahome: Option<PathBuf>,
    dxphome: Option<PathBuf>,
}

impl FileLocator {
    /// Locator that reads both roots from the environment.
    pub fn from_env() -> Self {
        Self::default()
    }

    /// Locator with explicit roots; a `None` root falls back to the environment.
    pub fn with_roots(xiahome: Option<PathBuf>, dxphome: Option<PathBuf>) -> Self {
        Self { xiahome, dxphome }
    }

    fn root(&self, configured: &Option<PathBuf>, var: &str) -> Option<PathBuf> {
        configured
            .clone()
            .or_else(|| env::var_os(var).map(PathBuf::from))
    }

    /// Every path tried for `name`, in search order.
    pub fn candidates(&self, name: &str) -> Vec<PathBuf> {
        let xiahome = self.root(&self.xiahome, XIAHOME);
        let dxphome = self.root(&self.dxphome, DXPHOME);
        let aliased = env::var_os(name).map(PathBuf::from);

        let mut paths = vec![PathBuf::from(name)];
        paths.extend(xiahome.as_ref().map(|root| root.join(name)));
        paths.extend(dxphome.as_ref().map(|root| root.join(name)));
        if let Some(alias) = aliased {
            paths.push(alias.clone());
            paths.extend(xiahome.as_ref().map(|root| root.join(&alias)));
            paths.extend(dxphome.as_ref().map(|root| root.join(&alias)));
        }
        paths
    }

    /// First existing candidate for `name`.
    pub fn find(&self, name: &str) -> Result<PathBuf> {
        let candidates = self.candidates(name);
        for path in &candidates {
            if path.is_file() {
                debug!(name, path = %path.display(), "Resolved file");
                return Ok(path.clone());
            }
        }
        Err(DxpError::LoadError {
            source_id: name.to_string(),
            message: format!(
                "file not found (tried {})",
                candidates
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        })
    }

    /// Resolve and open `name` for buffered reading.
    pub fn open(&self, name: &str) -> Result<BufReader<File>> {
        let path = self.find(name)?;
        open_path(name, &path)
    }
}

fn open_path(name: &str, path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| DxpError::LoadError {
            source_id: name.to_string(),
            message: format!("{}: {e}", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    #[serial]
    fn test_find_under_configured_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x10p.dsp"), "0\n").unwrap();
        let locator = FileLocator::with_roots(Some(dir.path().to_path_buf()), None);
        let found = locator.find("x10p.dsp").unwrap();
        assert_eq!(found, dir.path().join("x10p.dsp"));
    }

    #[test]
    #[serial]
    fn test_find_via_env_alias() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("real_fippi.fip");
        fs::write(&real, "00\n").unwrap();
        env::set_var("DXP_TEST_FIPPI_ALIAS", &real);
        let locator = FileLocator::with_roots(None, None);
        let found = locator.find("DXP_TEST_FIPPI_ALIAS").unwrap();
        assert_eq!(found, real);
        env::remove_var("DXP_TEST_FIPPI_ALIAS");
    }

    #[test]
    #[serial]
    fn test_candidate_order() {
        let locator = FileLocator::with_roots(Some("/opt/xia".into()), Some("/opt/dxp".into()));
        env::set_var("DXP_TEST_ORDER", "alias.dsp");
        let c = locator.candidates("DXP_TEST_ORDER");
        env::remove_var("DXP_TEST_ORDER");
        assert_eq!(
            c,
            vec![
                PathBuf::from("DXP_TEST_ORDER"),
                PathBuf::from("/opt/xia/DXP_TEST_ORDER"),
                PathBuf::from("/opt/dxp/DXP_TEST_ORDER"),
                PathBuf::from("alias.dsp"),
                PathBuf::from("/opt/xia/alias.dsp"),
                PathBuf::from("/opt/dxp/alias.dsp"),
            ]
        );
    }

    #[test]
    #[serial]
    fn test_missing_file_is_load_error() {
        let locator = FileLocator::with_roots(Some("/nonexistent/xia".into()), None);
        let err = locator.find("nope.dsp").unwrap_err();
        assert!(matches!(err, DxpError::LoadError { .. }));
        assert!(err.to_string().contains("/nonexistent/xia/nope.dsp"));
    }
}
