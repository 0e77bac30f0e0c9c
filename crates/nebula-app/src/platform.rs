//! Directory resolution for the probe.
//!
//! Config, persisted endpoint rotation and logs each get their own directory.
//! `--config` roots everything under the given path instead of the OS
//! locations.

use std::path::{Path, PathBuf};
use std::{fmt, io};

/// Errors that can occur while preparing probe directories.
#[derive(Debug)]
pub enum PlatformError {
    /// The OS did not provide a configuration directory.
    NoConfigDir,
    /// Directory creation failed.
    Io(io::Error),
}

impl fmt::Display for PlatformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoConfigDir => write!(f, "could not determine OS configuration directory"),
            Self::Io(e) => write!(f, "platform I/O error: {e}"),
        }
    }
}

impl std::error::Error for PlatformError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PlatformError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

/// Where the probe reads and writes files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeDirs {
    /// `config.ron`.
    pub config_dir: PathBuf,
    /// `endpoints.ron`, the persisted rotation indices.
    pub state_dir: PathBuf,
    /// `nebula-link.log`.
    pub log_dir: PathBuf,
}

impl ProbeDirs {
    /// Resolve directories without creating them. `override_dir` replaces
    /// the OS config location.
    pub fn resolve(override_dir: Option<&Path>) -> Result<Self, PlatformError> {
        if let Some(root) = override_dir {
            return Ok(Self::under(root.to_path_buf()));
        }
        let config_dir = nebula_config::Config::default_dir().ok_or(PlatformError::NoConfigDir)?;
        let state_dir = dirs::data_dir()
            .map(|d| d.join("nebula-link"))
            .unwrap_or_else(|| config_dir.join("state"));
        Ok(Self {
            log_dir: config_dir.join("logs"),
            config_dir,
            state_dir,
        })
    }

    /// Everything below a single root.
    pub fn under(root: PathBuf) -> Self {
        Self {
            state_dir: root.join("state"),
            log_dir: root.join("logs"),
            config_dir: root,
        }
    }

    /// Create all directories on disk.
    pub fn create_dirs(&self) -> Result<(), PlatformError> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(&self.state_dir)?;
        std::fs::create_dir_all(&self.log_dir)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_override_roots_everything() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ProbeDirs::resolve(Some(tmp.path())).unwrap();
        assert_eq!(dirs.config_dir, tmp.path());
        assert!(dirs.state_dir.starts_with(tmp.path()));
        assert!(dirs.log_dir.starts_with(tmp.path()));
    }

    #[test]
    fn test_default_dirs_are_absolute() {
        if let Ok(dirs) = ProbeDirs::resolve(None) {
            assert!(dirs.config_dir.is_absolute());
            assert!(dirs.state_dir.is_absolute());
            assert!(dirs.log_dir.ends_with("logs"));
        }
    }

    #[test]
    fn test_directory_creation() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ProbeDirs::under(tmp.path().join("probe"));
        dirs.create_dirs().unwrap();
        assert!(dirs.config_dir.is_dir());
        assert!(dirs.state_dir.is_dir());
        assert!(dirs.log_dir.is_dir());
    }

    #[test]
    fn test_create_dirs_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let dirs = ProbeDirs::under(tmp.path().to_path_buf());
        dirs.create_dirs().unwrap();
        dirs.create_dirs().unwrap();
    }
}
