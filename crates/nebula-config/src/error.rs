//! Errors from loading and saving the config and endpoint-state files.

use std::path::{Path, PathBuf};

/// A config or state file could not be read, written, or (de)serialized.
/// Every variant names the file involved.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    WriteError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    ParseError {
        path: PathBuf,
        #[source]
        source: ron::error::SpannedError,
    },

    #[error("failed to serialize {}: {source}", path.display())]
    SerializeError {
        path: PathBuf,
        #[source]
        source: ron::Error,
    },
}

impl ConfigError {
    pub(crate) fn read(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::ReadError {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn write(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| Self::WriteError {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn parse(path: &Path) -> impl FnOnce(ron::error::SpannedError) -> Self + '_ {
        move |source| Self::ParseError {
            path: path.to_path_buf(),
            source,
        }
    }

    pub(crate) fn serialize(path: &Path) -> impl FnOnce(ron::Error) -> Self + '_ {
        move |source| Self::SerializeError {
            path: path.to_path_buf(),
            source,
        }
    }

    /// The file the failed operation was about.
    pub fn path(&self) -> &Path {
        match self {
            Self::ReadError { path, .. }
            | Self::WriteError { path, .. }
            | Self::ParseError { path, .. }
            | Self::SerializeError { path, .. } => path,
        }
    }
}
