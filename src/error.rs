// src/error.rs

//! Error types for the cefs store
//!
//! Errors fall into four classes, see [`ErrorClass`]. Structural and
//! verification errors are never retried; transport/build errors abort the
//! current operation after cleanup and are safe to retry because archive
//! deduplication makes a second attempt cheap.

use std::path::PathBuf;
use thiserror::Error;

/// Message used when a catalog tree holds a regular file it should not
pub const UNEXPECTED_FILE: &str = "found an unexpected file";

/// Message used when a catalog symlink points outside the mount point
pub const FOREIGN_SYMLINK: &str = "symlink that wasn't a symlink to cefs";

/// Broad classification used by callers deciding whether to retry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Catalog tree or root pointer is malformed
    Structural,
    /// External tool or filesystem failure during staging/publishing
    Transport,
    /// Post-operation checks failed
    Verification,
    /// Bad configuration or caller input
    Usage,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("{message}: {}", path.display())]
    Structural { path: PathBuf, message: String },

    #[error("not a cefs filesystem root: {}", .0.display())]
    NotARoot(PathBuf),

    #[error("not a CEFS root symlink: {} -> {}", path.display(), target.display())]
    NotARootSymlink { path: PathBuf, target: PathBuf },

    #[error("{tool} failed ({status}): {stderr}")]
    ToolFailed {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("Required tool not found: {0}")]
    ToolNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error at {}: {source}", path.display())]
    IoAt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    #[error("verification failed for {}: {reason}", path.display())]
    Verification { path: PathBuf, reason: String },

    #[error("nothing to convert at {}", .0.display())]
    NothingToConvert(PathBuf),

    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_yaml::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid config: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Build a structural error for `path`
    pub fn structural(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Structural {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Attach the path an IO error happened at
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Structural { .. } | Self::NotARoot(_) | Self::NotARootSymlink { .. } => {
                ErrorClass::Structural
            }
            Self::Verification { .. } => ErrorClass::Verification,
            Self::ToolFailed { .. }
            | Self::ToolNotFound(_)
            | Self::Io(_)
            | Self::IoAt { .. }
            | Self::Walk(_) => ErrorClass::Transport,
            Self::NothingToConvert(_)
            | Self::Manifest(_)
            | Self::ConfigParse(_)
            | Self::Config(_)
            | Self::Json(_)
            | Self::InvalidArgument(_) => ErrorClass::Usage,
        }
    }

    /// True when repeating the whole operation may succeed
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transport
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structural_message_includes_path() {
        let err = Error::structural("/cefs-root/gcc", UNEXPECTED_FILE);
        let msg = err.to_string();
        assert!(msg.contains("found an unexpected file"));
        assert!(msg.contains("/cefs-root/gcc"));
        assert_eq!(err.class(), ErrorClass::Structural);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_io_errors_are_retryable() {
        let err: Error = std::io::Error::new(std::io::ErrorKind::Other, "disk gone").into();
        assert_eq!(err.class(), ErrorClass::Transport);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_verification_is_distinct() {
        let err = Error::Verification {
            path: PathBuf::from("/opt/x"),
            reason: "not installed".to_string(),
        };
        assert_eq!(err.class(), ErrorClass::Verification);
        assert!(!err.is_retryable());
    }
}
