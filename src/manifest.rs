// src/manifest.rs

//! Provenance sidecars for archives
//!
//! Every archive `<digest>.sqfs` may carry a `<digest>.yaml` manifest
//! describing what went into it. A manifest is first written as
//! `<digest>.yaml.inprogress` and only renamed to its final name once the
//! archive and everything pointing at it is in place, so a finalized manifest
//! always vouches for a complete archive.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Extension of committed manifests
pub const MANIFEST_EXTENSION: &str = "yaml";

/// Suffix appended to a manifest path while its transaction is open
pub const IN_PROGRESS_SUFFIX: &str = ".inprogress";

/// What produced an archive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Install,
    Convert,
    Consolidate,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Install => write!(f, "install"),
            Self::Convert => write!(f, "convert"),
            Self::Consolidate => write!(f, "consolidate"),
        }
    }
}

/// One logical component stored in an archive
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContentEntry {
    pub name: String,
    /// Legacy path the component is exposed at
    pub destination: PathBuf,
    /// Location of the component inside a composite archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_path: Option<PathBuf>,
}

impl ContentEntry {
    pub fn new(name: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            extraction_path: None,
        }
    }

    pub fn with_extraction_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.extraction_path = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    pub version: u32,
    pub operation: Operation,
    pub description: String,
    pub contents: Vec<ContentEntry>,
    pub created_at: DateTime<Utc>,
    pub git_sha: String,
    pub command: Vec<String>,
}

impl Manifest {
    /// A manifest stamped with the current time, build revision and argv
    pub fn new(
        operation: Operation,
        description: impl Into<String>,
        contents: Vec<ContentEntry>,
    ) -> Self {
        Self {
            version: MANIFEST_VERSION,
            operation,
            description: description.into(),
            contents,
            created_at: Utc::now(),
            git_sha: option_env!("CEFS_GIT_SHA").unwrap_or("unknown").to_string(),
            command: std::env::args().collect(),
        }
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }
}

/// `<image_dir>/<digest>.yaml` for `<image_dir>/<digest>.sqfs`
pub fn manifest_path(archive: &Path) -> PathBuf {
    archive.with_extension(MANIFEST_EXTENSION)
}

/// `<image_dir>/<digest>.yaml.inprogress`
pub fn in_progress_path(archive: &Path) -> PathBuf {
    let mut path = manifest_path(archive).into_os_string();
    path.push(IN_PROGRESS_SUFFIX);
    PathBuf::from(path)
}

/// Archive an in-progress marker belongs to, if `marker` is one
pub fn archive_for_marker(marker: &Path) -> Option<PathBuf> {
    let name = marker.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{}{}", MANIFEST_EXTENSION, IN_PROGRESS_SUFFIX))?;
    Some(marker.with_file_name(format!(
        "{}.{}",
        stem,
        crate::store::ARCHIVE_EXTENSION
    )))
}

/// Serialize `manifest` to the in-progress marker of `archive`
pub fn write_in_progress(manifest: &Manifest, archive: &Path) -> Result<PathBuf> {
    let path = in_progress_path(archive);
    let yaml = manifest.to_yaml()?;
    fs::write(&path, yaml).map_err(|e| Error::io_at(&path, e))?;
    debug!("Wrote in-progress manifest {}", path.display());
    Ok(path)
}

/// Commit point: rename the in-progress marker to the manifest name
pub fn finalize(archive: &Path) -> Result<PathBuf> {
    let marker = in_progress_path(archive);
    let path = manifest_path(archive);
    fs::rename(&marker, &path).map_err(|e| Error::io_at(&marker, e))?;
    if let Some(dir) = path.parent() {
        crate::store::sync_dir(dir);
    }
    debug!("Finalized manifest {}", path.display());
    Ok(path)
}

/// Read the committed manifest of `archive`
///
/// Missing and unparsable manifests both read as `None`.
pub fn read(archive: &Path) -> Option<Manifest> {
    let path = manifest_path(archive);
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
        Err(e) => {
            warn!("Could not read manifest {}: {}", path.display(), e);
            return None;
        }
    };

    match Manifest::from_yaml(&content) {
        Ok(manifest) => Some(manifest),
        Err(e) => {
            warn!("Ignoring unparsable manifest {}: {}", path.display(), e);
            None
        }
    }
}

/// Remove the in-progress marker of `archive`, if any
pub fn discard_in_progress(archive: &Path) -> Result<()> {
    remove_if_present(&in_progress_path(archive))
}

/// Remove the committed manifest of `archive`, if any
pub fn delete(archive: &Path) -> Result<()> {
    remove_if_present(&manifest_path(archive))
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io_at(path, e)),
    }
}
