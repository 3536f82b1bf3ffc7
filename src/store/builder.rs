// src/store/builder.rs

//! Archive builder
//!
//! Turns a staged directory into a content-addressed archive. The compressor
//! writes a temporary file, the file is hashed, and the hash decides whether
//! the file is renamed into the store or discarded as a duplicate.
//!
//! The staging directory is consumed by every build: its files are made
//! world-readable and it is removed whether the build succeeded or not.

use super::format::Compressor;
use super::{ArchiveStore, TEMP_PREFIX, TEMP_SUFFIX};
use crate::error::{Error, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::{TempDir, TempPath};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// A scratch directory that is always cleaned up
pub struct StagingDir {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl StagingDir {
    /// Create an empty staging directory under `temp_root`
    pub fn new(temp_root: &Path) -> Result<Self> {
        fs::create_dir_all(temp_root).map_err(|e| Error::io_at(temp_root, e))?;
        let dir = tempfile::Builder::new()
            .prefix("cefs-stage-")
            .tempdir_in(temp_root)
            .map_err(|e| Error::io_at(temp_root, e))?;
        let path = dir.path().to_path_buf();
        Ok(Self {
            dir: Some(dir),
            path,
        })
    }

    /// Create a staging directory holding a copy of `source`
    pub fn copy_of(source: &Path, temp_root: &Path) -> Result<Self> {
        let staging = Self::new(temp_root)?;
        copy_tree(source, staging.path())?;
        Ok(staging)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Make everything readable and remove the directory
    pub fn cleanup(mut self) -> Result<()> {
        match self.dir.take() {
            Some(dir) => {
                make_world_readable(dir.path())?;
                dir.close().map_err(|e| Error::io_at(&self.path, e))
            }
            None => Ok(()),
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        if let Some(dir) = self.dir.take() {
            if let Err(e) = make_world_readable(dir.path()) {
                warn!("Failed to normalize {}: {}", self.path.display(), e);
            }
            if let Err(e) = dir.close() {
                warn!("Failed to remove staging dir {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Archive written outside the store, deleted on drop unless consumed
pub struct TempArchive {
    pub path: TempPath,
    pub stem: String,
    pub size: u64,
}

/// Archive present in the store
#[derive(Debug, Clone)]
pub struct BuiltArchive {
    pub stem: String,
    pub path: PathBuf,
    pub size: u64,
    /// An archive with identical content already existed
    pub deduplicated: bool,
}

pub struct ArchiveBuilder<'a> {
    store: &'a ArchiveStore,
    compressor: &'a dyn Compressor,
    temp_root: PathBuf,
}

impl<'a> ArchiveBuilder<'a> {
    pub fn new(store: &'a ArchiveStore, compressor: &'a dyn Compressor, temp_root: &Path) -> Self {
        Self {
            store,
            compressor,
            temp_root: temp_root.to_path_buf(),
        }
    }

    /// A fresh staging directory for content to be archived
    pub fn staging(&self) -> Result<StagingDir> {
        StagingDir::new(&self.temp_root)
    }

    /// Build `staging` straight into the store
    pub fn build(&self, staging: StagingDir) -> Result<BuiltArchive> {
        let temp = self.compress_into(staging, self.store.image_dir())?;
        let path = self.store.archive_path(&temp.stem);

        let deduplicated = match temp.path.persist_noclobber(&path) {
            Ok(()) => false,
            Err(e) if e.error.kind() == std::io::ErrorKind::AlreadyExists => {
                // e.path drops here, removing the duplicate
                true
            }
            Err(e) => return Err(Error::io_at(&path, e.error)),
        };
        super::sync_dir(self.store.image_dir());

        info!(
            stem = %temp.stem,
            size = temp.size,
            deduplicated,
            "Built archive"
        );
        Ok(BuiltArchive {
            stem: temp.stem,
            path,
            size: temp.size,
            deduplicated,
        })
    }

    /// Build `staging` into a temporary archive outside the store
    ///
    /// Used when the archive is handed to a deploy transaction, which owns
    /// the decision of writing it into the store.
    pub fn compress(&self, staging: StagingDir) -> Result<TempArchive> {
        fs::create_dir_all(&self.temp_root).map_err(|e| Error::io_at(&self.temp_root, e))?;
        self.compress_into(staging, &self.temp_root)
    }

    fn compress_into(&self, staging: StagingDir, out_dir: &Path) -> Result<TempArchive> {
        let built = self.compress_staged(staging.path(), out_dir);
        let cleaned = staging.cleanup();
        let archive = built?;
        cleaned?;
        Ok(archive)
    }

    fn compress_staged(&self, source: &Path, out_dir: &Path) -> Result<TempArchive> {
        make_world_readable(source)?;

        let path = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(out_dir)
            .map_err(|e| Error::io_at(out_dir, e))?
            .into_temp_path();

        debug!(
            "Compressing {} with {} into {}",
            source.display(),
            self.compressor.name(),
            path.display()
        );
        self.compressor.compress(source, &path)?;

        let stem = self.store.hash_file(&path)?;
        let size = fs::metadata(&path).map_err(|e| Error::io_at(&path, e))?.len();
        Ok(TempArchive { path, stem, size })
    }
}

/// Grant read access to everyone (and execute on directories/executables)
pub fn make_world_readable(root: &Path) -> Result<()> {
    if !root.exists() {
        return Ok(());
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_symlink() {
            continue;
        }

        let mut perms = entry.path().symlink_metadata()?.permissions();
        let mode = perms.mode();
        let wanted = if file_type.is_dir() || mode & 0o111 != 0 {
            mode | 0o755
        } else {
            mode | 0o644
        };
        if wanted != mode {
            perms.set_mode(wanted);
            fs::set_permissions(entry.path(), perms)
                .map_err(|e| Error::io_at(entry.path(), e))?;
        }
    }
    Ok(())
}

/// Recursively copy a tree, preserving symlinks as symlinks
pub fn copy_tree(source: &Path, dest: &Path) -> Result<()> {
    for entry in WalkDir::new(source).follow_links(false).min_depth(1) {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|_| Error::structural(entry.path(), "entry escaped copy root"))?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, &target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| Error::io_at(entry.path(), e))?;
        }
    }
    Ok(())
}
