// src/store/mod.rs

//! Content-addressed archive store
//!
//! Archives live side by side with their manifests in one directory:
//!
//! ```text
//! <image_dir>/<digest>.sqfs              archive, named by its content hash
//! <image_dir>/<digest>.yaml              manifest (committed)
//! <image_dir>/<digest>.yaml.inprogress   manifest (transaction still open)
//! <image_dir>/.cefs-*.tmp                archive being written
//! ```
//!
//! and every archive is mounted read-only at `<mount_point>/<digest>`.
//!
//! An archive name is only ever bound to one content, so publishing is a
//! check-then-rename into place: if the name exists the new bytes are proven
//! identical and are discarded.

pub mod builder;
pub mod format;

pub use builder::{ArchiveBuilder, BuiltArchive, StagingDir, TempArchive};

use crate::error::{Error, Result};
use crate::hash::{self, HashAlgorithm};
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Extension of archive files
pub const ARCHIVE_EXTENSION: &str = "sqfs";

/// Prefix and suffix of in-flight archive files
pub const TEMP_PREFIX: &str = ".cefs-";
pub const TEMP_SUFFIX: &str = ".tmp";

/// How an archive file reaches the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transfer {
    /// Leave the source in place
    Copy,
    /// Consume the source (rename when possible)
    Move,
}

/// Result of bringing an archive file into the store
#[derive(Debug, Clone)]
pub struct ImportedArchive {
    pub stem: String,
    pub path: PathBuf,
    pub size: u64,
    /// False when an archive with the same content was already present
    pub written: bool,
}

/// Handle on the archive directory and its mount point
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    image_dir: PathBuf,
    mount_point: PathBuf,
    algorithm: HashAlgorithm,
}

impl ArchiveStore {
    /// Open the store, creating the archive directory if needed
    pub fn open(
        image_dir: impl AsRef<Path>,
        mount_point: impl AsRef<Path>,
        algorithm: HashAlgorithm,
    ) -> Result<Self> {
        let image_dir = image_dir.as_ref().to_path_buf();
        if !image_dir.exists() {
            fs::create_dir_all(&image_dir).map_err(|e| Error::io_at(&image_dir, e))?;
            debug!(
                "Created archive directory: {} (algorithm: {})",
                image_dir.display(),
                algorithm
            );
        }

        Ok(Self {
            image_dir,
            mount_point: mount_point.as_ref().to_path_buf(),
            algorithm,
        })
    }

    #[inline]
    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    #[inline]
    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    #[inline]
    pub fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// `<image_dir>/<stem>.sqfs`
    pub fn archive_path(&self, stem: &str) -> PathBuf {
        self.image_dir.join(format!("{}.{}", stem, ARCHIVE_EXTENSION))
    }

    /// `<mount_point>/<stem>`
    pub fn mount_path(&self, stem: &str) -> PathBuf {
        self.mount_point.join(stem)
    }

    pub fn contains(&self, stem: &str) -> bool {
        self.archive_path(stem).is_file()
    }

    /// Content digest of a file, i.e. the stem it would be stored under
    pub fn hash_file(&self, path: &Path) -> Result<String> {
        hash::hash_file(self.algorithm, path)
    }

    /// Stem of an archive path, if it names an archive
    pub fn stem_of(archive: &Path) -> Option<&str> {
        if archive.extension().and_then(|e| e.to_str()) != Some(ARCHIVE_EXTENSION) {
            return None;
        }
        archive.file_stem().and_then(|s| s.to_str())
    }

    /// Stem referenced by an absolute path under the mount point
    ///
    /// `/cefs/abc123/bin/gcc` yields `abc123`; anything relative or outside
    /// the mount point yields `None`.
    pub fn stem_for_mount_target(&self, target: &Path) -> Option<String> {
        stem_under(&self.mount_point, target)
    }

    /// All archives currently in the store, sorted by path
    pub fn list_archives(&self) -> Result<Vec<PathBuf>> {
        self.list_matching(|name| {
            !name.starts_with('.') && name.ends_with(&format!(".{}", ARCHIVE_EXTENSION))
        })
    }

    /// Leftover archive files from interrupted writes
    pub fn list_temp_files(&self) -> Result<Vec<PathBuf>> {
        self.list_matching(|name| name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX))
    }

    /// Manifest markers of transactions that never committed (or are open)
    pub fn list_in_progress(&self) -> Result<Vec<PathBuf>> {
        self.list_matching(|name| name.ends_with(crate::manifest::IN_PROGRESS_SUFFIX))
    }

    fn list_matching(&self, keep: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
        let mut found = Vec::new();
        let entries = match fs::read_dir(&self.image_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(Error::io_at(&self.image_dir, e)),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if keep(name) && entry.file_type()?.is_file() {
                found.push(entry.path());
            }
        }
        found.sort();
        Ok(found)
    }

    /// Resolve a stem, archive path, or mounted path to an archive file
    pub fn resolve(&self, target: &str) -> Option<PathBuf> {
        let as_path = Path::new(target);
        if let Some(stem) = self.stem_for_mount_target(as_path) {
            return Some(self.archive_path(&stem));
        }
        if as_path.is_file() && Self::stem_of(as_path).is_some() {
            return Some(as_path.to_path_buf());
        }
        if self.algorithm.is_digest(target) {
            return Some(self.archive_path(target));
        }
        // A symlink (legacy path or catalog entry) pointing into the mount
        if let Ok(target) = fs::read_link(as_path) {
            return self
                .stem_for_mount_target(&target)
                .map(|stem| self.archive_path(&stem));
        }
        None
    }

    /// Fresh temporary path inside the archive directory
    pub fn temp_path(&self) -> PathBuf {
        self.image_dir.join(format!(
            "{}{}{}",
            TEMP_PREFIX,
            uuid::Uuid::new_v4(),
            TEMP_SUFFIX
        ))
    }

    /// Bring an existing archive file into the store
    ///
    /// The file is hashed first; when its name is already taken nothing is
    /// written (and a [`Transfer::Move`] source is removed). Otherwise it is
    /// staged under a temporary name in the archive directory and renamed to
    /// its final name.
    pub fn import(&self, source: &Path, transfer: Transfer) -> Result<ImportedArchive> {
        let stem = self.hash_file(source)?;
        let size = fs::metadata(source).map_err(|e| Error::io_at(source, e))?.len();
        let path = self.archive_path(&stem);

        if path.exists() {
            debug!("Archive already in store: {}", stem);
            if transfer == Transfer::Move {
                let _ = fs::remove_file(source);
            }
            return Ok(ImportedArchive {
                stem,
                path,
                size,
                written: false,
            });
        }

        let temp = self.temp_path();
        let staged = match transfer {
            Transfer::Copy => copy_synced(source, &temp),
            Transfer::Move => move_file_atomic(source, &temp),
        };
        if let Err(e) = staged {
            let _ = fs::remove_file(&temp);
            return Err(Error::io_at(source, e));
        }

        let written = self.publish_temp(&temp, &stem)?;
        Ok(ImportedArchive {
            stem,
            path,
            size,
            written,
        })
    }

    /// Rename a fully written temp file to its content address
    ///
    /// Returns false (and removes the temp file) when the name is taken.
    pub fn publish_temp(&self, temp: &Path, stem: &str) -> Result<bool> {
        let path = self.archive_path(stem);
        if path.exists() {
            fs::remove_file(temp).map_err(|e| Error::io_at(temp, e))?;
            debug!("Discarded duplicate archive for {}", stem);
            return Ok(false);
        }

        fs::rename(temp, &path).map_err(|e| {
            let _ = fs::remove_file(temp);
            Error::io_at(&path, e)
        })?;
        sync_dir(&self.image_dir);
        debug!("Stored archive {}", path.display());
        Ok(true)
    }
}

/// First path segment of `target` below `mount_point`
pub(crate) fn stem_under(mount_point: &Path, target: &Path) -> Option<String> {
    if !target.is_absolute() {
        return None;
    }
    let rel = target.strip_prefix(mount_point).ok()?;
    match rel.components().next()? {
        Component::Normal(segment) => segment.to_str().map(str::to_string),
        _ => None,
    }
}

/// Point `link` at `target`, replacing whatever symlink is there
///
/// A temporary link is renamed over `link`, so readers never observe the
/// path missing.
pub fn replace_symlink(link: &Path, target: &Path) -> Result<()> {
    // fixed length so a link name near NAME_MAX still gets a valid sibling
    let temp = link.with_file_name(format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()));
    std::os::unix::fs::symlink(target, &temp).map_err(|e| Error::io_at(&temp, e))?;
    if let Err(e) = fs::rename(&temp, link) {
        let _ = fs::remove_file(&temp);
        return Err(Error::io_at(link, e));
    }
    Ok(())
}

fn copy_synced(src: &Path, dst: &Path) -> io::Result<()> {
    fs::copy(src, dst)?;
    File::open(dst)?.sync_all()
}

/// Move a file, falling back to copy+fsync+delete across filesystems
pub(crate) fn move_file_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            debug!(
                "Cross-filesystem move ({} -> {}), copying",
                src.display(),
                dst.display()
            );
            copy_synced(src, dst)?;
            fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}

/// Best-effort fsync of a directory entry table
pub(crate) fn sync_dir(dir: &Path) {
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}
