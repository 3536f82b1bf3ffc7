// src/catalog/mod.rs

//! Catalog images
//!
//! A catalog image is a directory tree made only of symlinks into the store
//! mount point, plus an optional metadata file at its root. Loading validates
//! the tree strictly: anything else found in it is a structural error.
//!
//! ```text
//! <image>/.cefs-metadata          one log line per entry, in order
//! <image>/gcc-13.2.0 -> /cefs/<digest>
//! <image>/libs/boost -> /cefs/<digest>/boost_1_84
//! ```

pub mod root;

pub use root::RootPointer;

use crate::error::{Error, FOREIGN_SYMLINK, Result, UNEXPECTED_FILE};
use crate::store::stem_under;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// Reserved filename holding the metadata log
pub const METADATA_FILENAME: &str = ".cefs-metadata";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogImage {
    mount_point: PathBuf,
    links: BTreeMap<PathBuf, PathBuf>,
    metadata: Vec<String>,
}

impl CatalogImage {
    /// An empty catalog for `mount_point`
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        Self {
            mount_point: mount_point.into(),
            links: BTreeMap::new(),
            metadata: Vec::new(),
        }
    }

    /// Read and validate the tree at `directory`
    ///
    /// A missing or empty directory loads as an empty catalog.
    pub fn load(directory: &Path, mount_point: &Path) -> Result<Self> {
        let mut image = Self::new(mount_point);
        if !directory.exists() {
            debug!("Catalog {} does not exist, starting empty", directory.display());
            return Ok(image);
        }

        for entry in WalkDir::new(directory)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
        {
            let entry = entry?;
            let path = entry.path();
            let rel = path
                .strip_prefix(directory)
                .map_err(|_| Error::structural(path, UNEXPECTED_FILE))?;
            let file_type = entry.file_type();

            if file_type.is_dir() {
                continue;
            }

            if file_type.is_symlink() {
                let target = fs::read_link(path).map_err(|e| Error::io_at(path, e))?;
                if !target.is_absolute() {
                    return Err(Error::structural(
                        path,
                        format!("relative symlink in catalog ({})", target.display()),
                    ));
                }
                if stem_under(mount_point, &target).is_none() {
                    return Err(Error::structural(path, FOREIGN_SYMLINK));
                }
                image.links.insert(rel.to_path_buf(), target);
                continue;
            }

            if file_type.is_file() && rel == Path::new(METADATA_FILENAME) {
                let content = fs::read_to_string(path).map_err(|e| Error::io_at(path, e))?;
                image.metadata.extend(content.lines().map(str::to_string));
                continue;
            }

            return Err(Error::structural(path, UNEXPECTED_FILE));
        }

        debug!(
            "Loaded catalog {} ({} links, {} metadata lines)",
            directory.display(),
            image.links.len(),
            image.metadata.len()
        );
        Ok(image)
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    /// Append one line to the metadata log
    ///
    /// Embedded newlines would split the entry on reload and are replaced.
    pub fn add_metadata(&mut self, line: impl AsRef<str>) {
        self.metadata.push(line.as_ref().replace(['\n', '\r'], " "));
    }

    /// Point `relative_path` at `target`, replacing any previous target
    ///
    /// The path must stay inside the image and the target must lie under the
    /// mount point, so a rendered image always loads back.
    pub fn link_path(
        &mut self,
        relative_path: impl Into<PathBuf>,
        target: impl Into<PathBuf>,
    ) -> Result<()> {
        let relative_path = relative_path.into();
        let target = target.into();

        let inside = relative_path.components().next().is_some()
            && relative_path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !inside || relative_path == Path::new(METADATA_FILENAME) {
            return Err(Error::InvalidArgument(format!(
                "catalog entry must be a plain relative path: {}",
                relative_path.display()
            )));
        }
        if stem_under(&self.mount_point, &target).is_none() {
            return Err(Error::structural(&target, FOREIGN_SYMLINK));
        }

        if let Some(previous) = self.links.insert(relative_path.clone(), target.clone()) {
            debug!(
                "Repointed {}: {} -> {}",
                relative_path.display(),
                previous.display(),
                target.display()
            );
        }
        Ok(())
    }

    /// Remove the entry at `relative_path`, returning its target
    pub fn unlink_path(&mut self, relative_path: &Path) -> Option<PathBuf> {
        self.links.remove(relative_path)
    }

    /// Materialize the catalog as a symlink tree under `destination`
    pub fn render_to(&self, destination: &Path) -> Result<()> {
        fs::create_dir_all(destination).map_err(|e| Error::io_at(destination, e))?;

        for (rel, target) in &self.links {
            let link = destination.join(rel);
            if let Some(parent) = link.parent() {
                fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
            }
            symlink(target, &link).map_err(|e| Error::io_at(&link, e))?;
        }

        if !self.metadata.is_empty() {
            let path = destination.join(METADATA_FILENAME);
            let mut content = self.metadata.join("\n");
            content.push('\n');
            fs::write(&path, content).map_err(|e| Error::io_at(&path, e))?;
        }
        Ok(())
    }

    /// Relative path to absolute store target, sorted by path
    pub fn entries(&self) -> &BTreeMap<PathBuf, PathBuf> {
        &self.links
    }

    pub fn metadata(&self) -> &[String] {
        &self.metadata
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty() && self.metadata.is_empty()
    }

    /// Archive stems this catalog keeps alive
    pub fn referenced_stems(&self) -> BTreeSet<String> {
        self.links
            .values()
            .filter_map(|target| stem_under(&self.mount_point, target))
            .collect()
    }
}
