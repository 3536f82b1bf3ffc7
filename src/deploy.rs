// src/deploy.rs

//! Transactional deployment
//!
//! Publishing an archive is a four step sequence:
//!
//! 1. the archive is placed in the store (skipped when its digest is present)
//! 2. its manifest is written as an in-progress marker
//! 3. the caller creates the symlink(s) that reference the archive
//! 4. the marker is renamed to the manifest name (commit point)
//!
//! Failing before step 3 completes removes the archive (if this transaction
//! wrote it) and the marker, leaving prior state untouched. Once symlinks
//! are published the archive is never removed by a rollback; an unfinished
//! marker is left for garbage collection to reconcile.

use crate::catalog::{CatalogImage, RootPointer};
use crate::error::Result;
use crate::manifest::{self, ContentEntry, Manifest, Operation};
use crate::store::{ArchiveBuilder, ArchiveStore, Transfer};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Deploy transaction phases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployState {
    /// Archive in store, manifest marker written
    Pending,
    /// Caller's symlinks are live; rollback no longer removes the archive
    Published,
    /// Manifest finalized
    Committed,
    /// Rolled back
    Aborted,
}

/// What a finished deployment left in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployReceipt {
    pub stem: String,
    pub archive_path: PathBuf,
    pub manifest_path: PathBuf,
    /// False when the archive was already present
    pub written: bool,
}

pub struct DeployTransaction<'a> {
    store: &'a ArchiveStore,
    stem: String,
    archive_path: PathBuf,
    written: bool,
    state: DeployState,
}

impl<'a> DeployTransaction<'a> {
    /// Place `source` in the store and open the manifest marker
    pub fn begin(
        store: &'a ArchiveStore,
        source: &Path,
        transfer: Transfer,
        manifest: &Manifest,
    ) -> Result<Self> {
        let imported = store.import(source, transfer)?;
        let tx = Self {
            store,
            stem: imported.stem,
            archive_path: imported.path,
            written: imported.written,
            state: DeployState::Pending,
        };

        // on failure, dropping tx removes the archive written above
        manifest::write_in_progress(manifest, &tx.archive_path)?;

        debug!(
            stem = %tx.stem,
            written = tx.written,
            "Deploy transaction opened"
        );
        Ok(tx)
    }

    pub fn stem(&self) -> &str {
        &self.stem
    }

    pub fn archive_path(&self) -> &Path {
        &self.archive_path
    }

    /// Where the archive's content is visible once mounted
    pub fn mount_path(&self) -> PathBuf {
        self.store.mount_path(&self.stem)
    }

    pub fn state(&self) -> DeployState {
        self.state
    }

    /// Record that the caller's symlinks now reference the archive
    pub fn mark_published(&mut self) {
        if self.state == DeployState::Pending {
            self.state = DeployState::Published;
        }
    }

    /// Finalize the manifest
    pub fn commit(mut self) -> Result<DeployReceipt> {
        self.mark_published();
        let manifest_path = manifest::finalize(&self.archive_path)?;
        self.state = DeployState::Committed;
        info!(stem = %self.stem, written = self.written, "Deployed archive");

        Ok(DeployReceipt {
            stem: self.stem.clone(),
            archive_path: self.archive_path.clone(),
            manifest_path,
            written: self.written,
        })
    }

    /// Roll back everything this transaction wrote
    pub fn abort(mut self) -> Result<()> {
        self.rollback()
    }

    fn rollback(&mut self) -> Result<()> {
        if matches!(self.state, DeployState::Committed | DeployState::Aborted) {
            return Ok(());
        }
        let published = self.state == DeployState::Published;
        self.state = DeployState::Aborted;

        if published {
            warn!(
                "Deploy of {} failed after publishing; leaving archive and marker",
                self.stem
            );
            return Ok(());
        }

        manifest::discard_in_progress(&self.archive_path)?;
        if self.written {
            match fs::remove_file(&self.archive_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(crate::error::Error::io_at(&self.archive_path, e)),
            }
        }
        info!(stem = %self.stem, "Rolled back deploy");
        Ok(())
    }
}

impl Drop for DeployTransaction<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.rollback() {
            warn!("Rollback of {} failed: {}", self.stem, e);
        }
    }
}

/// Run a whole deploy, with `publish` creating the referencing symlinks
///
/// `publish` runs after the archive and marker are in place; the manifest is
/// finalized only if it succeeds.
pub fn deploy<T>(
    store: &ArchiveStore,
    source: &Path,
    transfer: Transfer,
    manifest: &Manifest,
    publish: impl FnOnce(&DeployTransaction<'_>) -> Result<T>,
) -> Result<(DeployReceipt, T)> {
    let mut tx = DeployTransaction::begin(store, source, transfer, manifest)?;
    let value = match publish(&tx) {
        Ok(value) => value,
        Err(e) => {
            tx.abort()?;
            return Err(e);
        }
    };
    tx.mark_published();
    let receipt = tx.commit()?;
    Ok((receipt, value))
}

/// Build `image` into an archive and repoint `root` at it
pub fn publish_catalog(
    store: &ArchiveStore,
    builder: &ArchiveBuilder<'_>,
    image: &CatalogImage,
    root: &mut RootPointer,
    description: &str,
) -> Result<DeployReceipt> {
    let staging = builder.staging()?;
    image.render_to(staging.path())?;
    let archive = builder.compress(staging)?;

    let manifest = Manifest::new(
        Operation::Install,
        description,
        vec![ContentEntry::new("catalog", root.link())],
    );
    let (receipt, ()) = deploy(store, &archive.path, Transfer::Move, &manifest, |tx| {
        root.update(&tx.mount_path())
    })?;
    Ok(receipt)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::hash::HashAlgorithm;
    use tempfile::TempDir;

    fn setup() -> (TempDir, ArchiveStore, PathBuf) {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(
            dir.path().join("images"),
            dir.path().join("cefs"),
            HashAlgorithm::Sha256,
        )
        .unwrap();
        let source = dir.path().join("built.img");
        fs::write(&source, b"archive content").unwrap();
        (dir, store, source)
    }

    fn manifest() -> Manifest {
        Manifest::new(
            Operation::Install,
            "test",
            vec![ContentEntry::new("tool", "/opt/tool")],
        )
    }

    #[test]
    fn test_deploy_commits_after_publish() {
        let (dir, store, source) = setup();
        let link = dir.path().join("tool");

        let (receipt, ()) = deploy(&store, &source, Transfer::Copy, &manifest(), |tx| {
            assert!(tx.archive_path().exists());
            assert!(manifest::in_progress_path(tx.archive_path()).exists());
            assert!(manifest::read(tx.archive_path()).is_none());
            std::os::unix::fs::symlink(tx.mount_path(), &link)?;
            Ok(())
        })
        .unwrap();

        assert!(receipt.written);
        assert!(receipt.manifest_path.exists());
        assert!(!manifest::in_progress_path(&receipt.archive_path).exists());
        assert_eq!(fs::read_link(&link).unwrap(), store.mount_path(&receipt.stem));
    }

    #[test]
    fn test_failed_publish_rolls_back() {
        let (_dir, store, source) = setup();

        let err = deploy(&store, &source, Transfer::Copy, &manifest(), |_| {
            Err::<(), _>(Error::InvalidArgument("symlink step failed".into()))
        })
        .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        assert!(store.list_archives().unwrap().is_empty());
        assert!(store.list_temp_files().unwrap().is_empty());
        let leftovers: Vec<_> = fs::read_dir(store.image_dir()).unwrap().collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_rollback_keeps_preexisting_archive() {
        let (_dir, store, source) = setup();
        let (first, ()) = deploy(&store, &source, Transfer::Copy, &manifest(), |_| Ok(())).unwrap();

        let result = deploy(&store, &source, Transfer::Copy, &manifest(), |tx| {
            assert_eq!(tx.stem(), first.stem);
            Err::<(), _>(Error::InvalidArgument("nope".into()))
        });
        assert!(result.is_err());
        assert!(first.archive_path.exists());
        assert!(first.manifest_path.exists());
        assert!(!manifest::in_progress_path(&first.archive_path).exists());
    }

    #[test]
    fn test_drop_without_commit_rolls_back() {
        let (_dir, store, source) = setup();
        let archive = {
            let tx = DeployTransaction::begin(&store, &source, Transfer::Copy, &manifest()).unwrap();
            tx.archive_path().to_path_buf()
        };
        assert!(!archive.exists());
        assert!(!manifest::in_progress_path(&archive).exists());
    }

    #[test]
    fn test_published_transaction_keeps_archive() {
        let (_dir, store, source) = setup();
        let mut tx = DeployTransaction::begin(&store, &source, Transfer::Copy, &manifest()).unwrap();
        let archive = tx.archive_path().to_path_buf();
        tx.mark_published();
        drop(tx);

        assert!(archive.exists());
        assert!(manifest::in_progress_path(&archive).exists());
    }
}
