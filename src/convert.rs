// src/convert.rs

//! Legacy install conversion
//!
//! A legacy install is a plain directory on shared storage. Converting it
//! publishes its pre-built archive into the store and swaps the directory
//! for a symlink to the archive's mount path, keeping the old directory as a
//! timestamped backup beside it.

use crate::config::ConvertConfig;
use crate::deploy::{DeployReceipt, deploy};
use crate::error::{Error, Result};
use crate::manifest::{ContentEntry, Manifest, Operation};
use crate::store::{ArchiveStore, Transfer, replace_symlink};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Extension of pre-built legacy archives
pub const PREBUILT_EXTENSION: &str = "img";

/// What a legacy path currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NfsState {
    /// Already a symlink (converted)
    Symlink,
    /// Legacy directory layout
    Directory,
    /// Nothing usable at the path
    Missing,
}

impl std::fmt::Display for NfsState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Symlink => write!(f, "symlink"),
            Self::Directory => write!(f, "directory"),
            Self::Missing => write!(f, "missing"),
        }
    }
}

pub fn detect_nfs_state(path: &Path) -> NfsState {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => NfsState::Symlink,
        Ok(meta) if meta.is_dir() => NfsState::Directory,
        _ => NfsState::Missing,
    }
}

/// The surrounding system's view of one installable component
pub trait LegacyInstallation {
    fn name(&self) -> &str;

    /// Path the component is installed at
    fn destination(&self) -> &Path;

    /// Location of the component's pre-built archive
    fn prebuilt_archive(&self) -> Result<PathBuf>;

    /// Whether the component currently reports itself as installed
    fn is_installed(&self) -> bool;
}

/// Installation backed by a mirrored tree of pre-built `.img` files
///
/// `<nfs_root>/gcc-13.2.0` maps to `<squash_image_root>/gcc-13.2.0.img`.
#[derive(Debug, Clone)]
pub struct PrebuiltInstallation {
    name: String,
    destination: PathBuf,
    archive: PathBuf,
    installed_marker: Option<PathBuf>,
}

impl PrebuiltInstallation {
    pub fn new(
        name: impl Into<String>,
        destination: impl Into<PathBuf>,
        archive: impl Into<PathBuf>,
    ) -> Self {
        Self {
            name: name.into(),
            destination: destination.into(),
            archive: archive.into(),
            installed_marker: None,
        }
    }

    /// Derive archive location and name from `destination` under `nfs_root`
    pub fn from_config(config: &ConvertConfig, destination: &Path) -> Result<Self> {
        let rel = destination.strip_prefix(&config.nfs_root).map_err(|_| {
            Error::InvalidArgument(format!(
                "{} is not under {}",
                destination.display(),
                config.nfs_root.display()
            ))
        })?;
        if rel.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(format!(
                "refusing to convert the legacy root {}",
                destination.display()
            )));
        }

        let mut archive = config.squash_image_root.join(rel).into_os_string();
        archive.push(".");
        archive.push(PREBUILT_EXTENSION);

        Ok(Self {
            name: rel.to_string_lossy().into_owned(),
            destination: destination.to_path_buf(),
            archive: PathBuf::from(archive),
            installed_marker: config.installed_marker.clone(),
        })
    }

    pub fn with_installed_marker(mut self, marker: impl Into<PathBuf>) -> Self {
        self.installed_marker = Some(marker.into());
        self
    }
}

impl LegacyInstallation for PrebuiltInstallation {
    fn name(&self) -> &str {
        &self.name
    }

    fn destination(&self) -> &Path {
        &self.destination
    }

    fn prebuilt_archive(&self) -> Result<PathBuf> {
        if self.archive.is_file() {
            Ok(self.archive.clone())
        } else {
            Err(Error::io_at(
                &self.archive,
                io::Error::new(io::ErrorKind::NotFound, "no pre-built archive"),
            ))
        }
    }

    fn is_installed(&self) -> bool {
        match &self.installed_marker {
            Some(marker) => self.destination.join(marker).exists(),
            None => fs::read_dir(&self.destination)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConvertOptions {
    /// Re-convert paths that are already symlinks
    pub force: bool,
    /// Report what would happen without touching anything
    pub dry_run: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConvertOutcome {
    AlreadyConverted,
    DryRun {
        stem: String,
        mount_path: PathBuf,
    },
    Converted {
        receipt: DeployReceipt,
        backup: Option<PathBuf>,
    },
}

/// Convert one legacy install into a store-backed symlink
pub fn convert_to_cefs(
    installation: &dyn LegacyInstallation,
    store: &ArchiveStore,
    options: ConvertOptions,
) -> Result<ConvertOutcome> {
    let destination = installation.destination();
    let state = detect_nfs_state(destination);
    debug!("{} is {}", destination.display(), state);

    match state {
        NfsState::Symlink if !options.force => {
            info!("{} already converted", installation.name());
            return Ok(ConvertOutcome::AlreadyConverted);
        }
        NfsState::Missing => return Err(Error::NothingToConvert(destination.to_path_buf())),
        NfsState::Symlink | NfsState::Directory => {}
    }

    let archive = installation.prebuilt_archive()?;
    let stem = store.hash_file(&archive)?;
    let mount_path = store.mount_path(&stem);

    if options.dry_run {
        info!(
            "Would convert {} -> {}",
            destination.display(),
            mount_path.display()
        );
        return Ok(ConvertOutcome::DryRun { stem, mount_path });
    }

    let manifest = Manifest::new(
        Operation::Convert,
        format!("Converted {} to cefs", installation.name()),
        vec![ContentEntry::new(installation.name(), destination)],
    );

    let (receipt, backup) = deploy(store, &archive, Transfer::Copy, &manifest, |tx| {
        swap_to_symlink(destination, &tx.mount_path())
    })?;

    if detect_nfs_state(destination) != NfsState::Symlink {
        return Err(Error::Verification {
            path: destination.to_path_buf(),
            reason: "path is not a symlink after conversion".to_string(),
        });
    }
    if !installation.is_installed() {
        return Err(Error::Verification {
            path: destination.to_path_buf(),
            reason: format!("{} no longer reports as installed", installation.name()),
        });
    }

    info!(
        "Converted {} -> {}",
        destination.display(),
        receipt.stem
    );
    Ok(ConvertOutcome::Converted { receipt, backup })
}

/// Replace `destination` with a symlink to `target`
///
/// A directory is renamed aside first and restored if the symlink cannot be
/// created. An existing symlink is replaced in place and not backed up.
fn swap_to_symlink(destination: &Path, target: &Path) -> Result<Option<PathBuf>> {
    if detect_nfs_state(destination) == NfsState::Symlink {
        replace_symlink(destination, target)?;
        return Ok(None);
    }

    let backup = backup_path(destination);
    fs::rename(destination, &backup).map_err(|e| Error::io_at(destination, e))?;
    debug!("Backed up {} to {}", destination.display(), backup.display());

    if let Err(e) = symlink(target, destination) {
        if let Err(restore) = fs::rename(&backup, destination) {
            warn!(
                "Could not restore {} from {}: {}",
                destination.display(),
                backup.display(),
                restore
            );
        }
        return Err(Error::io_at(destination, e));
    }
    Ok(Some(backup))
}

/// `<path>.bak.<timestamp>`, never an existing path
fn backup_path(path: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let mut base = path.as_os_str().to_owned();
    base.push(format!(".bak.{}", stamp));

    let mut candidate = PathBuf::from(&base);
    let mut n = 1;
    while fs::symlink_metadata(&candidate).is_ok() {
        let mut next = base.clone();
        next.push(format!(".{}", n));
        candidate = PathBuf::from(next);
        n += 1;
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use crate::manifest;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        store: ArchiveStore,
        config: ConvertConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let store = ArchiveStore::open(
                dir.path().join("images"),
                dir.path().join("cefs"),
                HashAlgorithm::Sha256,
            )
            .unwrap();
            let config = ConvertConfig {
                nfs_root: dir.path().join("nfs"),
                squash_image_root: dir.path().join("squash"),
                installed_marker: None,
            };
            Self { dir, store, config }
        }

        /// Legacy directory plus a pre-built archive, "mounted" in advance
        fn legacy(&self, name: &str) -> PrebuiltInstallation {
            let dest = self.config.nfs_root.join(name);
            fs::create_dir_all(dest.join("bin")).unwrap();
            fs::write(dest.join("bin/tool"), name.as_bytes()).unwrap();

            let install = PrebuiltInstallation::from_config(&self.config, &dest).unwrap();
            fs::create_dir_all(install.archive.parent().unwrap()).unwrap();
            fs::write(&install.archive, format!("image of {}", name)).unwrap();

            let stem = self.store.hash_file(&install.archive).unwrap();
            let mounted = self.store.mount_path(&stem);
            fs::create_dir_all(mounted.join("bin")).unwrap();
            fs::write(mounted.join("bin/tool"), name.as_bytes()).unwrap();
            install
        }
    }

    #[test]
    fn test_detect_nfs_state() {
        let fx = Fixture::new();
        let dir = fx.dir.path().join("d");
        fs::create_dir(&dir).unwrap();
        let link = fx.dir.path().join("l");
        symlink(&dir, &link).unwrap();

        assert_eq!(detect_nfs_state(&dir), NfsState::Directory);
        assert_eq!(detect_nfs_state(&link), NfsState::Symlink);
        assert_eq!(detect_nfs_state(&fx.dir.path().join("x")), NfsState::Missing);
    }

    #[test]
    fn test_from_config_mirrors_layout() {
        let fx = Fixture::new();
        let install =
            PrebuiltInstallation::from_config(&fx.config, &fx.config.nfs_root.join("arm/gcc-13"))
                .unwrap();
        assert_eq!(install.name(), "arm/gcc-13");
        assert_eq!(
            install.archive,
            fx.config.squash_image_root.join("arm/gcc-13.img")
        );
        assert!(PrebuiltInstallation::from_config(&fx.config, Path::new("/elsewhere")).is_err());
        assert!(PrebuiltInstallation::from_config(&fx.config, &fx.config.nfs_root).is_err());
    }

    #[test]
    fn test_convert_then_short_circuit() {
        let fx = Fixture::new();
        let install = fx.legacy("gcc-13.2.0");
        let dest = install.destination().to_path_buf();

        let outcome = convert_to_cefs(&install, &fx.store, ConvertOptions::default()).unwrap();
        let ConvertOutcome::Converted { receipt, backup } = outcome else {
            panic!("expected conversion, got {outcome:?}");
        };
        assert_eq!(detect_nfs_state(&dest), NfsState::Symlink);
        assert_eq!(fs::read_link(&dest).unwrap(), fx.store.mount_path(&receipt.stem));
        let backup = backup.unwrap();
        assert!(backup.join("bin/tool").exists());

        let manifest = manifest::read(&receipt.archive_path).unwrap();
        assert_eq!(manifest.operation, Operation::Convert);
        assert_eq!(manifest.contents.len(), 1);
        assert_eq!(manifest.contents[0].destination, dest);

        let again = convert_to_cefs(&install, &fx.store, ConvertOptions::default()).unwrap();
        assert_eq!(again, ConvertOutcome::AlreadyConverted);
    }

    #[test]
    fn test_dry_run_touches_nothing() {
        let fx = Fixture::new();
        let install = fx.legacy("clang-17");
        let options = ConvertOptions {
            dry_run: true,
            ..Default::default()
        };

        let outcome = convert_to_cefs(&install, &fx.store, options).unwrap();
        assert!(matches!(outcome, ConvertOutcome::DryRun { .. }));
        assert_eq!(detect_nfs_state(install.destination()), NfsState::Directory);
        assert!(fx.store.list_archives().unwrap().is_empty());
    }

    #[test]
    fn test_missing_path_is_an_error() {
        let fx = Fixture::new();
        let install = PrebuiltInstallation::new("ghost", fx.dir.path().join("ghost"), "/nope.img");
        let err = convert_to_cefs(&install, &fx.store, ConvertOptions::default()).unwrap_err();
        assert!(matches!(err, Error::NothingToConvert(_)));
    }

    #[test]
    fn test_verification_failure_is_distinct() {
        let fx = Fixture::new();
        let install = fx.legacy("broken").with_installed_marker("bin/missing-binary");

        let err = convert_to_cefs(&install, &fx.store, ConvertOptions::default()).unwrap_err();
        assert_eq!(err.class(), crate::error::ErrorClass::Verification);
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_force_reconverts_symlink_without_backup() {
        let fx = Fixture::new();
        let install = fx.legacy("go-1.22");
        convert_to_cefs(&install, &fx.store, ConvertOptions::default()).unwrap();

        let options = ConvertOptions {
            force: true,
            ..Default::default()
        };
        let outcome = convert_to_cefs(&install, &fx.store, options).unwrap();
        let ConvertOutcome::Converted { receipt, backup } = outcome else {
            panic!("expected conversion, got {outcome:?}");
        };
        assert!(backup.is_none());
        assert!(!receipt.written);
    }
}
