// src/catalog/root.rs

//! Root pointers
//!
//! A root pointer is the symlink consumers use to reach the live catalog
//! image. It may be reached through further symlinks (an externally owned
//! path aliasing the real pointer); the last link in the chain is the one
//! that gets rewritten.

use super::CatalogImage;
use crate::error::{Error, Result};
use crate::store::{replace_symlink, stem_under};
use std::fs;
use std::io;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Longest symlink chain followed before giving up
pub const MAX_SYMLINK_HOPS: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootPointer {
    path: PathBuf,
    link: PathBuf,
    image_dir: PathBuf,
    mount_point: PathBuf,
}

impl RootPointer {
    /// Open an existing root pointer at `path`
    pub fn open(path: &Path, mount_point: &Path) -> Result<Self> {
        let is_symlink = fs::symlink_metadata(path)
            .map(|m| m.file_type().is_symlink())
            .unwrap_or(false);
        if !is_symlink {
            return Err(Error::NotARoot(path.to_path_buf()));
        }

        let mut link = path.to_path_buf();
        let mut hops = 0;
        let target = loop {
            let target = absolute_target(&link)?;
            let next_is_link = fs::symlink_metadata(&target)
                .map(|m| m.file_type().is_symlink())
                .unwrap_or(false);
            if !next_is_link {
                break target;
            }
            hops += 1;
            if hops > MAX_SYMLINK_HOPS {
                return Err(Error::structural(
                    path,
                    format!("root pointer chain longer than {} links", MAX_SYMLINK_HOPS),
                ));
            }
            link = target;
        };

        if stem_under(mount_point, &target).is_none() {
            return Err(Error::NotARootSymlink {
                path: path.to_path_buf(),
                target,
            });
        }

        debug!(
            "Root {} -> {} (via {})",
            path.display(),
            target.display(),
            link.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            link,
            image_dir: target,
            mount_point: mount_point.to_path_buf(),
        })
    }

    /// Create a new root pointer at `path` designating `base_image`
    pub fn create(base_image: &Path, path: &Path, mount_point: &Path) -> Result<Self> {
        if fs::symlink_metadata(path).is_ok() {
            return Err(Error::InvalidArgument(format!(
                "{} already exists",
                path.display()
            )));
        }
        if !base_image.is_dir() {
            return Err(Error::InvalidArgument(format!(
                "{} is not a directory",
                base_image.display()
            )));
        }

        // validation only; the loaded catalog is discarded
        CatalogImage::load(base_image, mount_point)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
        }
        symlink(base_image, path).map_err(|e| Error::io_at(path, e))?;
        info!("Created root {} -> {}", path.display(), base_image.display());

        Ok(Self {
            path: path.to_path_buf(),
            link: path.to_path_buf(),
            image_dir: base_image.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
        })
    }

    /// Repoint the writable link at `new_target`
    ///
    /// A temporary symlink is renamed over the link, so readers see either
    /// the old or the new target. An absent link is recreated.
    pub fn update(&mut self, new_target: &Path) -> Result<()> {
        if stem_under(&self.mount_point, new_target).is_none() {
            return Err(Error::NotARootSymlink {
                path: self.link.clone(),
                target: new_target.to_path_buf(),
            });
        }

        replace_symlink(&self.link, new_target)?;

        info!(
            "Root {} now -> {} (was {})",
            self.link.display(),
            new_target.display(),
            self.image_dir.display()
        );
        self.image_dir = new_target.to_path_buf();
        Ok(())
    }

    /// Path the pointer was opened through
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last symlink in the chain, the one [`update`](Self::update) rewrites
    pub fn link(&self) -> &Path {
        &self.link
    }

    /// Catalog image directory currently designated
    pub fn image_dir(&self) -> &Path {
        &self.image_dir
    }

    pub fn load_image(&self) -> Result<CatalogImage> {
        CatalogImage::load(&self.image_dir, &self.mount_point)
    }
}

/// Whether `path` is a symlink that opens as a root pointer
pub fn is_root_pointer(path: &Path, mount_point: &Path) -> bool {
    RootPointer::open(path, mount_point).is_ok()
}

fn absolute_target(link: &Path) -> Result<PathBuf> {
    let target = fs::read_link(link).map_err(|e| match e.kind() {
        io::ErrorKind::InvalidInput => Error::NotARoot(link.to_path_buf()),
        _ => Error::io_at(link, e),
    })?;
    if target.is_absolute() {
        return Ok(target);
    }
    Ok(link
        .parent()
        .map(|parent| parent.join(&target))
        .unwrap_or(target))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        mount: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let mount = dir.path().join("cefs");
            fs::create_dir_all(mount.join("aaaa")).unwrap();
            fs::create_dir_all(mount.join("bbbb")).unwrap();
            Self { dir, mount }
        }

        fn path(&self, name: &str) -> PathBuf {
            self.dir.path().join(name)
        }
    }

    #[test]
    fn test_open_requires_symlink() {
        let fx = Fixture::new();
        let plain = fx.path("plain");
        fs::create_dir(&plain).unwrap();
        let err = RootPointer::open(&plain, &fx.mount).unwrap_err();
        assert!(err.to_string().contains("not a cefs filesystem root"));

        let err = RootPointer::open(&fx.path("missing"), &fx.mount).unwrap_err();
        assert!(err.to_string().contains("not a cefs filesystem root"));
    }

    #[test]
    fn test_open_rejects_target_outside_mount() {
        let fx = Fixture::new();
        let elsewhere = fx.path("elsewhere");
        fs::create_dir(&elsewhere).unwrap();
        let root = fx.path("root");
        symlink(&elsewhere, &root).unwrap();

        let err = RootPointer::open(&root, &fx.mount).unwrap_err();
        assert!(err.to_string().contains("not a CEFS root symlink"));
    }

    #[test]
    fn test_open_follows_chain() {
        let fx = Fixture::new();
        let real = fx.path("real-root");
        symlink(fx.mount.join("aaaa"), &real).unwrap();
        let alias = fx.path("alias");
        symlink(&real, &alias).unwrap();

        let root = RootPointer::open(&alias, &fx.mount).unwrap();
        assert_eq!(root.link(), real.as_path());
        assert_eq!(root.image_dir(), fx.mount.join("aaaa").as_path());
    }

    #[test]
    fn test_cycle_is_structural() {
        let fx = Fixture::new();
        let a = fx.path("a");
        let b = fx.path("b");
        symlink(&b, &a).unwrap();
        symlink(&a, &b).unwrap();

        let err = RootPointer::open(&a, &fx.mount).unwrap_err();
        assert_eq!(err.class(), ErrorClass::Structural);
    }

    #[test]
    fn test_create_and_update() {
        let fx = Fixture::new();
        let path = fx.path("nested/root");
        let mut root = RootPointer::create(&fx.mount.join("aaaa"), &path, &fx.mount).unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), fx.mount.join("aaaa"));

        root.update(&fx.mount.join("bbbb")).unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), fx.mount.join("bbbb"));
        assert_eq!(
            RootPointer::open(&path, &fx.mount).unwrap().image_dir(),
            fx.mount.join("bbbb").as_path()
        );
    }

    #[test]
    fn test_update_tolerates_missing_link() {
        let fx = Fixture::new();
        let path = fx.path("root");
        let mut root = RootPointer::create(&fx.mount.join("aaaa"), &path, &fx.mount).unwrap();
        fs::remove_file(&path).unwrap();
        root.update(&fx.mount.join("bbbb")).unwrap();
        assert_eq!(fs::read_link(&path).unwrap(), fx.mount.join("bbbb"));
    }

    #[test]
    fn test_create_refuses_existing_or_invalid() {
        let fx = Fixture::new();
        let path = fx.path("root");
        RootPointer::create(&fx.mount.join("aaaa"), &path, &fx.mount).unwrap();
        assert!(RootPointer::create(&fx.mount.join("bbbb"), &path, &fx.mount).is_err());

        assert!(
            RootPointer::create(&fx.path("no-such-dir"), &fx.path("other"), &fx.mount).is_err()
        );

        let bad = fx.mount.join("bbbb");
        fs::write(bad.join("stray"), b"x").unwrap();
        let err = RootPointer::create(&bad, &fx.path("third"), &fx.mount).unwrap_err();
        assert!(err.to_string().contains("unexpected file"));
        assert!(fs::symlink_metadata(fx.path("third")).is_err());
    }
}
