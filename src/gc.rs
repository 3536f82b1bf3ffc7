// src/gc.rs

//! Garbage collection of unreferenced archives
//!
//! Liveness is computed by scanning the configured roots for symlinks into
//! the mount point. Every catalog image reached that way is loaded and its
//! entries count as references too. Archives referenced by nothing and older
//! than the minimum age are deleted together with their manifests; younger
//! ones are protected since they may belong to a deploy still in flight.

use crate::catalog::{CatalogImage, METADATA_FILENAME, RootPointer};
use crate::error::{Error, Result};
use crate::manifest;
use crate::store::{ArchiveStore, stem_under};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Archives split by the age safety margin
#[derive(Debug, Default)]
pub struct AgeFilter {
    /// Eligible for deletion
    pub old_enough: Vec<PathBuf>,
    /// Protected, with their current age
    pub too_recent: Vec<(PathBuf, Duration)>,
}

/// Partition `images` by modification time
///
/// An image whose mtime cannot be read counts as old enough.
pub fn filter_images_by_age(images: &[PathBuf], min_age: Duration, now: SystemTime) -> AgeFilter {
    let mut filter = AgeFilter::default();
    for image in images {
        let mtime = match fs::metadata(image).and_then(|m| m.modified()) {
            Ok(mtime) => mtime,
            Err(e) => {
                warn!("Cannot stat {} ({}), treating as old", image.display(), e);
                filter.old_enough.push(image.clone());
                continue;
            }
        };

        let age = now.duration_since(mtime).unwrap_or(Duration::ZERO);
        if age >= min_age {
            filter.old_enough.push(image.clone());
        } else {
            filter.too_recent.push((image.clone(), age));
        }
    }
    filter
}

/// Whether `symlink` points at (something inside) the archive `image_stem`
pub fn check_if_symlink_references_image(symlink: &Path, image_stem: &str, mount_point: &Path) -> bool {
    match fs::read_link(symlink) {
        Ok(target) => stem_under(mount_point, &target).as_deref() == Some(image_stem),
        Err(_) => false,
    }
}

/// Union of archive stems referenced from all `roots`
///
/// A root that is a root pointer contributes its catalog image. Any catalog
/// image reached through a symlink is loaded as well. Roots are scanned in
/// parallel. A missing root or malformed catalog fails the whole scan.
pub fn collect_referenced_stems(roots: &[PathBuf], mount_point: &Path) -> Result<BTreeSet<String>> {
    let per_root = roots
        .par_iter()
        .map(|root| scan_root(root, mount_point))
        .collect::<Result<Vec<_>>>()?;

    Ok(per_root.into_iter().flatten().collect())
}

fn scan_root(root: &Path, mount_point: &Path) -> Result<BTreeSet<String>> {
    if fs::symlink_metadata(root).is_err() {
        return Err(Error::InvalidArgument(format!(
            "gc root does not exist: {}",
            root.display()
        )));
    }

    let mut stems = BTreeSet::new();
    let mut catalogs = Vec::new();

    if let Ok(pointer) = RootPointer::open(root, mount_point) {
        catalogs.push(pointer.image_dir().to_path_buf());
    }

    for entry in WalkDir::new(root)
        .follow_links(false)
        .follow_root_links(false)
    {
        let entry = entry?;
        if !entry.path_is_symlink() {
            continue;
        }
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        let Some(stem) = stem_under(mount_point, &target) else {
            continue;
        };
        if target.join(METADATA_FILENAME).is_file() {
            catalogs.push(target.clone());
        }
        stems.insert(stem);
    }

    // catalogs may link to further catalogs
    let mut loaded = BTreeSet::new();
    while let Some(dir) = catalogs.pop() {
        if !loaded.insert(dir.clone()) {
            continue;
        }
        let image = CatalogImage::load(&dir, mount_point)?;
        for target in image.entries().values() {
            if target.join(METADATA_FILENAME).is_file() {
                catalogs.push(target.clone());
            }
        }
        stems.extend(image.referenced_stems());
        if let Some(stem) = stem_under(mount_point, &dir) {
            stems.insert(stem);
        }
    }

    debug!(
        "{}: {} referenced archives",
        root.display(),
        stems.len()
    );
    Ok(stems)
}

/// Delete an archive, then its manifest sidecars
///
/// Only the archive deletion can fail; sidecar failures are logged.
pub fn delete_image_with_manifest(archive: &Path) -> Result<()> {
    fs::remove_file(archive).map_err(|e| Error::io_at(archive, e))?;
    if let Err(e) = manifest::delete(archive) {
        warn!("Deleted {} but not its manifest: {}", archive.display(), e);
    }
    if let Err(e) = manifest::discard_in_progress(archive) {
        warn!("Deleted {} but not its marker: {}", archive.display(), e);
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GcSummary {
    pub total_images: usize,
    pub referenced_images: usize,
    pub unreferenced_images: usize,
    /// Unreferenced but protected by the minimum age
    pub too_recent: usize,
    /// Bytes held by unreferenced images old enough to delete
    pub reclaimable_bytes: u64,
    pub deleted: usize,
    pub deleted_bytes: u64,
    pub temp_files_removed: usize,
    pub markers_removed: usize,
    pub errors: Vec<String>,
}

/// What a collection would do
#[derive(Debug, Default)]
pub struct GcPlan {
    pub summary: GcSummary,
    /// Unreferenced, old enough archives with their sizes
    pub deletable: Vec<(PathBuf, u64)>,
    pub too_recent: Vec<(PathBuf, Duration)>,
    pub stale_temp_files: Vec<PathBuf>,
    /// Markers whose archive no longer exists
    pub orphaned_markers: Vec<PathBuf>,
}

pub struct GarbageCollector<'a> {
    store: &'a ArchiveStore,
    roots: Vec<PathBuf>,
    min_age: Duration,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(store: &'a ArchiveStore, roots: Vec<PathBuf>, min_age: Duration) -> Self {
        Self {
            store,
            roots,
            min_age,
        }
    }

    pub fn plan(&self, now: SystemTime) -> Result<GcPlan> {
        let referenced = collect_referenced_stems(&self.roots, self.store.mount_point())?;
        let images = self.store.list_archives()?;

        let unreferenced: Vec<PathBuf> = images
            .iter()
            .filter(|image| {
                ArchiveStore::stem_of(image).is_none_or(|stem| !referenced.contains(stem))
            })
            .cloned()
            .collect();

        let by_age = filter_images_by_age(&unreferenced, self.min_age, now);
        let deletable: Vec<(PathBuf, u64)> = by_age
            .old_enough
            .into_iter()
            .map(|path| {
                let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
                (path, size)
            })
            .collect();

        let stale_temp_files =
            filter_images_by_age(&self.store.list_temp_files()?, self.min_age, now).old_enough;

        let markers: Vec<PathBuf> = self
            .store
            .list_in_progress()?
            .into_iter()
            .filter(|marker| manifest::archive_for_marker(marker).is_some_and(|a| !a.exists()))
            .collect();
        let orphaned_markers = filter_images_by_age(&markers, self.min_age, now).old_enough;

        let summary = GcSummary {
            total_images: images.len(),
            referenced_images: images.len() - unreferenced.len(),
            unreferenced_images: unreferenced.len(),
            too_recent: by_age.too_recent.len(),
            reclaimable_bytes: deletable.iter().map(|(_, size)| size).sum(),
            ..GcSummary::default()
        };

        Ok(GcPlan {
            summary,
            deletable,
            too_recent: by_age.too_recent,
            stale_temp_files,
            orphaned_markers,
        })
    }

    /// Collect garbage, or only report it with `dry_run`
    pub fn run(&self, dry_run: bool) -> Result<GcSummary> {
        let plan = self.plan(SystemTime::now())?;
        let mut summary = plan.summary;

        for (path, age) in &plan.too_recent {
            debug!(
                "Keeping {} (age {}s < {}s)",
                path.display(),
                age.as_secs(),
                self.min_age.as_secs()
            );
        }

        if dry_run {
            for (path, size) in &plan.deletable {
                info!("Would delete {} ({} bytes)", path.display(), size);
            }
            return Ok(summary);
        }

        for (path, size) in &plan.deletable {
            match delete_image_with_manifest(path) {
                Ok(()) => {
                    info!("Deleted {} ({} bytes)", path.display(), size);
                    summary.deleted += 1;
                    summary.deleted_bytes += size;
                }
                Err(e) => {
                    warn!("Failed to delete {}: {}", path.display(), e);
                    summary.errors.push(e.to_string());
                }
            }
        }

        for temp in &plan.stale_temp_files {
            match fs::remove_file(temp) {
                Ok(()) => summary.temp_files_removed += 1,
                Err(e) => summary.errors.push(Error::io_at(temp, e).to_string()),
            }
        }
        for marker in &plan.orphaned_markers {
            match fs::remove_file(marker) {
                Ok(()) => summary.markers_removed += 1,
                Err(e) => summary.errors.push(Error::io_at(marker, e).to_string()),
            }
        }

        info!(
            deleted = summary.deleted,
            deleted_bytes = summary.deleted_bytes,
            errors = summary.errors.len(),
            "GC complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::HashAlgorithm;
    use std::fs::File;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn touch_aged(path: &Path, age: Duration, now: SystemTime) {
        fs::write(path, b"x").unwrap();
        File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(now - age)
            .unwrap();
    }

    #[test]
    fn test_filter_images_by_age() {
        let dir = TempDir::new().unwrap();
        let now = SystemTime::now();
        let old = dir.path().join("old.sqfs");
        let young = dir.path().join("young.sqfs");
        let gone = dir.path().join("gone.sqfs");
        touch_aged(&old, Duration::from_secs(2 * 3600), now);
        touch_aged(&young, Duration::from_secs(30 * 60), now);

        let filter = filter_images_by_age(
            &[old.clone(), young.clone(), gone.clone()],
            Duration::from_secs(3600),
            now,
        );
        assert_eq!(filter.old_enough, vec![old, gone]);
        assert_eq!(filter.too_recent.len(), 1);
        assert_eq!(filter.too_recent[0].0, young);
        assert_eq!(filter.too_recent[0].1.as_secs(), 30 * 60);
    }

    #[test]
    fn test_check_if_symlink_references_image() {
        let dir = TempDir::new().unwrap();
        let mount = Path::new("/cefs");
        let link = dir.path().join("gcc");
        symlink("/cefs/abcd/gcc-13", &link).unwrap();

        assert!(check_if_symlink_references_image(&link, "abcd", mount));
        assert!(!check_if_symlink_references_image(&link, "abc", mount));
        assert!(!check_if_symlink_references_image(&link, "abcd", Path::new("/other")));

        let relative = dir.path().join("rel");
        symlink("cefs/abcd", &relative).unwrap();
        assert!(!check_if_symlink_references_image(&relative, "abcd", Path::new("cefs")));
        assert!(!check_if_symlink_references_image(&dir.path().join("none"), "abcd", mount));
    }

    #[test]
    fn test_collect_follows_catalogs() {
        let dir = TempDir::new().unwrap();
        let mount = dir.path().join("cefs");

        // catalog archive "cat" is mounted and lists "leaf"
        let mut image = CatalogImage::new(&mount);
        image.link_path("tools/leaf", mount.join("leaf")).unwrap();
        image.add_metadata("initial");
        image.render_to(&mount.join("cat")).unwrap();

        let roots = dir.path().join("roots");
        fs::create_dir(&roots).unwrap();
        symlink(mount.join("cat"), roots.join("live")).unwrap();
        symlink(mount.join("direct/bin"), roots.join("direct")).unwrap();

        let stems = collect_referenced_stems(&[roots], &mount).unwrap();
        let stems: Vec<_> = stems.into_iter().collect();
        assert_eq!(stems, vec!["cat", "direct", "leaf"]);
    }

    #[test]
    fn test_missing_root_aborts() {
        let dir = TempDir::new().unwrap();
        let err = collect_referenced_stems(&[dir.path().join("nope")], Path::new("/cefs"));
        assert!(err.is_err());
    }

    #[test]
    fn test_delete_image_with_manifest() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("abc.sqfs");
        fs::write(&archive, b"a").unwrap();
        fs::write(manifest::manifest_path(&archive), b"m").unwrap();

        delete_image_with_manifest(&archive).unwrap();
        assert!(!archive.exists());
        assert!(!manifest::manifest_path(&archive).exists());
        assert!(delete_image_with_manifest(&archive).is_err());
    }

    #[test]
    fn test_sweeps_temp_files_and_orphaned_markers() {
        let dir = TempDir::new().unwrap();
        let store = ArchiveStore::open(
            dir.path().join("images"),
            dir.path().join("cefs"),
            HashAlgorithm::Sha256,
        )
        .unwrap();
        let roots = dir.path().join("roots");
        fs::create_dir(&roots).unwrap();
        let now = SystemTime::now();
        let old = Duration::from_secs(7200);

        let temp = store.temp_path();
        touch_aged(&temp, old, now);
        let marker = manifest::in_progress_path(&store.archive_path("dead"));
        touch_aged(&marker, old, now);
        let fresh_temp = store.temp_path();
        touch_aged(&fresh_temp, Duration::from_secs(5), now);

        let gc = GarbageCollector::new(&store, vec![roots], Duration::from_secs(3600));
        let summary = gc.run(false).unwrap();
        assert_eq!(summary.temp_files_removed, 1);
        assert_eq!(summary.markers_removed, 1);
        assert!(!temp.exists());
        assert!(!marker.exists());
        assert!(fresh_temp.exists());
    }
}
