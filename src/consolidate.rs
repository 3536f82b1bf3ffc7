// src/consolidate.rs

//! Consolidation of small archives
//!
//! Every archive costs a mount. Many small single-component archives are
//! folded into one composite archive holding each component in its own
//! `item_NN` subdirectory; the components' symlinks are then repointed into
//! the composite. The manifest of the composite records where every
//! component lives so it can be re-extracted later.

use crate::config::ConsolidationConfig;
use crate::deploy::{DeployReceipt, deploy};
use crate::error::{Error, Result};
use crate::gc::check_if_symlink_references_image;
use crate::manifest::{self, ContentEntry, Manifest, Operation};
use crate::store::format::Extractor;
use crate::store::{ArchiveBuilder, ArchiveStore, Transfer, replace_symlink, stem_under};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// One component eligible for folding into a composite archive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsolidationCandidate {
    pub name: String,
    /// Symlink that exposes the component
    pub destination: PathBuf,
    pub source_archive: PathBuf,
    pub size: u64,
    /// Subtree of `source_archive` holding the component
    pub extraction_path: Option<PathBuf>,
}

impl ConsolidationCandidate {
    /// Mount path the destination must point at to still be this candidate
    fn expected_target(&self, store: &ArchiveStore) -> Option<PathBuf> {
        let stem = ArchiveStore::stem_of(&self.source_archive)?;
        let base = store.mount_path(stem);
        Some(match &self.extraction_path {
            Some(sub) => base.join(sub),
            None => base,
        })
    }
}

/// Find small components under `nfs_root` worth folding together
///
/// Single-component archives qualify when no larger than `max_item_size`.
/// Components still live inside a partially used consolidated archive are
/// re-derived from their `item_NN` subtree, sized as their share of it.
pub fn find_candidates(
    store: &ArchiveStore,
    nfs_root: &Path,
    max_item_size: u64,
) -> Result<Vec<ConsolidationCandidate>> {
    let mut candidates = Vec::new();
    let mut seen = BTreeSet::new();

    for entry in WalkDir::new(nfs_root)
        .follow_links(false)
        .sort_by_file_name()
        .min_depth(1)
    {
        let entry = entry?;
        if !entry.path_is_symlink() {
            continue;
        }
        let Ok(target) = fs::read_link(entry.path()) else {
            continue;
        };
        let Some(stem) = stem_under(store.mount_point(), &target) else {
            continue;
        };
        let sub = target
            .strip_prefix(store.mount_path(&stem))
            .ok()
            .filter(|rel| !rel.as_os_str().is_empty())
            .map(Path::to_path_buf);
        if !seen.insert((stem.clone(), sub.clone())) {
            continue;
        }

        let archive = store.archive_path(&stem);
        let Ok(meta) = fs::metadata(&archive) else {
            debug!("{} references missing archive {}", entry.path().display(), stem);
            continue;
        };
        let Some(manifest) = manifest::read(&archive) else {
            continue;
        };

        let size = match manifest.contents.as_slice() {
            [content] if content.extraction_path == sub => meta.len(),
            [_] => continue,
            contents if manifest.operation == Operation::Consolidate => {
                let mount_point = store.mount_point();
                let live = contents
                    .iter()
                    .filter(|c| check_if_symlink_references_image(&c.destination, &stem, mount_point))
                    .count();
                if live == contents.len() {
                    continue;
                }
                meta.len() / contents.len() as u64
            }
            _ => continue,
        };
        if size > max_item_size {
            continue;
        }
        let Some(content) = manifest
            .contents
            .iter()
            .find(|c| c.extraction_path == sub && c.destination == entry.path())
            .or_else(|| manifest.contents.iter().find(|c| c.extraction_path == sub))
        else {
            continue;
        };

        candidates.push(ConsolidationCandidate {
            name: content.name.clone(),
            destination: entry.path().to_path_buf(),
            source_archive: archive,
            size,
            extraction_path: sub,
        });
    }

    debug!("Found {} consolidation candidates", candidates.len());
    Ok(candidates)
}

/// Group candidates greedily into batches bounded by `max_batch_size`
///
/// Batches with fewer than `min_items` candidates are dropped.
pub fn plan_batches(
    mut candidates: Vec<ConsolidationCandidate>,
    max_batch_size: u64,
    min_items: usize,
) -> Vec<Vec<ConsolidationCandidate>> {
    candidates.sort_by(|a, b| a.destination.cmp(&b.destination));

    let mut batches = Vec::new();
    let mut current: Vec<ConsolidationCandidate> = Vec::new();
    let mut current_size = 0u64;

    for candidate in candidates {
        if !current.is_empty() && current_size + candidate.size > max_batch_size {
            batches.push(std::mem::take(&mut current));
            current_size = 0;
        }
        current_size += candidate.size;
        current.push(candidate);
    }
    if !current.is_empty() {
        batches.push(current);
    }

    batches.retain(|batch| batch.len() >= min_items.max(1));
    batches
}

/// Name of the subdirectory holding the `index`th component
pub fn item_dir(index: usize) -> PathBuf {
    PathBuf::from(format!("item_{:02}", index))
}

/// Fold `batch` into one composite archive and repoint its symlinks
pub fn consolidate(
    store: &ArchiveStore,
    builder: &ArchiveBuilder<'_>,
    extractor: &dyn Extractor,
    batch: &[ConsolidationCandidate],
) -> Result<DeployReceipt> {
    if batch.is_empty() {
        return Err(Error::InvalidArgument("empty consolidation batch".to_string()));
    }

    let staging = builder.staging()?;
    let mut contents = Vec::with_capacity(batch.len());
    for (index, candidate) in batch.iter().enumerate() {
        let sub = item_dir(index);
        extractor.extract(
            &candidate.source_archive,
            candidate.extraction_path.as_deref(),
            &staging.path().join(&sub),
        )?;
        contents.push(
            ContentEntry::new(&candidate.name, &candidate.destination).with_extraction_path(sub),
        );
    }
    let archive = builder.compress(staging)?;

    let manifest = Manifest::new(
        Operation::Consolidate,
        format!("Consolidated {} items", batch.len()),
        contents,
    );
    let (receipt, ()) = deploy(store, &archive.path, Transfer::Move, &manifest, |tx| {
        // refuse if anything moved since planning
        let mut repoints = Vec::with_capacity(batch.len());
        for (index, candidate) in batch.iter().enumerate() {
            let expected = candidate.expected_target(store);
            let current = fs::read_link(&candidate.destination)
                .ok()
                .filter(|current| Some(current) == expected.as_ref());
            let Some(current) = current else {
                return Err(Error::structural(
                    &candidate.destination,
                    "symlink changed since consolidation was planned",
                ));
            };
            repoints.push(Repoint {
                link: candidate.destination.clone(),
                from: current,
                to: tx.mount_path().join(item_dir(index)),
            });
        }
        repoint_all(&repoints, replace_symlink)
    })?;

    info!(
        stem = %receipt.stem,
        items = batch.len(),
        "Consolidated archives"
    );
    Ok(receipt)
}

/// One symlink swap, with the target to put back on failure
#[derive(Debug, Clone)]
struct Repoint {
    link: PathBuf,
    from: PathBuf,
    to: PathBuf,
}

/// Apply every repoint or none of them
///
/// When a swap fails, links already swapped are pointed back at their
/// previous targets before the error is returned.
fn repoint_all(
    repoints: &[Repoint],
    mut swap: impl FnMut(&Path, &Path) -> Result<()>,
) -> Result<()> {
    for (done, repoint) in repoints.iter().enumerate() {
        if let Err(e) = swap(&repoint.link, &repoint.to) {
            for undo in repoints[..done].iter().rev() {
                if let Err(restore) = swap(&undo.link, &undo.from) {
                    warn!(
                        "Could not restore {} -> {}: {}",
                        undo.link.display(),
                        undo.from.display(),
                        restore
                    );
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Plan and run consolidation over everything under `nfs_root`
pub fn consolidate_all(
    store: &ArchiveStore,
    builder: &ArchiveBuilder<'_>,
    extractor: &dyn Extractor,
    nfs_root: &Path,
    config: &ConsolidationConfig,
) -> Result<Vec<DeployReceipt>> {
    let candidates = find_candidates(store, nfs_root, config.max_item_size.0)?;
    let batches = plan_batches(candidates, config.max_batch_size.0, config.min_items);
    batches
        .iter()
        .map(|batch| consolidate(store, builder, extractor, batch))
        .collect()
}

/// Usage of one consolidated archive
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartialUsage {
    pub stem: String,
    pub used_items: usize,
    pub total_items: usize,
    pub usage: f64,
    pub size: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UsageStatistics {
    pub individual_images: usize,
    pub consolidated_images: usize,
    pub fully_used_consolidated: Vec<String>,
    pub partially_used_consolidated: Vec<PartialUsage>,
    pub unused_images: Vec<String>,
    pub total_bytes: u64,
    /// Bytes held for content nobody references
    pub wasted_bytes: u64,
}

/// Cross-reference every archive's manifest against live symlinks
///
/// An entry counts as used when its destination symlink still points into
/// the archive. Archives without a manifest fall back to `referenced`.
pub fn compute_usage_statistics(
    store: &ArchiveStore,
    referenced: &BTreeSet<String>,
) -> Result<UsageStatistics> {
    let mut stats = UsageStatistics::default();
    let mount_point = store.mount_point();

    for archive in store.list_archives()? {
        let Some(stem) = ArchiveStore::stem_of(&archive).map(str::to_string) else {
            continue;
        };
        let size = fs::metadata(&archive).map_err(|e| Error::io_at(&archive, e))?.len();
        stats.total_bytes += size;

        let manifest = manifest::read(&archive);
        let entries = manifest.as_ref().map(|m| m.contents.as_slice()).unwrap_or(&[]);
        let is_consolidated = manifest
            .as_ref()
            .is_some_and(|m| m.operation == Operation::Consolidate);

        let (used, total) = if entries.is_empty() {
            (usize::from(referenced.contains(&stem)), 1)
        } else {
            let used = entries
                .iter()
                .filter(|e| check_if_symlink_references_image(&e.destination, &stem, mount_point))
                .count();
            (used, entries.len())
        };

        if is_consolidated {
            stats.consolidated_images += 1;
        } else {
            stats.individual_images += 1;
        }

        if used == 0 {
            stats.unused_images.push(stem);
            stats.wasted_bytes += size;
        } else if used == total {
            if is_consolidated {
                stats.fully_used_consolidated.push(stem);
            }
        } else if is_consolidated {
            let usage = used as f64 / total as f64;
            stats.wasted_bytes += (size as f64 * (1.0 - usage)) as u64;
            stats.partially_used_consolidated.push(PartialUsage {
                stem,
                used_items: used,
                total_items: total,
                usage,
                size,
            });
        }
    }

    Ok(stats)
}

/// Sizes grouped by operation, for reporting
pub fn bytes_by_operation(store: &ArchiveStore) -> Result<BTreeMap<String, u64>> {
    let mut totals = BTreeMap::new();
    for archive in store.list_archives()? {
        let size = fs::metadata(&archive).map_err(|e| Error::io_at(&archive, e))?.len();
        let key = manifest::read(&archive)
            .map(|m| m.operation.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        *totals.entry(key).or_insert(0) += size;
    }
    Ok(totals)
}
