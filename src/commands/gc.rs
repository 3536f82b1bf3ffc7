// src/commands/gc.rs
//! Garbage collection

use super::{Context, format_bytes};
use anyhow::{Context as _, Result, bail};
use cefs::GarbageCollector;
use cefs::config::HumanDuration;
use std::path::PathBuf;

pub fn cmd_gc(
    ctx: &Context,
    min_age: Option<HumanDuration>,
    extra_roots: &[PathBuf],
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let min_age = min_age.unwrap_or(ctx.config.gc.min_age);
    let mut roots = ctx.config.gc.roots.clone();
    roots.extend(extra_roots.iter().cloned());
    if roots.is_empty() {
        bail!("no gc roots configured; refusing to treat every archive as unreferenced");
    }

    let gc = GarbageCollector::new(&ctx.store, roots, min_age.0);
    let summary = gc.run(dry_run).context("Garbage collection failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Archives:      {}", summary.total_images);
        println!("  referenced:  {}", summary.referenced_images);
        println!("  unreferenced: {}", summary.unreferenced_images);
        println!("  too recent:  {} (younger than {})", summary.too_recent, min_age);
        println!("Reclaimable:   {}", format_bytes(summary.reclaimable_bytes));
        if dry_run {
            println!("Dry run: nothing deleted");
        } else {
            println!(
                "Deleted:       {} ({})",
                summary.deleted,
                format_bytes(summary.deleted_bytes)
            );
            if summary.temp_files_removed + summary.markers_removed > 0 {
                println!(
                    "Swept:         {} temp files, {} stale markers",
                    summary.temp_files_removed, summary.markers_removed
                );
            }
        }
        for error in &summary.errors {
            eprintln!("error: {}", error);
        }
    }

    if !summary.errors.is_empty() {
        bail!("{} archives could not be deleted", summary.errors.len());
    }
    Ok(())
}
