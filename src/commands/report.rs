// src/commands/report.rs
//! Read-only reporting: describe and stats

use super::{Context, format_bytes};
use anyhow::{Context as _, Result, bail};
use cefs::consolidate::{bytes_by_operation, compute_usage_statistics};
use cefs::gc::collect_referenced_stems;
use cefs::manifest;

pub fn cmd_describe(ctx: &Context, target: &str) -> Result<()> {
    let Some(archive) = ctx.store.resolve(target) else {
        bail!("{} does not name an archive", target);
    };
    if !archive.exists() {
        bail!("archive {} is not in the store", archive.display());
    }

    println!("Archive:  {}", archive.display());
    if let Some(stem) = cefs::ArchiveStore::stem_of(&archive) {
        println!("Mount:    {}", ctx.store.mount_path(stem).display());
    }

    let Some(manifest) = manifest::read(&archive) else {
        if manifest::in_progress_path(&archive).exists() {
            println!("Manifest: in progress (deploy not committed)");
        } else {
            println!("Manifest: none");
        }
        return Ok(());
    };

    println!("Operation: {}", manifest.operation);
    println!("Description: {}", manifest.description);
    println!("Created:  {}", manifest.created_at.to_rfc3339());
    println!("Git SHA:  {}", manifest.git_sha);
    println!("Command:  {}", manifest.command.join(" "));
    println!("Contents:");
    for entry in &manifest.contents {
        match &entry.extraction_path {
            Some(sub) => println!(
                "  {} -> {} (at {})",
                entry.name,
                entry.destination.display(),
                sub.display()
            ),
            None => println!("  {} -> {}", entry.name, entry.destination.display()),
        }
    }
    Ok(())
}

pub fn cmd_stats(ctx: &Context, json: bool) -> Result<()> {
    let referenced = collect_referenced_stems(&ctx.config.gc.roots, ctx.store.mount_point())
        .context("Failed to scan roots")?;
    let stats = compute_usage_statistics(&ctx.store, &referenced)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Individual archives:   {}", stats.individual_images);
    println!("Consolidated archives: {}", stats.consolidated_images);
    println!("  fully used:          {}", stats.fully_used_consolidated.len());
    println!("  partially used:      {}", stats.partially_used_consolidated.len());
    for partial in &stats.partially_used_consolidated {
        println!(
            "    {} {}/{} items ({:.0}%), {}",
            partial.stem,
            partial.used_items,
            partial.total_items,
            partial.usage * 100.0,
            format_bytes(partial.size)
        );
    }
    println!("Unused archives:       {}", stats.unused_images.len());
    println!("Total size:            {}", format_bytes(stats.total_bytes));
    println!("Estimated waste:       {}", format_bytes(stats.wasted_bytes));

    for (operation, bytes) in bytes_by_operation(&ctx.store)? {
        println!("  {:<12} {}", operation, format_bytes(bytes));
    }
    Ok(())
}
