// src/commands/consolidate.rs
//! Consolidation of small archives

use super::{Context, format_bytes};
use anyhow::{Context as _, Result};
use cefs::consolidate::{consolidate, find_candidates, plan_batches};

pub fn cmd_consolidate(ctx: &Context, dry_run: bool) -> Result<()> {
    let settings = &ctx.config.consolidation;
    let candidates = find_candidates(
        &ctx.store,
        &ctx.config.convert.nfs_root,
        settings.max_item_size.0,
    )
    .context("Failed to find consolidation candidates")?;
    let found = candidates.len();
    let batches = plan_batches(candidates, settings.max_batch_size.0, settings.min_items);

    println!(
        "{} candidates, {} batches (max {} per batch, at least {} items)",
        found,
        batches.len(),
        settings.max_batch_size,
        settings.min_items
    );

    let builder = ctx.builder();
    for (index, batch) in batches.iter().enumerate() {
        let size: u64 = batch.iter().map(|c| c.size).sum();
        println!("Batch {}: {} items, {}", index + 1, batch.len(), format_bytes(size));
        for candidate in batch {
            println!("  {}", candidate.destination.display());
        }
        if dry_run {
            continue;
        }

        let receipt = consolidate(&ctx.store, &builder, ctx.extractor(), batch)
            .with_context(|| format!("Failed to consolidate batch {}", index + 1))?;
        println!("  -> {}", ctx.store.mount_path(&receipt.stem).display());
    }
    Ok(())
}
