// src/commands/root.rs
//! Root pointer commands

use super::Context;
use anyhow::{Context as _, Result};
use cefs::RootPointer;
use cefs::deploy::publish_catalog;
use std::path::Path;

pub fn cmd_root_create(ctx: &Context, base_image: &Path, path: &Path) -> Result<()> {
    RootPointer::create(base_image, path, ctx.store.mount_point())
        .with_context(|| format!("Failed to create root {}", path.display()))?;
    println!("Created {} -> {}", path.display(), base_image.display());
    Ok(())
}

pub fn cmd_root_show(ctx: &Context, path: &Path) -> Result<()> {
    let root = RootPointer::open(path, ctx.store.mount_point())?;
    let image = root.load_image()?;

    println!("Root:     {}", root.path().display());
    if root.link() != root.path() {
        println!("Via:      {}", root.link().display());
    }
    println!("Image:    {}", root.image_dir().display());
    println!("Entries:  {}", image.entries().len());
    for (rel, target) in image.entries() {
        println!("  {} -> {}", rel.display(), target.display());
    }
    if !image.metadata().is_empty() {
        println!("Metadata:");
        for line in image.metadata() {
            println!("  {}", line);
        }
    }
    Ok(())
}

pub fn cmd_root_link(
    ctx: &Context,
    root_path: &Path,
    entry: &Path,
    target: &Path,
    message: Option<&str>,
) -> Result<()> {
    let mut root = RootPointer::open(root_path, ctx.store.mount_point())?;
    let mut image = root.load_image()?;
    image
        .link_path(entry, target)
        .with_context(|| format!("Cannot link {}", entry.display()))?;
    image.add_metadata(message.map(str::to_string).unwrap_or_else(|| {
        format!(
            "{} linked {} -> {}",
            chrono::Utc::now().to_rfc3339(),
            entry.display(),
            target.display()
        )
    }));

    let builder = ctx.builder();
    let receipt = publish_catalog(
        &ctx.store,
        &builder,
        &image,
        &mut root,
        &format!("Catalog update: {}", entry.display()),
    )
    .context("Failed to publish catalog")?;

    println!(
        "{} now -> {}",
        root.link().display(),
        ctx.store.mount_path(&receipt.stem).display()
    );
    Ok(())
}
