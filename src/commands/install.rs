// src/commands/install.rs
//! Install a staged directory into the store

use super::Context;
use anyhow::{Context as _, Result, bail};
use cefs::deploy::deploy;
use cefs::manifest::{ContentEntry, Manifest, Operation};
use cefs::store::{StagingDir, Transfer, replace_symlink};
use std::fs;
use std::path::Path;
use tracing::info;

pub fn cmd_install(
    ctx: &Context,
    staged: &Path,
    destination: &Path,
    name: Option<&str>,
    description: Option<&str>,
) -> Result<()> {
    if !staged.is_dir() {
        bail!("{} is not a directory", staged.display());
    }
    if let Ok(meta) = fs::symlink_metadata(destination)
        && !meta.file_type().is_symlink()
    {
        bail!(
            "{} exists and is not a symlink; use `cefs convert` for legacy directories",
            destination.display()
        );
    }

    let name = match name {
        Some(name) => name.to_string(),
        None => destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .context("destination has no file name")?,
    };
    let description = description
        .map(str::to_string)
        .unwrap_or_else(|| format!("Installed {}", name));

    info!("Installing {} from {}", name, staged.display());
    let builder = ctx.builder();
    let staging = StagingDir::copy_of(staged, &ctx.config.temp_dir)
        .with_context(|| format!("Failed to stage {}", staged.display()))?;
    let archive = builder.compress(staging).context("Failed to build archive")?;

    let manifest = Manifest::new(
        Operation::Install,
        description,
        vec![ContentEntry::new(&name, destination)],
    );
    let (receipt, ()) = deploy(&ctx.store, &archive.path, Transfer::Move, &manifest, |tx| {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        replace_symlink(destination, &tx.mount_path())
    })
    .with_context(|| format!("Failed to deploy {}", name))?;

    println!(
        "Installed {} -> {}{}",
        destination.display(),
        ctx.store.mount_path(&receipt.stem).display(),
        if receipt.written { "" } else { " (deduplicated)" }
    );
    Ok(())
}
