// src/commands/convert.rs
//! Legacy directory conversion

use super::Context;
use anyhow::{Result, bail};
use cefs::convert::{ConvertOptions, ConvertOutcome, PrebuiltInstallation, convert_to_cefs};
use std::path::PathBuf;
use tracing::{error, info};

pub fn cmd_convert(ctx: &Context, paths: &[PathBuf], force: bool, dry_run: bool) -> Result<()> {
    let options = ConvertOptions { force, dry_run };
    let mut failed = 0usize;

    for path in paths {
        let result = PrebuiltInstallation::from_config(&ctx.config.convert, path)
            .and_then(|install| convert_to_cefs(&install, &ctx.store, options));

        match result {
            Ok(ConvertOutcome::AlreadyConverted) => {
                println!("{}: already converted", path.display());
            }
            Ok(ConvertOutcome::DryRun { stem, mount_path }) => {
                println!(
                    "{}: would convert to {} ({})",
                    path.display(),
                    mount_path.display(),
                    stem
                );
            }
            Ok(ConvertOutcome::Converted { receipt, backup }) => {
                println!(
                    "{}: converted to {}",
                    path.display(),
                    ctx.store.mount_path(&receipt.stem).display()
                );
                if let Some(backup) = backup {
                    info!("Backup kept at {}", backup.display());
                }
            }
            Err(e) => {
                error!(
                    class = ?e.class(),
                    retryable = e.is_retryable(),
                    "Failed to convert {}: {}",
                    path.display(),
                    e
                );
                failed += 1;
            }
        }
    }

    if failed > 0 {
        bail!("{} of {} conversions failed", failed, paths.len());
    }
    Ok(())
}
