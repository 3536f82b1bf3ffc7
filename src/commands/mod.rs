// src/commands/mod.rs
//! Command handlers for the cefs CLI

mod consolidate;
mod convert;
mod gc;
mod install;
mod report;
mod root;

pub use consolidate::cmd_consolidate;
pub use convert::cmd_convert;
pub use gc::cmd_gc;
pub use install::cmd_install;
pub use report::{cmd_describe, cmd_stats};
pub use root::{cmd_root_create, cmd_root_link, cmd_root_show};

use anyhow::{Context as _, Result};
use cefs::{ArchiveBuilder, ArchiveStore, StoreConfig};
use cefs::store::format::{Compressor, Extractor};
use std::path::Path;

/// Loaded configuration plus the store it describes
pub struct Context {
    pub config: StoreConfig,
    pub store: ArchiveStore,
    compressor: Box<dyn Compressor>,
    extractor: Box<dyn Extractor>,
}

impl Context {
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let config = StoreConfig::load(config_path).context("Failed to load configuration")?;
        let store = config.store().with_context(|| {
            format!("Failed to open archive store {}", config.image_dir.display())
        })?;
        let compressor = config.compressor();
        let extractor = config.extractor();
        Ok(Self {
            config,
            store,
            compressor,
            extractor,
        })
    }

    pub fn builder(&self) -> ArchiveBuilder<'_> {
        ArchiveBuilder::new(&self.store, self.compressor.as_ref(), &self.config.temp_dir)
    }

    pub fn extractor(&self) -> &dyn Extractor {
        self.extractor.as_ref()
    }
}

/// Human readable byte count
pub(crate) fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
