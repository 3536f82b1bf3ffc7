// src/cli/mod.rs
//! CLI definitions for cefs
//!
//! This module contains all command-line interface definitions using clap.
//! The actual command implementations are in the `commands` module.
//!
//! - `install` - Build a staged directory into the store and link it
//! - `convert` - Migrate legacy directories to store-backed symlinks
//! - `gc` - Delete unreferenced archives
//! - `root` - Create, inspect and edit root pointers
//! - `describe` / `stats` - Reporting
//! - `consolidate` - Fold small archives into composites

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::PathBuf;

mod root;

pub use root::RootCommands;

#[derive(Parser)]
#[command(name = "cefs")]
#[command(author = "cefs contributors")]
#[command(version)]
#[command(about = "Content-addressed filesystem store", long_about = None)]
pub struct Cli {
    /// Configuration file (default: $CEFS_CONFIG or /etc/cefs/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build a staged directory into an archive and symlink it into place
    Install {
        /// Directory holding the content to archive
        staged: PathBuf,

        /// Path to expose the content at
        destination: PathBuf,

        /// Logical component name (default: destination file name)
        #[arg(long)]
        name: Option<String>,

        /// Description recorded in the manifest
        #[arg(long)]
        description: Option<String>,
    },

    /// Convert legacy install directories to store-backed symlinks
    Convert {
        /// Legacy install paths under the configured legacy root
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Re-convert paths that are already symlinks
        #[arg(long)]
        force: bool,

        /// Show what would be converted without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Delete archives no longer referenced by any root
    Gc {
        /// Minimum age before an unreferenced archive may be deleted
        #[arg(long)]
        min_age: Option<cefs::config::HumanDuration>,

        /// Additional roots to scan (default: configured roots)
        #[arg(long = "root")]
        roots: Vec<PathBuf>,

        /// Report without deleting
        #[arg(long)]
        dry_run: bool,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },

    /// Root pointer management
    #[command(subcommand)]
    Root(RootCommands),

    /// Show the manifest of an archive
    Describe {
        /// Digest, archive path, mounted path or symlink into the store
        target: String,
    },

    /// Show archive usage statistics
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Fold small single-component archives into composites
    Consolidate {
        /// Show the planned batches without building anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}
