// src/cli/root.rs
//! Root pointer commands

use clap::Subcommand;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum RootCommands {
    /// Create a root pointer designating an existing catalog image
    Create {
        /// Catalog image directory (usually under the mount point)
        base_image: PathBuf,

        /// Where to create the root pointer symlink
        path: PathBuf,
    },

    /// Show where a root pointer leads and what its catalog holds
    Show {
        /// Root pointer path
        path: PathBuf,
    },

    /// Link an entry into the root's catalog and publish the result
    Link {
        /// Root pointer path
        root: PathBuf,

        /// Path of the entry inside the catalog
        entry: PathBuf,

        /// Store path the entry should point at
        target: PathBuf,

        /// Line appended to the catalog's metadata log
        #[arg(long)]
        message: Option<String>,
    },
}
