// src/lib.rs

//! cefs: content-addressed filesystem store
//!
//! Software installations are packed into immutable archives named by the
//! hash of their bytes, mounted read-only under a mount point, and exposed
//! through symlink trees that can be swapped atomically.
//!
//! # Architecture
//!
//! - Store: archives and manifest sidecars in one flat directory
//! - Catalog images: symlink trees into the mount point, plus a metadata log
//! - Root pointers: the symlink designating the live catalog image
//! - Deploys: archive + manifest + symlinks, committed by renaming the manifest
//! - GC: liveness by scanning symlinks, age-gated deletion

pub mod catalog;
pub mod config;
pub mod consolidate;
pub mod convert;
pub mod deploy;
mod error;
pub mod gc;
pub mod hash;
pub mod manifest;
pub mod store;

pub use catalog::{CatalogImage, RootPointer};
pub use config::StoreConfig;
pub use deploy::{DeployReceipt, DeployTransaction};
pub use error::{Error, ErrorClass, FOREIGN_SYMLINK, Result, UNEXPECTED_FILE};
pub use gc::{GarbageCollector, GcSummary};
pub use hash::HashAlgorithm;
pub use manifest::{ContentEntry, Manifest, Operation};
pub use store::{ArchiveBuilder, ArchiveStore, Transfer};
