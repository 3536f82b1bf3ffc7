// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.
//!
//! Archives are deterministic tars, and "mounting" one means extracting it to
//! its mount path, so no squashfs tools or privileges are needed.

#![allow(dead_code)]

use cefs::manifest::{self, ContentEntry, Manifest, Operation};
use cefs::store::format::{Extractor, TarFormat};
use cefs::{ArchiveBuilder, ArchiveStore, HashAlgorithm};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

pub struct TestStore {
    /// Keep alive for the duration of the test
    pub dir: TempDir,
    pub store: ArchiveStore,
    pub temp_root: PathBuf,
}

impl TestStore {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = ArchiveStore::open(
            dir.path().join("images"),
            dir.path().join("cefs"),
            HashAlgorithm::Sha256,
        )
        .unwrap();
        let temp_root = dir.path().join("tmp");
        Self {
            dir,
            store,
            temp_root,
        }
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn mount_point(&self) -> &Path {
        self.store.mount_point()
    }

    pub fn builder(&self) -> ArchiveBuilder<'_> {
        ArchiveBuilder::new(&self.store, &TarFormat, &self.temp_root)
    }

    /// Build an archive holding `files` and give it a one-entry manifest
    pub fn build_component(&self, name: &str, files: &[(&str, &str)]) -> String {
        let builder = self.builder();
        let staging = builder.staging().unwrap();
        for (rel, content) in files {
            let path = staging.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        let built = builder.build(staging).unwrap();

        let manifest = Manifest::new(
            Operation::Install,
            format!("Installed {}", name),
            vec![ContentEntry::new(name, self.path("nfs").join(name))],
        );
        manifest::write_in_progress(&manifest, &built.path).unwrap();
        manifest::finalize(&built.path).unwrap();
        built.stem
    }

    /// Make an archive's content visible at its mount path
    pub fn mount(&self, stem: &str) {
        let target = self.store.mount_path(stem);
        if !target.exists() {
            TarFormat
                .extract(&self.store.archive_path(stem), None, &target)
                .unwrap();
        }
    }

    /// Write `content` as a pre-built image and mount it under its digest
    pub fn prebuilt_image(&self, path: &Path, files: &[(&str, &str)]) -> String {
        let src = self.temp_root.join(format!(
            "src-{}",
            path.file_name().unwrap().to_string_lossy()
        ));
        for (rel, content) in files {
            let file = src.join(rel);
            fs::create_dir_all(file.parent().unwrap()).unwrap();
            fs::write(file, content).unwrap();
        }
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        cefs::store::format::Compressor::compress(&TarFormat, &src, path).unwrap();
        fs::remove_dir_all(&src).unwrap();

        let stem = self.store.hash_file(path).unwrap();
        let target = self.store.mount_path(&stem);
        if !target.exists() {
            TarFormat.extract(path, None, &target).unwrap();
        }
        stem
    }
}

/// Backdate a file's modification time by `age`
pub fn set_age(path: &Path, age: Duration) {
    File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(SystemTime::now() - age)
        .unwrap();
}

pub fn hours(n: u64) -> Duration {
    Duration::from_secs(n * 3600)
}

pub fn minutes(n: u64) -> Duration {
    Duration::from_secs(n * 60)
}
