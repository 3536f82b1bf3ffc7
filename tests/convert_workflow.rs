// tests/convert_workflow.rs

//! End-to-end conversion of a legacy install directory.

mod common;

use cefs::config::ConvertConfig;
use cefs::convert::{
    ConvertOptions, ConvertOutcome, LegacyInstallation, NfsState, PrebuiltInstallation,
    convert_to_cefs, detect_nfs_state,
};
use cefs::manifest::{self, Operation};
use common::TestStore;
use std::fs;
use std::path::PathBuf;

fn convert_config(ts: &TestStore) -> ConvertConfig {
    ConvertConfig {
        nfs_root: ts.path("nfs"),
        squash_image_root: ts.path("squash"),
        installed_marker: Some(PathBuf::from("bin/gcc")),
    }
}

#[test]
fn test_convert_legacy_directory() {
    let ts = TestStore::new();
    let config = convert_config(&ts);
    let legacy = config.nfs_root.join("gcc-13.2.0");
    fs::create_dir_all(legacy.join("bin")).unwrap();
    fs::write(legacy.join("bin/gcc"), "gcc 13.2.0").unwrap();
    let stem = ts.prebuilt_image(
        &config.squash_image_root.join("gcc-13.2.0.img"),
        &[("bin/gcc", "gcc 13.2.0")],
    );

    assert_eq!(detect_nfs_state(&legacy), NfsState::Directory);

    let install = PrebuiltInstallation::from_config(&config, &legacy).unwrap();
    assert!(install.is_installed());
    let outcome = convert_to_cefs(&install, &ts.store, ConvertOptions::default()).unwrap();

    let ConvertOutcome::Converted { receipt, backup } = outcome else {
        panic!("expected a conversion, got {outcome:?}");
    };
    assert_eq!(receipt.stem, stem);
    assert!(receipt.written);

    // legacy path is now a symlink into the store
    assert_eq!(detect_nfs_state(&legacy), NfsState::Symlink);
    assert_eq!(fs::read_link(&legacy).unwrap(), ts.store.mount_path(&stem));
    assert_eq!(fs::read_to_string(legacy.join("bin/gcc")).unwrap(), "gcc 13.2.0");

    // old directory kept aside
    let backup = backup.unwrap();
    assert!(backup.to_string_lossy().contains("gcc-13.2.0.bak."));
    assert!(backup.join("bin/gcc").is_file());

    // finalized manifest with one entry for the component
    let manifest = manifest::read(&receipt.archive_path).unwrap();
    assert_eq!(manifest.operation, Operation::Convert);
    assert_eq!(manifest.contents.len(), 1);
    assert_eq!(manifest.contents[0].name, "gcc-13.2.0");
    assert_eq!(manifest.contents[0].destination, legacy);
    assert!(!manifest::in_progress_path(&receipt.archive_path).exists());

    // second run short-circuits
    let again = convert_to_cefs(&install, &ts.store, ConvertOptions::default()).unwrap();
    assert_eq!(again, ConvertOutcome::AlreadyConverted);
}

#[test]
fn test_convert_identical_images_share_archive() {
    let ts = TestStore::new();
    let config = convert_config(&ts);

    let mut stems = Vec::new();
    for name in ["gcc-a", "gcc-b"] {
        let legacy = config.nfs_root.join(name);
        fs::create_dir_all(legacy.join("bin")).unwrap();
        fs::write(legacy.join("bin/gcc"), "same").unwrap();
        stems.push(ts.prebuilt_image(
            &config.squash_image_root.join(format!("{name}.img")),
            &[("bin/gcc", "same")],
        ));

        let install = PrebuiltInstallation::from_config(&config, &legacy).unwrap();
        convert_to_cefs(&install, &ts.store, ConvertOptions::default()).unwrap();
    }

    assert_eq!(stems[0], stems[1]);
    assert_eq!(ts.store.list_archives().unwrap().len(), 1);
}

#[test]
fn test_missing_prebuilt_leaves_directory_alone() {
    let ts = TestStore::new();
    let config = convert_config(&ts);
    let legacy = config.nfs_root.join("clang-17");
    fs::create_dir_all(legacy.join("bin")).unwrap();
    fs::write(legacy.join("bin/gcc"), "x").unwrap();

    let install = PrebuiltInstallation::from_config(&config, &legacy).unwrap();
    let err = convert_to_cefs(&install, &ts.store, ConvertOptions::default()).unwrap_err();
    assert!(err.is_retryable());
    assert_eq!(detect_nfs_state(&legacy), NfsState::Directory);
    assert!(ts.store.list_archives().unwrap().is_empty());
}
