// src/store/format.rs

//! Archive formats
//!
//! The store treats archive bytes as opaque: a [`Compressor`] turns a staged
//! directory into one file, an [`Extractor`] turns (part of) that file back
//! into a directory. Two implementations exist:
//!
//! - [`Squashfs`] shells out to `mksquashfs`/`unsquashfs`. This is the
//!   production format; archives are mounted read-only under the mount point.
//! - [`TarFormat`] writes a deterministic tar (sorted entries, zeroed
//!   ownership and mtimes) and needs no external tools.

use crate::config::SquashfsConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tracing::debug;
use walkdir::WalkDir;

/// Which [`Compressor`]/[`Extractor`] pair the store uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArchiveFormat {
    #[default]
    Squashfs,
    Tar,
}

/// Packs a directory tree into a single archive file
pub trait Compressor: Send + Sync {
    fn name(&self) -> &str;

    /// Write an archive of `source` to `output`, replacing whatever is there
    fn compress(&self, source: &Path, output: &Path) -> Result<()>;
}

/// Unpacks an archive, or one subtree of it, into a directory
pub trait Extractor: Send + Sync {
    /// Extract `archive` into `dest`
    ///
    /// With `sub_path`, only that subtree is extracted and its contents land
    /// directly in `dest`. `dest` must not exist yet.
    fn extract(&self, archive: &Path, sub_path: Option<&Path>, dest: &Path) -> Result<()>;
}

/// squashfs-tools wrapper
#[derive(Debug, Clone)]
pub struct Squashfs {
    mksquashfs: PathBuf,
    unsquashfs: PathBuf,
    compression: String,
    compression_level: Option<u32>,
}

impl Squashfs {
    pub fn from_config(config: &SquashfsConfig) -> Self {
        Self {
            mksquashfs: config.mksquashfs.clone(),
            unsquashfs: config.unsquashfs.clone(),
            compression: config.compression.clone(),
            compression_level: config.compression_level,
        }
    }

    fn resolve(tool: &Path) -> Result<PathBuf> {
        which::which(tool).map_err(|_| Error::ToolNotFound(tool.display().to_string()))
    }

    fn run(tool: &Path, mut command: Command) -> Result<()> {
        debug!("Running {:?}", command);
        let output = command.output()?;
        if !output.status.success() {
            return Err(Error::ToolFailed {
                tool: tool.display().to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

impl Compressor for Squashfs {
    fn name(&self) -> &str {
        "squashfs"
    }

    fn compress(&self, source: &Path, output: &Path) -> Result<()> {
        let tool = Self::resolve(&self.mksquashfs)?;
        let mut command = Command::new(&tool);
        command
            .arg(source)
            .arg(output)
            .args(["-all-root", "-noappend", "-no-progress", "-comp"])
            .arg(&self.compression);
        if let Some(level) = self.compression_level {
            command.arg("-Xcompression-level").arg(level.to_string());
        }
        Self::run(&tool, command)
    }
}

impl Extractor for Squashfs {
    fn extract(&self, archive: &Path, sub_path: Option<&Path>, dest: &Path) -> Result<()> {
        let tool = Self::resolve(&self.unsquashfs)?;

        let Some(sub_path) = sub_path else {
            let mut command = Command::new(&tool);
            command.arg("-no-progress").arg("-d").arg(dest).arg(archive);
            return Self::run(&tool, command);
        };

        // unsquashfs recreates the sub path below -d; unpack beside dest and
        // lift the subtree into place
        let scratch = dest.with_file_name(format!(
            ".{}.unsquash",
            dest.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        ));
        let mut command = Command::new(&tool);
        command
            .arg("-no-progress")
            .arg("-d")
            .arg(&scratch)
            .arg(archive)
            .arg(sub_path);
        let result = Self::run(&tool, command).and_then(|()| {
            let extracted = scratch.join(relative_inside(sub_path)?);
            fs::rename(&extracted, dest).map_err(|e| Error::io_at(&extracted, e))
        });
        if scratch.exists() {
            let _ = fs::remove_dir_all(&scratch);
        }
        result
    }
}

/// Deterministic tar archives
#[derive(Debug, Clone, Copy, Default)]
pub struct TarFormat;

impl TarFormat {
    fn normalized_mode(mode: u32, is_dir: bool) -> u32 {
        if is_dir || mode & 0o111 != 0 { 0o755 } else { 0o644 }
    }
}

impl Compressor for TarFormat {
    fn name(&self) -> &str {
        "tar"
    }

    fn compress(&self, source: &Path, output: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let file = File::create(output).map_err(|e| Error::io_at(output, e))?;
        let mut archive = tar::Builder::new(BufWriter::new(file));
        archive.follow_symlinks(false);

        for entry in WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
            .min_depth(1)
        {
            let entry = entry?;
            let rel = entry
                .path()
                .strip_prefix(source)
                .map_err(|_| Error::structural(entry.path(), "entry escaped staging root"))?;
            let metadata = entry.path().symlink_metadata()?;

            let mut header = tar::Header::new_gnu();
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);

            if metadata.file_type().is_symlink() {
                let target = fs::read_link(entry.path())?;
                header.set_entry_type(tar::EntryType::Symlink);
                header.set_mode(0o777);
                header.set_size(0);
                archive.append_link(&mut header, rel, &target)?;
            } else if metadata.is_dir() {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                header.set_size(0);
                archive.append_data(&mut header, rel, std::io::empty())?;
            } else {
                let mode = metadata.permissions().mode();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(Self::normalized_mode(mode, false));
                header.set_size(metadata.len());
                let content = File::open(entry.path())?;
                archive.append_data(&mut header, rel, content)?;
            }
        }

        let writer = archive.into_inner()?;
        let file = writer
            .into_inner()
            .map_err(|e| Error::io_at(output, e.into_error()))?;
        file.sync_all()?;
        Ok(())
    }
}

impl Extractor for TarFormat {
    fn extract(&self, archive: &Path, sub_path: Option<&Path>, dest: &Path) -> Result<()> {
        let file = File::open(archive).map_err(|e| Error::io_at(archive, e))?;
        let mut tar = tar::Archive::new(file);
        let prefix = sub_path.map(relative_inside).transpose()?;

        fs::create_dir_all(dest)?;
        for entry in tar.entries()? {
            let mut entry = entry?;
            let path = relative_inside(&entry.path()?)?;
            let rel = match &prefix {
                Some(prefix) => match path.strip_prefix(prefix) {
                    Ok(rel) => rel.to_path_buf(),
                    Err(_) => continue,
                },
                None => path,
            };
            if rel.as_os_str().is_empty() {
                continue;
            }

            let target = dest.join(&rel);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            entry.unpack(&target)?;
        }
        Ok(())
    }
}

/// Normalize an in-archive path, rejecting anything that climbs out of it
fn relative_inside(path: &Path) -> Result<PathBuf> {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(c) => normalized.push(c),
            Component::CurDir | Component::RootDir => {}
            Component::ParentDir | Component::Prefix(_) => {
                return Err(Error::structural(path, "path escapes archive root"));
            }
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::{HashAlgorithm, hash_file};
    use std::os::unix::fs::symlink;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("bin")).unwrap();
        fs::create_dir_all(root.join("lib/sub")).unwrap();
        fs::write(root.join("bin/tool"), b"#!/bin/sh\necho hi\n").unwrap();
        fs::write(root.join("lib/sub/data.txt"), b"payload").unwrap();
        symlink("../bin/tool", root.join("lib/tool-link")).unwrap();
    }

    #[test]
    fn test_tar_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        populate(&a);
        populate(&b);

        let out_a = dir.path().join("a.tar");
        let out_b = dir.path().join("b.tar");
        TarFormat.compress(&a, &out_a).unwrap();
        TarFormat.compress(&b, &out_b).unwrap();

        assert_eq!(
            hash_file(HashAlgorithm::Sha256, &out_a).unwrap(),
            hash_file(HashAlgorithm::Sha256, &out_b).unwrap()
        );
    }

    #[test]
    fn test_tar_extract_full_and_subtree() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        populate(&src);
        let archive = dir.path().join("x.tar");
        TarFormat.compress(&src, &archive).unwrap();

        let full = dir.path().join("full");
        TarFormat.extract(&archive, None, &full).unwrap();
        assert_eq!(fs::read(full.join("lib/sub/data.txt")).unwrap(), b"payload");
        assert_eq!(
            fs::read_link(full.join("lib/tool-link")).unwrap(),
            PathBuf::from("../bin/tool")
        );

        let partial = dir.path().join("partial");
        TarFormat
            .extract(&archive, Some(Path::new("lib")), &partial)
            .unwrap();
        assert!(partial.join("sub/data.txt").exists());
        assert!(!partial.join("bin").exists());
    }

    #[test]
    fn test_relative_inside_rejects_parent() {
        assert!(relative_inside(Path::new("a/../../etc")).is_err());
        assert_eq!(
            relative_inside(Path::new("/a/./b")).unwrap(),
            PathBuf::from("a/b")
        );
    }

    #[test]
    fn test_missing_squashfs_tool_reported() {
        let squashfs = Squashfs::from_config(&SquashfsConfig {
            mksquashfs: PathBuf::from("definitely-not-a-real-mksquashfs"),
            ..SquashfsConfig::default()
        });
        let dir = tempfile::tempdir().unwrap();
        let err = squashfs
            .compress(dir.path(), &dir.path().join("out.sqfs"))
            .unwrap_err();
        assert!(matches!(err, Error::ToolNotFound(_)));
    }
}
