// src/config.rs

//! Store configuration
//!
//! Configuration lives in a TOML file (default `/etc/cefs/config.toml`,
//! overridable with `CEFS_CONFIG` or `--config`). Every key has a default so a
//! missing default file yields a usable configuration; unknown keys are
//! rejected.
//!
//! ```toml
//! mount_point = "/cefs"
//! image_dir = "/efs/cefs-images"
//! archive_format = "squashfs"
//!
//! [squashfs]
//! compression = "zstd"
//! compression_level = 7
//!
//! [gc]
//! min_age = "1h"
//! roots = ["/opt/compiler-explorer"]
//! ```

use crate::error::{Error, Result};
use crate::hash::HashAlgorithm;
use crate::store::ArchiveStore;
use crate::store::format::{ArchiveFormat, Compressor, Extractor, Squashfs, TarFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cefs/config.toml";

/// Environment variable overriding the configuration path
pub const CONFIG_ENV: &str = "CEFS_CONFIG";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StoreConfig {
    /// Where every archive is mounted read-only, as `<mount_point>/<stem>`
    pub mount_point: PathBuf,
    /// Directory holding `<stem>.sqfs` archives and their manifests
    pub image_dir: PathBuf,
    /// Scratch space for staging directories
    pub temp_dir: PathBuf,
    pub hash_algorithm: HashAlgorithm,
    pub archive_format: ArchiveFormat,
    pub squashfs: SquashfsConfig,
    pub gc: GcConfig,
    pub convert: ConvertConfig,
    pub consolidation: ConsolidationConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            mount_point: PathBuf::from("/cefs"),
            image_dir: PathBuf::from("/efs/cefs-images"),
            temp_dir: std::env::temp_dir().join("cefs"),
            hash_algorithm: HashAlgorithm::Sha256,
            archive_format: ArchiveFormat::Squashfs,
            squashfs: SquashfsConfig::default(),
            gc: GcConfig::default(),
            convert: ConvertConfig::default(),
            consolidation: ConsolidationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SquashfsConfig {
    pub mksquashfs: PathBuf,
    pub unsquashfs: PathBuf,
    pub compression: String,
    pub compression_level: Option<u32>,
}

impl Default for SquashfsConfig {
    fn default() -> Self {
        Self {
            mksquashfs: PathBuf::from("mksquashfs"),
            unsquashfs: PathBuf::from("unsquashfs"),
            compression: "zstd".to_string(),
            compression_level: Some(7),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct GcConfig {
    /// Unreferenced archives younger than this are kept
    pub min_age: HumanDuration,
    /// Trees and root pointers whose symlinks keep archives alive
    pub roots: Vec<PathBuf>,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            min_age: HumanDuration(Duration::from_secs(3600)),
            roots: vec![PathBuf::from("/opt/compiler-explorer")],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConvertConfig {
    /// Root of the legacy directory-based installs
    pub nfs_root: PathBuf,
    /// Where pre-built archives for legacy installs live, mirroring `nfs_root`
    pub squash_image_root: PathBuf,
    /// File (relative to the install) whose presence means "installed"
    pub installed_marker: Option<PathBuf>,
}

impl Default for ConvertConfig {
    fn default() -> Self {
        Self {
            nfs_root: PathBuf::from("/opt/compiler-explorer"),
            squash_image_root: PathBuf::from("/efs/squash-images"),
            installed_marker: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConsolidationConfig {
    /// Archives larger than this are never folded into a composite
    pub max_item_size: ByteSize,
    /// Upper bound on the combined size of one composite
    pub max_batch_size: ByteSize,
    /// Batches with fewer items are not worth the mount they save
    pub min_items: usize,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            max_item_size: ByteSize(256 * 1024 * 1024),
            max_batch_size: ByteSize(4 * 1024 * 1024 * 1024),
            min_items: 2,
        }
    }
}

impl StoreConfig {
    /// Load the configuration
    ///
    /// An explicit path must exist. Without one, `CEFS_CONFIG` is consulted,
    /// then the default path; a missing default file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(p) => (PathBuf::from(p), true),
                None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        if !path.exists() {
            if explicit {
                return Err(Error::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            tracing::debug!("No config at {}, using defaults", path.display());
            let config = Self::default();
            config.validate()?;
            return Ok(config);
        }

        let content = std::fs::read_to_string(&path).map_err(|e| Error::io_at(&path, e))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: StoreConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.mount_point.is_absolute() {
            return Err(Error::Config(format!(
                "mount_point must be absolute: {}",
                self.mount_point.display()
            )));
        }
        if !self.image_dir.is_absolute() {
            return Err(Error::Config(format!(
                "image_dir must be absolute: {}",
                self.image_dir.display()
            )));
        }
        if self.consolidation.min_items == 0 {
            return Err(Error::Config(
                "consolidation.min_items must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Open the archive store this configuration describes
    pub fn store(&self) -> Result<ArchiveStore> {
        ArchiveStore::open(&self.image_dir, &self.mount_point, self.hash_algorithm)
    }

    pub fn compressor(&self) -> Box<dyn Compressor> {
        match self.archive_format {
            ArchiveFormat::Squashfs => Box::new(Squashfs::from_config(&self.squashfs)),
            ArchiveFormat::Tar => Box::new(TarFormat),
        }
    }

    pub fn extractor(&self) -> Box<dyn Extractor> {
        match self.archive_format {
            ArchiveFormat::Squashfs => Box::new(Squashfs::from_config(&self.squashfs)),
            ArchiveFormat::Tar => Box::new(TarFormat),
        }
    }
}

/// Duration written as `<n>[s|m|h|d]`, e.g. `"90m"` or `"2d"`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct HumanDuration(pub Duration);

impl FromStr for HumanDuration {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (num_str, unit) = match s.char_indices().find(|(_, c)| !c.is_ascii_digit()) {
            Some((idx, _)) => s.split_at(idx),
            None => (s, "s"),
        };
        let multiplier = match unit.trim() {
            "s" | "sec" | "secs" => 1,
            "m" | "min" | "mins" => 60,
            "h" | "hour" | "hours" => 3600,
            "d" | "day" | "days" => 86_400,
            _ => return Err(Error::InvalidArgument(format!("invalid duration: {}", s))),
        };
        let num: u64 = num_str
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid duration: {}", s)))?;
        let secs = num
            .checked_mul(multiplier)
            .ok_or_else(|| Error::InvalidArgument(format!("duration too large: {}", s)))?;
        Ok(Self(Duration::from_secs(secs)))
    }
}

impl TryFrom<String> for HumanDuration {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<HumanDuration> for String {
    fn from(value: HumanDuration) -> Self {
        value.to_string()
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.0.as_secs();
        if secs != 0 && secs % 86_400 == 0 {
            write!(f, "{}d", secs / 86_400)
        } else if secs != 0 && secs % 3600 == 0 {
            write!(f, "{}h", secs / 3600)
        } else if secs != 0 && secs % 60 == 0 {
            write!(f, "{}m", secs / 60)
        } else {
            write!(f, "{}s", secs)
        }
    }
}

/// Byte count written as `<n>[K|M|G|T]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ByteSize(pub u64);

impl FromStr for ByteSize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::InvalidArgument("empty size".to_string()));
        }

        let (num_str, multiplier) = if let Some(n) = s.strip_suffix(['T', 't']) {
            (n, 1024 * 1024 * 1024 * 1024u64)
        } else if let Some(n) = s.strip_suffix(['G', 'g']) {
            (n, 1024 * 1024 * 1024u64)
        } else if let Some(n) = s.strip_suffix(['M', 'm']) {
            (n, 1024 * 1024u64)
        } else if let Some(n) = s.strip_suffix(['K', 'k']) {
            (n, 1024u64)
        } else {
            (s, 1u64)
        };

        let num: u64 = num_str
            .trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("invalid size: {}", s)))?;

        num.checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| Error::InvalidArgument(format!("size too large: {}", s)))
    }
}

impl TryFrom<String> for ByteSize {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ByteSize> for String {
    fn from(value: ByteSize) -> Self {
        value.to_string()
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const UNITS: [(u64, &str); 4] = [
            (1024 * 1024 * 1024 * 1024, "T"),
            (1024 * 1024 * 1024, "G"),
            (1024 * 1024, "M"),
            (1024, "K"),
        ];
        for (size, suffix) in UNITS {
            if self.0 >= size && self.0 % size == 0 {
                return write!(f, "{}{}", self.0 / size, suffix);
            }
        }
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StoreConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.gc.min_age.0, Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_partial_config() {
        let config = StoreConfig::parse(
            r#"
mount_point = "/mnt/cefs"
archive_format = "tar"

[gc]
min_age = "2d"
roots = ["/opt/ce", "/opt/ce-root"]
"#,
        )
        .unwrap();

        assert_eq!(config.mount_point, PathBuf::from("/mnt/cefs"));
        assert_eq!(config.archive_format, ArchiveFormat::Tar);
        assert_eq!(config.gc.min_age.0, Duration::from_secs(2 * 86_400));
        assert_eq!(config.gc.roots.len(), 2);
        // Untouched sections keep their defaults
        assert_eq!(config.squashfs.compression, "zstd");
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(StoreConfig::parse("mount_pont = \"/cefs\"").is_err());
        assert!(StoreConfig::parse("[gc]\nmax_age = \"1h\"").is_err());
    }

    #[test]
    fn test_relative_mount_point_rejected() {
        let err = StoreConfig::parse("mount_point = \"cefs\"").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_explicit_missing_path_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = StoreConfig::load(Some(&dir.path().join("nope.toml")));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_human_duration() {
        assert_eq!("30m".parse::<HumanDuration>().unwrap().0, Duration::from_secs(1800));
        assert_eq!("45".parse::<HumanDuration>().unwrap().0, Duration::from_secs(45));
        assert_eq!("3 hours".parse::<HumanDuration>().unwrap().0, Duration::from_secs(10_800));
        assert!("soon".parse::<HumanDuration>().is_err());
        assert_eq!(HumanDuration(Duration::from_secs(7200)).to_string(), "2h");
    }

    #[test]
    fn test_byte_size() {
        assert_eq!("64M".parse::<ByteSize>().unwrap().0, 64 * 1024 * 1024);
        assert_eq!("2g".parse::<ByteSize>().unwrap().0, 2 * 1024 * 1024 * 1024);
        assert_eq!("8192".parse::<ByteSize>().unwrap().0, 8192);
        assert!("".parse::<ByteSize>().is_err());
        assert_eq!(ByteSize(3 * 1024).to_string(), "3K");
        assert_eq!(ByteSize(1500).to_string(), "1500");
    }

    #[test]
    fn test_oversized_values_rejected() {
        let err = "999999999999999999d".parse::<HumanDuration>().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        let err = "99999999999T".parse::<ByteSize>().unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
