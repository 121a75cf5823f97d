//! Layered configuration.
//!
//! Values are resolved in order, later sources winning:
//!
//! 1. built-in defaults,
//! 2. a configuration file (TOML, YAML or JSON, picked by extension),
//! 3. `MIRAGE_`-prefixed environment variables, with `__` separating
//!    nested keys (`MIRAGE_TRANSFERS__PARALLEL=8`).
//!
//! Without an explicit path the file is looked up in the platform's
//! configuration directory and skipped if absent.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use mirage_compress::{Compression, Level};
use mirage_policy::{CompressionPolicy, PerformanceThresholds};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_PREFIX: &str = "MIRAGE_";
pub const DEFAULT_FILE_NAME: &str = "config.toml";

const DEFAULT_PARALLEL: usize = 4;
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;
const DEFAULT_COMPACTION_MIN_SIZE: u64 = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Must be absolute.
    pub directory: PathBuf,
    /// Codec the background compactor stores entries in.
    pub compaction: Compression,
    pub level: Level,
    /// Entries smaller than this are left as they are.
    pub compaction_min_size: u64,
    /// Physical size `cache evict` trims down to, if set.
    pub max_size: Option<u64>,
}
impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_directory(),
            compaction: Compression::Zstd,
            level: Level::default(),
            compaction_min_size: DEFAULT_COMPACTION_MIN_SIZE,
            max_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Transfers allowed in progress at once.
    pub parallel: usize,
    pub chunk_size: usize,
}
impl Default for TransferConfig {
    fn default() -> Self {
        Self { parallel: DEFAULT_PARALLEL, chunk_size: DEFAULT_CHUNK_SIZE }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    pub transfers: TransferConfig,
    pub policy: CompressionPolicy,
    pub performance: PerformanceThresholds,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", "mirage")
}

fn default_cache_directory() -> PathBuf {
    project_dirs()
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| std::env::temp_dir().join("mirage"))
}

/// Where the configuration file lives when none is given.
pub fn default_path() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().join(DEFAULT_FILE_NAME))
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    let extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .unwrap_or_default()
        .to_ascii_lowercase();
    Ok(match extension.as_str() {
        "toml" => figment.merge(Toml::file_exact(path)),
        "yaml" | "yml" => figment.merge(Yaml::file_exact(path)),
        "json" => figment.merge(Json::file_exact(path)),
        _ => exn::bail!(ErrorKind::UnsupportedFormat(path.display().to_string())),
    })
}

impl Config {
    /// The merged sources, before extraction.
    pub fn figment(path: Option<&Path>) -> Result<Figment> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match path {
            Some(path) if !path.is_file() => exn::bail!(ErrorKind::NotFound(path.to_path_buf())),
            Some(path) => figment = merge_file(figment, path)?,
            None => {
                if let Some(path) = default_path().filter(|path| path.is_file()) {
                    tracing::debug!(path = %path.display(), "using default configuration file");
                    figment = merge_file(figment, &path)?;
                }
            },
        }
        Ok(figment.merge(Env::prefixed(ENV_PREFIX).split("__")))
    }

    /// Load and validate.
    ///
    /// An explicit `path` must exist; the default one may not.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config: Config = Self::figment(path)?.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that can't work together.
    ///
    /// Inverted performance thresholds are allowed; each limit is still
    /// applied on its own, so they only produce a warning.
    pub fn validate(&self) -> Result<()> {
        if self.transfers.parallel == 0 {
            exn::bail!(ErrorKind::Invalid("transfers.parallel must be at least 1".to_string()));
        }
        if self.transfers.chunk_size == 0 {
            exn::bail!(ErrorKind::Invalid("transfers.chunk_size must be at least 1".to_string()));
        }
        if !self.cache.directory.is_absolute() {
            exn::bail!(ErrorKind::Invalid(format!(
                "cache.directory must be absolute: {}",
                self.cache.directory.display()
            )));
        }
        for dimension in self.performance.inverted() {
            tracing::warn!(%dimension, "pause threshold is below the warn threshold");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use mirage_policy::PeerId;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert!(config.cache.directory.is_absolute());
        assert_eq!(config.cache.compaction, Compression::Zstd);
        assert_eq!(config.transfers, TransferConfig { parallel: 4, chunk_size: 64 * 1024 });
        assert_eq!(config.policy, CompressionPolicy::AlwaysCompressed);
        assert_eq!(config.performance, PerformanceThresholds::default());
    }

    #[test]
    fn test_toml_then_env() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let directory = jail.directory().join("cache");
            jail.create_file(
                "mirage.toml",
                &format!(
                    r#"
                    policy = "always-source-quality"

                    [cache]
                    directory = "{}"
                    compaction = "gzip"
                    max_size = 1048576

                    [transfers]
                    parallel = 2

                    [performance]
                    ignored = ["friend"]

                    [performance.vram.pause]
                    enabled = true
                    limit = 600
                    "#,
                    directory.display()
                ),
            )?;
            jail.set_env("MIRAGE_TRANSFERS__PARALLEL", "8");
            jail.set_env("MIRAGE_CACHE__COMPACTION_MIN_SIZE", "16");

            let config = Config::load(Some(Path::new("mirage.toml"))).unwrap();
            assert_eq!(config.cache.directory, directory);
            assert_eq!(config.cache.compaction, Compression::Gzip);
            assert_eq!(config.cache.compaction_min_size, 16);
            assert_eq!(config.cache.max_size, Some(1_048_576));
            assert_eq!(config.transfers.parallel, 8, "environment beats the file");
            assert_eq!(config.transfers.chunk_size, DEFAULT_CHUNK_SIZE, "untouched keys keep defaults");
            assert_eq!(config.policy, CompressionPolicy::AlwaysSourceQuality);
            assert_eq!(config.performance.vram.pause.limit, 600);
            assert_eq!(config.performance.vram.warn.limit, 375);
            assert!(config.performance.ignored.contains(&PeerId::from("friend")));
            Ok(())
        });
    }

    #[rstest]
    #[case("mirage.yaml", "transfers:\n  chunk_size: 1024\npolicy: compressed-new-downloads\n")]
    #[case("mirage.yml", "transfers:\n  chunk_size: 1024\npolicy: compressed-new-downloads\n")]
    #[case("mirage.json", r#"{"transfers": {"chunk_size": 1024}, "policy": "compressed-new-downloads"}"#)]
    fn test_other_formats(#[case] name: &str, #[case] contents: &str) {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file(name, contents)?;
            let config = Config::load(Some(Path::new(name))).unwrap();
            assert_eq!(config.transfers.chunk_size, 1024);
            assert_eq!(config.policy, CompressionPolicy::CompressedNewDownloads);
            Ok(())
        });
    }

    #[test]
    fn test_explicit_file_must_exist() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            let err = Config::load(Some(Path::new("missing.toml"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::NotFound(path) if path == Path::new("missing.toml")));
            Ok(())
        });
    }

    #[test]
    fn test_unsupported_extension() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("mirage.ini", "parallel=1")?;
            let err = Config::load(Some(Path::new("mirage.ini"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::UnsupportedFormat(_)));
            Ok(())
        });
    }

    #[test]
    fn test_unknown_policy_fails_to_load() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("mirage.toml", r#"policy = "sometimes""#)?;
            let err = Config::load(Some(Path::new("mirage.toml"))).unwrap_err();
            assert_eq!(*err, ErrorKind::Load);
            Ok(())
        });
    }

    #[test]
    fn test_zero_parallel_rejected() {
        Jail::expect_with(|jail| {
            jail.clear_env();
            jail.create_file("mirage.toml", "")?;
            jail.set_env("MIRAGE_TRANSFERS__PARALLEL", "0");
            let err = Config::load(Some(Path::new("mirage.toml"))).unwrap_err();
            assert!(matches!(&*err, ErrorKind::Invalid(message) if message.contains("parallel")));
            Ok(())
        });
    }

    #[test]
    fn test_relative_cache_directory_rejected() {
        let mut config = Config::default();
        config.cache.directory = PathBuf::from("relative/cache");
        let err = config.validate().unwrap_err();
        assert!(matches!(&*err, ErrorKind::Invalid(message) if message.contains("cache.directory")));
    }

    #[test]
    fn test_inverted_thresholds_only_warn() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache.directory = dir.path().to_path_buf();
        config.performance.triangles.pause.limit = 100;
        assert!(!config.performance.inverted().is_empty());
        config.validate().unwrap();
    }
}
