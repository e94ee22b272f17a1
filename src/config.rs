use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::domain::Kind;
use crate::error::ChelsaError;
use crate::transfer::{RemoteRoot, RetryPolicy};

pub const CONFIG_ENV: &str = "CHELSA_DOWNLOAD_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = ".chelsa-download.toml";
pub const DEFAULT_MAX_WORKERS: usize = 4;
pub const DEFAULT_NODATA: f64 = -9999.0;

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub paths: PathsSection,
    #[serde(default)]
    pub rclone: RcloneSection,
    #[serde(default)]
    pub downloads: DownloadsSection,
    #[serde(default)]
    pub trace: TargetSection,
    #[serde(default)]
    pub present: TargetSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct PathsSection {
    #[serde(default)]
    pub aoi: Option<String>,
    #[serde(default)]
    pub lists_dir: Option<String>,
    #[serde(default)]
    pub cache_dir: Option<String>,
    #[serde(default)]
    pub trace_filelist_json: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct RcloneSection {
    #[serde(default)]
    pub config: Option<String>,
    #[serde(default)]
    pub binary: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct DownloadsSection {
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub backoff_secs: Option<f64>,
    #[serde(default)]
    pub max_backoff_secs: Option<f64>,
    #[serde(default)]
    pub attempt_timeout_secs: Option<u64>,
    #[serde(default)]
    pub backend: Option<TransferBackend>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TargetSection {
    #[serde(default)]
    pub remote: Option<String>,
    #[serde(default)]
    pub prefix: Option<String>,
    #[serde(default)]
    pub lists_subdir: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub nodata_value: Option<f64>,
    #[serde(default)]
    pub http_base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferBackend {
    #[default]
    Rclone,
    Http,
}

#[derive(Debug, Clone)]
pub struct TargetConfig {
    pub remote: String,
    pub prefix: String,
    pub lists_subdir: String,
    pub output_dir: Utf8PathBuf,
    pub nodata_value: f64,
    pub http_base_url: Option<String>,
}

impl TargetConfig {
    pub fn remote_root(&self, kind: Kind, backend: TransferBackend) -> Result<RemoteRoot, ChelsaError> {
        match backend {
            TransferBackend::Rclone => {
                if self.remote.trim().is_empty() {
                    return Err(ChelsaError::Configuration(format!(
                        "[{kind}] remote is required for the rclone backend"
                    )));
                }
                Ok(RemoteRoot::Rclone {
                    alias: self.remote.trim().to_string(),
                    prefix: self.prefix.clone(),
                })
            }
            TransferBackend::Http => {
                let base_url = self
                    .http_base_url
                    .as_deref()
                    .map(str::trim)
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| {
                        ChelsaError::Configuration(format!(
                            "[{kind}] http_base_url is required for the http backend"
                        ))
                    })?;
                Ok(RemoteRoot::Http {
                    base_url: base_url.to_string(),
                    prefix: self.prefix.clone(),
                })
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub aoi_path: Utf8PathBuf,
    pub lists_dir: Utf8PathBuf,
    pub cache_dir: Utf8PathBuf,
    pub trace_filelist_json: Option<Utf8PathBuf>,
    pub rclone_config: Option<Utf8PathBuf>,
    pub rclone_binary: Option<Utf8PathBuf>,
    pub max_workers: usize,
    pub backend: TransferBackend,
    pub retry: RetryPolicy,
    pub trace: TargetConfig,
    pub present: TargetConfig,
}

impl ResolvedConfig {
    pub fn target(&self, kind: Kind) -> &TargetConfig {
        match kind {
            Kind::Trace => &self.trace,
            Kind::Present => &self.present,
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolve the config file from an explicit path, `CHELSA_DOWNLOAD_CONFIG`,
    /// or `~/.chelsa-download.toml`, in that order.
    pub fn resolve(path: Option<&Path>) -> Result<ResolvedConfig, ChelsaError> {
        let config_path = match path {
            Some(path) => path.to_path_buf(),
            None => match std::env::var_os(CONFIG_ENV) {
                Some(value) if !value.is_empty() => PathBuf::from(value),
                _ => home_dir()?.join(DEFAULT_CONFIG_FILE),
            },
        };

        if !config_path.exists() {
            return Err(ChelsaError::MissingConfig(config_path));
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| ChelsaError::ConfigRead(config_path.clone()))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<ResolvedConfig, ChelsaError> {
        let config: Config =
            toml::from_str(content).map_err(|err| ChelsaError::ConfigParse(err.to_string()))?;
        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, ChelsaError> {
        let aoi = config
            .paths
            .aoi
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ChelsaError::Configuration("paths.aoi is required".to_string()))?;
        let aoi_path = expand_path(aoi)?;
        let lists_dir = expand_path(config.paths.lists_dir.as_deref().unwrap_or("./lists"))?;
        let cache_dir = expand_path(config.paths.cache_dir.as_deref().unwrap_or("./chelsa_cache"))?;
        let trace_filelist_json = config
            .paths
            .trace_filelist_json
            .as_deref()
            .map(expand_path)
            .transpose()?;
        let rclone_config = config.rclone.config.as_deref().map(expand_path).transpose()?;
        let rclone_binary = config.rclone.binary.as_deref().map(expand_path).transpose()?;

        let max_workers = config.downloads.max_workers.unwrap_or(DEFAULT_MAX_WORKERS);
        if max_workers == 0 {
            return Err(ChelsaError::Configuration(
                "downloads.max_workers must be at least 1".to_string(),
            ));
        }

        let defaults = RetryPolicy::default();
        let max_attempts = config.downloads.max_attempts.unwrap_or(defaults.max_attempts);
        if max_attempts == 0 {
            return Err(ChelsaError::Configuration(
                "downloads.max_attempts must be at least 1".to_string(),
            ));
        }
        let retry = RetryPolicy {
            max_attempts,
            base_delay: secs_or(config.downloads.backoff_secs, defaults.base_delay)?,
            max_delay: secs_or(config.downloads.max_backoff_secs, defaults.max_delay)?,
            attempt_timeout: config
                .downloads
                .attempt_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.attempt_timeout),
        };

        Ok(ResolvedConfig {
            aoi_path,
            lists_dir,
            cache_dir,
            trace_filelist_json,
            rclone_config,
            rclone_binary,
            max_workers,
            backend: config.downloads.backend.unwrap_or_default(),
            retry,
            trace: resolve_target(config.trace, Kind::Trace, "chelsa01_trace21k_bioclim")?,
            present: resolve_target(config.present, Kind::Present, "chelsa02_bioclim")?,
        })
    }
}

fn resolve_target(
    section: TargetSection,
    kind: Kind,
    default_remote: &str,
) -> Result<TargetConfig, ChelsaError> {
    let output_dir = match section.output_dir.as_deref() {
        Some(dir) => expand_path(dir)?,
        None => Utf8PathBuf::from("./outputs").join(kind.as_str()),
    };
    Ok(TargetConfig {
        remote: section.remote.unwrap_or_else(|| default_remote.to_string()),
        prefix: section.prefix.unwrap_or_default(),
        lists_subdir: section
            .lists_subdir
            .unwrap_or_else(|| kind.as_str().to_string()),
        output_dir,
        nodata_value: section.nodata_value.unwrap_or(DEFAULT_NODATA),
        http_base_url: section.http_base_url,
    })
}

fn secs_or(value: Option<f64>, default: Duration) -> Result<Duration, ChelsaError> {
    match value {
        None => Ok(default),
        Some(secs) => Duration::try_from_secs_f64(secs)
            .map_err(|_| ChelsaError::Configuration(format!("invalid duration: {secs}"))),
    }
}

fn home_dir() -> Result<PathBuf, ChelsaError> {
    BaseDirs::new()
        .map(|dirs| dirs.home_dir().to_path_buf())
        .ok_or_else(|| ChelsaError::Filesystem("unable to resolve home directory".to_string()))
}

pub fn expand_path(raw: &str) -> Result<Utf8PathBuf, ChelsaError> {
    let trimmed = raw.trim();
    let expanded = if trimmed == "~" {
        home_dir()?
    } else if let Some(rest) = trimmed.strip_prefix("~/") {
        home_dir()?.join(rest)
    } else {
        PathBuf::from(trimmed)
    };
    Utf8PathBuf::from_path_buf(expanded)
        .map_err(|path| ChelsaError::Configuration(format!("non-UTF-8 path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let resolved = ConfigLoader::parse("[paths]\naoi = \"aoi.geojson\"\n").unwrap();
        assert_eq!(resolved.max_workers, DEFAULT_MAX_WORKERS);
        assert_eq!(resolved.backend, TransferBackend::Rclone);
        assert_eq!(resolved.trace.remote, "chelsa01_trace21k_bioclim");
        assert_eq!(resolved.present.lists_subdir, "present");
        assert_eq!(resolved.present.nodata_value, DEFAULT_NODATA);
        assert!(resolved.trace.output_dir.ends_with("outputs/trace"));
    }

    #[test]
    fn missing_aoi_is_a_configuration_error() {
        let err = ConfigLoader::parse("[downloads]\nmax_workers = 2\n").unwrap_err();
        assert_matches!(err, ChelsaError::Configuration(_));
    }

    #[test]
    fn zero_workers_rejected() {
        let err = ConfigLoader::parse("[paths]\naoi = \"a.geojson\"\n[downloads]\nmax_workers = 0\n")
            .unwrap_err();
        assert_matches!(err, ChelsaError::Configuration(_));
    }
}
