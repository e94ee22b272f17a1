use std::fs;
use std::io::Write;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tempfile::Builder;

use crate::config::ResolvedConfig;
use crate::domain::{Kind, Variable, file_name};
use crate::error::ChelsaError;

pub const LIST_EXTENSION: &str = "txt";
pub const METADATA_SUFFIX: &str = ".meta.json";
pub const OUTPUT_SUFFIX: &str = "_AOI";

#[derive(Debug, Clone)]
pub struct Store {
    lists_root: Utf8PathBuf,
    cache_root: Utf8PathBuf,
    trace_subdir: String,
    present_subdir: String,
}

impl Store {
    pub fn from_config(config: &ResolvedConfig) -> Self {
        Self {
            lists_root: config.lists_dir.clone(),
            cache_root: config.cache_dir.clone(),
            trace_subdir: config.trace.lists_subdir.clone(),
            present_subdir: config.present.lists_subdir.clone(),
        }
    }

    pub fn new_with_paths(lists_root: Utf8PathBuf, cache_root: Utf8PathBuf) -> Self {
        Self {
            lists_root,
            cache_root,
            trace_subdir: Kind::Trace.as_str().to_string(),
            present_subdir: Kind::Present.as_str().to_string(),
        }
    }

    pub fn lists_dir(&self, kind: Kind) -> Utf8PathBuf {
        let subdir = match kind {
            Kind::Trace => &self.trace_subdir,
            Kind::Present => &self.present_subdir,
        };
        if subdir.is_empty() {
            self.lists_root.clone()
        } else {
            self.lists_root.join(subdir)
        }
    }

    pub fn list_path(&self, kind: Kind, variable: &Variable) -> Utf8PathBuf {
        self.lists_dir(kind)
            .join(format!("{kind}_{variable}.{LIST_EXTENSION}"))
    }

    pub fn metadata_path(list_path: &Utf8Path) -> Utf8PathBuf {
        let stem = list_path.file_stem().unwrap_or("list");
        list_path.with_file_name(format!("{stem}{METADATA_SUFFIX}"))
    }

    pub fn list_files(&self, kind: Kind) -> Result<Vec<Utf8PathBuf>, ChelsaError> {
        let dir = self.lists_dir(kind);
        if !dir.as_std_path().is_dir() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| ChelsaError::Filesystem(format!("{dir}: {err}")))?;
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| ChelsaError::Filesystem(err.to_string()))?;
            let Ok(path) = Utf8PathBuf::from_path_buf(entry.path()) else {
                continue;
            };
            if path.is_file() && Self::variable_for_list(kind, &path).is_some() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    pub fn variable_for_list(kind: Kind, list_path: &Utf8Path) -> Option<Variable> {
        if list_path.extension() != Some(LIST_EXTENSION) {
            return None;
        }
        let stem = list_path.file_stem()?;
        let raw = stem.strip_prefix(kind.as_str())?.strip_prefix('_')?;
        raw.parse().ok()
    }

    pub fn read_list(path: &Utf8Path) -> Result<Vec<String>, ChelsaError> {
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| ChelsaError::Filesystem(format!("{path}: {err}")))?;
        Ok(content
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect())
    }

    /// Cache location of a remote file. Remote paths that would escape the
    /// cache root are rejected.
    pub fn cache_path(&self, kind: Kind, remote_path: &str) -> Result<Utf8PathBuf, ChelsaError> {
        let relative = Utf8Path::new(remote_path.trim_start_matches('/'));
        let escapes = relative.as_str().is_empty()
            || relative
                .components()
                .any(|component| !matches!(component, Utf8Component::Normal(_)));
        if escapes {
            return Err(ChelsaError::Filesystem(format!(
                "refusing to cache remote path outside the cache root: {remote_path}"
            )));
        }
        Ok(self.cache_root.join(kind.as_str()).join(relative))
    }

    pub fn output_path(output_dir: &Utf8Path, variable: &Variable, remote_path: &str) -> Utf8PathBuf {
        let name = Utf8Path::new(file_name(remote_path));
        let stem = name.file_stem().unwrap_or(name.as_str());
        let file = match name.extension() {
            Some(ext) => format!("{stem}{OUTPUT_SUFFIX}.{ext}"),
            None => format!("{stem}{OUTPUT_SUFFIX}"),
        };
        output_dir.join(variable.as_str()).join(file)
    }

    pub fn ensure_dir(path: &Utf8Path) -> Result<(), ChelsaError> {
        fs::create_dir_all(path.as_std_path())
            .map_err(|err| ChelsaError::Filesystem(format!("{path}: {err}")))
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), ChelsaError> {
        let parent = path
            .parent()
            .ok_or_else(|| ChelsaError::Filesystem(format!("invalid destination path: {path}")))?;
        Self::ensure_dir(parent)?;
        let mut temp = Builder::new()
            .prefix(".chelsa-write")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| ChelsaError::Filesystem(err.to_string()))?;
        temp.write_all(content)
            .and_then(|()| temp.as_file().sync_all())
            .map_err(|err| ChelsaError::Filesystem(format!("{path}: {err}")))?;
        temp.persist(path.as_std_path())
            .map_err(|err| ChelsaError::Filesystem(format!("{path}: {}", err.error)))?;
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), ChelsaError> {
        let mut content = serde_json::to_vec_pretty(value)
            .map_err(|err| ChelsaError::Filesystem(err.to_string()))?;
        content.push(b'\n');
        Self::write_bytes_atomic(path, &content)
    }
}
