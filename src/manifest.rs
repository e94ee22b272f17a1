use std::collections::{BTreeMap, HashSet};
use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::digest::{self, DIGEST_ALGORITHM, Freshness};
use crate::domain::{Kind, ListEntry, ParseFailure, Variable, file_name, trace_time_id_to_ka};
use crate::error::ChelsaError;
use crate::store::Store;

const MAX_REPORTED_FAILURES: usize = 20;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteRecord {
    #[serde(rename = "Path", alias = "path")]
    pub path: String,
    #[serde(rename = "Name", alias = "name", default)]
    pub name: Option<String>,
    /// rclone reports -1 when the size is unknown.
    #[serde(rename = "Size", alias = "size", default)]
    pub size: Option<i64>,
    #[serde(rename = "ModTime", alias = "mod_time", alias = "modTime", default)]
    pub mod_time: Option<String>,
    #[serde(rename = "IsDir", alias = "is_dir", default)]
    pub is_dir: bool,
}

impl RemoteRecord {
    pub fn file(path: &str, size: u64) -> Self {
        Self {
            path: path.to_string(),
            name: Some(file_name(path).to_string()),
            size: i64::try_from(size).ok(),
            mod_time: None,
            is_dir: false,
        }
    }

    fn known_size(&self) -> Option<u64> {
        self.size.and_then(|size| u64::try_from(size).ok())
    }
}

pub trait RemoteLister: Send + Sync {
    fn list(&self, root: &str) -> Result<Vec<RemoteRecord>, ChelsaError>;

    fn describe(&self, root: &str) -> String {
        root.to_string()
    }
}

pub fn parse_listing(content: &str) -> Result<Vec<RemoteRecord>, ChelsaError> {
    serde_json::from_str(content).map_err(|err| ChelsaError::ListingParse(err.to_string()))
}

pub fn load_listing(path: &Utf8Path) -> Result<Vec<RemoteRecord>, ChelsaError> {
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| ChelsaError::Filesystem(format!("{path}: {err}")))?;
    parse_listing(&content).map_err(|err| match err {
        ChelsaError::ListingParse(message) => ChelsaError::ListingParse(format!("{path}: {message}")),
        other => other,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ListingSource {
    Json { path: String },
    Remote { root: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mod_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_id: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period: Option<String>,
}

impl FileRecord {
    fn from_entry(entry: &ListEntry) -> Self {
        Self {
            path: entry.path.clone(),
            size: entry.size,
            mod_time: entry.mod_time.clone(),
            time_id: entry.parsed.time.step(),
            month: entry.parsed.month,
            period: entry.parsed.time.period_label(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct KaRange {
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListMetadata {
    pub kind: Kind,
    pub variable: Variable,
    pub count: usize,
    pub total_size_bytes: u64,
    pub time_min: Option<i32>,
    pub time_max: Option<i32>,
    pub digest: String,
    pub digest_algorithm: String,
    pub generated_at: String,
    pub source: ListingSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ka_bp: Option<KaRange>,
    #[serde(default)]
    pub files: Vec<FileRecord>,
}

impl ListMetadata {
    pub fn read(path: &Utf8Path) -> Result<Self, ChelsaError> {
        if !path.as_std_path().exists() {
            return Err(ChelsaError::MetadataMissing(path.to_string()));
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| ChelsaError::Filesystem(format!("{path}: {err}")))?;
        serde_json::from_str(&content).map_err(|err| ChelsaError::MetadataParse {
            path: path.to_string(),
            message: err.to_string(),
        })
    }

    pub fn expected_size(&self, remote_path: &str) -> Option<u64> {
        self.files
            .iter()
            .find(|file| file.path == remote_path)
            .and_then(|file| file.size)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListSummary {
    pub variable: Variable,
    pub list_path: Utf8PathBuf,
    pub metadata_path: Utf8PathBuf,
    pub count: usize,
    pub total_size_bytes: u64,
    pub time_min: Option<i32>,
    pub time_max: Option<i32>,
    pub digest: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuildReport {
    pub kind: Kind,
    pub lists: Vec<ListSummary>,
    pub records: usize,
    pub directories: usize,
    pub duplicates: usize,
    pub name_collisions: usize,
    pub unparsed: usize,
    pub unparsed_samples: Vec<ParseFailure>,
}

pub struct ManifestBuilder<'a> {
    store: &'a Store,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(store: &'a Store) -> Self {
        Self { store }
    }

    /// Group, order and persist `records`. Unparseable names are dropped and
    /// counted; they never fail the build.
    pub fn build(
        &self,
        kind: Kind,
        records: Vec<RemoteRecord>,
        source: ListingSource,
    ) -> Result<BuildReport, ChelsaError> {
        let total = records.len();
        let mut seen = HashSet::new();
        let mut directories = 0;
        let mut duplicates = 0;
        let mut unparsed = 0;
        let mut unparsed_samples = Vec::new();
        let mut groups: BTreeMap<Variable, Vec<ListEntry>> = BTreeMap::new();

        for record in records {
            if record.is_dir {
                directories += 1;
                continue;
            }
            let path = record.path.trim_start_matches('/').to_string();
            if !seen.insert(path.clone()) {
                duplicates += 1;
                continue;
            }
            match kind.parse_name(file_name(&path)) {
                Ok(parsed) => {
                    let size = record.known_size();
                    groups.entry(parsed.variable.clone()).or_default().push(ListEntry {
                        path,
                        size,
                        mod_time: record.mod_time,
                        parsed,
                    });
                }
                Err(failure) => {
                    debug!(path = %path, "{failure}");
                    unparsed += 1;
                    if unparsed_samples.len() < MAX_REPORTED_FAILURES {
                        unparsed_samples.push(failure);
                    }
                }
            }
        }

        if unparsed > 0 {
            warn!(kind = %kind, unparsed, "records did not match the file grammar and were skipped");
        }
        if duplicates > 0 {
            warn!(kind = %kind, duplicates, "duplicate records collapsed");
        }

        let generated_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut lists = Vec::with_capacity(groups.len());
        let mut name_collisions = 0;
        for (variable, mut entries) in groups {
            let collapsed = collapse_name_collisions(&mut entries);
            if collapsed > 0 {
                warn!(
                    kind = %kind,
                    variable = %variable,
                    collapsed,
                    "records share a file name with another directory and were collapsed"
                );
                name_collisions += collapsed;
            }
            kind.sort_entries(&mut entries);
            lists.push(self.write_group(kind, variable, &entries, &source, &generated_at)?);
        }
        info!(kind = %kind, lists = lists.len(), records = total, "lists prepared");

        Ok(BuildReport {
            kind,
            lists,
            records: total,
            directories,
            duplicates,
            name_collisions,
            unparsed,
            unparsed_samples,
        })
    }

    fn write_group(
        &self,
        kind: Kind,
        variable: Variable,
        entries: &[ListEntry],
        source: &ListingSource,
        generated_at: &str,
    ) -> Result<ListSummary, ChelsaError> {
        let content = render_list(entries);
        let digest = digest::digest_bytes(content.as_bytes());
        let list_path = self.store.list_path(kind, &variable);
        let metadata_path = Store::metadata_path(&list_path);

        let time_min = entries.iter().map(|entry| entry.parsed.time.start()).min();
        let time_max = entries.iter().map(|entry| entry.parsed.time.end()).max();
        let ka_bp = match (kind, time_min, time_max) {
            (Kind::Trace, Some(min), Some(max)) => Some(KaRange {
                min: trace_time_id_to_ka(max),
                max: trace_time_id_to_ka(min),
            }),
            _ => None,
        };
        let metadata = ListMetadata {
            kind,
            variable: variable.clone(),
            count: entries.len(),
            total_size_bytes: entries.iter().filter_map(|entry| entry.size).sum(),
            time_min,
            time_max,
            digest: digest.clone(),
            digest_algorithm: DIGEST_ALGORITHM.to_string(),
            generated_at: generated_at.to_string(),
            source: source.clone(),
            ka_bp,
            files: entries.iter().map(FileRecord::from_entry).collect(),
        };

        Store::write_bytes_atomic(&list_path, content.as_bytes())?;
        Store::write_json_atomic(&metadata_path, &metadata)?;
        debug!(list = %list_path, count = metadata.count, "list written");

        Ok(ListSummary {
            variable,
            list_path,
            metadata_path,
            count: metadata.count,
            total_size_bytes: metadata.total_size_bytes,
            time_min,
            time_max,
            digest,
        })
    }
}

// Outputs are keyed by variable and file name, so two entries with the same
// name would write the same output file.
fn collapse_name_collisions(entries: &mut Vec<ListEntry>) -> usize {
    entries.sort_by(|a, b| a.path.cmp(&b.path));
    let before = entries.len();
    let mut names = HashSet::new();
    entries.retain(|entry| names.insert(entry.file_name().to_string()));
    before - entries.len()
}

pub fn render_list(entries: &[ListEntry]) -> String {
    let mut content = String::new();
    for entry in entries {
        content.push_str(&entry.path);
        content.push('\n');
    }
    content
}

#[derive(Debug, Clone)]
pub struct Manifest {
    pub kind: Kind,
    pub list_path: Utf8PathBuf,
    pub metadata: ListMetadata,
    pub entries: Vec<ListEntry>,
    pub freshness: Freshness,
}

impl Manifest {
    pub fn load(kind: Kind, list_path: &Utf8Path) -> Result<Self, ChelsaError> {
        let metadata = ListMetadata::read(&Store::metadata_path(list_path))?;
        let freshness = digest::validate(list_path, &metadata)?;

        let mut entries = Vec::new();
        for path in Store::read_list(list_path)? {
            match kind.parse_name(file_name(&path)) {
                Ok(parsed) => {
                    let record = metadata.files.iter().find(|file| file.path == path);
                    entries.push(ListEntry {
                        size: record.and_then(|file| file.size),
                        mod_time: record.and_then(|file| file.mod_time.clone()),
                        path,
                        parsed,
                    });
                }
                Err(failure) => warn!(list = %list_path, "skipping line: {failure}"),
            }
        }

        Ok(Self {
            kind,
            list_path: list_path.to_path_buf(),
            metadata,
            entries,
            freshness,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsjson_records_deserialize() {
        let records = parse_listing(
            r#"[
                {"Path":"bio1/CHELSA_TraCE21k_bio1_-100_V1.0.tif","Name":"CHELSA_TraCE21k_bio1_-100_V1.0.tif","Size":1024,"ModTime":"2021-01-01T00:00:00Z","IsDir":false},
                {"path":"bio1","is_dir":true},
                {"Path":"x.tif","Size":-1}
            ]"#,
        )
        .unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].known_size(), Some(1024));
        assert!(records[1].is_dir);
        assert_eq!(records[2].known_size(), None);
    }

    #[test]
    fn malformed_listing_is_a_parse_error() {
        let err = parse_listing("{not json").unwrap_err();
        assert!(matches!(err, ChelsaError::ListingParse(_)));
    }

    #[test]
    fn builds_groups_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        let store = Store::new_with_paths(root.join("lists"), root.join("cache"));
        let records = vec![
            RemoteRecord::file("bio1/CHELSA_TraCE21k_bio1_100_V1.0.tif", 30),
            RemoteRecord::file("bio1/CHELSA_TraCE21k_bio1_50_V1.0.tif", 10),
            RemoteRecord::file("bio12/CHELSA_TraCE21k_bio12_50_V1.0.tif", 5),
            RemoteRecord::file("bio1/CHELSA_TraCE21k_bio1_50_V1.0.tif", 10),
            RemoteRecord::file("bio1/readme.txt", 1),
        ];
        let report = ManifestBuilder::new(&store)
            .build(
                Kind::Trace,
                records,
                ListingSource::Remote {
                    root: "alias:".to_string(),
                },
            )
            .unwrap();
        assert_eq!(report.lists.len(), 2);
        assert_eq!(report.duplicates, 1);
        assert_eq!(report.unparsed, 1);
        assert_eq!(report.lists[0].variable.as_str(), "bio01");
        assert_eq!(report.lists[0].total_size_bytes, 40);
        assert_eq!(report.lists[1].variable.as_str(), "bio12");

        let metadata = ListMetadata::read(&report.lists[0].metadata_path).unwrap();
        assert_eq!(metadata.ka_bp, Some(KaRange { min: -8.0, max: -3.0 }));
        assert_eq!(
            metadata.expected_size("bio1/CHELSA_TraCE21k_bio1_100_V1.0.tif"),
            Some(30)
        );
    }
}
