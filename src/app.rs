use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aoi::Aoi;
use crate::clip::{AoiClipper, ClipStage, DEFAULT_RASTER_CRS};
use crate::config::{ResolvedConfig, TransferBackend};
use crate::digest::Freshness;
use crate::domain::{Kind, Variable};
use crate::error::ChelsaError;
use crate::http::HttpCopier;
use crate::manifest::{
    BuildReport, KaRange, ListMetadata, ListingSource, Manifest, ManifestBuilder, RemoteLister,
    load_listing,
};
use crate::orchestrator::{CancelFlag, EntryOutcome, Orchestrator, RunSummary, plan_jobs};
use crate::rclone::{Rclone, RcloneCopier, RcloneLister};
use crate::store::Store;
use crate::transfer::{Copier, ErrorClass, TransferEngine};

#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    pub variables: Vec<Variable>,
    pub limit: Option<usize>,
    pub force: bool,
    pub max_workers: Option<usize>,
    pub allow_stale: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListVarsResult {
    pub kind: Kind,
    pub lists: Vec<ListVarsEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListVarsEntry {
    pub variable: Option<Variable>,
    pub list_path: Utf8PathBuf,
    pub count: Option<usize>,
    pub total_size_bytes: Option<u64>,
    pub time_min: Option<i32>,
    pub time_max: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ka_bp: Option<KaRange>,
    pub status: ListStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ListStatus {
    Fresh,
    Stale(String),
    MetadataMissing,
    MetadataInvalid(String),
}

#[derive(Debug, Clone)]
pub enum ProgressEvent {
    Message(String),
    RunStarted {
        kind: Kind,
        total: usize,
        pending: usize,
        expected_bytes: u64,
    },
    TransferStarted {
        worker: usize,
        path: String,
        expected_size: Option<u64>,
    },
    TransferProgress {
        worker: usize,
        path: String,
        bytes: u64,
        expected_size: Option<u64>,
    },
    TransferRetry {
        worker: usize,
        path: String,
        attempt: u32,
        class: ErrorClass,
        delay: Duration,
    },
    ClipStarted {
        worker: usize,
        path: String,
    },
    EntryFinished {
        worker: Option<usize>,
        outcome: EntryOutcome,
    },
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone)]
pub struct App {
    config: ResolvedConfig,
    store: Store,
}

impl App {
    pub fn new(config: ResolvedConfig) -> Self {
        let store = Store::from_config(&config);
        Self { config, store }
    }

    pub fn prepare_lists(
        &self,
        kind: Kind,
        source_json: Option<&Utf8Path>,
        sink: &dyn ProgressSink,
    ) -> Result<BuildReport, ChelsaError> {
        if self.listing_document(kind, source_json).is_some() {
            return self.prepare_lists_with(kind, source_json, None, sink);
        }
        let lister = RcloneLister::new(self.locate_rclone()?);
        self.prepare_lists_with(kind, source_json, Some(&lister as &dyn RemoteLister), sink)
    }

    pub fn prepare_lists_with(
        &self,
        kind: Kind,
        source_json: Option<&Utf8Path>,
        lister: Option<&dyn RemoteLister>,
        sink: &dyn ProgressSink,
    ) -> Result<BuildReport, ChelsaError> {
        let (records, source) = match (self.listing_document(kind, source_json), lister) {
            (Some(path), _) => {
                sink.event(ProgressEvent::Message(format!("reading listing {path}")));
                info!(kind = %kind, path = %path, "reading listing document");
                let records = load_listing(&path)?;
                (
                    records,
                    ListingSource::Json {
                        path: path.to_string(),
                    },
                )
            }
            (None, Some(lister)) => {
                let root = self
                    .config
                    .target(kind)
                    .remote_root(kind, TransferBackend::Rclone)?
                    .listing_root();
                let described = lister.describe(&root);
                sink.event(ProgressEvent::Message(format!("listing {described}")));
                info!(kind = %kind, root = %described, "listing remote");
                let records = lister.list(&root)?;
                (records, ListingSource::Remote { root: described })
            }
            (None, None) => {
                return Err(ChelsaError::Configuration(format!(
                    "no listing source for {kind}: pass --source-json or configure a remote"
                )));
            }
        };

        sink.event(ProgressEvent::Message(format!(
            "building {kind} lists from {} records",
            records.len()
        )));
        let report = ManifestBuilder::new(&self.store).build(kind, records, source)?;
        sink.event(ProgressEvent::Message(format!(
            "wrote {} list(s), {} unparsed, {} duplicate(s)",
            report.lists.len(),
            report.unparsed,
            report.duplicates
        )));
        Ok(report)
    }

    pub fn list_vars(&self, kind: Kind) -> Result<ListVarsResult, ChelsaError> {
        let files = self.store.list_files(kind)?;
        if files.is_empty() {
            return Err(self.no_lists(kind));
        }

        let mut lists = Vec::with_capacity(files.len());
        for list_path in files {
            let variable = Store::variable_for_list(kind, &list_path);
            let entry = match ListMetadata::read(&Store::metadata_path(&list_path)) {
                Ok(metadata) => {
                    let status = match crate::digest::validate(&list_path, &metadata)? {
                        Freshness::Fresh => ListStatus::Fresh,
                        Freshness::Stale(reason) => ListStatus::Stale(reason.to_string()),
                    };
                    ListVarsEntry {
                        variable: Some(metadata.variable),
                        list_path,
                        count: Some(metadata.count),
                        total_size_bytes: Some(metadata.total_size_bytes),
                        time_min: metadata.time_min,
                        time_max: metadata.time_max,
                        ka_bp: metadata.ka_bp,
                        status,
                    }
                }
                Err(err) => ListVarsEntry {
                    variable,
                    list_path,
                    count: None,
                    total_size_bytes: None,
                    time_min: None,
                    time_max: None,
                    ka_bp: None,
                    status: match err {
                        ChelsaError::MetadataMissing(_) => ListStatus::MetadataMissing,
                        ChelsaError::MetadataParse { message, .. } => {
                            ListStatus::MetadataInvalid(message)
                        }
                        other => return Err(other),
                    },
                },
            };
            lists.push(entry);
        }

        Ok(ListVarsResult { kind, lists })
    }

    pub fn download(
        &self,
        kind: Kind,
        options: &DownloadOptions,
        cancel: CancelFlag,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, ChelsaError> {
        // Fail on configuration before loading the AOI or any tool.
        self.config
            .target(kind)
            .remote_root(kind, self.config.backend)?;
        let aoi = Aoi::load(&self.config.aoi_path)?;
        aoi.to_crs(DEFAULT_RASTER_CRS)?;
        let clipper = AoiClipper::new(aoi);

        match self.config.backend {
            TransferBackend::Rclone => {
                let copier = RcloneCopier::new(self.locate_rclone()?);
                let engine = TransferEngine::new(copier, self.config.retry);
                self.download_with(kind, options, &engine, &clipper, cancel, sink)
            }
            TransferBackend::Http => {
                let engine = TransferEngine::new(HttpCopier::new()?, self.config.retry);
                self.download_with(kind, options, &engine, &clipper, cancel, sink)
            }
        }
    }

    pub fn download_with<C, S>(
        &self,
        kind: Kind,
        options: &DownloadOptions,
        engine: &TransferEngine<C>,
        clip: &S,
        cancel: CancelFlag,
        sink: &dyn ProgressSink,
    ) -> Result<RunSummary, ChelsaError>
    where
        C: Copier,
        S: ClipStage + ?Sized,
    {
        let target = self.config.target(kind);
        let remote_root = target.remote_root(kind, self.config.backend)?;
        let (manifests, stale_lists) = self.load_manifests(kind, options, sink)?;
        let jobs = plan_jobs(&self.store, target, &remote_root, &manifests, options.limit)?;
        let workers = options.max_workers.unwrap_or(self.config.max_workers);
        if workers == 0 {
            return Err(ChelsaError::Configuration(
                "max workers must be at least 1".to_string(),
            ));
        }

        debug!(
            kind = %kind,
            workers,
            max_secs_per_entry = engine.policy().max_wall_clock().as_secs(),
            "dispatching entries"
        );
        let orchestrator = Orchestrator::new(engine, clip, workers, options.force, cancel);
        let mut summary = orchestrator.run(kind, jobs, sink);
        summary.stale_lists = stale_lists;
        Ok(summary)
    }

    fn load_manifests(
        &self,
        kind: Kind,
        options: &DownloadOptions,
        sink: &dyn ProgressSink,
    ) -> Result<(Vec<Manifest>, Vec<String>), ChelsaError> {
        let list_paths = if options.variables.is_empty() {
            self.store.list_files(kind)?
        } else {
            let mut paths = Vec::with_capacity(options.variables.len());
            for variable in &options.variables {
                let path = self.store.list_path(kind, variable);
                if !path.as_std_path().is_file() {
                    return Err(ChelsaError::NoLists {
                        kind: kind.to_string(),
                        dir: path.to_string(),
                    });
                }
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
            paths
        };
        if list_paths.is_empty() {
            return Err(self.no_lists(kind));
        }

        let mut manifests = Vec::with_capacity(list_paths.len());
        let mut stale_lists = Vec::new();
        for list_path in list_paths {
            let manifest = Manifest::load(kind, &list_path)?;
            if let Freshness::Stale(reason) = &manifest.freshness {
                if !options.allow_stale {
                    return Err(ChelsaError::StaleManifest {
                        list: list_path.to_string(),
                        reason: reason.to_string(),
                    });
                }
                warn!(list = %list_path, "using stale list: {reason}");
                sink.event(ProgressEvent::Message(format!("stale list {list_path}: {reason}")));
                stale_lists.push(list_path.to_string());
            }
            manifests.push(manifest);
        }
        Ok((manifests, stale_lists))
    }

    fn listing_document(&self, kind: Kind, source_json: Option<&Utf8Path>) -> Option<Utf8PathBuf> {
        source_json.map(Utf8Path::to_path_buf).or_else(|| match kind {
            Kind::Trace => self.config.trace_filelist_json.clone(),
            Kind::Present => None,
        })
    }

    fn locate_rclone(&self) -> Result<Rclone, ChelsaError> {
        Rclone::locate(
            self.config.rclone_binary.as_deref().map(Utf8Path::as_std_path),
            self.config.rclone_config.as_deref().map(Utf8Path::as_std_path),
        )
    }

    fn no_lists(&self, kind: Kind) -> ChelsaError {
        ChelsaError::NoLists {
            kind: kind.to_string(),
            dir: self.store.lists_dir(kind).to_string(),
        }
    }
}
