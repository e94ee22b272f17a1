use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, mpsc};
use std::thread;

use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::app::{ProgressEvent, ProgressSink};
use crate::clip::{ClipOutcome, ClipRequest, ClipStage, output_satisfied};
use crate::config::TargetConfig;
use crate::domain::{Kind, Variable};
use crate::error::ChelsaError;
use crate::manifest::Manifest;
use crate::store::Store;
use crate::transfer::{
    Copier, ErrorClass, RemoteRoot, TransferEngine, TransferProgress, TransferRequest,
};

#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadJob {
    pub kind: Kind,
    pub variable: Variable,
    pub remote_path: String,
    pub remote_uri: String,
    pub cache_path: Utf8PathBuf,
    pub output_path: Utf8PathBuf,
    pub expected_size: Option<u64>,
    pub nodata: f64,
}

pub fn plan_jobs(
    store: &Store,
    target: &TargetConfig,
    remote_root: &RemoteRoot,
    manifests: &[Manifest],
    limit: Option<usize>,
) -> Result<Vec<DownloadJob>, ChelsaError> {
    let mut jobs = Vec::new();
    let mut outputs = HashSet::new();
    for manifest in manifests {
        let variable = &manifest.metadata.variable;
        for entry in &manifest.entries {
            if limit.is_some_and(|limit| jobs.len() >= limit) {
                return Ok(jobs);
            }
            let output_path = Store::output_path(&target.output_dir, variable, &entry.path);
            if !outputs.insert(output_path.clone()) {
                warn!(
                    list = %manifest.list_path,
                    path = %entry.path,
                    output = %output_path,
                    "entry maps to an output already planned, skipping"
                );
                continue;
            }
            jobs.push(DownloadJob {
                kind: manifest.kind,
                variable: variable.clone(),
                remote_path: entry.path.clone(),
                remote_uri: remote_root.uri(&entry.path),
                cache_path: store.cache_path(manifest.kind, &entry.path)?,
                output_path,
                expected_size: entry.size,
                nodata: target.nodata_value,
            });
        }
    }
    Ok(jobs)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    Skipped,
    Done,
    TransferFailed,
    ClipFailed,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntryOutcome {
    pub remote_path: String,
    pub variable: Variable,
    pub output_path: Utf8PathBuf,
    pub state: EntryState,
    pub bytes_transferred: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl EntryOutcome {
    fn new(job: &DownloadJob, state: EntryState) -> Self {
        Self {
            remote_path: job.remote_path.clone(),
            variable: job.variable.clone(),
            output_path: job.output_path.clone(),
            state,
            bytes_transferred: 0,
            attempts: None,
            error_class: None,
            reason: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSummary {
    pub kind: Kind,
    pub total: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub bytes_transferred: u64,
    pub stale_lists: Vec<String>,
    pub failures: Vec<EntryOutcome>,
}

impl RunSummary {
    pub fn new(kind: Kind, total: usize) -> Self {
        Self {
            kind,
            total,
            attempted: 0,
            succeeded: 0,
            skipped: 0,
            failed: 0,
            cancelled: 0,
            bytes_transferred: 0,
            stale_lists: Vec::new(),
            failures: Vec::new(),
        }
    }

    pub fn has_failures(&self) -> bool {
        self.failed > 0
    }

    fn record(&mut self, outcome: EntryOutcome, dispatched: bool) {
        if dispatched {
            self.attempted += 1;
        }
        self.bytes_transferred += outcome.bytes_transferred;
        match outcome.state {
            EntryState::Skipped => self.skipped += 1,
            EntryState::Done => self.succeeded += 1,
            EntryState::Cancelled => self.cancelled += 1,
            EntryState::TransferFailed | EntryState::ClipFailed => {
                self.failed += 1;
                self.failures.push(outcome);
            }
        }
    }
}

pub struct Orchestrator<'a, C, S: ?Sized> {
    engine: &'a TransferEngine<C>,
    clip: &'a S,
    max_workers: usize,
    force: bool,
    cancel: CancelFlag,
}

impl<'a, C, S> Orchestrator<'a, C, S>
where
    C: Copier,
    S: ClipStage + ?Sized,
{
    pub fn new(
        engine: &'a TransferEngine<C>,
        clip: &'a S,
        max_workers: usize,
        force: bool,
        cancel: CancelFlag,
    ) -> Self {
        Self {
            engine,
            clip,
            max_workers: max_workers.max(1),
            force,
            cancel,
        }
    }

    /// Run every job to a terminal state. Entry failures are recorded in
    /// the summary and never stop the batch.
    pub fn run(&self, kind: Kind, jobs: Vec<DownloadJob>, sink: &dyn ProgressSink) -> RunSummary {
        let mut summary = RunSummary::new(kind, jobs.len());
        let mut pending = VecDeque::new();
        for job in jobs {
            if !self.force && output_satisfied(&job.output_path) {
                let outcome = EntryOutcome::new(&job, EntryState::Skipped);
                sink.event(ProgressEvent::EntryFinished {
                    worker: None,
                    outcome: outcome.clone(),
                });
                summary.record(outcome, false);
            } else {
                pending.push_back(job);
            }
        }

        sink.event(ProgressEvent::RunStarted {
            kind,
            total: summary.total,
            pending: pending.len(),
            expected_bytes: pending.iter().filter_map(|job| job.expected_size).sum(),
        });
        info!(
            kind = %kind,
            total = summary.total,
            pending = pending.len(),
            skipped = summary.skipped,
            "starting downloads"
        );

        let workers = self.max_workers.min(pending.len());
        let queue = Mutex::new(pending);
        let (tx, rx) = mpsc::channel::<EntryOutcome>();

        thread::scope(|scope| {
            for worker in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || {
                    while !self.cancel.is_cancelled() {
                        let job = match queue.lock() {
                            Ok(mut queue) => queue.pop_front(),
                            Err(_) => None,
                        };
                        let Some(job) = job else {
                            break;
                        };
                        let outcome = self.run_entry(worker, &job, sink);
                        sink.event(ProgressEvent::EntryFinished {
                            worker: Some(worker),
                            outcome: outcome.clone(),
                        });
                        if tx.send(outcome).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(tx);
            for outcome in rx {
                summary.record(outcome, true);
            }
        });

        let leftover = match queue.into_inner() {
            Ok(queue) => queue,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !leftover.is_empty() {
            warn!(remaining = leftover.len(), "run cancelled before all entries were dispatched");
        }
        for job in leftover {
            let outcome = EntryOutcome::new(&job, EntryState::Cancelled);
            sink.event(ProgressEvent::EntryFinished {
                worker: None,
                outcome: outcome.clone(),
            });
            summary.record(outcome, false);
        }

        info!(
            kind = %kind,
            succeeded = summary.succeeded,
            skipped = summary.skipped,
            failed = summary.failed,
            cancelled = summary.cancelled,
            bytes = summary.bytes_transferred,
            "downloads finished"
        );
        summary
    }

    fn run_entry(&self, worker: usize, job: &DownloadJob, sink: &dyn ProgressSink) -> EntryOutcome {
        sink.event(ProgressEvent::TransferStarted {
            worker,
            path: job.remote_path.clone(),
            expected_size: job.expected_size,
        });
        let request = TransferRequest {
            remote_path: job.remote_path.clone(),
            remote_uri: job.remote_uri.clone(),
            cache_path: job.cache_path.clone().into_std_path_buf(),
            expected_size: job.expected_size,
        };
        let on_progress = |progress: TransferProgress| match progress {
            TransferProgress::Bytes(bytes) => sink.event(ProgressEvent::TransferProgress {
                worker,
                path: job.remote_path.clone(),
                bytes,
                expected_size: job.expected_size,
            }),
            TransferProgress::Retrying {
                attempt,
                class,
                delay,
            } => sink.event(ProgressEvent::TransferRetry {
                worker,
                path: job.remote_path.clone(),
                attempt,
                class,
                delay,
            }),
        };

        let receipt = match self.engine.transfer(&request, &self.cancel, &on_progress) {
            Ok(receipt) => receipt,
            Err(failure) => {
                let state = if failure.class == ErrorClass::Cancelled {
                    EntryState::Cancelled
                } else {
                    error!(path = %job.remote_path, "transfer failed: {failure}");
                    EntryState::TransferFailed
                };
                return EntryOutcome {
                    attempts: Some(failure.attempts),
                    error_class: Some(failure.class),
                    reason: Some(failure.message),
                    ..EntryOutcome::new(job, state)
                };
            }
        };

        sink.event(ProgressEvent::ClipStarted {
            worker,
            path: job.remote_path.clone(),
        });
        let clip_request = ClipRequest {
            cache_path: job.cache_path.as_std_path(),
            output_path: &job.output_path,
            nodata: job.nodata,
            force: self.force,
        };
        let mut outcome = match self.clip.clip(&clip_request) {
            Ok(ClipOutcome::Written { .. }) => EntryOutcome::new(job, EntryState::Done),
            Ok(ClipOutcome::Skipped) => EntryOutcome::new(job, EntryState::Skipped),
            Err(failure) => {
                error!(
                    path = %job.remote_path,
                    cache = %job.cache_path,
                    "clip failed, cache file kept: {failure}"
                );
                EntryOutcome {
                    reason: Some(failure.to_string()),
                    ..EntryOutcome::new(job, EntryState::ClipFailed)
                }
            }
        };
        outcome.bytes_transferred = receipt.fetched;
        outcome
    }
}
