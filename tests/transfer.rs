use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use assert_matches::assert_matches;

use chelsa_download::orchestrator::CancelFlag;
use chelsa_download::transfer::{
    CopyError, CopyRequest, Copier, ErrorClass, RetryPolicy, TransferEngine, TransferProgress,
    TransferRequest,
};

#[derive(Debug, Clone, Copy)]
enum Step {
    /// Write the rest of the payload.
    Complete,
    /// Write up to `n` bytes of the payload, then fail with `class`.
    Interrupt(usize, ErrorClass),
    Fail(ErrorClass),
}

/// Serves one payload following a fixed script of attempt outcomes.
struct ScriptedCopier {
    payload: Vec<u8>,
    resumes: bool,
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<usize>,
}

impl ScriptedCopier {
    fn new(payload: &[u8], resumes: bool, steps: &[Step]) -> Self {
        Self {
            payload: payload.to_vec(),
            resumes,
            steps: Mutex::new(steps.iter().copied().collect()),
            calls: Mutex::new(0),
        }
    }

    fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl Copier for ScriptedCopier {
    fn copy(&self, request: &CopyRequest<'_>, progress: &dyn Fn(u64)) -> Result<(), CopyError> {
        *self.calls.lock().unwrap() += 1;
        let step = self.steps.lock().unwrap().pop_front().unwrap_or(Step::Complete);
        let offset = fs::metadata(request.local_path)
            .map(|meta| meta.len() as usize)
            .unwrap_or(0);
        let offset = if self.resumes { offset } else { 0 };
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.resumes)
            .truncate(!self.resumes)
            .open(request.local_path)
            .unwrap();

        match step {
            Step::Complete => {
                file.write_all(&self.payload[offset..]).unwrap();
                progress(self.payload.len() as u64);
                Ok(())
            }
            Step::Interrupt(upto, class) => {
                let end = upto.max(offset).min(self.payload.len());
                file.write_all(&self.payload[offset..end]).unwrap();
                progress(end as u64);
                Err(CopyError::new(class, "connection reset"))
            }
            Step::Fail(class) => Err(CopyError::new(class, "scripted failure")),
        }
    }

    fn resumes_partial(&self) -> bool {
        self.resumes
    }
}

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(2),
        attempt_timeout: Duration::from_secs(5),
    }
}

fn payload() -> Vec<u8> {
    (0..4096u32).map(|value| (value % 251) as u8).collect()
}

fn request(dir: &std::path::Path, expected: Option<u64>) -> TransferRequest {
    TransferRequest {
        remote_path: "bio/CHELSA_bio1_1981-2010_V.2.1.tif".to_string(),
        remote_uri: "chelsa02_bioclim:bio/CHELSA_bio1_1981-2010_V.2.1.tif".to_string(),
        cache_path: dir.join("present/bio/CHELSA_bio1_1981-2010_V.2.1.tif"),
        expected_size: expected,
    }
}

#[test]
fn interrupted_transfer_restarts_to_identical_file() {
    let dir = tempfile::tempdir().unwrap();
    let payload = payload();
    let copier = ScriptedCopier::new(
        &payload,
        false,
        &[Step::Interrupt(1000, ErrorClass::Network), Step::Complete],
    );
    let engine = TransferEngine::new(&copier, fast_policy(3));
    let request = request(dir.path(), Some(payload.len() as u64));

    let receipt = engine
        .transfer(&request, &CancelFlag::new(), &|_| {})
        .unwrap();

    assert_eq!(receipt.size, payload.len() as u64);
    assert_eq!(fs::read(&request.cache_path).unwrap(), payload);
    assert_eq!(copier.calls(), 2);
}

#[test]
fn interrupted_transfer_resumes_without_duplication() {
    let dir = tempfile::tempdir().unwrap();
    let payload = payload();
    let copier = ScriptedCopier::new(
        &payload,
        true,
        &[
            Step::Interrupt(1000, ErrorClass::Timeout),
            Step::Interrupt(3000, ErrorClass::Network),
            Step::Complete,
        ],
    );
    let engine = TransferEngine::new(&copier, fast_policy(3));
    let request = request(dir.path(), Some(payload.len() as u64));

    let receipt = engine
        .transfer(&request, &CancelFlag::new(), &|_| {})
        .unwrap();

    assert_eq!(fs::read(&request.cache_path).unwrap(), payload);
    assert_eq!(receipt.fetched, payload.len() as u64 - 3000);
}

#[test]
fn short_copy_without_error_is_retried_as_incomplete() {
    let dir = tempfile::tempdir().unwrap();
    let payload = payload();
    // First attempt "succeeds" but leaves a short file.
    struct ShortThenFull<'a>(&'a ScriptedCopier, Mutex<bool>);
    impl Copier for ShortThenFull<'_> {
        fn copy(&self, request: &CopyRequest<'_>, progress: &dyn Fn(u64)) -> Result<(), CopyError> {
            let mut first = self.1.lock().unwrap();
            if *first {
                *first = false;
                fs::write(request.local_path, &self.0.payload[..10]).unwrap();
                return Ok(());
            }
            self.0.copy(request, progress)
        }
    }
    let inner = ScriptedCopier::new(&payload, false, &[Step::Complete]);
    let copier = ShortThenFull(&inner, Mutex::new(true));
    let engine = TransferEngine::new(&copier, fast_policy(3));
    let request = request(dir.path(), Some(payload.len() as u64));

    let retries = Mutex::new(Vec::new());
    engine
        .transfer(&request, &CancelFlag::new(), &|progress| {
            if let TransferProgress::Retrying { class, .. } = progress {
                retries.lock().unwrap().push(class);
            }
        })
        .unwrap();

    assert_eq!(*retries.lock().unwrap(), vec![ErrorClass::Incomplete]);
    assert_eq!(fs::read(&request.cache_path).unwrap(), payload);
}

#[test]
fn terminal_errors_are_not_retried() {
    let dir = tempfile::tempdir().unwrap();
    let copier = ScriptedCopier::new(&payload(), false, &[Step::Fail(ErrorClass::NotFound)]);
    let engine = TransferEngine::new(&copier, fast_policy(5));

    let failure = engine
        .transfer(&request(dir.path(), Some(4096)), &CancelFlag::new(), &|_| {})
        .unwrap_err();

    assert_eq!(failure.class, ErrorClass::NotFound);
    assert_eq!(failure.attempts, 1);
    assert_eq!(copier.calls(), 1);
}

#[test]
fn retryable_errors_exhaust_the_attempt_cap() {
    let dir = tempfile::tempdir().unwrap();
    let copier = ScriptedCopier::new(
        &payload(),
        false,
        &[
            Step::Fail(ErrorClass::RateLimited),
            Step::Fail(ErrorClass::Network),
            Step::Fail(ErrorClass::Timeout),
            Step::Complete,
        ],
    );
    let engine = TransferEngine::new(&copier, fast_policy(3));

    let failure = engine
        .transfer(&request(dir.path(), Some(4096)), &CancelFlag::new(), &|_| {})
        .unwrap_err();

    assert_eq!(failure.attempts, 3);
    assert_eq!(failure.class, ErrorClass::Timeout);
    assert_eq!(copier.calls(), 3);
}

#[test]
fn complete_cache_file_is_reused() {
    let dir = tempfile::tempdir().unwrap();
    let payload = payload();
    let request = request(dir.path(), Some(payload.len() as u64));
    fs::create_dir_all(request.cache_path.parent().unwrap()).unwrap();
    fs::write(&request.cache_path, &payload).unwrap();

    let copier = ScriptedCopier::new(&payload, false, &[Step::Fail(ErrorClass::Fatal)]);
    let engine = TransferEngine::new(&copier, fast_policy(3));
    let receipt = engine
        .transfer(&request, &CancelFlag::new(), &|_| {})
        .unwrap();

    assert_eq!(receipt.fetched, 0);
    assert_eq!(copier.calls(), 0);
}

#[test]
fn cancelled_before_start() {
    let dir = tempfile::tempdir().unwrap();
    let copier = ScriptedCopier::new(&payload(), false, &[]);
    let engine = TransferEngine::new(&copier, fast_policy(3));
    let cancel = CancelFlag::new();
    cancel.cancel();

    let failure = engine
        .transfer(&request(dir.path(), None), &cancel, &|_| {})
        .unwrap_err();

    assert_matches!(failure.class, ErrorClass::Cancelled);
    assert_eq!(copier.calls(), 0);
}
