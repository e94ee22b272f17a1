use std::fmt;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::orchestrator::CancelFlag;

const SLEEP_SLICE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Network,
    Timeout,
    RateLimited,
    Incomplete,
    NotFound,
    PermissionDenied,
    Cancelled,
    Fatal,
}

impl ErrorClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            ErrorClass::Network | ErrorClass::Timeout | ErrorClass::RateLimited | ErrorClass::Incomplete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorClass::Network => "network",
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimited => "rate_limited",
            ErrorClass::Incomplete => "incomplete",
            ErrorClass::NotFound => "not_found",
            ErrorClass::PermissionDenied => "permission_denied",
            ErrorClass::Cancelled => "cancelled",
            ErrorClass::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{class}: {message}")]
pub struct CopyError {
    pub class: ErrorClass,
    pub message: String,
}

impl CopyError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CopyRequest<'a> {
    pub remote_uri: &'a str,
    pub local_path: &'a Path,
    pub expected_size: Option<u64>,
    pub timeout: Duration,
}

pub trait Copier: Send + Sync {
    fn copy(&self, request: &CopyRequest<'_>, progress: &dyn Fn(u64)) -> Result<(), CopyError>;

    /// Whether a partial local file is continued rather than rewritten. When
    /// false the engine deletes partial files before every attempt.
    fn resumes_partial(&self) -> bool {
        false
    }
}

impl<T: Copier + ?Sized> Copier for &T {
    fn copy(&self, request: &CopyRequest<'_>, progress: &dyn Fn(u64)) -> Result<(), CopyError> {
        (**self).copy(request, progress)
    }

    fn resumes_partial(&self) -> bool {
        (**self).resumes_partial()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(30 * 60),
        }
    }
}

impl RetryPolicy {
    /// Delay slept after failed attempt `attempt` (1-based): base, 2*base,
    /// 4*base, ... capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    pub fn max_wall_clock(&self) -> Duration {
        let attempts = self.attempt_timeout.saturating_mul(self.max_attempts);
        (1..self.max_attempts)
            .map(|attempt| self.delay_after(attempt))
            .fold(attempts, Duration::saturating_add)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRoot {
    Rclone { alias: String, prefix: String },
    Http { base_url: String, prefix: String },
}

impl RemoteRoot {
    pub fn uri(&self, remote_path: &str) -> String {
        match self {
            RemoteRoot::Rclone { alias, prefix } => {
                format!("{alias}:{}", join_remote(prefix, remote_path))
            }
            RemoteRoot::Http { base_url, prefix } => format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                join_remote(prefix, remote_path)
            ),
        }
    }

    pub fn listing_root(&self) -> String {
        match self {
            RemoteRoot::Rclone { alias, prefix } => {
                format!("{alias}:{}", prefix.trim_matches('/'))
            }
            RemoteRoot::Http { base_url, prefix } => format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                prefix.trim_matches('/')
            ),
        }
    }
}

fn join_remote(prefix: &str, path: &str) -> String {
    [prefix.trim_matches('/'), path.trim_start_matches('/')]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub remote_path: String,
    pub remote_uri: String,
    pub cache_path: PathBuf,
    pub expected_size: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReceipt {
    pub size: u64,
    pub fetched: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferProgress {
    Bytes(u64),
    Retrying {
        attempt: u32,
        class: ErrorClass,
        delay: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Error)]
#[error("{remote_path}: {class} after {attempts} attempt(s): {message}")]
pub struct TransferFailure {
    pub remote_path: String,
    pub attempts: u32,
    pub class: ErrorClass,
    pub message: String,
}

pub struct TransferEngine<C> {
    copier: C,
    policy: RetryPolicy,
}

impl<C: Copier> TransferEngine<C> {
    pub fn new(copier: C, policy: RetryPolicy) -> Self {
        Self { copier, policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Copy one remote file into its cache path. A successful return means
    /// the cache file size equals `expected_size` when it is known.
    pub fn transfer(
        &self,
        request: &TransferRequest,
        cancel: &CancelFlag,
        progress: &dyn Fn(TransferProgress),
    ) -> Result<TransferReceipt, TransferFailure> {
        let fail = |attempts: u32, error: CopyError| TransferFailure {
            remote_path: request.remote_path.clone(),
            attempts,
            class: error.class,
            message: error.message,
        };

        if let Some(parent) = request.cache_path.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| fail(0, CopyError::new(ErrorClass::Fatal, err.to_string())))?;
        }

        let mut last_error = CopyError::new(ErrorClass::Fatal, "no attempt made");
        for attempt in 1..=self.policy.max_attempts {
            if cancel.is_cancelled() {
                return Err(fail(attempt - 1, CopyError::new(ErrorClass::Cancelled, "cancelled")));
            }

            let resumed_from = self
                .prepare_cache_file(request)
                .map_err(|err| fail(attempt, err))?;
            if resumed_from > 0 && Some(resumed_from) == request.expected_size {
                debug!(path = %request.remote_path, "cache file already complete");
                return Ok(TransferReceipt {
                    size: resumed_from,
                    fetched: 0,
                });
            }

            debug!(
                path = %request.remote_path,
                attempt,
                resumed_from,
                "starting transfer attempt"
            );
            let copy_request = CopyRequest {
                remote_uri: &request.remote_uri,
                local_path: &request.cache_path,
                expected_size: request.expected_size,
                timeout: self.policy.attempt_timeout,
            };
            let outcome = self
                .copier
                .copy(&copy_request, &|bytes| progress(TransferProgress::Bytes(bytes)));

            let error = match outcome.and_then(|()| self.verify_size(request)) {
                Ok(size) => {
                    progress(TransferProgress::Bytes(size));
                    return Ok(TransferReceipt {
                        size,
                        fetched: size.saturating_sub(resumed_from),
                    });
                }
                Err(error) => error,
            };
            self.discard_oversized(request);

            if !error.class.is_retryable() {
                return Err(fail(attempt, error));
            }

            if attempt < self.policy.max_attempts {
                let delay = self.policy.delay_after(attempt);
                warn!(
                    path = %request.remote_path,
                    attempt,
                    class = %error.class,
                    delay_ms = delay.as_millis() as u64,
                    "transfer attempt failed, retrying: {}",
                    error.message
                );
                progress(TransferProgress::Retrying {
                    attempt,
                    class: error.class,
                    delay,
                });
                if !sleep_unless_cancelled(delay, cancel) {
                    return Err(fail(attempt, CopyError::new(ErrorClass::Cancelled, "cancelled")));
                }
            }
            last_error = error;
        }

        Err(fail(self.policy.max_attempts, last_error))
    }

    fn prepare_cache_file(&self, request: &TransferRequest) -> Result<u64, CopyError> {
        let path = &request.cache_path;
        let existing = fs::metadata(path).map(|meta| meta.len()).ok();
        let keep = match (existing, request.expected_size) {
            (None, _) => false,
            (Some(len), Some(expected)) if len > expected => false,
            (Some(len), Some(expected)) if len == expected => true,
            (Some(_), _) => self.copier.resumes_partial(),
        };

        if keep {
            return Ok(existing.unwrap_or(0));
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|err| CopyError::new(ErrorClass::Fatal, format!("{}: {err}", path.display())))?;
        Ok(0)
    }

    fn verify_size(&self, request: &TransferRequest) -> Result<u64, CopyError> {
        let actual = fs::metadata(&request.cache_path)
            .map(|meta| meta.len())
            .map_err(|err| {
                CopyError::new(
                    ErrorClass::Incomplete,
                    format!("cache file missing after copy: {err}"),
                )
            })?;
        match request.expected_size {
            Some(expected) if actual != expected => Err(CopyError::new(
                ErrorClass::Incomplete,
                format!("size mismatch: {actual} != {expected}"),
            )),
            _ => Ok(actual),
        }
    }

    fn discard_oversized(&self, request: &TransferRequest) {
        let Some(expected) = request.expected_size else {
            return;
        };
        let oversized = fs::metadata(&request.cache_path)
            .map(|meta| meta.len() > expected)
            .unwrap_or(false);
        if oversized {
            if let Err(err) = fs::remove_file(&request.cache_path) {
                warn!(path = %request.cache_path.display(), "failed to remove oversized cache file: {err}");
            }
        }
    }
}

fn sleep_unless_cancelled(delay: Duration, cancel: &CancelFlag) -> bool {
    let mut remaining = delay;
    while !remaining.is_zero() {
        if cancel.is_cancelled() {
            return false;
        }
        let slice = remaining.min(SLEEP_SLICE);
        thread::sleep(slice);
        remaining = remaining.saturating_sub(slice);
    }
    !cancel.is_cancelled()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(10),
            attempt_timeout: Duration::from_secs(60),
        };
        assert_eq!(policy.delay_after(1), Duration::from_secs(2));
        assert_eq!(policy.delay_after(2), Duration::from_secs(4));
        assert_eq!(policy.delay_after(3), Duration::from_secs(8));
        assert_eq!(policy.delay_after(4), Duration::from_secs(10));
        // 5 * 60s of attempts plus 2 + 4 + 8 + 10 of backoff
        assert_eq!(policy.max_wall_clock(), Duration::from_secs(324));
    }

    #[test]
    fn remote_uris() {
        let rclone = RemoteRoot::Rclone {
            alias: "chelsa02_bioclim".to_string(),
            prefix: "/chelsa_V2/".to_string(),
        };
        assert_eq!(
            rclone.uri("bio/CHELSA_bio1_1981-2010_V.2.1.tif"),
            "chelsa02_bioclim:chelsa_V2/bio/CHELSA_bio1_1981-2010_V.2.1.tif"
        );

        let http = RemoteRoot::Http {
            base_url: "https://example.org/chelsa/".to_string(),
            prefix: String::new(),
        };
        assert_eq!(http.uri("/bio/a.tif"), "https://example.org/chelsa/bio/a.tif");
    }

    #[test]
    fn retryable_classes() {
        assert!(ErrorClass::Timeout.is_retryable());
        assert!(ErrorClass::RateLimited.is_retryable());
        assert!(!ErrorClass::NotFound.is_retryable());
        assert!(!ErrorClass::PermissionDenied.is_retryable());
    }
}
