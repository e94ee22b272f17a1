use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::error::ChelsaError;
use crate::manifest::{RemoteLister, RemoteRecord, parse_listing};
use crate::transfer::{CopyError, CopyRequest, Copier, ErrorClass};

const POLL_INTERVAL: Duration = Duration::from_millis(250);
const LISTING_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone)]
pub struct Rclone {
    binary: PathBuf,
    config: Option<PathBuf>,
}

impl Rclone {
    pub fn locate(binary: Option<&Path>, config: Option<&Path>) -> Result<Self, ChelsaError> {
        let binary = match binary {
            Some(path) if path.components().count() > 1 => path.to_path_buf(),
            Some(name) => find_in_path(&name.to_string_lossy())
                .ok_or_else(|| ChelsaError::MissingTool(name.display().to_string()))?,
            None => find_in_path("rclone")
                .ok_or_else(|| ChelsaError::MissingTool("rclone".to_string()))?,
        };
        if !binary.exists() {
            return Err(ChelsaError::MissingTool(binary.display().to_string()));
        }
        Ok(Self {
            binary,
            config: config.map(Path::to_path_buf),
        })
    }

    fn command(&self, args: &[String]) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args);
        if let Some(config) = &self.config {
            cmd.arg("--config").arg(config);
        }
        cmd
    }

    fn copy_args(remote_uri: &str, local_path: &Path) -> Vec<String> {
        vec![
            "copyto".to_string(),
            remote_uri.to_string(),
            local_path.to_string_lossy().to_string(),
            "--retries".to_string(),
            "1".to_string(),
            "--low-level-retries".to_string(),
            "10".to_string(),
            "--no-traverse".to_string(),
            // no `.partial` sibling; progress is read from the cache file
            "--inplace".to_string(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct RcloneCopier {
    rclone: Rclone,
}

impl RcloneCopier {
    pub fn new(rclone: Rclone) -> Self {
        Self { rclone }
    }
}

impl Copier for RcloneCopier {
    fn copy(&self, request: &CopyRequest<'_>, progress: &dyn Fn(u64)) -> Result<(), CopyError> {
        let args = Rclone::copy_args(request.remote_uri, request.local_path);
        debug!(uri = request.remote_uri, "rclone copyto");
        let mut child = self
            .rclone
            .command(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| CopyError::new(ErrorClass::Fatal, format!("failed to spawn rclone: {err}")))?;

        let stderr_reader = child.stderr.take().map(|mut stderr| {
            thread::spawn(move || {
                let mut buffer = String::new();
                let _ = stderr.read_to_string(&mut buffer);
                buffer
            })
        });

        let status = wait_with_timeout(&mut child, request.timeout, || {
            if let Ok(meta) = fs::metadata(request.local_path) {
                progress(meta.len());
            }
        });
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        match status {
            Ok(Some(status)) if status.success() => Ok(()),
            Ok(Some(status)) => Err(classify_exit(status, stderr.trim())),
            Ok(None) => Err(CopyError::new(
                ErrorClass::Timeout,
                format!("rclone exceeded {}s", request.timeout.as_secs()),
            )),
            Err(err) => Err(CopyError::new(ErrorClass::Network, err.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RcloneLister {
    rclone: Rclone,
}

impl RcloneLister {
    pub fn new(rclone: Rclone) -> Self {
        Self { rclone }
    }

    fn list_once(&self, root: &str) -> Result<String, ChelsaError> {
        let args = vec![
            "lsjson".to_string(),
            "--files-only".to_string(),
            "--recursive".to_string(),
            root.to_string(),
        ];
        let output = self
            .rclone
            .command(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| ChelsaError::Listing(err.to_string()))?;
        if output.status.success() {
            return String::from_utf8(output.stdout)
                .map_err(|err| ChelsaError::ListingParse(err.to_string()));
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("rclone lsjson {root} failed with {}", output.status)
        } else {
            stderr
        };
        Err(ChelsaError::Listing(message))
    }
}

impl RemoteLister for RcloneLister {
    fn list(&self, root: &str) -> Result<Vec<RemoteRecord>, ChelsaError> {
        let mut attempt = 1;
        loop {
            match self.list_once(root) {
                Ok(body) => return parse_listing(&body),
                Err(err) if attempt < LISTING_ATTEMPTS => {
                    warn!(root, attempt, "listing failed, retrying: {err}");
                    thread::sleep(Duration::from_secs(1 << attempt));
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn describe(&self, root: &str) -> String {
        format!("rclone lsjson {root}")
    }
}

fn wait_with_timeout(
    child: &mut Child,
    timeout: Duration,
    on_tick: impl Fn(),
) -> std::io::Result<Option<ExitStatus>> {
    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if started.elapsed() >= timeout {
            let _ = child.kill();
            let _ = child.wait();
            return Ok(None);
        }
        on_tick();
        thread::sleep(POLL_INTERVAL);
    }
}

fn classify_exit(status: ExitStatus, stderr: &str) -> CopyError {
    let message = if stderr.is_empty() {
        format!("rclone exited with {status}")
    } else {
        stderr.lines().last().unwrap_or(stderr).to_string()
    };
    let class = match status.code() {
        Some(3) | Some(4) => ErrorClass::NotFound,
        Some(5) => ErrorClass::Network,
        Some(1) | Some(6) => ErrorClass::Fatal,
        Some(7) => match classify_stderr(stderr) {
            ErrorClass::PermissionDenied => ErrorClass::PermissionDenied,
            _ => ErrorClass::Fatal,
        },
        Some(8) => ErrorClass::RateLimited,
        Some(9) => ErrorClass::Incomplete,
        Some(10) => ErrorClass::Timeout,
        Some(_) => classify_stderr(stderr),
        // killed by a signal
        None => ErrorClass::Network,
    };
    CopyError::new(class, message)
}

fn classify_stderr(stderr: &str) -> ErrorClass {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("permission denied") || lower.contains("403") || lower.contains("forbidden") {
        ErrorClass::PermissionDenied
    } else if lower.contains("not found") || lower.contains("404") {
        ErrorClass::NotFound
    } else if lower.contains("429") || lower.contains("too many requests") || lower.contains("rate limit") {
        ErrorClass::RateLimited
    } else if lower.contains("timeout") || lower.contains("timed out") {
        ErrorClass::Timeout
    } else {
        ErrorClass::Network
    }
}

pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
