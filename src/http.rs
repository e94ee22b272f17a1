use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::time::Duration;

use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::{CONTENT_RANGE, HeaderMap, HeaderValue, RANGE, USER_AGENT};
use tracing::debug;

use crate::error::ChelsaError;
use crate::transfer::{CopyError, CopyRequest, Copier, ErrorClass};

const CHUNK_SIZE: usize = 256 * 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HttpCopier {
    client: Client,
}

impl HttpCopier {
    pub fn new() -> Result<Self, ChelsaError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("chelsa-download/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| ChelsaError::HttpSetup(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|err| ChelsaError::HttpSetup(err.to_string()))?;
        Ok(Self { client })
    }
}

impl Copier for HttpCopier {
    fn copy(&self, request: &CopyRequest<'_>, progress: &dyn Fn(u64)) -> Result<(), CopyError> {
        let local_err =
            |err: std::io::Error| CopyError::new(ErrorClass::Fatal, format!("{}: {err}", request.local_path.display()));
        let offset = std::fs::metadata(request.local_path)
            .map(|meta| meta.len())
            .unwrap_or(0);

        let mut builder = self.client.get(request.remote_uri).timeout(request.timeout);
        if offset > 0 {
            builder = builder.header(RANGE, format!("bytes={offset}-"));
        }
        debug!(uri = request.remote_uri, offset, "http get");
        let mut response = builder.send().map_err(classify_error)?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && Some(offset) == request.expected_size {
            return Ok(());
        }
        if !status.is_success() {
            return Err(CopyError::new(
                classify_status(status.as_u16()),
                format!("HTTP {status} for {}", request.remote_uri),
            ));
        }
        let resumed = match body_start(status, response.headers(), offset) {
            BodyStart::Resume => true,
            BodyStart::Rewrite => false,
            BodyStart::Misaligned => {
                File::create(request.local_path).map_err(local_err)?;
                return Err(CopyError::new(
                    ErrorClass::Network,
                    format!("partial response does not start at byte {offset}"),
                ));
            }
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed)
            .truncate(!resumed)
            .open(request.local_path)
            .map_err(local_err)?;
        let mut written = if resumed { offset } else { 0 };
        let limit = request.expected_size;
        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            let read = response.read(&mut buffer).map_err(|err| {
                CopyError::new(ErrorClass::Network, format!("read failed after {written} bytes: {err}"))
            })?;
            if read == 0 {
                break;
            }
            if let Some(limit) = limit.filter(|limit| written + read as u64 > *limit) {
                return Err(CopyError::new(
                    ErrorClass::Fatal,
                    format!("remote sent more than the expected {limit} bytes"),
                ));
            }
            file.write_all(&buffer[..read]).map_err(local_err)?;
            written += read as u64;
            progress(written);
        }
        file.flush().map_err(local_err)?;
        Ok(())
    }

    fn resumes_partial(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyStart {
    Resume,
    Rewrite,
    Misaligned,
}

fn body_start(status: StatusCode, headers: &HeaderMap, offset: u64) -> BodyStart {
    if status != StatusCode::PARTIAL_CONTENT {
        BodyStart::Rewrite
    } else if range_starts_at(headers, offset) {
        BodyStart::Resume
    } else {
        BodyStart::Misaligned
    }
}

fn range_starts_at(headers: &HeaderMap, offset: u64) -> bool {
    headers
        .get(CONTENT_RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes "))
        .and_then(|value| value.split('-').next())
        .and_then(|start| start.trim().parse::<u64>().ok())
        .is_some_and(|start| start == offset)
}

fn classify_status(status: u16) -> ErrorClass {
    match status {
        404 | 410 => ErrorClass::NotFound,
        401 | 403 => ErrorClass::PermissionDenied,
        408 => ErrorClass::Timeout,
        429 => ErrorClass::RateLimited,
        500..=599 => ErrorClass::Network,
        _ => ErrorClass::Fatal,
    }
}

fn classify_error(err: reqwest::Error) -> CopyError {
    let class = if err.is_timeout() {
        ErrorClass::Timeout
    } else if err.is_connect() || err.is_request() || err.is_body() {
        ErrorClass::Network
    } else {
        ErrorClass::Fatal
    };
    CopyError::new(class, err.to_string())
}
