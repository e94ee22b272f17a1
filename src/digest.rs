use std::fmt;
use std::fs;

use camino::Utf8Path;
use sha2::{Digest, Sha256};

use crate::error::ChelsaError;
use crate::manifest::ListMetadata;

pub const DIGEST_ALGORITHM: &str = "sha256";

pub fn digest_bytes(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale(StaleReason),
}

impl Freshness {
    pub fn is_fresh(&self) -> bool {
        matches!(self, Freshness::Fresh)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleReason {
    CountMismatch { recorded: usize, actual: usize },
    DigestMismatch { recorded: String, actual: String },
    UnknownAlgorithm(String),
}

impl fmt::Display for StaleReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StaleReason::CountMismatch { recorded, actual } => {
                write!(f, "metadata records {recorded} entries, list has {actual}")
            }
            StaleReason::DigestMismatch { recorded, actual } => {
                write!(f, "digest {actual} does not match recorded {recorded}")
            }
            StaleReason::UnknownAlgorithm(name) => write!(f, "unknown digest algorithm {name}"),
        }
    }
}

pub fn validate(list_path: &Utf8Path, metadata: &ListMetadata) -> Result<Freshness, ChelsaError> {
    if metadata.digest_algorithm != DIGEST_ALGORITHM {
        return Ok(Freshness::Stale(StaleReason::UnknownAlgorithm(
            metadata.digest_algorithm.clone(),
        )));
    }

    let content = fs::read(list_path.as_std_path())
        .map_err(|err| ChelsaError::Filesystem(format!("{list_path}: {err}")))?;
    let actual = count_entries(&content);
    if actual != metadata.count {
        return Ok(Freshness::Stale(StaleReason::CountMismatch {
            recorded: metadata.count,
            actual,
        }));
    }

    let digest = digest_bytes(&content);
    if digest != metadata.digest {
        return Ok(Freshness::Stale(StaleReason::DigestMismatch {
            recorded: metadata.digest.clone(),
            actual: digest,
        }));
    }
    Ok(Freshness::Fresh)
}

fn count_entries(content: &[u8]) -> usize {
    String::from_utf8_lossy(content)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .count()
}
