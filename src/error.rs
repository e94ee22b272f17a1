use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ChelsaError {
    #[error("invalid dataset kind: {0} (expected trace or present)")]
    InvalidKind(String),

    #[error("invalid variable name: {0}")]
    InvalidVariable(String),

    #[error("config file not found: {0}")]
    #[diagnostic(help("copy chelsa-download.example.toml to ~/.chelsa-download.toml or pass --config"))]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse TOML config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("failed to parse remote listing: {0}")]
    ListingParse(String),

    #[error("no list files found for {kind} in {dir}")]
    #[diagnostic(help("run `chelsa-download prepare-lists --kind {kind}` first"))]
    NoLists { kind: String, dir: String },

    #[error("metadata missing for list {0}")]
    #[diagnostic(help("re-run `chelsa-download prepare-lists`"))]
    MetadataMissing(String),

    #[error("failed to parse list metadata {path}: {message}")]
    MetadataParse { path: String, message: String },

    #[error("list {list} is stale: {reason}")]
    #[diagnostic(help("re-run `chelsa-download prepare-lists` or pass --allow-stale"))]
    StaleManifest { list: String, reason: String },

    #[error("failed to load AOI {path}: {message}")]
    Aoi { path: String, message: String },

    #[error("unsupported CRS transformation: {from} -> {to}")]
    UnsupportedCrs { from: String, to: String },

    #[error("reprojection failed: {0}")]
    Reprojection(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("remote listing failed: {0}")]
    Listing(String),

    #[error("HTTP client setup failed: {0}")]
    HttpSetup(String),
}
