pub mod aoi;
pub mod app;
pub mod clip;
pub mod config;
pub mod digest;
pub mod domain;
pub mod error;
pub mod geotiff;
pub mod http;
pub mod manifest;
pub mod orchestrator;
pub mod output;
pub mod rclone;
pub mod store;
pub mod transfer;
pub mod tui;
