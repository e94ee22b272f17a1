use std::io::{self, Write};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::app::{ListStatus, ListVarsResult, ProgressEvent, ProgressSink};
use crate::manifest::BuildReport;
use crate::orchestrator::{EntryState, RunSummary};

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_report(report: &BuildReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_summary(summary: &RunSummary) -> io::Result<()> {
        Self::print_json(summary)
    }

    pub fn print_list_vars(result: &ListVarsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Message(message) => info!("{message}"),
            ProgressEvent::RunStarted {
                kind,
                total,
                pending,
                expected_bytes,
            } => info!(
                kind = %kind,
                total,
                pending,
                "{} to download",
                bytes_to_human(expected_bytes)
            ),
            ProgressEvent::TransferStarted { worker, path, .. } => {
                debug!(worker, path = %path, "transfer started")
            }
            ProgressEvent::TransferProgress { worker, path, bytes, .. } => {
                debug!(worker, path = %path, bytes, "transfer progress")
            }
            ProgressEvent::TransferRetry {
                worker,
                path,
                attempt,
                class,
                delay,
            } => warn!(
                worker,
                path = %path,
                attempt,
                class = %class,
                "retrying in {:.1}s",
                delay.as_secs_f64()
            ),
            ProgressEvent::ClipStarted { worker, path } => debug!(worker, path = %path, "clipping"),
            ProgressEvent::EntryFinished { outcome, .. } => match outcome.state {
                EntryState::Done => info!(path = %outcome.output_path, "done"),
                EntryState::Skipped => debug!(path = %outcome.output_path, "already present"),
                EntryState::Cancelled => debug!(path = %outcome.remote_path, "cancelled"),
                EntryState::TransferFailed | EntryState::ClipFailed => {}
            },
        }
    }
}

pub fn print_report_text(report: &BuildReport) {
    println!(
        "{} list(s) for {} from {} record(s)",
        report.lists.len(),
        report.kind,
        report.records
    );
    for list in &report.lists {
        let range = match (list.time_min, list.time_max) {
            (Some(min), Some(max)) => format!("{min}..{max}"),
            _ => "-".to_string(),
        };
        println!(
            "  {:<14} {:>6} files {:>10}  {range:<12} {}",
            list.variable.as_str(),
            list.count,
            bytes_to_human(list.total_size_bytes),
            list.list_path
        );
    }
    if report.unparsed > 0 {
        println!("  {} record(s) did not match the file grammar", report.unparsed);
        for sample in &report.unparsed_samples {
            println!("    {sample}");
        }
    }
    if report.duplicates > 0 {
        println!("  {} duplicate record(s) collapsed", report.duplicates);
    }
    if report.name_collisions > 0 {
        println!(
            "  {} record(s) sharing a file name with another directory collapsed",
            report.name_collisions
        );
    }
}

pub fn print_list_vars_text(result: &ListVarsResult) {
    println!("{} lists:", result.kind);
    for list in &result.lists {
        let variable = list
            .variable
            .as_ref()
            .map(|variable| variable.as_str().to_string())
            .unwrap_or_else(|| "?".to_string());
        let count = list
            .count
            .map(|count| count.to_string())
            .unwrap_or_else(|| "-".to_string());
        let range = match (list.time_min, list.time_max) {
            (Some(min), Some(max)) => format!("{min}..{max}"),
            _ => "-".to_string(),
        };
        let status = match &list.status {
            ListStatus::Fresh => "fresh".to_string(),
            ListStatus::Stale(reason) => format!("STALE ({reason})"),
            ListStatus::MetadataMissing => "no metadata".to_string(),
            ListStatus::MetadataInvalid(message) => format!("bad metadata ({message})"),
        };
        println!("  {variable:<14} {count:>6}  {range:<12} {status}");
    }
}

pub fn print_summary_text(summary: &RunSummary) {
    println!(
        "{}: {} total, {} succeeded, {} skipped, {} failed, {} cancelled, {} transferred",
        summary.kind,
        summary.total,
        summary.succeeded,
        summary.skipped,
        summary.failed,
        summary.cancelled,
        bytes_to_human(summary.bytes_transferred)
    );
    for list in &summary.stale_lists {
        println!("  stale list used: {list}");
    }
    for failure in &summary.failures {
        println!(
            "  FAILED {} ({}): {}",
            failure.remote_path,
            failure
                .error_class
                .map(|class| class.to_string())
                .unwrap_or_else(|| "clip".to_string()),
            failure.reason.as_deref().unwrap_or("unknown")
        );
    }
}

pub fn bytes_to_human(bytes: u64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let value = bytes as f64;
    if value >= GB {
        format!("{:.1} GB", value / GB)
    } else if value >= MB {
        format!("{:.1} MB", value / MB)
    } else if value >= KB {
        format!("{:.1} KB", value / KB)
    } else {
        format!("{bytes} B")
    }
}

#[cfg(test)]
mod tests {
    use super::bytes_to_human;

    #[test]
    fn human_sizes() {
        assert_eq!(bytes_to_human(512), "512 B");
        assert_eq!(bytes_to_human(2048), "2.0 KB");
        assert_eq!(bytes_to_human(5 * 1024 * 1024 * 1024), "5.0 GB");
    }
}
