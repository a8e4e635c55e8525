//! Progress display and result publishing

use crate::session::{Failure, MeasurementResults};
use anyhow::{Context, Result};
use ndt_protocol::TestKind;
use std::io;
use std::path::{Path, PathBuf};
use tracing::error;

/// Progress reported while a run is under way
#[derive(Debug, Clone, PartialEq)]
pub enum StatusUpdate {
    Connected,
    Queued { minutes: Option<u32> },
    ServerVersion(String),
    TestStarted(TestKind),
    TestFinished { test: TestKind, kbps: Option<f64> },
    Failed(Failure),
}

/// Where progress and final results go
pub trait ResultsSink: Send {
    fn status(&mut self, update: &StatusUpdate);

    /// Called once per run, when it ends
    fn publish(&mut self, results: &MeasurementResults);
}

/// Prints to stdout; optionally writes the results as CSV
#[derive(Debug, Default)]
pub struct ConsoleSink {
    json: bool,
    export: Option<PathBuf>,
}

impl ConsoleSink {
    pub fn new(json: bool, export: Option<PathBuf>) -> Self {
        Self { json, export }
    }

    fn line(&self, text: &str) {
        if !self.json {
            println!("[{}] {}", chrono::Local::now().format("%H:%M:%S"), text);
        }
    }
}

impl ResultsSink for ConsoleSink {
    fn status(&mut self, update: &StatusUpdate) {
        let text = match update {
            StatusUpdate::Connected => "Connected, negotiating tests".to_string(),
            StatusUpdate::Queued { minutes: Some(m) } => {
                format!("Queued by server, about {} minute(s) to wait", m)
            }
            StatusUpdate::Queued { minutes: None } => "Queued by server".to_string(),
            StatusUpdate::ServerVersion(v) => format!("Server version {}", v),
            StatusUpdate::TestStarted(test) => format!("Running {} test", test),
            StatusUpdate::TestFinished {
                test,
                kbps: Some(kbps),
            } => format!("{} test done: {:.2} kbps", test, kbps),
            StatusUpdate::TestFinished { test, kbps: None } => format!("{} test done", test),
            StatusUpdate::Failed(failure) => format!("ERROR: {}", failure),
        };
        self.line(&text);
    }

    fn publish(&mut self, results: &MeasurementResults) {
        if self.json {
            match serde_json::to_string_pretty(results) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Failed to serialize results: {}", e),
            }
        } else {
            print_summary(results);
        }

        if let Some(path) = &self.export {
            match export_csv(results, path) {
                Ok(()) => self.line(&format!("Results written to {}", path.display())),
                Err(e) => error!("{:#}", e),
            }
        }
    }
}

fn print_summary(results: &MeasurementResults) {
    let rate = |kbps: Option<f64>| {
        kbps.map(|v| format!("{:.2} kbps", v))
            .unwrap_or_else(|| "-".to_string())
    };

    println!();
    println!("=== NDT Results ===");
    if let Some(version) = &results.server_version {
        println!("  Server version:      {}", version);
    }
    println!("  Upload (client):     {}", rate(results.client_upload_kbps));
    println!("  Upload (server):     {}", rate(results.server_upload_kbps));
    println!("  Download (client):   {}", rate(results.client_download_kbps));
    println!("  Download (server):   {}", rate(results.server_download_kbps));
    if let Some(failure) = &results.failure {
        println!("  Failure:             {}", failure);
    }
    if !results.variables.is_empty() {
        println!("  Server variables:    {}", results.variables.len());
    }
}

/// Write `metric,value` rows
pub fn write_csv<W: io::Write>(results: &MeasurementResults, writer: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(writer);
    writer.write_record(["metric", "value"])?;
    for (metric, value) in results.entries() {
        writer.write_record([metric, value])?;
    }
    writer.flush()?;
    Ok(())
}

/// Export results as CSV
pub fn export_csv(results: &MeasurementResults, output_path: &Path) -> Result<()> {
    let file = std::fs::File::create(output_path)
        .with_context(|| format!("Failed to create {}", output_path.display()))?;
    write_csv(results, file).with_context(|| format!("Failed to write {}", output_path.display()))
}

/// Sink that keeps everything it is given, for assertions
#[cfg(test)]
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    pub statuses: std::sync::Arc<std::sync::Mutex<Vec<StatusUpdate>>>,
    pub published: std::sync::Arc<std::sync::Mutex<Vec<MeasurementResults>>>,
}

#[cfg(test)]
impl ResultsSink for RecordingSink {
    fn status(&mut self, update: &StatusUpdate) {
        self.statuses.lock().unwrap().push(update.clone());
    }

    fn publish(&mut self, results: &MeasurementResults) {
        self.published.lock().unwrap().push(results.clone());
    }
}
