//! Measurement results collected during a run

use super::Failure;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

/// A server variable value: numeric when it parses as one, text otherwise
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ResultValue {
    Number(f64),
    Text(String),
}

impl ResultValue {
    pub fn parse(raw: &str) -> Self {
        match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => Self::Number(n),
            _ => Self::Text(raw.to_string()),
        }
    }
}

impl fmt::Display for ResultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Split a results payload into `Name: value` pairs.
///
/// Lines without a colon or with an empty name are skipped.
pub fn parse_variables(text: &str) -> Vec<(String, ResultValue)> {
    text.lines()
        .filter_map(|line| {
            let (name, value) = line.split_once(':')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), ResultValue::parse(value.trim())))
        })
        .collect()
}

/// Everything measured or reported during one run
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeasurementResults {
    pub server_version: Option<String>,

    pub upload_start: Option<DateTime<Utc>>,
    pub upload_end: Option<DateTime<Utc>>,
    pub upload_bytes_sent: Option<u64>,
    /// Upload rate measured by this client
    pub client_upload_kbps: Option<f64>,
    /// Upload rate measured by the server
    pub server_upload_kbps: Option<f64>,

    pub download_start: Option<DateTime<Utc>>,
    pub download_end: Option<DateTime<Utc>>,
    pub download_bytes_received: Option<u64>,
    pub client_download_kbps: Option<f64>,
    pub server_download_kbps: Option<f64>,

    pub failure: Option<Failure>,

    /// Raw server variables keyed by name
    pub variables: BTreeMap<String, ResultValue>,
}

impl MeasurementResults {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn set_client_upload_kbps(&mut self, kbps: f64) -> bool {
        write_once(&mut self.client_upload_kbps, kbps, "client upload rate")
    }

    pub fn set_server_upload_kbps(&mut self, kbps: f64) -> bool {
        write_once(&mut self.server_upload_kbps, kbps, "server upload rate")
    }

    pub fn set_client_download_kbps(&mut self, kbps: f64) -> bool {
        write_once(&mut self.client_download_kbps, kbps, "client download rate")
    }

    pub fn set_server_download_kbps(&mut self, kbps: f64) -> bool {
        write_once(&mut self.server_download_kbps, kbps, "server download rate")
    }

    /// Keep the first failure; later ones are usually consequences of it
    pub fn record_failure(&mut self, failure: Failure) {
        match &self.failure {
            None => self.failure = Some(failure),
            Some(first) => debug!("Ignoring follow-up failure '{}' after '{}'", failure, first),
        }
    }

    /// Merge `Name: value` lines into the variable map; returns how many were stored
    pub fn merge_variables(&mut self, text: &str) -> usize {
        let parsed = parse_variables(text);
        let count = parsed.len();
        self.variables.extend(parsed);
        count
    }

    /// Flattened `(metric, value)` rows for export
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut rows = Vec::new();
        let mut push = |name: &str, value: Option<String>| {
            if let Some(value) = value {
                rows.push((name.to_string(), value));
            }
        };

        push("serverVersion", self.server_version.clone());
        push("uploadStart", self.upload_start.map(|t| t.to_rfc3339()));
        push("uploadEnd", self.upload_end.map(|t| t.to_rfc3339()));
        push("uploadBytesSent", self.upload_bytes_sent.map(|b| b.to_string()));
        push("clientUploadKbps", self.client_upload_kbps.map(|v| format!("{:.2}", v)));
        push("serverUploadKbps", self.server_upload_kbps.map(|v| format!("{:.2}", v)));
        push("downloadStart", self.download_start.map(|t| t.to_rfc3339()));
        push("downloadEnd", self.download_end.map(|t| t.to_rfc3339()));
        push("downloadBytesReceived", self.download_bytes_received.map(|b| b.to_string()));
        push("clientDownloadKbps", self.client_download_kbps.map(|v| format!("{:.2}", v)));
        push("serverDownloadKbps", self.server_download_kbps.map(|v| format!("{:.2}", v)));
        push("failure", self.failure.as_ref().map(|f| f.to_string()));

        for (name, value) in &self.variables {
            rows.push((name.clone(), value.to_string()));
        }
        rows
    }
}

fn write_once(slot: &mut Option<f64>, value: f64, what: &str) -> bool {
    if let Some(existing) = slot {
        warn!("Ignoring second {} ({:.2}), already have {:.2}", what, value, existing);
        return false;
    }
    *slot = Some(value);
    true
}
