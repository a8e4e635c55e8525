//! Configuration management

use crate::control::Settings;
use crate::testing::Timing;
use anyhow::{Context, Result};
use ndt_protocol::{
    CLIENT_APPLICATION, DEFAULT_CONTROL_PORT, DOWNLOAD_DURATION, DOWNLOAD_RECV_BUFFER,
    MAX_PAYLOAD_SIZE, PREDEFINED_BUFFER_SIZE, TestKind, TestSuite, UPLOAD_DURATION,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub tests: TestsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_control_port")]
    pub control_port: u16,
    /// Largest control message payload accepted from the server
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TestsConfig {
    #[serde(default = "default_true")]
    pub upload: bool,
    #[serde(default = "default_true")]
    pub download: bool,
    #[serde(default = "default_true")]
    pub metadata: bool,
    #[serde(default)]
    pub middlebox: bool,
    #[serde(default)]
    pub firewall: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TimingConfig {
    #[serde(default = "default_upload_duration_ms")]
    pub upload_duration_ms: u64,
    #[serde(default = "default_download_duration_ms")]
    pub download_duration_ms: u64,
    #[serde(default = "default_upload_buffer_size")]
    pub upload_buffer_size: usize,
    #[serde(default = "default_download_recv_buffer")]
    pub download_recv_buffer: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Reported as `client.application` in the metadata test
    #[serde(default = "default_application")]
    pub application: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_control_port() -> u16 {
    DEFAULT_CONTROL_PORT
}

fn default_max_message_size() -> usize {
    MAX_PAYLOAD_SIZE
}

fn default_true() -> bool {
    true
}

fn default_upload_duration_ms() -> u64 {
    UPLOAD_DURATION.as_millis() as u64
}

fn default_download_duration_ms() -> u64 {
    DOWNLOAD_DURATION.as_millis() as u64
}

fn default_upload_buffer_size() -> usize {
    PREDEFINED_BUFFER_SIZE
}

fn default_download_recv_buffer() -> usize {
    DOWNLOAD_RECV_BUFFER
}

fn default_application() -> String {
    CLIENT_APPLICATION.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            control_port: default_control_port(),
            max_message_size: default_max_message_size(),
        }
    }
}

impl Default for TestsConfig {
    fn default() -> Self {
        Self {
            upload: true,
            download: true,
            metadata: true,
            middlebox: false,
            firewall: false,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            upload_duration_ms: default_upload_duration_ms(),
            download_duration_ms: default_download_duration_ms(),
            upload_buffer_size: default_upload_buffer_size(),
            download_recv_buffer: default_download_recv_buffer(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            application: default_application(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self> {
        toml::from_str(contents).with_context(|| "Failed to parse config file")
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.host.trim().is_empty() {
            anyhow::bail!("No server host configured (set server.host or pass --server)");
        }
        if self.server.control_port == 0 {
            anyhow::bail!("server.control_port must not be 0");
        }
        if self.server.max_message_size == 0 || self.server.max_message_size > MAX_PAYLOAD_SIZE {
            anyhow::bail!(
                "server.max_message_size must be between 1 and {}",
                MAX_PAYLOAD_SIZE
            );
        }
        if self.timing.upload_duration_ms == 0 || self.timing.download_duration_ms == 0 {
            anyhow::bail!("Test durations must be greater than 0");
        }
        if self.timing.upload_buffer_size == 0 || self.timing.upload_buffer_size > u16::MAX as usize {
            anyhow::bail!(
                "timing.upload_buffer_size must be between 1 and {}",
                u16::MAX
            );
        }
        Ok(())
    }

    /// Login mask; the status bit is always set so the server may queue us
    pub fn requested_tests(&self) -> TestSuite {
        [
            (self.tests.middlebox, TestKind::Middlebox),
            (self.tests.upload, TestKind::Upload),
            (self.tests.download, TestKind::Download),
            (self.tests.firewall, TestKind::Firewall),
            (self.tests.metadata, TestKind::Metadata),
        ]
        .into_iter()
        .filter_map(|(enabled, kind)| enabled.then_some(kind))
        .collect::<TestSuite>()
        .with(TestKind::Status)
    }

    pub fn timing(&self) -> Timing {
        Timing {
            upload_duration: Duration::from_millis(self.timing.upload_duration_ms),
            download_duration: Duration::from_millis(self.timing.download_duration_ms),
            upload_buffer_size: self.timing.upload_buffer_size,
            download_recv_buffer: self.timing.download_recv_buffer,
        }
    }

    pub fn settings(&self) -> Settings {
        Settings {
            host: self.server.host.trim().to_string(),
            control_port: self.server.control_port,
            requested: self.requested_tests(),
            timing: self.timing(),
            max_message_size: self.server.max_message_size,
        }
    }
}
