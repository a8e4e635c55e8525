//! Protocol constants and message type definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Oldest server version this client still talks to
pub const LAST_VALID_SERVER_VERSION: &str = "v3.3.12";

/// Protocol version announced by this client
pub const CLIENT_VERSION: &str = "v3.6.5.2";

/// Default application identifier sent during the metadata test
pub const CLIENT_APPLICATION: &str = "ndt-rs";

/// Standard control port of an NDT server
pub const DEFAULT_CONTROL_PORT: u16 = 3001;

/// How long the client pushes data during the upload test.
/// Slightly longer than the server's 10 s window so the server closes first.
pub const UPLOAD_DURATION: Duration = Duration::from_millis(11_000);

/// How long the client counts received data during the download test
pub const DOWNLOAD_DURATION: Duration = Duration::from_millis(11_000);

/// Size of the pre-generated upload buffer
pub const PREDEFINED_BUFFER_SIZE: usize = 8192;

/// Receive buffer requested for the raw download connection
pub const DOWNLOAD_RECV_BUFFER: usize = 10_000_000;

// Metadata test labels
pub const META_CLIENT_OS: &str = "client.os.name:";
pub const META_CLIENT_BROWSER: &str = "client.browser.name:";
pub const META_CLIENT_VERSION: &str = "client.version:";
pub const META_CLIENT_APPLICATION: &str = "client.application:";

/// Control message types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    CommFailure = 0x00,
    QueueStatus = 0x01,
    Login = 0x02,
    TestPrepare = 0x03,
    TestStart = 0x04,
    TestData = 0x05,
    TestFinalize = 0x06,
    Error = 0x07,
    Results = 0x08,
    Logout = 0x09,
    Waiting = 0x10,
    ExtendedLogin = 0x11,
}

impl MessageType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(Self::CommFailure),
            0x01 => Some(Self::QueueStatus),
            0x02 => Some(Self::Login),
            0x03 => Some(Self::TestPrepare),
            0x04 => Some(Self::TestStart),
            0x05 => Some(Self::TestData),
            0x06 => Some(Self::TestFinalize),
            0x07 => Some(Self::Error),
            0x08 => Some(Self::Results),
            0x09 => Some(Self::Logout),
            0x10 => Some(Self::Waiting),
            0x11 => Some(Self::ExtendedLogin),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

// Queue status codes carried as decimal text in SRV_QUEUE messages
pub const SRV_QUEUE_TEST_STARTS_NOW: u32 = 0;
pub const SRV_QUEUE_SERVER_FAULT: u32 = 9977;
pub const SRV_QUEUE_SERVER_BUSY: u32 = 9988;
pub const SRV_QUEUE_HEARTBEAT: u32 = 9990;
pub const SRV_QUEUE_SERVER_BUSY_60S: u32 = 9999;

/// Server scheduling state reported while the client waits for a test slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    StartNow,
    ServerFault,
    ServerBusy,
    ServerBusyExtended,
    Heartbeat,
    /// Estimated wait in minutes
    Wait(u32),
}

impl QueueStatus {
    pub fn from_code(code: u32) -> Self {
        match code {
            SRV_QUEUE_TEST_STARTS_NOW => Self::StartNow,
            SRV_QUEUE_SERVER_FAULT => Self::ServerFault,
            SRV_QUEUE_SERVER_BUSY => Self::ServerBusy,
            SRV_QUEUE_HEARTBEAT => Self::Heartbeat,
            SRV_QUEUE_SERVER_BUSY_60S => Self::ServerBusyExtended,
            minutes => Self::Wait(minutes),
        }
    }

    /// Busy and fault replies end the session; the server closes the connection
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::ServerFault | Self::ServerBusy | Self::ServerBusyExtended
        )
    }
}

/// Test kinds, encoded as bit flags in the login request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum TestKind {
    Middlebox = 1 << 0,
    Upload = 1 << 1,
    Download = 1 << 2,
    Firewall = 1 << 3,
    Status = 1 << 4,
    Metadata = 1 << 5,
}

impl TestKind {
    /// Map a numeric code from the server's test list
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Middlebox),
            2 => Some(Self::Upload),
            4 => Some(Self::Download),
            8 => Some(Self::Firewall),
            16 => Some(Self::Status),
            32 => Some(Self::Metadata),
            _ => None,
        }
    }

    pub fn bit(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Middlebox => "middlebox",
            Self::Upload => "upload",
            Self::Download => "download",
            Self::Firewall => "firewall",
            Self::Status => "status",
            Self::Metadata => "metadata",
        }
    }
}

impl fmt::Display for TestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Bitwise-OR of requested test kinds, as sent in the login payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TestSuite(u8);

impl TestSuite {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub fn with(self, kind: TestKind) -> Self {
        Self(self.0 | kind.bit())
    }

    pub fn without(self, kind: TestKind) -> Self {
        Self(self.0 & !kind.bit())
    }

    pub fn contains(self, kind: TestKind) -> bool {
        self.0 & kind.bit() != 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl FromIterator<TestKind> for TestSuite {
    fn from_iter<I: IntoIterator<Item = TestKind>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::with)
    }
}
