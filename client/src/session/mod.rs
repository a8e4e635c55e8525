//! Session state for one test run
//!
//! A fresh [`SessionState`] and [`MeasurementResults`] pair is owned by the
//! control state machine for the duration of a run and reset once the run
//! ends, so the same instances can serve the next run.

mod results;

pub use results::MeasurementResults;

use ndt_protocol::{TestKind, TestSuite};
use serde::Serialize;
use thiserror::Error;

/// Negotiation and progress flags
#[derive(Debug, Clone, Default)]
pub struct SessionState {
    pub connected: bool,
    pub queued: bool,
    pub version_compatible: bool,
    /// A scalar reply (queue status) is expected from the server
    pub waiting_for_reply: bool,
    pub complete: bool,
    /// Tests requested in the login message
    pub requested: TestSuite,
    /// Tests the server asked for, in server order
    pub negotiated_tests: Vec<TestKind>,
    /// Estimated queue wait while queued
    pub time_till_start_minutes: Option<u32>,
}

impl SessionState {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Terminal or test-level failures recorded during a run
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    #[error("Server fault")]
    ServerFault,

    #[error("Server busy, try again later")]
    ServerBusy,

    #[error("Server version {server} is too old for this client")]
    IncompatibleVersion { server: String },

    #[error("{test} test failed: {reason}")]
    Transport { test: TestKind, reason: String },

    #[error("Control stream corrupted: {reason}")]
    Framing { reason: String },

    #[error("Control connection closed before logout")]
    ConnectionLost,
}
