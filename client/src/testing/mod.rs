//! Test handlers driven by the control state machine
//!
//! Each test the server declares gets a handler. While a handler is at the
//! head of the queue it receives every control message; it reports `true`
//! from [`TestHandler::handle`] once its test is over. Work on the data
//! channel runs in spawned tasks that report back through [`DataEvent`]s,
//! so handler state is only ever touched from the control loop.

mod download;
mod measurement;
mod metadata;
mod upload;

pub use download::DownloadTest;
pub use measurement::Throughput;
pub use metadata::{MetadataSource, MetadataTest, SystemMetadata};
pub use upload::UploadTest;

use crate::control::Outbound;
use crate::output::{ResultsSink, StatusUpdate};
use crate::session::{Failure, MeasurementResults};
use crate::transport::Transport;
use ndt_protocol::{
    DOWNLOAD_DURATION, DOWNLOAD_RECV_BUFFER, Message, MessageType, PREDEFINED_BUFFER_SIZE,
    TestKind, UPLOAD_DURATION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Fixed per-test durations and buffer sizes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    pub upload_duration: Duration,
    pub download_duration: Duration,
    pub upload_buffer_size: usize,
    pub download_recv_buffer: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            upload_duration: UPLOAD_DURATION,
            download_duration: DOWNLOAD_DURATION,
            upload_buffer_size: PREDEFINED_BUFFER_SIZE,
            download_recv_buffer: DOWNLOAD_RECV_BUFFER,
        }
    }
}

/// Data-channel events reported by spawned test tasks
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent {
    Opened { test: TestKind, at: Instant },
    /// The server closed the data connection
    Closed { test: TestKind },
    Failed { test: TestKind, reason: String },
    TimerExpired { test: TestKind },
}

impl DataEvent {
    pub fn test(&self) -> TestKind {
        match self {
            Self::Opened { test, .. }
            | Self::Closed { test }
            | Self::Failed { test, .. }
            | Self::TimerExpired { test } => *test,
        }
    }
}

/// A data event tagged with the handler whose task posted it
#[derive(Debug, Clone, PartialEq)]
pub struct Posted {
    pub owner: u64,
    pub event: DataEvent,
}

/// Collaborators shared by all handlers of one run
#[derive(Clone)]
pub struct TestEnv {
    pub transport: Arc<dyn Transport>,
    pub host: String,
    pub timing: Timing,
    pub metadata: Arc<dyn MetadataSource>,
    owner: u64,
    events: mpsc::UnboundedSender<Posted>,
}

impl TestEnv {
    pub fn new(
        transport: Arc<dyn Transport>,
        host: String,
        timing: Timing,
        metadata: Arc<dyn MetadataSource>,
    ) -> (Self, mpsc::UnboundedReceiver<Posted>) {
        let (events, rx) = mpsc::unbounded_channel();
        let env = Self {
            transport,
            host,
            timing,
            metadata,
            owner: 0,
            events,
        };
        (env, rx)
    }

    /// Copy whose events are tagged with handler `owner`
    pub fn for_handler(&self, owner: u64) -> Self {
        Self {
            owner,
            ..self.clone()
        }
    }

    /// Post an event to the control loop
    pub fn notify(&self, event: DataEvent) {
        let posted = Posted {
            owner: self.owner,
            event,
        };
        if self.events.send(posted).is_err() {
            debug!("Control loop gone, data event dropped");
        }
    }
}

/// What a handler may touch while processing a message or event
pub struct TestContext<'a> {
    pub results: &'a mut MeasurementResults,
    pub env: &'a TestEnv,
    pub outbound: &'a Outbound,
    pub sink: &'a mut dyn ResultsSink,
}

impl TestContext<'_> {
    pub fn fail(&mut self, failure: Failure) {
        warn!("{}", failure);
        self.sink.status(&StatusUpdate::Failed(failure.clone()));
        self.results.record_failure(failure);
    }
}

/// Per-test protocol handler
pub trait TestHandler: Send {
    fn kind(&self) -> TestKind;

    fn prepare(&mut self, _message: &Message, _ctx: &mut TestContext<'_>) {}

    fn start(&mut self, _ctx: &mut TestContext<'_>) {}

    fn data(&mut self, message: &Message, _ctx: &mut TestContext<'_>) {
        debug!("{} test: ignoring {:?}", self.kind(), message);
    }

    fn finalize(&mut self, _ctx: &mut TestContext<'_>) {}

    fn on_event(&mut self, event: DataEvent, _ctx: &mut TestContext<'_>) {
        debug!("{} test: ignoring {:?}", self.kind(), event);
    }

    /// Process one control message; `true` means the test is over
    fn handle(&mut self, message: &Message, ctx: &mut TestContext<'_>) -> bool {
        match message.kind() {
            Some(MessageType::TestPrepare) => {
                self.prepare(message, ctx);
                false
            }
            Some(MessageType::TestStart) => {
                self.start(ctx);
                false
            }
            Some(MessageType::TestData) => {
                self.data(message, ctx);
                false
            }
            Some(MessageType::TestFinalize) => {
                self.finalize(ctx);
                true
            }
            _ => {
                warn!("{} test: unexpected {:?}", self.kind(), message);
                false
            }
        }
    }
}

/// Handler for a test code from the server's list; tests this client
/// recognizes but does not run have none.
pub fn handler_for(kind: TestKind) -> Option<Box<dyn TestHandler>> {
    match kind {
        TestKind::Upload => Some(Box::new(UploadTest::new())),
        TestKind::Download => Some(Box::new(DownloadTest::new())),
        TestKind::Metadata => Some(Box::new(MetadataTest::new())),
        TestKind::Middlebox | TestKind::Firewall | TestKind::Status => None,
    }
}

/// Data port announced in TEST_PREPARE
fn parse_port(message: &Message) -> Option<u16> {
    message.parse_number::<u16>().ok().filter(|port| *port != 0)
}

/// Server-side rate in a TEST_MSG: a leading number with no `Name:` label
fn server_rate(message: &Message) -> Option<f64> {
    let text = message.payload_str();
    if text.contains(':') {
        return None;
    }
    text.split_whitespace()
        .next()?
        .parse::<f64>()
        .ok()
        .filter(|kbps| kbps.is_finite())
}

/// Handler-level test rig: a memory transport for data connections and
/// channels standing in for the control writer and the event loop.
#[cfg(test)]
pub(crate) struct Harness {
    pub results: MeasurementResults,
    pub env: TestEnv,
    pub outbound: Outbound,
    pub sent: mpsc::UnboundedReceiver<Message>,
    pub events: mpsc::UnboundedReceiver<Posted>,
    pub sink: crate::output::RecordingSink,
    pub accepted: mpsc::UnboundedReceiver<crate::transport::memory::Accepted>,
}

#[cfg(test)]
impl Harness {
    pub fn new(pipe_size: usize, timing: Timing) -> Self {
        Self::refusing(pipe_size, timing, Vec::new())
    }

    pub fn refusing(pipe_size: usize, timing: Timing, refused_ports: Vec<u16>) -> Self {
        let (transport, accepted) =
            crate::transport::memory::MemoryTransport::refusing(pipe_size, refused_ports);
        let (env, events) = TestEnv::new(
            transport,
            "ndt.test".to_string(),
            timing,
            Arc::new(test_descriptors()),
        );
        let (outbound, sent) = Outbound::channel();
        Self {
            results: MeasurementResults::default(),
            env,
            outbound,
            sent,
            events,
            sink: crate::output::RecordingSink::default(),
            accepted,
        }
    }

    pub fn ctx(&mut self) -> TestContext<'_> {
        TestContext {
            results: &mut self.results,
            env: &self.env,
            outbound: &self.outbound,
            sink: &mut self.sink,
        }
    }

    /// Wait for the next data event and hand it to `handler`
    pub async fn pump(&mut self, handler: &mut dyn TestHandler) -> DataEvent {
        let Posted { event, .. } = self.events.recv().await.expect("event channel open");
        handler.on_event(event.clone(), &mut self.ctx());
        event
    }
}

#[cfg(test)]
pub(crate) fn test_descriptors() -> metadata::ClientDescriptors {
    metadata::ClientDescriptors {
        os_name: "testos".to_string(),
        browser: "test-browser".to_string(),
        client_version: ndt_protocol::CLIENT_VERSION.to_string(),
        application: ndt_protocol::CLIENT_APPLICATION.to_string(),
    }
}
