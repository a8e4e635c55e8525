//! Control connection state machine and the session event loop
//!
//! Everything that mutates session state happens on one task: control
//! messages coming out of the framer and events posted by the per-test data
//! tasks are both funnelled through [`ControlMachine`].

mod writer;

pub use writer::Outbound;

use crate::output::{ResultsSink, StatusUpdate};
use crate::session::{Failure, MeasurementResults, SessionState};
use crate::testing::{
    MetadataSource, Posted, TestContext, TestEnv, TestHandler, Timing, handler_for,
};
use crate::transport::{ConnectOptions, Transport};
use anyhow::{Context, Result};
use ndt_protocol::version::{check_server_version, is_version_string};
use ndt_protocol::{Framer, Message, MessageType, QueueStatus, TestKind, TestSuite};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

const READ_BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    Handshake,
    Negotiating,
    Dispatching,
    /// Every queued test is done, waiting for Logout
    Draining,
    Complete,
}

/// Everything a run needs to know up front
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub control_port: u16,
    pub requested: TestSuite,
    pub timing: Timing,
    /// Largest control payload accepted from the server
    pub max_message_size: usize,
}

/// How a run ended
#[derive(Debug, Clone, Default)]
pub struct Outcome {
    /// Results as they were published
    pub results: MeasurementResults,
}

impl Outcome {
    pub fn failure(&self) -> Option<&Failure> {
        self.results.failure.as_ref()
    }
}

/// A handler waiting its turn, with the env its tasks post events through
struct Queued {
    id: u64,
    env: TestEnv,
    handler: Box<dyn TestHandler>,
}

pub struct ControlMachine {
    env: TestEnv,
    outbound: Outbound,
    state: ControlState,
    session: SessionState,
    results: MeasurementResults,
    queue: VecDeque<Queued>,
    next_handler_id: u64,
    framer: Framer,
    sink: Box<dyn ResultsSink>,
    outcome: Option<Outcome>,
}

impl ControlMachine {
    pub fn new(
        env: TestEnv,
        outbound: Outbound,
        requested: TestSuite,
        max_message_size: usize,
        sink: Box<dyn ResultsSink>,
    ) -> Self {
        let session = SessionState {
            requested,
            ..SessionState::default()
        };
        Self {
            env,
            outbound,
            state: ControlState::Handshake,
            session,
            results: MeasurementResults::default(),
            queue: VecDeque::new(),
            next_handler_id: 1,
            framer: Framer::with_max_payload(max_message_size),
            sink,
            outcome: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state == ControlState::Complete
    }

    pub fn into_outcome(self) -> Outcome {
        self.outcome.unwrap_or_default()
    }

    fn transition(&mut self, next: ControlState) {
        if self.state != next {
            debug!("Control state {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// Control connection is open: log in with the requested test mask
    pub fn on_connected(&mut self) {
        self.session.connected = true;
        self.sink.status(&StatusUpdate::Connected);

        info!("Requesting tests, mask {}", self.session.requested.bits());
        self.outbound.send(Message::login(self.session.requested));
        self.session.waiting_for_reply = true;
        self.transition(ControlState::Negotiating);
    }

    /// Bytes read from the control connection
    pub fn on_bytes(&mut self, bytes: &[u8]) {
        let mut messages = Vec::new();
        let framed = self.framer.feed(bytes, |message| messages.push(message));

        for message in messages {
            if self.is_complete() {
                debug!("Session complete, ignoring {:?}", message);
                continue;
            }
            self.dispatch(&message);
        }

        if let Err(e) = framed {
            self.fail(Failure::Framing {
                reason: e.to_string(),
            });
            self.finish();
        }
    }

    /// The server closed the control connection
    pub fn on_disconnect(&mut self) {
        if self.is_complete() {
            return;
        }
        warn!("Control connection closed before logout");
        self.fail(Failure::ConnectionLost);
        self.finish();
    }

    /// Event from a data-channel task, routed to the handler that owns it
    pub fn on_event(&mut self, posted: Posted) {
        let Posted { owner, event } = posted;
        let Some(queued) = self.queue.iter_mut().find(|q| q.id == owner) else {
            debug!(
                "{} handler #{} is gone, dropping {:?}",
                event.test(),
                owner,
                event
            );
            return;
        };

        let mut ctx = TestContext {
            results: &mut self.results,
            env: &queued.env,
            outbound: &self.outbound,
            sink: self.sink.as_mut(),
        };
        queued.handler.on_event(event, &mut ctx);
    }

    pub fn dispatch(&mut self, message: &Message) {
        debug!("Received {:?}", message);

        if message.kind() == Some(MessageType::Logout) && !self.queue.is_empty() {
            warn!(
                "Logout with {} test(s) still queued, dropping them",
                self.queue.len()
            );
            self.queue.clear();
        }

        if !self.queue.is_empty() {
            self.route_to_head(message);
            return;
        }

        let kind = match message.message_type() {
            Ok(kind) => kind,
            Err(e) => {
                warn!("Ignoring message: {}", e);
                return;
            }
        };
        match kind {
            MessageType::CommFailure => warn!("Server reported a communication failure"),
            MessageType::QueueStatus => match message.parse_number::<u32>() {
                Ok(code) => self.on_queue_status(code),
                Err(e) => warn!("Queue status: {}", e),
            },
            MessageType::Login => self.on_login(message),
            MessageType::Logout => {
                info!("Server logged out");
                self.finish();
            }
            MessageType::Error | MessageType::Waiting | MessageType::ExtendedLogin => {
                info!("Server sent {:?}: '{}'", kind, message.payload_str());
            }
            _ => self.on_scalar(message),
        }
    }

    fn route_to_head(&mut self, message: &Message) {
        let compatible = self.session.version_compatible;
        let Some(Queued { env, handler: head, .. }) = self.queue.front_mut() else {
            return;
        };

        if !compatible
            && matches!(
                message.kind(),
                Some(MessageType::TestPrepare | MessageType::TestStart)
            )
        {
            debug!("Incompatible server, not running {} test", head.kind());
            return;
        }

        let mut ctx = TestContext {
            results: &mut self.results,
            env,
            outbound: &self.outbound,
            sink: self.sink.as_mut(),
        };
        if head.handle(message, &mut ctx) {
            if let Some(done) = self.queue.pop_front() {
                info!("{} test finished", done.handler.kind());
            }
            if self.queue.is_empty() {
                self.transition(ControlState::Draining);
            }
        }
    }

    fn on_login(&mut self, message: &Message) {
        let payload = message.payload_str();
        self.session.waiting_for_reply = false;
        self.session.queued = false;

        if is_version_string(&payload) {
            let server = payload.trim().to_string();
            let check = check_server_version(&server);
            info!("Server version {} ({:?})", server, check);
            self.sink.status(&StatusUpdate::ServerVersion(server.clone()));

            self.session.version_compatible = check.is_compatible();
            if !check.is_compatible() {
                self.fail(Failure::IncompatibleVersion {
                    server: server.clone(),
                });
            }
            self.results.server_version = Some(server);
            return;
        }

        for token in payload.split_whitespace() {
            let Some(kind) = token.parse::<u8>().ok().and_then(TestKind::from_code) else {
                warn!("Unknown test code '{}'", token);
                continue;
            };
            self.session.negotiated_tests.push(kind);
            match handler_for(kind) {
                Some(handler) => {
                    let id = self.next_handler_id;
                    self.next_handler_id += 1;
                    self.queue.push_back(Queued {
                        id,
                        env: self.env.for_handler(id),
                        handler,
                    });
                }
                None => debug!("No handler for {} test, skipping", kind),
            }
        }

        info!("Server will run {:?}", self.session.negotiated_tests);
        if self.queue.is_empty() {
            self.transition(ControlState::Draining);
        } else {
            self.transition(ControlState::Dispatching);
        }
    }

    fn on_queue_status(&mut self, code: u32) {
        let status = QueueStatus::from_code(code);
        debug!("Queue status {} ({:?})", code, status);

        match status {
            QueueStatus::StartNow => {
                info!("Server is ready");
                self.session.queued = false;
                self.session.waiting_for_reply = false;
                self.session.time_till_start_minutes = None;
            }
            QueueStatus::Heartbeat => {
                self.session.queued = true;
                self.outbound.send(Message::waiting());
            }
            QueueStatus::ServerFault => {
                self.session.waiting_for_reply = false;
                self.fail(Failure::ServerFault);
            }
            QueueStatus::ServerBusy | QueueStatus::ServerBusyExtended => {
                self.session.waiting_for_reply = false;
                self.fail(Failure::ServerBusy);
            }
            QueueStatus::Wait(minutes) => {
                self.session.queued = true;
                self.session.time_till_start_minutes = Some(minutes);
                self.sink.status(&StatusUpdate::Queued {
                    minutes: Some(minutes),
                });
            }
        }
    }

    /// TestData or Results outside an active test
    fn on_scalar(&mut self, message: &Message) {
        if self.state == ControlState::Negotiating && self.session.waiting_for_reply {
            if let Ok(code) = message.parse_number::<u32>() {
                self.on_queue_status(code);
                return;
            }
        }
        let stored = self.results.merge_variables(&message.payload_str());
        debug!("Stored {} server variables", stored);
    }

    fn fail(&mut self, failure: Failure) {
        warn!("{}", failure);
        self.sink.status(&StatusUpdate::Failed(failure.clone()));
        self.results.record_failure(failure);
    }

    /// Publish once, then reset for the next run
    fn finish(&mut self) {
        self.queue.clear();
        self.session.complete = true;
        self.transition(ControlState::Complete);

        self.sink.publish(&self.results);
        self.outcome = Some(Outcome {
            results: self.results.clone(),
        });

        self.session.reset();
        self.results.reset();
        self.framer.reset();
    }
}

/// Run one measurement session against `settings.host`
pub async fn run_session(
    settings: &Settings,
    transport: Arc<dyn Transport>,
    metadata: Arc<dyn MetadataSource>,
    sink: Box<dyn ResultsSink>,
) -> Result<Outcome> {
    info!(
        "Connecting to {}:{}",
        settings.host, settings.control_port
    );
    let stream = transport
        .connect(&settings.host, settings.control_port, ConnectOptions::control())
        .await
        .context("Failed to open control connection")?;
    let (mut reader, writer) = tokio::io::split(stream);
    let (outbound, writer_task) = writer::spawn(writer);

    let (env, mut events) = TestEnv::new(
        transport,
        settings.host.clone(),
        settings.timing.clone(),
        metadata,
    );
    let mut machine = ControlMachine::new(
        env,
        outbound,
        settings.requested,
        settings.max_message_size,
        sink,
    );
    machine.on_connected();

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    while !machine.is_complete() {
        tokio::select! {
            read = reader.read(&mut buf) => match read {
                Ok(0) => machine.on_disconnect(),
                Ok(n) => machine.on_bytes(&buf[..n]),
                Err(e) => {
                    warn!("Control connection read failed: {}", e);
                    machine.on_disconnect();
                }
            },
            Some(posted) = events.recv() => machine.on_event(posted),
        }
    }

    writer_task.abort();
    Ok(machine.into_outcome())
}

#[cfg(test)]
impl ControlMachine {
    pub fn state(&self) -> ControlState {
        self.state
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn results(&self) -> &MeasurementResults {
        &self.results
    }

    /// Kinds of the queued handlers, head first
    pub fn queued_tests(&self) -> Vec<TestKind> {
        self.queue.iter().map(|q| q.handler.kind()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::RecordingSink;
    use crate::testing::{DataEvent, test_descriptors};
    use crate::transport::memory::{Accepted, MemoryTransport};
    use ndt_protocol::MAX_PAYLOAD_SIZE;
    use rstest::rstest;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    fn msg(kind: MessageType, payload: &'static str) -> Message {
        Message::new(kind, payload.as_bytes())
    }

    struct Rig {
        machine: ControlMachine,
        sent: mpsc::UnboundedReceiver<Message>,
        sink: RecordingSink,
    }

    impl Rig {
        fn new() -> Self {
            let (transport, _accepted) = MemoryTransport::new(8192);
            let (env, _events) = TestEnv::new(
                transport,
                "ndt.test".to_string(),
                Timing::default(),
                Arc::new(test_descriptors()),
            );
            let (outbound, sent) = Outbound::channel();
            let sink = RecordingSink::default();
            let requested = TestSuite::from_bits(0).with(TestKind::Status);
            let machine = ControlMachine::new(
                env,
                outbound,
                requested,
                MAX_PAYLOAD_SIZE,
                Box::new(sink.clone()),
            );
            Self {
                machine,
                sent,
                sink,
            }
        }

        fn sent(&mut self) -> Vec<Message> {
            std::iter::from_fn(|| self.sent.try_recv().ok()).collect()
        }

        fn published(&self) -> Vec<MeasurementResults> {
            self.sink.published.lock().unwrap().clone()
        }
    }

    #[test]
    fn test_login_sends_requested_mask() {
        let mut rig = Rig::new();
        rig.machine.on_connected();

        let sent = rig.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].kind(), Some(MessageType::Login));
        assert_eq!(sent[0].payload(), &[TestKind::Status.bit()]);
        assert_eq!(rig.machine.state(), ControlState::Negotiating);
        assert!(rig.machine.session().waiting_for_reply);
    }

    #[test]
    fn test_queue_follows_server_order() {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, "4 2 32"));

        assert_eq!(
            rig.machine.queued_tests(),
            vec![TestKind::Download, TestKind::Upload, TestKind::Metadata]
        );
        assert_eq!(rig.machine.state(), ControlState::Dispatching);
    }

    #[test]
    fn test_unknown_and_unhandled_codes_are_skipped() {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, "1 8 99 abc 2"));

        assert_eq!(rig.machine.queued_tests(), vec![TestKind::Upload]);
        assert_eq!(
            rig.machine.session().negotiated_tests,
            vec![TestKind::Middlebox, TestKind::Firewall, TestKind::Upload]
        );
    }

    #[test]
    fn test_empty_test_list_goes_straight_to_draining() {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, ""));
        assert_eq!(rig.machine.state(), ControlState::Draining);
    }

    #[rstest]
    #[case("v3.6.5.2", true)]
    #[case("v3.7.0.2", true)]
    #[case("v3.3.12", true)]
    #[case("v3.3.1", false)]
    #[case("v3.0.9", false)]
    fn test_version_compatibility(#[case] server: &'static str, #[case] compatible: bool) {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, server));

        assert_eq!(rig.machine.session().version_compatible, compatible);
        assert_eq!(rig.machine.results().server_version.as_deref(), Some(server));
        assert_eq!(rig.machine.results().failure.is_some(), !compatible);
    }

    #[test]
    fn test_one_pop_per_finished_test() {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, "v3.6.5.2"));
        rig.machine.dispatch(&msg(MessageType::Login, "32 32"));
        assert_eq!(rig.machine.queued_tests().len(), 2);

        rig.machine.dispatch(&Message::empty(MessageType::TestPrepare));
        assert_eq!(rig.machine.queued_tests().len(), 2);

        rig.machine.dispatch(&Message::empty(MessageType::TestFinalize));
        assert_eq!(rig.machine.queued_tests(), vec![TestKind::Metadata]);
        assert_eq!(rig.machine.state(), ControlState::Dispatching);

        rig.machine.dispatch(&Message::empty(MessageType::TestFinalize));
        assert!(rig.machine.queued_tests().is_empty());
        assert_eq!(rig.machine.state(), ControlState::Draining);
    }

    #[test]
    fn test_metadata_through_dispatch() {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, "v3.6.5.2"));
        rig.machine.dispatch(&msg(MessageType::Login, "32"));
        rig.machine.dispatch(&Message::empty(MessageType::TestPrepare));
        rig.machine.dispatch(&Message::empty(MessageType::TestStart));

        let sent = rig.sent();
        assert_eq!(sent.len(), 5);
        assert_eq!(sent[0].payload_str(), "client.os.name:testos");
        assert_eq!(sent[4].payload(), b"");
    }

    #[test]
    fn test_incompatible_server_runs_no_tests() {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, "v3.0.0"));
        rig.machine.dispatch(&msg(MessageType::Login, "32"));
        rig.machine.dispatch(&Message::empty(MessageType::TestPrepare));
        rig.machine.dispatch(&Message::empty(MessageType::TestStart));
        assert!(rig.sent().is_empty());

        rig.machine.dispatch(&Message::empty(MessageType::TestFinalize));
        assert!(rig.machine.queued_tests().is_empty());

        rig.machine.dispatch(&Message::empty(MessageType::Logout));
        assert!(rig.machine.is_complete());
        assert!(matches!(
            rig.published()[0].failure,
            Some(Failure::IncompatibleVersion { .. })
        ));
    }

    #[rstest]
    #[case(0, None, false, None, false)]
    #[case(9977, Some(Failure::ServerFault), false, None, false)]
    #[case(9988, Some(Failure::ServerBusy), false, None, false)]
    #[case(9999, Some(Failure::ServerBusy), false, None, false)]
    #[case(9990, None, true, None, true)]
    #[case(3, None, true, Some(3), false)]
    fn test_queue_status(
        #[case] code: u32,
        #[case] failure: Option<Failure>,
        #[case] queued: bool,
        #[case] minutes: Option<u32>,
        #[case] replies_waiting: bool,
    ) {
        let mut rig = Rig::new();
        rig.machine.on_connected();
        rig.sent();

        let payload = code.to_string();
        rig.machine
            .dispatch(&Message::new(MessageType::QueueStatus, payload.into_bytes()));

        assert_eq!(rig.machine.results().failure, failure);
        assert_eq!(rig.machine.session().queued, queued);
        let sent = rig.sent();
        assert_eq!(
            sent.iter().any(|m| m.kind() == Some(MessageType::Waiting)),
            replies_waiting
        );
        assert_eq!(rig.machine.session().time_till_start_minutes, minutes);
        assert!(!rig.machine.is_complete());
    }

    #[test]
    fn test_heartbeat_keeps_a_queued_client_queued() {
        let mut rig = Rig::new();
        rig.machine.on_connected();
        rig.machine
            .dispatch(&Message::new(MessageType::QueueStatus, &b"2"[..]));
        rig.machine
            .dispatch(&Message::new(MessageType::QueueStatus, &b"9990"[..]));
        assert!(rig.machine.session().queued);
        assert_eq!(rig.machine.session().time_till_start_minutes, Some(2));

        rig.machine
            .dispatch(&Message::new(MessageType::QueueStatus, &b"0"[..]));
        assert!(!rig.machine.session().queued);
    }

    #[test]
    fn test_late_event_does_not_reach_the_next_handler_of_its_kind() {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, "v3.6.5.2"));
        rig.machine.dispatch(&msg(MessageType::Login, "2 2"));
        let first = rig.machine.queue[0].id;
        let second = rig.machine.queue[1].id;
        assert_ne!(first, second);

        rig.machine.dispatch(&Message::empty(MessageType::TestFinalize));
        assert_eq!(rig.machine.queued_tests(), vec![TestKind::Upload]);

        rig.machine.on_event(Posted {
            owner: first,
            event: DataEvent::Failed {
                test: TestKind::Upload,
                reason: "connection reset".to_string(),
            },
        });
        assert_eq!(rig.machine.results().failure, None);

        rig.machine.on_event(Posted {
            owner: second,
            event: DataEvent::Failed {
                test: TestKind::Upload,
                reason: "connection reset".to_string(),
            },
        });
        assert!(matches!(
            rig.machine.results().failure,
            Some(Failure::Transport {
                test: TestKind::Upload,
                ..
            })
        ));
    }

    #[test]
    fn test_scalar_test_data_is_queue_status_while_waiting() {
        let mut rig = Rig::new();
        rig.machine.on_connected();
        rig.machine.dispatch(&msg(MessageType::TestData, "9988"));
        assert_eq!(rig.machine.results().failure, Some(Failure::ServerBusy));
    }

    #[test]
    fn test_results_outside_a_test_are_merged() {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, "v3.6.5.2"));
        rig.machine.dispatch(&msg(MessageType::Results, "CurMSS: 1448\nSACKEnabled: 1"));
        assert_eq!(rig.machine.results().variables.len(), 2);
    }

    #[test]
    fn test_logout_drains_queue_and_publishes_once() {
        let mut rig = Rig::new();
        rig.machine.dispatch(&msg(MessageType::Login, "v3.6.5.2"));
        rig.machine.dispatch(&msg(MessageType::Login, "32 32"));
        rig.machine.dispatch(&Message::empty(MessageType::Logout));

        assert!(rig.machine.is_complete());
        assert!(rig.machine.queued_tests().is_empty());
        assert_eq!(rig.published().len(), 1);
        assert_eq!(
            rig.published()[0].server_version.as_deref(),
            Some("v3.6.5.2")
        );

        assert!(rig.machine.results().server_version.is_none());
        assert!(!rig.machine.session().version_compatible);

        rig.machine.on_disconnect();
        assert_eq!(rig.published().len(), 1);
    }

    #[test]
    fn test_disconnect_publishes_connection_lost() {
        let mut rig = Rig::new();
        rig.machine.on_connected();
        rig.machine.on_disconnect();

        assert!(rig.machine.is_complete());
        assert_eq!(rig.published().len(), 1);
        assert_eq!(rig.published()[0].failure, Some(Failure::ConnectionLost));
        assert_eq!(
            rig.machine.into_outcome().failure(),
            Some(&Failure::ConnectionLost)
        );
    }

    #[test]
    fn test_framing_error_ends_the_session() {
        let (transport, _accepted) = MemoryTransport::new(8192);
        let (env, _events) = TestEnv::new(
            transport,
            "ndt.test".to_string(),
            Timing::default(),
            Arc::new(test_descriptors()),
        );
        let (outbound, _sent) = Outbound::channel();
        let sink = RecordingSink::default();
        let mut machine =
            ControlMachine::new(env, outbound, TestSuite::empty(), 16, Box::new(sink.clone()));

        machine.on_bytes(&[0x05, 0x00, 0x20]);
        assert!(machine.is_complete());
        assert!(matches!(
            sink.published.lock().unwrap()[0].failure,
            Some(Failure::Framing { .. })
        ));
    }

    #[test]
    fn test_frames_split_across_reads() {
        let mut rig = Rig::new();
        let frame = msg(MessageType::Login, "v3.6.5.2").encode().unwrap();
        let mut stream = b"123456 654321".to_vec();
        stream.extend_from_slice(&frame);

        for chunk in stream.chunks(4) {
            rig.machine.on_bytes(chunk);
        }
        assert_eq!(
            rig.machine.results().server_version.as_deref(),
            Some("v3.6.5.2")
        );
    }

    /// Plays the server end of the control connection
    struct FakeServer {
        stream: DuplexStream,
        framer: Framer,
        pending: VecDeque<Message>,
    }

    impl FakeServer {
        fn new(accepted: Accepted) -> Self {
            assert_eq!(accepted.port, 3001);
            assert!(accepted.options.nodelay);
            Self {
                stream: accepted.stream,
                framer: Framer::new(),
                pending: VecDeque::new(),
            }
        }

        async fn send(&mut self, kind: MessageType, payload: &'static str) {
            let frame = msg(kind, payload).encode().unwrap();
            self.stream.write_all(&frame).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            let mut buf = [0u8; 1024];
            loop {
                if let Some(message) = self.pending.pop_front() {
                    return message;
                }
                let n = self.stream.read(&mut buf).await.unwrap();
                assert!(n > 0, "client closed the control connection");
                let pending = &mut self.pending;
                self.framer
                    .feed(&buf[..n], |m| pending.push_back(m))
                    .unwrap();
            }
        }
    }

    fn settings(requested: TestSuite) -> Settings {
        Settings {
            host: "ndt.test".to_string(),
            control_port: 3001,
            requested,
            timing: Timing::default(),
            max_message_size: MAX_PAYLOAD_SIZE,
        }
    }

    fn spawn_session(
        transport: Arc<MemoryTransport>,
        requested: TestSuite,
        sink: RecordingSink,
    ) -> tokio::task::JoinHandle<Result<Outcome>> {
        tokio::spawn(async move {
            run_session(
                &settings(requested),
                transport,
                Arc::new(test_descriptors()),
                Box::new(sink),
            )
            .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_download_session_end_to_end() {
        let (transport, mut accepted) = MemoryTransport::new(64 * 1024);
        let sink = RecordingSink::default();
        let requested = TestSuite::empty()
            .with(TestKind::Download)
            .with(TestKind::Status);
        let session = spawn_session(transport, requested, sink.clone());

        let mut server = FakeServer::new(accepted.recv().await.unwrap());
        let login = server.recv().await;
        assert_eq!(login.kind(), Some(MessageType::Login));
        assert_eq!(login.payload(), &[20]);

        server.send(MessageType::QueueStatus, "0").await;
        server.send(MessageType::Login, "v3.6.5.2").await;
        server.send(MessageType::Login, "4").await;
        server.send(MessageType::TestPrepare, "3003").await;

        let mut data = accepted.recv().await.unwrap();
        assert_eq!(data.port, 3003);
        assert_eq!(data.options.recv_buffer, Some(10_000_000));

        server.send(MessageType::TestStart, "").await;
        data.stream.write_all(&vec![0u8; 2_000_000]).await.unwrap();

        let reported = server.recv().await;
        assert_eq!(reported.kind(), Some(MessageType::TestData));
        let reported: f64 = reported.parse_number().unwrap();
        assert!((reported - 1454.55).abs() < 0.01, "reported {}", reported);

        server.send(MessageType::TestData, "1390.2").await;
        server.send(MessageType::TestFinalize, "").await;
        server.send(MessageType::Logout, "").await;

        let outcome = session.await.unwrap().unwrap();
        assert!(outcome.failure().is_none());

        let published = sink.published.lock().unwrap().clone();
        assert_eq!(published.len(), 1);
        let results = &published[0];
        assert_eq!(results.server_version.as_deref(), Some("v3.6.5.2"));
        assert_eq!(results.download_bytes_received, Some(2_000_000));
        assert!((results.client_download_kbps.unwrap() - 1454.55).abs() < 0.01);
        assert_eq!(results.server_download_kbps, Some(1390.2));
        assert!(results.download_start.is_some() && results.download_end.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_session_end_to_end() {
        let (transport, mut accepted) = MemoryTransport::new(8192);
        let sink = RecordingSink::default();
        let requested = TestSuite::empty()
            .with(TestKind::Upload)
            .with(TestKind::Status);
        let session = spawn_session(transport, requested, sink.clone());

        let mut server = FakeServer::new(accepted.recv().await.unwrap());
        server.recv().await;
        server.send(MessageType::Login, "v3.7.0.2").await;
        server.send(MessageType::Login, "2").await;
        server.send(MessageType::TestPrepare, "3002").await;

        let mut data = accepted.recv().await.unwrap();
        assert_eq!(data.port, 3002);
        server.send(MessageType::TestStart, "").await;

        let mut received = vec![0u8; 1_015_808];
        data.stream.read_exact(&mut received).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        server.send(MessageType::TestData, "800.5").await;
        server.send(MessageType::TestFinalize, "").await;
        server.send(MessageType::Logout, "").await;

        let outcome = session.await.unwrap().unwrap();
        let results = &outcome.results;
        assert!(results.failure.is_none());
        assert_eq!(results.upload_bytes_sent, Some(1_024_000));
        assert!((results.client_upload_kbps.unwrap() - 819.2).abs() < 0.01);
        assert_eq!(results.server_upload_kbps, Some(800.5));
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_server_then_close() {
        let (transport, mut accepted) = MemoryTransport::new(8192);
        let sink = RecordingSink::default();
        let session = spawn_session(transport, TestSuite::empty(), sink.clone());

        let mut server = FakeServer::new(accepted.recv().await.unwrap());
        server.recv().await;
        server.send(MessageType::QueueStatus, "9988").await;
        drop(server);

        let outcome = session.await.unwrap().unwrap();
        assert_eq!(outcome.failure(), Some(&Failure::ServerBusy));
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refused_control_connection_is_an_error() {
        let (transport, _accepted) = MemoryTransport::refusing(8192, vec![3001]);
        let result = spawn_session(transport, TestSuite::empty(), RecordingSink::default())
            .await
            .unwrap();
        assert!(result.is_err());
    }
}
