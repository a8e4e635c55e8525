//! Client-to-server throughput test

use super::{DataEvent, TestContext, TestEnv, TestHandler, Throughput, parse_port, server_rate};
use crate::output::StatusUpdate;
use crate::session::Failure;
use crate::transport::ConnectOptions;
use ndt_protocol::{Message, TestKind};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct UploadTest {
    throughput: Throughput,
    task: Option<JoinHandle<()>>,
}

impl UploadTest {
    pub fn new() -> Self {
        Self::default()
    }

    fn stop_sending(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for UploadTest {
    fn drop(&mut self) {
        self.stop_sending();
    }
}

impl TestHandler for UploadTest {
    fn kind(&self) -> TestKind {
        TestKind::Upload
    }

    fn prepare(&mut self, message: &Message, ctx: &mut TestContext<'_>) {
        let Some(port) = parse_port(message) else {
            ctx.fail(Failure::Transport {
                test: TestKind::Upload,
                reason: format!("invalid data port '{}'", message.payload_str()),
            });
            return;
        };

        info!("Upload test: opening data connection on port {}", port);
        let env = ctx.env.clone();
        let counter = self.throughput.counter();
        self.task = Some(tokio::spawn(run_upload(env, port, counter)));
    }

    fn start(&mut self, _ctx: &mut TestContext<'_>) {
        if self.task.is_some() {
            debug!("Upload test: server started the test, pacing loop already running");
        } else {
            warn!("Upload test: TEST_START without a data connection");
        }
    }

    fn data(&mut self, message: &Message, ctx: &mut TestContext<'_>) {
        match server_rate(message) {
            Some(kbps) => {
                info!("Upload test: server measured {:.2} kbps", kbps);
                ctx.results.set_server_upload_kbps(kbps);
            }
            None => {
                ctx.results.merge_variables(&message.payload_str());
            }
        }
    }

    fn finalize(&mut self, ctx: &mut TestContext<'_>) {
        self.stop_sending();
        if !self.throughput.is_started() {
            debug!("Upload test: finalized without a data connection");
            return;
        }

        let rate = self.throughput.finish(Instant::now());
        ctx.results.upload_bytes_sent = Some(self.throughput.bytes());
        ctx.results.upload_end = self.throughput.ended_at;

        match rate {
            Some(kbps) => {
                info!(
                    "Upload test: {} bytes in {:?}, {:.2} kbps",
                    self.throughput.bytes(),
                    self.throughput.elapsed().unwrap_or_default(),
                    kbps
                );
                ctx.results.set_client_upload_kbps(kbps);
            }
            None => warn!("Upload test: no time elapsed, rate not computed"),
        }
        ctx.sink.status(&StatusUpdate::TestFinished {
            test: TestKind::Upload,
            kbps: rate,
        });
    }

    fn on_event(&mut self, event: DataEvent, ctx: &mut TestContext<'_>) {
        match event {
            DataEvent::Opened { at, .. } => {
                self.throughput.start(at);
                ctx.results.upload_start = self.throughput.started_at;
                ctx.sink.status(&StatusUpdate::TestStarted(TestKind::Upload));
            }
            DataEvent::Closed { .. } => debug!("Upload test: data connection closed"),
            DataEvent::Failed { test, reason } => ctx.fail(Failure::Transport { test, reason }),
            DataEvent::TimerExpired { .. } => {}
        }
    }
}

fn test_buffer(size: usize) -> Vec<u8> {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(size)
        .collect()
}

/// Push the test buffer until the deadline, then hold the connection open
/// until the server closes it or the handler aborts the task.
async fn run_upload(env: TestEnv, port: u16, sent: Arc<AtomicU64>) {
    let test = TestKind::Upload;
    let mut stream = match env
        .transport
        .connect(&env.host, port, ConnectOptions::upload())
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            env.notify(DataEvent::Failed {
                test,
                reason: format!("{:#}", e),
            });
            return;
        }
    };

    let opened = Instant::now();
    env.notify(DataEvent::Opened { test, at: opened });

    let buffer = test_buffer(env.timing.upload_buffer_size);
    let deadline = opened + env.timing.upload_duration;
    while Instant::now() < deadline {
        match timeout_at(deadline, stream.write(&buffer)).await {
            Err(_) => break,
            Ok(Ok(0)) => {
                env.notify(DataEvent::Closed { test });
                return;
            }
            Ok(Ok(n)) => {
                sent.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(Err(e)) => {
                debug!("Upload write ended: {}", e);
                env.notify(DataEvent::Closed { test });
                return;
            }
        }
        tokio::task::yield_now().await;
    }
    debug!(
        "Upload pacing loop done after {} bytes",
        sent.load(Ordering::Relaxed)
    );

    let mut scratch = [0u8; 1024];
    loop {
        match stream.read(&mut scratch).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    env.notify(DataEvent::Closed { test });
}
