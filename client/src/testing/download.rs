//! Server-to-client throughput test
//!
//! The data connection is only counted, never inspected. The client's own
//! timer ends the measurement and the resulting rate is reported back to
//! the server; the queue still advances on TEST_FINALIZE.

use super::{DataEvent, TestContext, TestEnv, TestHandler, Throughput, parse_port, server_rate};
use crate::output::StatusUpdate;
use crate::session::Failure;
use crate::transport::ConnectOptions;
use ndt_protocol::{Message, TestKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 64 * 1024;

#[derive(Debug, Default)]
pub struct DownloadTest {
    throughput: Throughput,
    reader: Option<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl DownloadTest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the data channel and record the client-side rate.
    ///
    /// `report` sends the rate to the server, which only happens when the
    /// client's own timer ended the test.
    fn complete(&mut self, ctx: &mut TestContext<'_>, report: bool) {
        if self.throughput.is_finished() {
            return;
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if !self.throughput.is_started() {
            warn!("Download test: data connection never opened");
            return;
        }

        let rate = self.throughput.finish(Instant::now());
        ctx.results.download_bytes_received = Some(self.throughput.bytes());
        ctx.results.download_end = self.throughput.ended_at;

        match rate {
            Some(kbps) => {
                info!(
                    "Download test: {} bytes in {:?}, {:.2} kbps",
                    self.throughput.bytes(),
                    self.throughput.elapsed().unwrap_or_default(),
                    kbps
                );
                ctx.results.set_client_download_kbps(kbps);
                if report {
                    ctx.outbound.send(Message::test_data(kbps.to_string()));
                }
            }
            None => warn!("Download test: no time elapsed, rate not computed"),
        }
        ctx.sink.status(&StatusUpdate::TestFinished {
            test: TestKind::Download,
            kbps: rate,
        });
    }
}

impl Drop for DownloadTest {
    fn drop(&mut self) {
        for task in [self.reader.take(), self.timer.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

impl TestHandler for DownloadTest {
    fn kind(&self) -> TestKind {
        TestKind::Download
    }

    fn prepare(&mut self, message: &Message, ctx: &mut TestContext<'_>) {
        let Some(port) = parse_port(message) else {
            ctx.fail(Failure::Transport {
                test: TestKind::Download,
                reason: format!("invalid data port '{}'", message.payload_str()),
            });
            return;
        };

        info!("Download test: opening data connection on port {}", port);
        let env = ctx.env.clone();
        let counter = self.throughput.counter();
        self.reader = Some(tokio::spawn(run_download(env, port, counter)));
    }

    fn start(&mut self, ctx: &mut TestContext<'_>) {
        let env = ctx.env.clone();
        let duration = env.timing.download_duration;
        debug!("Download test: measuring for {:?}", duration);
        self.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            env.notify(DataEvent::TimerExpired {
                test: TestKind::Download,
            });
        }));
    }

    fn data(&mut self, message: &Message, ctx: &mut TestContext<'_>) {
        match server_rate(message) {
            Some(kbps) => {
                info!("Download test: server measured {:.2} kbps", kbps);
                ctx.results.set_server_download_kbps(kbps);
            }
            None => {
                let stored = ctx.results.merge_variables(&message.payload_str());
                debug!("Download test: stored {} server variables", stored);
            }
        }
    }

    fn finalize(&mut self, ctx: &mut TestContext<'_>) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if !self.throughput.is_finished() {
            debug!("Download test: finalized before the timer, finishing locally");
            self.complete(ctx, false);
        }
    }

    fn on_event(&mut self, event: DataEvent, ctx: &mut TestContext<'_>) {
        match event {
            DataEvent::Opened { at, .. } => {
                self.throughput.start(at);
                ctx.results.download_start = self.throughput.started_at;
                ctx.sink.status(&StatusUpdate::TestStarted(TestKind::Download));
            }
            DataEvent::TimerExpired { .. } => {
                self.timer = None;
                self.complete(ctx, true);
            }
            DataEvent::Closed { .. } => debug!("Download test: server closed the data connection"),
            DataEvent::Failed { test, reason } => ctx.fail(Failure::Transport { test, reason }),
        }
    }
}

async fn run_download(env: TestEnv, port: u16, received: Arc<AtomicU64>) {
    let test = TestKind::Download;
    let options = ConnectOptions::download(env.timing.download_recv_buffer);
    let mut stream = match env.transport.connect(&env.host, port, options).await {
        Ok(stream) => stream,
        Err(e) => {
            env.notify(DataEvent::Failed {
                test,
                reason: format!("{:#}", e),
            });
            return;
        }
    };
    env.notify(DataEvent::Opened {
        test,
        at: Instant::now(),
    });

    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) => {
                env.notify(DataEvent::Closed { test });
                return;
            }
            Ok(n) => {
                received.fetch_add(n as u64, Ordering::Relaxed);
            }
            Err(e) => {
                env.notify(DataEvent::Failed {
                    test,
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}
