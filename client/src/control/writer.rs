//! Outbound side of the control connection
//!
//! Messages are queued on a channel and written by a dedicated task that is
//! only spawned once the connection is open. Aborting the task drops whatever
//! has not been written yet.

use ndt_protocol::Message;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cloneable handle for queueing control messages
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::UnboundedSender<Message>,
}

impl Outbound {
    /// Handle plus the receiving end, without a writer task
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn send(&self, message: Message) {
        debug!("Queueing {:?}", message);
        if self.tx.send(message).is_err() {
            debug!("Control writer stopped, message dropped");
        }
    }
}

/// Spawn the writer task for an open control connection
pub fn spawn<W>(writer: W) -> (Outbound, JoinHandle<()>)
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (outbound, rx) = Outbound::channel();
    let task = tokio::spawn(write_loop(writer, rx));
    (outbound, task)
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Message>)
where
    W: AsyncWrite + Send + Unpin,
{
    while let Some(message) = rx.recv().await {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping unencodable {:?}: {}", message, e);
                continue;
            }
        };

        if let Err(e) = writer.write_all(&frame).await {
            warn!("Control connection write failed: {}", e);
            return;
        }
        if let Err(e) = writer.flush().await {
            warn!("Control connection flush failed: {}", e);
            return;
        }
    }
}
