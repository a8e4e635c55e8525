//! In-memory transport for tests: every connect hands the server half of a
//! duplex pipe to the test, which plays the NDT server.

use super::{BoxedStream, ConnectOptions, Transport};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

pub struct Accepted {
    pub host: String,
    pub port: u16,
    pub options: ConnectOptions,
    pub stream: DuplexStream,
}

pub struct MemoryTransport {
    accepted: mpsc::UnboundedSender<Accepted>,
    pipe_size: usize,
    refused_ports: Vec<u16>,
}

impl MemoryTransport {
    pub fn new(pipe_size: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<Accepted>) {
        Self::refusing(pipe_size, Vec::new())
    }

    /// Connections to `refused_ports` fail like a closed port would
    pub fn refusing(
        pipe_size: usize,
        refused_ports: Vec<u16>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Accepted>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Self {
            accepted: tx,
            pipe_size,
            refused_ports,
        };
        (Arc::new(transport), rx)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, host: &str, port: u16, options: ConnectOptions) -> Result<BoxedStream> {
        if self.refused_ports.contains(&port) {
            anyhow::bail!("Connection refused: {}:{}", host, port);
        }

        let (client, server) = tokio::io::duplex(self.pipe_size);
        self.accepted
            .send(Accepted {
                host: host.to_string(),
                port,
                options,
                stream: server,
            })
            .map_err(|_| anyhow::anyhow!("Test server is gone"))?;
        Ok(Box::new(client))
    }
}
