//! Connection capability used by the control channel and the test data channels

#[cfg(test)]
pub mod memory;

use anyhow::{Context, Result};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpSocket, TcpStream};
use tracing::debug;

/// Any bidirectional byte stream a transport hands out
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Per-connection socket tuning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Disable Nagle's algorithm (small control frames)
    pub nodelay: bool,
    /// Requested socket receive buffer in bytes
    pub recv_buffer: Option<usize>,
}

impl ConnectOptions {
    pub fn control() -> Self {
        Self {
            nodelay: true,
            recv_buffer: None,
        }
    }

    pub fn upload() -> Self {
        Self {
            nodelay: false,
            recv_buffer: None,
        }
    }

    /// Raw download channel: large receive buffer, bytes are only counted
    pub fn download(recv_buffer: usize) -> Self {
        Self {
            nodelay: false,
            recv_buffer: Some(recv_buffer),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self, host: &str, port: u16, options: ConnectOptions) -> Result<BoxedStream>;
}

/// Plain TCP transport
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, host: &str, port: u16, options: ConnectOptions) -> Result<BoxedStream> {
        let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port))
            .await
            .with_context(|| format!("Failed to resolve {}:{}", host, port))?
            .collect();

        let mut last_error = None;
        for addr in addrs {
            match connect_addr(addr, options).await {
                Ok(stream) => {
                    debug!("Connected to {} ({:?})", addr, options);
                    return Ok(Box::new(stream));
                }
                Err(e) => {
                    debug!("Connect to {} failed: {:#}", addr, e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) => Err(e.context(format!("Failed to connect to {}:{}", host, port))),
            None => anyhow::bail!("No addresses found for {}", host),
        }
    }
}

async fn connect_addr(addr: SocketAddr, options: ConnectOptions) -> Result<TcpStream> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .context("Failed to create TCP socket")?;

    if let Some(size) = options.recv_buffer {
        socket
            .set_recv_buffer_size(size)
            .context("Failed to set socket receive buffer")?;
    }
    socket
        .set_nonblocking(true)
        .context("Failed to set socket non-blocking")?;

    let socket = TcpSocket::from_std_stream(socket.into());
    let stream = socket
        .connect(addr)
        .await
        .with_context(|| format!("Failed to connect to {}", addr))?;
    stream
        .set_nodelay(options.nodelay)
        .context("Failed to set TCP_NODELAY")?;
    Ok(stream)
}
