//! Framed TCP transport for `ClusterMessage`.
//!
//! Frames are a u32 little-endian byte length followed by the rkyv archive.
//! Inbound bytes are validated with `check_archived_root` before use, so a
//! garbled or malicious frame surfaces as a decode error, never as UB.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::protocol::ClusterNode;
use crate::types::ClusterMessage;

/// Upper bound on a single frame; a length prefix beyond this is treated as
/// a protocol violation rather than an allocation request.
const MAX_FRAME_BYTES: u32 = 4 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed before a response arrived")]
    ConnectionClosed,
    #[error("frame of {0} bytes exceeds the limit")]
    FrameTooLarge(u32),
    #[error("failed to decode message: {0}")]
    Decode(String),
    #[error("failed to encode message: {0}")]
    Encode(String),
}

pub struct NetworkServer {
    node: Arc<ClusterNode>,
    address: SocketAddr,
}

impl NetworkServer {
    pub fn new(node: Arc<ClusterNode>, address: SocketAddr) -> Self {
        Self { node, address }
    }

    /// Accept loop: one task per connection, each serving request frames
    /// until the peer closes its end.
    pub async fn start(&self) -> Result<(), NetworkError> {
        let listener = TcpListener::bind(self.address).await?;
        tracing::info!(address = %self.address, "listening");

        loop {
            let (socket, peer_addr) = listener.accept().await?;

            let node = Arc::clone(&self.node);
            tokio::spawn(async move {
                if let Err(e) = serve_connection(socket, node).await {
                    tracing::debug!(peer = %peer_addr, error = %e, "connection ended");
                }
            });
        }
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    node: Arc<ClusterNode>,
) -> Result<(), NetworkError> {
    loop {
        let message = match read_message(&mut socket).await {
            Ok(message) => message,
            Err(NetworkError::ConnectionClosed) => return Ok(()),
            Err(e) => return Err(e),
        };

        let response = node.handle_message(message).await;
        write_message(&mut socket, &response).await?;
    }
}

/// Client handle for one remote node. Each request opens a fresh
/// connection; requests are independent and the protocol never streams.
pub struct NetworkClient {
    address: SocketAddr,
}

impl NetworkClient {
    pub fn new(address: SocketAddr) -> Self {
        Self { address }
    }

    pub async fn send(&self, message: &ClusterMessage) -> Result<ClusterMessage, NetworkError> {
        send_to(self.address, message).await
    }
}

/// One request/response exchange with `address`.
pub async fn send_to(
    address: SocketAddr,
    message: &ClusterMessage,
) -> Result<ClusterMessage, NetworkError> {
    let mut stream = TcpStream::connect(address).await?;
    write_message(&mut stream, message).await?;
    read_message(&mut stream).await
}

async fn read_message(socket: &mut TcpStream) -> Result<ClusterMessage, NetworkError> {
    let mut len_buf = [0u8; 4];
    read_exact_or_closed(socket, &mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_BYTES {
        return Err(NetworkError::FrameTooLarge(len));
    }

    // rkyv requires the archive aligned; a plain Vec<u8> is not.
    let mut body = rkyv::AlignedVec::with_capacity(len as usize);
    body.resize(len as usize, 0);
    read_exact_or_closed(socket, &mut body[..]).await?;

    rkyv::from_bytes::<ClusterMessage>(&body).map_err(|e| NetworkError::Decode(e.to_string()))
}

async fn write_message(
    socket: &mut TcpStream,
    message: &ClusterMessage,
) -> Result<(), NetworkError> {
    let bytes =
        rkyv::to_bytes::<_, 1024>(message).map_err(|e| NetworkError::Encode(e.to_string()))?;
    socket.write_all(&(bytes.len() as u32).to_le_bytes()).await?;
    socket.write_all(&bytes).await?;
    socket.flush().await?;
    Ok(())
}

async fn read_exact_or_closed(socket: &mut TcpStream, buf: &mut [u8]) -> Result<(), NetworkError> {
    match socket.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            Err(NetworkError::ConnectionClosed)
        }
        Err(e) => Err(e.into()),
    }
}
