// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Framed packet transport over a byte stream.

use super::framing::{FrameReassembler, FramingError, RawFrame};
use super::protocol::{Packet, ProtocolError};
use socket2::{SockRef, TcpKeepalive};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// Bytes requested from the transport per read.
const READ_CHUNK_SIZE: usize = 4096;

/// A byte stream with frame reassembly on the read side.
///
/// Generic over the transport so sessions can be driven over in-memory pipes.
pub struct FramedConnection<S> {
    stream: S,
    peer_addr: SocketAddr,
    reassembler: FrameReassembler,
}

impl<S> FramedConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, peer_addr: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            stream,
            peer_addr,
            reassembler: FrameReassembler::with_max_frame_size(max_frame_size),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Read the next complete frame.
    ///
    /// Returns `Ok(None)` once the peer closes the stream. Cancel-safe: bytes
    /// are only handed to the reassembler after a read completes.
    pub async fn read_frame(&mut self) -> Result<Option<RawFrame>, ConnectionError> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            if let Some(frame) = self.reassembler.next_frame()? {
                return Ok(Some(frame));
            }

            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                if !self.reassembler.is_empty() {
                    debug!(
                        "{} closed with {} bytes of an incomplete frame buffered",
                        self.peer_addr,
                        self.reassembler.buffered()
                    );
                }
                return Ok(None);
            }
            self.reassembler.extend(&chunk[..n]);
        }
    }

    /// Read and decode the next packet; a malformed body is an error.
    pub async fn read_packet(&mut self) -> Result<Option<Packet>, ConnectionError> {
        match self.read_frame().await? {
            Some(frame) => Ok(Some(frame.decode()?)),
            None => Ok(None),
        }
    }

    /// Encode and send one packet.
    pub async fn send_packet(&mut self, packet: &Packet) -> Result<(), ConnectionError> {
        let frame = packet.encode()?;
        self.stream.write_all(&frame).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shutdown the write half.
    pub async fn shutdown(&mut self) -> Result<(), ConnectionError> {
        Ok(self.stream.shutdown().await?)
    }

    /// Direct access to the transport, bypassing framing.
    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

/// Apply keepalive and nodelay settings to an accepted socket.
pub fn configure_socket(
    stream: &TcpStream,
    keepalive: Option<Duration>,
    nodelay: bool,
) -> std::io::Result<()> {
    if nodelay {
        stream.set_nodelay(true)?;
    }
    if let Some(idle) = keepalive {
        let sock = SockRef::from(stream);
        // Idle time and probe interval both follow the configured period.
        let params = TcpKeepalive::new().with_time(idle).with_interval(idle);
        sock.set_tcp_keepalive(&params)?;
    }
    Ok(())
}

/// Connection error types.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] FramingError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("No frame received for {0:?}")]
    IdleTimeout(Duration),
}
