//! Framed wire receiver and the per-connection duplex relay.
//!
//! The relay never re-encodes traffic: every frame is forwarded as the exact
//! bytes it arrived in, so the upstream sees what the client sent and vice
//! versa even when decoding fails.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use serde_json::json;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::watch;

use crate::analyzer::{self, Direction};
use crate::error::{Error, Result};
use crate::logger::EventLog;
use crate::protocol::{self, DecodeError, MessageHeader};

/// Upstream's documented cap on a single wire message.
pub const DEFAULT_MAX_MESSAGE: usize = 48 * 1024 * 1024;

/// Shared state every connection worker needs.
pub struct ProxyContext {
    pub log: Arc<EventLog>,
    pub verbose: bool,
    pub max_message: usize,
}

/// Outcome of reading one frame off a socket.
#[derive(Debug)]
pub enum Recv {
    Frame(Bytes),
    Eof,
    Reset,
}

/// Read exactly one wire message: 16 header bytes, then `message_length - 16`
/// more, coalescing partial reads. A zero-byte read anywhere before the frame
/// completes is `Eof`; ECONNRESET is `Reset`. A length prefix outside
/// `[16, max_message]` fails with `Truncated` since framing cannot continue.
pub async fn recv_message<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_message: usize,
) -> Result<Recv> {
    let mut header = [0u8; MessageHeader::LEN];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Recv::Eof),
        Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(Recv::Reset),
        Err(e) => return Err(e.into()),
    }
    let message_length = i32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if message_length < MessageHeader::LEN as i32 || message_length as usize > max_message {
        return Err(Error::Decode(DecodeError::Truncated));
    }

    let mut frame = BytesMut::zeroed(message_length as usize);
    frame[..MessageHeader::LEN].copy_from_slice(&header);
    match stream.read_exact(&mut frame[MessageHeader::LEN..]).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(Recv::Eof),
        Err(e) if e.kind() == ErrorKind::ConnectionReset => return Ok(Recv::Reset),
        Err(e) => return Err(e.into()),
    }
    Ok(Recv::Frame(frame.freeze()))
}

/// How a connection ended. Shutdown is silent; everything else becomes one
/// `connection` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    ClosedByPeer,
    ResetByPeer,
    ClosedByUpstream,
    ResetByUpstream,
    Shutdown,
}

impl Termination {
    pub fn event(self) -> Option<&'static str> {
        match self {
            Termination::ClosedByPeer => Some("closed by peer"),
            Termination::ResetByPeer => Some("reset by peer"),
            Termination::ClosedByUpstream => Some("closed by upstream server"),
            Termination::ResetByUpstream => Some("reset by upstream server"),
            Termination::Shutdown => None,
        }
    }

    fn is_reset(self) -> bool {
        matches!(self, Termination::ResetByPeer | Termination::ResetByUpstream)
    }
}

/// Relay one client connection. Each direction runs in its own pump task;
/// whichever finishes first determines the termination report and the other
/// is torn down with it.
pub async fn run_connection(
    client: TcpStream,
    upstream: TcpStream,
    ctx: Arc<ProxyContext>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let peer = client.peer_addr()?;
    ctx.log.log(
        "connection",
        "established",
        json!({"address": peer.ip().to_string(), "port": peer.port()}),
    )?;
    tracing::info!(%peer, "connection established");

    let (client_rd, client_wr) = client.into_split();
    let (upstream_rd, upstream_wr) = upstream.into_split();

    let mut request_pump = tokio::spawn(pump(
        client_rd,
        upstream_wr,
        Direction::Request,
        peer,
        ctx.clone(),
        shutdown.clone(),
    ));
    let mut response_pump = tokio::spawn(pump(
        upstream_rd,
        client_wr,
        Direction::Response,
        peer,
        ctx.clone(),
        shutdown,
    ));

    let first = tokio::select! {
        r = &mut request_pump => { response_pump.abort(); r }
        r = &mut response_pump => { request_pump.abort(); r }
    };
    let termination = first
        .map_err(|e| Error::Msg(format!("connection worker panicked: {e}")))??;

    if let Some(event) = termination.event() {
        if termination.is_reset() {
            tracing::warn!(%peer, event, "connection terminated");
        } else {
            tracing::info!(%peer, event, "connection closed");
        }
        ctx.log.log(
            "connection",
            event,
            json!({"address": peer.ip().to_string(), "port": peer.port()}),
        )?;
    }
    Ok(())
}

/// Pump one direction: receive a frame, decode and analyze it, forward the
/// original bytes. Checks the shutdown flag between frames.
async fn pump(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    direction: Direction,
    peer: SocketAddr,
    ctx: Arc<ProxyContext>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Termination> {
    let (source_eof, source_reset, dest_reset) = match direction {
        Direction::Request => (
            Termination::ClosedByPeer,
            Termination::ResetByPeer,
            Termination::ResetByUpstream,
        ),
        Direction::Response => (
            Termination::ClosedByUpstream,
            Termination::ResetByUpstream,
            Termination::ResetByPeer,
        ),
    };

    loop {
        let recv = tokio::select! {
            _ = shutdown.changed() => return Ok(Termination::Shutdown),
            r = recv_message(&mut rd, ctx.max_message) => match r {
                Ok(recv) => recv,
                Err(Error::Decode(e)) => {
                    tracing::warn!(%peer, direction = direction.as_str(), error = %e,
                        "unframeable message; dropping connection");
                    return Ok(source_reset);
                }
                Err(e) => return Err(e),
            },
        };
        let frame = match recv {
            Recv::Eof => return Ok(source_eof),
            Recv::Reset => return Ok(source_reset),
            Recv::Frame(frame) => frame,
        };

        match protocol::decode(&frame) {
            Ok(msg) => {
                if ctx.verbose {
                    tracing::debug!(%peer, direction = direction.as_str(), message = ?msg,
                        "decoded wire message");
                }
                analyzer::analyze(&ctx.log, direction, peer, &msg)?;
            }
            Err(e) => {
                // Undecodable traffic is still honeypot traffic; keep the
                // bytes flowing and skip analysis.
                tracing::warn!(%peer, direction = direction.as_str(), error = %e,
                    "undecodable message; forwarding raw bytes");
            }
        }

        if wr.write_all(&frame).await.is_err() {
            return Ok(dest_reset);
        }
    }
}
