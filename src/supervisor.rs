//! Upstream liveness supervision.

use std::sync::Arc;
use std::time::Duration;

use bson::{Document, doc};
use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{Instant, timeout};

use crate::error::Result;
use crate::logger::EventLog;
use crate::protocol::{self, Message, MessageHeader, OpCode, QueryMsg};
use crate::proxy::{DEFAULT_MAX_MESSAGE, Recv, recv_message};
use crate::sandbox::MongoSandbox;

pub const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Probe liveness with a server-info exchange: connect, send an `ismaster`
/// OP_QUERY against `admin.$cmd`, read one reply. Anything that fails or
/// stalls past `limit` counts as down.
pub async fn probe(addr: &str, limit: Duration) -> bool {
    matches!(timeout(limit, probe_exchange(addr)).await, Ok(Ok(true)))
}

async fn probe_exchange(addr: &str) -> Result<bool> {
    let mut stream = TcpStream::connect(addr).await?;
    let request = Message::Query(QueryMsg {
        header: MessageHeader {
            message_length: 0,
            request_id: 1,
            response_to: 0,
            op_code: OpCode::Query as i32,
        },
        flags: 0,
        full_collection_name: "admin.$cmd".into(),
        number_to_skip: 0,
        number_to_return: 1,
        query: doc! {"ismaster": 1},
        return_fields_selector: Document::new(),
    });
    stream.write_all(&protocol::encode(&request)).await?;
    match recv_message(&mut stream, DEFAULT_MAX_MESSAGE).await? {
        Recv::Frame(frame) => Ok(protocol::decode(&frame).is_ok()),
        _ => Ok(false),
    }
}

/// Periodic health check against the upstream; restart it when a probe
/// fails. Never touches active client connections: they fail on their next
/// socket operation and get reported as upstream resets.
pub async fn run(
    sandbox: Arc<MongoSandbox>,
    log: Arc<EventLog>,
    check_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    loop {
        let started = Instant::now();
        if !probe(sandbox.addr(), PROBE_TIMEOUT).await {
            tracing::warn!(addr = sandbox.addr(), "upstream unresponsive");
            log.log("mongo", "down", json!({"address": sandbox.addr()}))?;
            sandbox.restart().await?;
            log.log("mongo", "restarted", json!({"address": sandbox.addr()}))?;
            tracing::info!(addr = sandbox.addr(), "upstream restarted");
        }
        // Keep the cadence steady regardless of how long the probe took.
        let wait = check_interval.saturating_sub(started.elapsed());
        tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
