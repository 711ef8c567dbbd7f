#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bson::doc;
use mongotrap::logger::EventLog;
use mongotrap::protocol::{self, Message, MessageHeader, OpCode, ReplyMsg};
use rand::{Rng, distributions::Alphanumeric};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub fn rand_suffix(n: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(n)
        .map(char::from)
        .collect()
}

pub fn temp_dir(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mongotrap_{prefix}_{}", rand_suffix(8)));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

pub fn temp_log(prefix: &str) -> (PathBuf, Arc<EventLog>) {
    let path = temp_dir(prefix).join("events.log");
    let log = Arc::new(EventLog::open(&path, 100 * 1024 * 1024).unwrap());
    (path, log)
}

pub fn read_entries(path: &Path) -> Vec<Value> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect()
}

/// Poll the event log until an entry with the given event shows up.
pub async fn wait_for_event(path: &Path, event: &str) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if read_entries(path)
            .iter()
            .any(|e| e.get("event").and_then(Value::as_str) == Some(event))
        {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

/// Bind a port and immediately free it again, leaving an address nothing
/// listens on.
pub async fn dead_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn server_info_reply(response_to: i32) -> Vec<u8> {
    protocol::encode(&Message::Reply(ReplyMsg {
        header: MessageHeader {
            message_length: 0,
            request_id: 99,
            response_to,
            op_code: OpCode::Reply as i32,
        },
        response_flags: 8,
        cursor_id: 0,
        starting_from: 0,
        number_returned: 1,
        documents: vec![doc! {"ismaster": true, "maxBsonObjectSize": 16777216, "ok": 1.0}],
    }))
}

async fn read_one_frame<S: tokio::io::AsyncRead + Unpin>(stream: &mut S) -> Option<Vec<u8>> {
    let mut header = [0u8; 16];
    stream.read_exact(&mut header).await.ok()?;
    let len = i32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let mut frame = vec![0u8; len];
    frame[..16].copy_from_slice(&header);
    stream.read_exact(&mut frame[16..]).await.ok()?;
    Some(frame)
}

/// A mongod that only knows one trick: every complete frame gets the same
/// canned OP_REPLY back.
pub async fn spawn_fake_mongod() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                while let Some(frame) = read_one_frame(&mut stream).await {
                    let request_id =
                        i32::from_le_bytes([frame[4], frame[5], frame[6], frame[7]]);
                    if stream
                        .write_all(&server_info_reply(request_id))
                        .await
                        .is_err()
                    {
                        return;
                    }
                }
            });
        }
    });
    (addr, handle)
}

/// A mongod that echoes every frame back verbatim; handy for checking that
/// the relay preserves bytes in both directions.
pub async fn spawn_echo_mongod() -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                while let Some(frame) = read_one_frame(&mut stream).await {
                    if stream.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (addr, handle)
}
