//! Signature checks over decoded requests.
//!
//! Best-effort by design: the analyzer reads whatever shape the client sent
//! and stays quiet about anything it does not recognize. It must never take
//! the proxy path down; the only error it surfaces is a fatal log write.

use std::net::SocketAddr;

use bson::{Bson, Document};
use serde_json::{Value, json};

use crate::error::Result;
use crate::logger::{EventLog, bson_to_json, section_to_json};
use crate::protocol::{Message, Section};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Request => "request",
            Direction::Response => "response",
        }
    }
}

/// Inspect one decoded message from `peer`. OP_MSG frames get a structured
/// `msgmsg` entry; body sections of requests additionally run through the
/// suspicion signatures. Other opcodes are forwarded without comment.
pub fn analyze(
    log: &EventLog,
    direction: Direction,
    peer: SocketAddr,
    msg: &Message,
) -> Result<()> {
    let Message::Msg(m) = msg else {
        return Ok(());
    };
    log.log(
        direction.as_str(),
        "msgmsg",
        json!({
            "address": peer.ip().to_string(),
            "port": peer.port(),
            "request_id": m.header.request_id,
            "response_to": m.header.response_to,
            "sections": m.sections.iter().map(section_to_json).collect::<Vec<_>>(),
        }),
    )?;

    if direction == Direction::Request {
        for section in &m.sections {
            if let Section::Body(body) = section {
                inspect_body(log, peer, body)?;
            }
        }
    }
    Ok(())
}

fn inspect_body(log: &EventLog, peer: SocketAddr, body: &Document) -> Result<()> {
    check_operators(log, peer, body)?;
    // A find command carries the interesting part in its filter.
    if body.contains_key("find") {
        if let Ok(filter) = body.get_document("filter") {
            check_operators(log, peer, filter)?;
        }
    }
    Ok(())
}

/// The fixed signature set: a top-level `$where` (arbitrary server-side
/// javascript), otherwise any field constrained by `$regex`.
fn check_operators(log: &EventLog, peer: SocketAddr, doc: &Document) -> Result<()> {
    if let Some(expr) = doc.get("$where") {
        return log.log(
            "suspicious_activity",
            "$where",
            json!({
                "address": peer.ip().to_string(),
                "port": peer.port(),
                "query": expr_to_json(expr),
            }),
        );
    }
    for (key, value) in doc {
        if key.starts_with('$') {
            continue;
        }
        let Bson::Document(condition) = value else {
            continue;
        };
        if let Some(pattern) = condition.get("$regex") {
            log.log(
                "suspicious_activity",
                "$regex",
                json!({
                    "address": peer.ip().to_string(),
                    "port": peer.port(),
                    "field": key,
                    "pattern": expr_to_json(pattern),
                }),
            )?;
        }
    }
    Ok(())
}

/// `$where` and `$regex` payloads arrive as plain strings, code values or
/// regular expressions depending on the driver; log the text either way.
fn expr_to_json(value: &Bson) -> Value {
    match value {
        Bson::String(s) => json!(s),
        Bson::JavaScriptCode(code) => json!(code),
        Bson::RegularExpression(re) => json!(re.pattern.clone()),
        other => bson_to_json(other),
    }
}
