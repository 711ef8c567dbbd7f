//! Structured event log: one JSON object per line, size-threshold rotation,
//! rotated segments archived as `<log>.NNN.gz`.
//!
//! This is the honeypot's product. Write failures are [`Error::LogWrite`] and
//! treated as fatal by the callers.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use bson::{Bson, Document};
use serde_json::{Map, Value, json};

use crate::error::{Error, Result};
use crate::protocol::Section;

pub const DEFAULT_ROTATION_THRESHOLD: u64 = 100 * 1024 * 1024;

pub struct EventLog {
    path: PathBuf,
    threshold: u64,
    file: Mutex<File>,
}

impl EventLog {
    pub fn open(path: impl Into<PathBuf>, threshold: u64) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(Error::LogWrite)?;
        Ok(Self {
            path,
            threshold,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry. `fields` should be a JSON object; its members land
    /// next to `timestamp`/`type`/`event`. The entry is written and flushed
    /// as a single line while holding the log mutex, so concurrent callers
    /// never interleave. Rotation happens first when the active file has
    /// outgrown the threshold.
    pub fn log(&self, entry_type: &str, event: &str, fields: Value) -> Result<()> {
        let mut entry = Map::new();
        entry.insert("timestamp".into(), json!(utc_timestamp()));
        entry.insert("type".into(), json!(entry_type));
        entry.insert("event".into(), json!(event));
        if let Value::Object(extra) = fields {
            entry.extend(extra);
        }
        let line = serde_json::to_string(&Value::Object(entry))
            .map_err(|e| Error::Msg(format!("log entry serialization failed: {e}")))?;

        let mut file = self.file.lock().unwrap_or_else(|e| e.into_inner());
        if file.metadata().map_err(Error::LogWrite)?.len() > self.threshold {
            self.rotate_locked(&mut file)?;
        }
        file.write_all(line.as_bytes())
            .and_then(|()| file.write_all(b"\n"))
            .and_then(|()| file.flush())
            .map_err(Error::LogWrite)
    }

    /// Archive the active file into the next-numbered gzip segment and
    /// reopen the path truncated. Caller holds the log mutex.
    fn rotate_locked(&self, file: &mut File) -> Result<()> {
        file.flush().map_err(Error::LogWrite)?;
        let n = next_segment_number(&self.path)?;
        let segment = format!("{}.{n:03}.gz", self.path.display());

        let mut src = File::open(&self.path).map_err(Error::LogWrite)?;
        let dst = File::create(&segment).map_err(Error::LogWrite)?;
        let mut gz = flate2::write::GzEncoder::new(dst, flate2::Compression::default());
        io::copy(&mut src, &mut gz).map_err(Error::LogWrite)?;
        gz.finish().map_err(Error::LogWrite)?;

        *file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(Error::LogWrite)?;
        Ok(())
    }
}

/// Next segment number: one past the highest `<log>.NNN.gz` in the log's
/// directory. Numbers freed by deleting segments can be reused.
fn next_segment_number(path: &Path) -> Result<u32> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Msg(format!("bad log path: {}", path.display())))?;
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let mut next = 0u32;
    for entry in fs::read_dir(dir).map_err(Error::LogWrite)? {
        let entry = entry.map_err(Error::LogWrite)?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(num) = name
            .strip_prefix(file_name)
            .and_then(|s| s.strip_prefix('.'))
            .and_then(|s| s.strip_suffix(".gz"))
        else {
            continue;
        };
        if !num.is_empty() && num.bytes().all(|b| b.is_ascii_digit()) {
            if let Ok(v) = num.parse::<u32>() {
                next = next.max(v + 1);
            }
        }
    }
    Ok(next)
}

fn utc_timestamp() -> String {
    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

/// Render a BSON value for the event log. Binary keeps its bytes as hex
/// under a `$bson` marker; types with no stable JSON form become null.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Double(f) => json!(f),
        Bson::String(s) => json!(s),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => document_to_json(doc),
        Bson::Boolean(b) => json!(b),
        Bson::Null => Value::Null,
        Bson::Int32(i) => json!(i),
        Bson::Int64(i) => json!(i),
        Bson::Binary(bin) => json!({"$bson": "binary", "value": hex(&bin.bytes)}),
        _ => Value::Null,
    }
}

pub fn document_to_json(doc: &Document) -> Value {
    Value::Object(
        doc.iter()
            .map(|(k, v)| (k.clone(), bson_to_json(v)))
            .collect(),
    )
}

pub fn section_to_json(section: &Section) -> Value {
    match section {
        Section::Body(doc) => json!({
            "$mongo": "msgmsg_body",
            "body": document_to_json(doc),
        }),
        Section::DocumentSequence {
            size,
            identifier,
            documents,
        } => json!({
            "$mongo": "msgmsg_document_sequence",
            "body": size,
            "document_sequence_identifier": identifier,
            "documents": documents.iter().map(document_to_json).collect::<Vec<_>>(),
        }),
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use bson::spec::BinarySubtype;

    #[test]
    fn binary_renders_as_hex() {
        let bin = Bson::Binary(bson::Binary {
            subtype: BinarySubtype::Generic,
            bytes: vec![0xde, 0xad, 0xbe, 0xef],
        });
        assert_eq!(
            bson_to_json(&bin),
            json!({"$bson": "binary", "value": "deadbeef"})
        );
    }

    #[test]
    fn exotic_scalars_render_as_null() {
        assert_eq!(bson_to_json(&Bson::ObjectId(bson::oid::ObjectId::new())), Value::Null);
    }

    #[test]
    fn body_section_rendering() {
        let section = Section::Body(doc! {"find": "restaurants"});
        assert_eq!(
            section_to_json(&section),
            json!({"$mongo": "msgmsg_body", "body": {"find": "restaurants"}})
        );
    }
}
