//! MongoDB wire protocol codec.
//!
//! Pure functions over byte buffers; no I/O happens here. `decode` turns one
//! complete wire frame into a typed [`Message`], `encode` is its inverse.
//! OP_COMPRESSED frames decode to their inner message; see [`decode`].

use std::io::Cursor;

use bson::Document;

pub mod compress;

use compress::CompressorId;

// Wire op codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
    Compressed = 2012,
    Msg = 2013,
}

impl OpCode {
    pub fn from_i32(v: i32) -> Result<Self, DecodeError> {
        match v {
            1 => Ok(Self::Reply),
            2001 => Ok(Self::Update),
            2002 => Ok(Self::Insert),
            2004 => Ok(Self::Query),
            2005 => Ok(Self::GetMore),
            2006 => Ok(Self::Delete),
            2007 => Ok(Self::KillCursors),
            2012 => Ok(Self::Compressed),
            2013 => Ok(Self::Msg),
            other => Err(DecodeError::UnknownOpCode(other)),
        }
    }
}

// OP_MSG flag bits.
pub const CHECKSUM_PRESENT: u32 = 1 << 0;
pub const MORE_TO_COME: u32 = 1 << 1;
pub const EXHAUST_ALLOWED: u32 = 1 << 16;

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    #[error("unknown op code {0}")]
    UnknownOpCode(i32),

    #[error("unknown compressor id {0}")]
    UnknownCompressor(u8),

    #[error("unknown section kind {0}")]
    UnknownSectionKind(u8),

    #[error("message truncated")]
    Truncated,

    #[error("OP_COMPRESSED nested inside OP_COMPRESSED")]
    NestedCompression,

    #[error("decompression failed: {0}")]
    DecompressionFailed(String),

    #[error("malformed bson document: {0}")]
    Bson(#[from] bson::de::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub const LEN: usize = 16;

    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < Self::LEN {
            return Err(DecodeError::Truncated);
        }
        // Little-endian 32-bit fields
        Ok(Self {
            message_length: i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            request_id: i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
            response_to: i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            op_code: i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        })
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.message_length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&self.op_code.to_le_bytes());
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplyMsg {
    pub header: MessageHeader,
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub number_returned: i32,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMsg {
    pub header: MessageHeader,
    pub zero: i32,
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: Document,
    pub update: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertMsg {
    pub header: MessageHeader,
    pub flags: i32,
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryMsg {
    pub header: MessageHeader,
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    /// Empty when the frame carried no selector; encode omits it again.
    pub return_fields_selector: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetMoreMsg {
    pub header: MessageHeader,
    pub zero: i32,
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMsg {
    pub header: MessageHeader,
    pub zero: i32,
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillCursorsMsg {
    pub header: MessageHeader,
    pub zero: i32,
    pub number_of_cursor_ids: i32,
    pub cursor_ids: Vec<i64>,
}

/// One OP_MSG section, discriminated by its leading kind byte.
#[derive(Debug, Clone, PartialEq)]
pub enum Section {
    Body(Document),
    DocumentSequence {
        /// Size field as it appeared on the wire (includes itself through the
        /// document list). Encode recomputes it.
        size: i32,
        identifier: String,
        documents: Vec<Document>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct MsgMsg {
    pub header: MessageHeader,
    pub flag_bits: u32,
    pub sections: Vec<Section>,
    /// CRC-32C trailer when CHECKSUM_PRESENT is set. Excluded from section
    /// parsing but retained so encode reproduces the original bytes.
    pub checksum: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Reply(ReplyMsg),
    Update(UpdateMsg),
    Insert(InsertMsg),
    Query(QueryMsg),
    GetMore(GetMoreMsg),
    Delete(DeleteMsg),
    KillCursors(KillCursorsMsg),
    Msg(MsgMsg),
}

impl Message {
    pub fn header(&self) -> &MessageHeader {
        match self {
            Message::Reply(m) => &m.header,
            Message::Update(m) => &m.header,
            Message::Insert(m) => &m.header,
            Message::Query(m) => &m.header,
            Message::GetMore(m) => &m.header,
            Message::Delete(m) => &m.header,
            Message::KillCursors(m) => &m.header,
            Message::Msg(m) => &m.header,
        }
    }
}

/// Decode one complete wire frame. `buf` must be exactly
/// `header.message_length` bytes and at least the 16-byte header.
///
/// OP_COMPRESSED yields the *inner* message: the payload is decompressed, a
/// header is synthesized (`message_length = 16 + uncompressed_size`, op code
/// swapped for the original, ids copied) and decoded again. A compressed
/// message wrapping another compressed message is rejected.
pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
    decode_at_depth(buf, false)
}

fn decode_at_depth(buf: &[u8], nested: bool) -> Result<Message, DecodeError> {
    let header = MessageHeader::parse(buf)?;
    if header.message_length < MessageHeader::LEN as i32
        || buf.len() != header.message_length as usize
    {
        return Err(DecodeError::Truncated);
    }
    let mut r = Reader::new(&buf[MessageHeader::LEN..]);
    match OpCode::from_i32(header.op_code)? {
        OpCode::Reply => decode_reply(header, &mut r).map(Message::Reply),
        OpCode::Update => decode_update(header, &mut r).map(Message::Update),
        OpCode::Insert => decode_insert(header, &mut r).map(Message::Insert),
        OpCode::Query => decode_query(header, &mut r).map(Message::Query),
        OpCode::GetMore => decode_get_more(header, &mut r).map(Message::GetMore),
        OpCode::Delete => decode_delete(header, &mut r).map(Message::Delete),
        OpCode::KillCursors => decode_kill_cursors(header, &mut r).map(Message::KillCursors),
        OpCode::Msg => decode_msg(header, &mut r).map(Message::Msg),
        OpCode::Compressed => {
            if nested {
                return Err(DecodeError::NestedCompression);
            }
            decode_compressed(header, &mut r)
        }
    }
}

fn decode_reply(header: MessageHeader, r: &mut Reader) -> Result<ReplyMsg, DecodeError> {
    let response_flags = r.i32()?;
    let cursor_id = r.i64()?;
    let starting_from = r.i32()?;
    let number_returned = r.i32()?;
    let mut documents = Vec::new();
    for _ in 0..number_returned {
        documents.push(r.document()?);
    }
    Ok(ReplyMsg {
        header,
        response_flags,
        cursor_id,
        starting_from,
        number_returned,
        documents,
    })
}

fn decode_update(header: MessageHeader, r: &mut Reader) -> Result<UpdateMsg, DecodeError> {
    Ok(UpdateMsg {
        header,
        zero: r.i32()?,
        full_collection_name: r.cstring()?,
        flags: r.i32()?,
        selector: r.document()?,
        update: r.document()?,
    })
}

fn decode_insert(header: MessageHeader, r: &mut Reader) -> Result<InsertMsg, DecodeError> {
    let flags = r.i32()?;
    let full_collection_name = r.cstring()?;
    let mut documents = Vec::new();
    while !r.is_empty() {
        documents.push(r.document()?);
    }
    Ok(InsertMsg {
        header,
        flags,
        full_collection_name,
        documents,
    })
}

fn decode_query(header: MessageHeader, r: &mut Reader) -> Result<QueryMsg, DecodeError> {
    let flags = r.i32()?;
    let full_collection_name = r.cstring()?;
    let number_to_skip = r.i32()?;
    let number_to_return = r.i32()?;
    let query = r.document()?;
    // Present only if bytes remain after the query document.
    let return_fields_selector = if r.is_empty() {
        Document::new()
    } else {
        r.document()?
    };
    Ok(QueryMsg {
        header,
        flags,
        full_collection_name,
        number_to_skip,
        number_to_return,
        query,
        return_fields_selector,
    })
}

fn decode_get_more(header: MessageHeader, r: &mut Reader) -> Result<GetMoreMsg, DecodeError> {
    Ok(GetMoreMsg {
        header,
        zero: r.i32()?,
        full_collection_name: r.cstring()?,
        number_to_return: r.i32()?,
        cursor_id: r.i64()?,
    })
}

fn decode_delete(header: MessageHeader, r: &mut Reader) -> Result<DeleteMsg, DecodeError> {
    Ok(DeleteMsg {
        header,
        zero: r.i32()?,
        full_collection_name: r.cstring()?,
        flags: r.i32()?,
        selector: r.document()?,
    })
}

fn decode_kill_cursors(header: MessageHeader, r: &mut Reader) -> Result<KillCursorsMsg, DecodeError> {
    let zero = r.i32()?;
    let number_of_cursor_ids = r.i32()?;
    let mut cursor_ids = Vec::new();
    for _ in 0..number_of_cursor_ids {
        cursor_ids.push(r.i64()?);
    }
    Ok(KillCursorsMsg {
        header,
        zero,
        number_of_cursor_ids,
        cursor_ids,
    })
}

fn decode_msg(header: MessageHeader, r: &mut Reader) -> Result<MsgMsg, DecodeError> {
    let flag_bits = r.u32()?;
    let mut body = r.rest();
    let checksum = if flag_bits & CHECKSUM_PRESENT != 0 {
        if body.len() < 4 {
            return Err(DecodeError::Truncated);
        }
        let (sections, tail) = body.split_at(body.len() - 4);
        body = sections;
        Some(u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]))
    } else {
        None
    };
    let mut sections = Vec::new();
    while !body.is_empty() {
        let (section, rest) = parse_section(body)?;
        sections.push(section);
        body = rest;
    }
    Ok(MsgMsg {
        header,
        flag_bits,
        sections,
        checksum,
    })
}

/// Parse one section off the front of `buf`, returning it and the remainder.
/// The section's extent is the little-endian i32 right after the kind byte:
/// the document's own length prefix for kind 0, the size field for kind 1.
fn parse_section(buf: &[u8]) -> Result<(Section, &[u8]), DecodeError> {
    let (&kind, after_kind) = buf.split_first().ok_or(DecodeError::Truncated)?;
    if after_kind.len() < 4 {
        return Err(DecodeError::Truncated);
    }
    let len = i32::from_le_bytes([after_kind[0], after_kind[1], after_kind[2], after_kind[3]]);
    if len < 4 || after_kind.len() < len as usize {
        return Err(DecodeError::Truncated);
    }
    let (content, rest) = after_kind.split_at(len as usize);
    match kind {
        0 => {
            let doc = Document::from_reader(&mut Cursor::new(content))?;
            Ok((Section::Body(doc), rest))
        }
        1 => {
            let mut r = Reader::new(content);
            let size = r.i32()?;
            let identifier = r.cstring()?;
            let mut documents = Vec::new();
            while !r.is_empty() {
                documents.push(r.document()?);
            }
            Ok((
                Section::DocumentSequence {
                    size,
                    identifier,
                    documents,
                },
                rest,
            ))
        }
        other => Err(DecodeError::UnknownSectionKind(other)),
    }
}

fn decode_compressed(header: MessageHeader, r: &mut Reader) -> Result<Message, DecodeError> {
    let original_opcode = r.i32()?;
    let uncompressed_size = r.i32()?;
    let compressor_id = CompressorId::from_u8(r.u8()?)?;
    let data = compress::decompress(compressor_id, r.rest())?;

    let inner_header = MessageHeader {
        message_length: MessageHeader::LEN as i32 + uncompressed_size,
        request_id: header.request_id,
        response_to: header.response_to,
        op_code: original_opcode,
    };
    let mut inner = Vec::with_capacity(MessageHeader::LEN + data.len());
    inner_header.write_to(&mut inner);
    inner.extend_from_slice(&data);
    decode_at_depth(&inner, true)
}

/// Encode a message back to wire bytes, recomputing `message_length`.
/// Byte-identical to the source frame for anything produced by [`decode`]
/// from an uncompressed frame.
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut payload = Vec::new();
    let header = match msg {
        Message::Reply(m) => {
            payload.extend_from_slice(&m.response_flags.to_le_bytes());
            payload.extend_from_slice(&m.cursor_id.to_le_bytes());
            payload.extend_from_slice(&m.starting_from.to_le_bytes());
            payload.extend_from_slice(&m.number_returned.to_le_bytes());
            for doc in &m.documents {
                write_document(&mut payload, doc);
            }
            m.header
        }
        Message::Update(m) => {
            payload.extend_from_slice(&m.zero.to_le_bytes());
            write_cstring(&mut payload, &m.full_collection_name);
            payload.extend_from_slice(&m.flags.to_le_bytes());
            write_document(&mut payload, &m.selector);
            write_document(&mut payload, &m.update);
            m.header
        }
        Message::Insert(m) => {
            payload.extend_from_slice(&m.flags.to_le_bytes());
            write_cstring(&mut payload, &m.full_collection_name);
            for doc in &m.documents {
                write_document(&mut payload, doc);
            }
            m.header
        }
        Message::Query(m) => {
            payload.extend_from_slice(&m.flags.to_le_bytes());
            write_cstring(&mut payload, &m.full_collection_name);
            payload.extend_from_slice(&m.number_to_skip.to_le_bytes());
            payload.extend_from_slice(&m.number_to_return.to_le_bytes());
            write_document(&mut payload, &m.query);
            if !m.return_fields_selector.is_empty() {
                write_document(&mut payload, &m.return_fields_selector);
            }
            m.header
        }
        Message::GetMore(m) => {
            payload.extend_from_slice(&m.zero.to_le_bytes());
            write_cstring(&mut payload, &m.full_collection_name);
            payload.extend_from_slice(&m.number_to_return.to_le_bytes());
            payload.extend_from_slice(&m.cursor_id.to_le_bytes());
            m.header
        }
        Message::Delete(m) => {
            payload.extend_from_slice(&m.zero.to_le_bytes());
            write_cstring(&mut payload, &m.full_collection_name);
            payload.extend_from_slice(&m.flags.to_le_bytes());
            write_document(&mut payload, &m.selector);
            m.header
        }
        Message::KillCursors(m) => {
            payload.extend_from_slice(&m.zero.to_le_bytes());
            payload.extend_from_slice(&m.number_of_cursor_ids.to_le_bytes());
            for id in &m.cursor_ids {
                payload.extend_from_slice(&id.to_le_bytes());
            }
            m.header
        }
        Message::Msg(m) => {
            payload.extend_from_slice(&m.flag_bits.to_le_bytes());
            for section in &m.sections {
                write_section(&mut payload, section);
            }
            if let Some(crc) = m.checksum {
                payload.extend_from_slice(&crc.to_le_bytes());
            }
            m.header
        }
    };

    let mut out = Vec::with_capacity(MessageHeader::LEN + payload.len());
    MessageHeader {
        message_length: (MessageHeader::LEN + payload.len()) as i32,
        ..header
    }
    .write_to(&mut out);
    out.extend_from_slice(&payload);
    out
}

fn write_document(out: &mut Vec<u8>, doc: &Document) {
    doc.to_writer(out).expect("bson encode");
}

fn write_cstring(out: &mut Vec<u8>, s: &str) {
    out.extend_from_slice(s.as_bytes());
    out.push(0);
}

fn write_section(out: &mut Vec<u8>, section: &Section) {
    match section {
        Section::Body(doc) => {
            out.push(0);
            write_document(out, doc);
        }
        Section::DocumentSequence {
            identifier,
            documents,
            ..
        } => {
            let mut content = Vec::new();
            write_cstring(&mut content, identifier);
            for doc in documents {
                write_document(&mut content, doc);
            }
            out.push(1);
            out.extend_from_slice(&((content.len() + 4) as i32).to_le_bytes());
            out.extend_from_slice(&content);
        }
    }
}

/// Cursor over a payload slice. Every accessor fails with `Truncated` when a
/// nested length runs past the enclosing buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.bytes(1)?[0])
    }

    fn i32(&mut self) -> Result<i32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        let b = self.bytes(8)?;
        Ok(i64::from_le_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    /// NUL-terminated UTF-8 string.
    fn cstring(&mut self) -> Result<String, DecodeError> {
        let start = self.pos;
        let mut end = start;
        while end < self.buf.len() && self.buf[end] != 0 {
            end += 1;
        }
        if end >= self.buf.len() {
            return Err(DecodeError::Truncated);
        }
        let s = std::str::from_utf8(&self.buf[start..end])
            .map_err(|_| DecodeError::Truncated)?
            .to_string();
        self.pos = end + 1;
        Ok(s)
    }

    /// One BSON document; its own length prefix defines its extent.
    fn document(&mut self) -> Result<Document, DecodeError> {
        if self.remaining() < 4 {
            return Err(DecodeError::Truncated);
        }
        let b = &self.buf[self.pos..self.pos + 4];
        let len = i32::from_le_bytes([b[0], b[1], b[2], b[3]]);
        if len < 5 || self.remaining() < len as usize {
            return Err(DecodeError::Truncated);
        }
        let doc_bytes = self.bytes(len as usize)?;
        Ok(Document::from_reader(&mut Cursor::new(doc_bytes))?)
    }
}
