//! PostgreSQL wire protocol message encoding and decoding.
//!
//! This module implements the PostgreSQL v3 protocol messages.
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::HashMap;

use super::error::{PgError, PgResult};
use super::types::Oid;

// ============================================================================
// Protocol Constants
// ============================================================================

/// PostgreSQL protocol version 3.0
pub const PROTOCOL_VERSION: i32 = 196608; // (3 << 16) | 0

/// Tag byte plus the length word.
pub const HEADER_LEN: usize = 5;

/// Largest length word accepted from the server (1 GiB).
pub const MAX_MESSAGE_LEN: i32 = 0x4000_0000;

/// Format codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i16)]
pub enum Format {
    Text = 0,
    Binary = 1,
}

/// Transaction status indicators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Idle (not in a transaction block)
    Idle,
    /// In a transaction block
    InTransaction,
    /// In a failed transaction block
    Failed,
}

impl TryFrom<u8> for TransactionStatus {
    type Error = PgError;

    fn try_from(b: u8) -> PgResult<Self> {
        match b {
            b'I' => Ok(TransactionStatus::Idle),
            b'T' => Ok(TransactionStatus::InTransaction),
            b'E' => Ok(TransactionStatus::Failed),
            other => Err(PgError::Protocol(format!(
                "Unknown transaction status: {:?}",
                other as char
            ))),
        }
    }
}

// ============================================================================
// Framing
// ============================================================================

/// Write one frame: optional tag, length placeholder, body, then backpatch
/// the length (which counts itself but not the tag).
fn frame<F>(buf: &mut BytesMut, tag: Option<u8>, body: F)
where
    F: FnOnce(&mut BytesMut),
{
    if let Some(tag) = tag {
        buf.put_u8(tag);
    }
    let start = buf.len();
    buf.put_i32(0);
    body(buf);
    let len = (buf.len() - start) as i32;
    buf[start..start + 4].copy_from_slice(&len.to_be_bytes());
}

#[inline]
fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// ============================================================================
// Frontend (Client -> Server) Messages
// ============================================================================

/// Trait for encoding frontend messages
pub trait FrontendMessage {
    /// Append the framed message to `buf`.
    fn encode_into(&self, buf: &mut BytesMut);

    fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf
    }
}

/// Startup message sent at connection start
#[derive(Debug, Clone)]
pub struct StartupMessage<'a> {
    pub user: &'a str,
    pub database: &'a str,
}

impl FrontendMessage for StartupMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, None, |buf| {
            buf.put_i32(PROTOCOL_VERSION);
            put_cstr(buf, "client_encoding");
            put_cstr(buf, "UTF-8");
            put_cstr(buf, "database");
            put_cstr(buf, self.database);
            put_cstr(buf, "user");
            put_cstr(buf, self.user);
            buf.put_u8(0);
        });
    }
}

/// Simple query message ('Q')
#[derive(Debug, Clone)]
pub struct QueryMessage<'a> {
    pub query: &'a str,
}

impl FrontendMessage for QueryMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'Q'), |buf| put_cstr(buf, self.query));
    }
}

/// Parse message ('P') - Creates a prepared statement
#[derive(Debug, Clone)]
pub struct ParseMessage<'a> {
    pub name: &'a str,
    pub query: &'a str,
    pub param_types: &'a [Oid],
}

impl FrontendMessage for ParseMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'P'), |buf| {
            put_cstr(buf, self.name);
            put_cstr(buf, self.query);
            buf.put_i16(self.param_types.len() as i16);
            for oid in self.param_types {
                buf.put_i32(oid.as_i32());
            }
        });
    }
}

/// Bind message ('B') - Binds text-format parameters to a prepared statement
#[derive(Debug, Clone)]
pub struct BindMessage<'a> {
    pub portal: &'a str,
    pub statement: &'a str,
    /// `None` is SQL NULL.
    pub params: &'a [Option<Vec<u8>>],
}

impl FrontendMessage for BindMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'B'), |buf| {
            put_cstr(buf, self.portal);
            put_cstr(buf, self.statement);

            // No parameter format codes: everything is text
            buf.put_i16(0);

            buf.put_i16(self.params.len() as i16);
            for param in self.params {
                match param {
                    None => buf.put_i32(-1),
                    Some(bytes) => {
                        buf.put_i32(bytes.len() as i32);
                        buf.put_slice(bytes);
                    }
                }
            }

            // No result format codes: results come back as text
            buf.put_i16(0);
        });
    }
}

/// Describe message ('D') - Request description of statement or portal
#[derive(Debug, Clone)]
pub struct DescribeMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for DescribeMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'D'), |buf| {
            buf.put_u8(self.kind);
            put_cstr(buf, self.name);
        });
    }
}

/// Execute message ('E') - Executes a bound portal
#[derive(Debug, Clone)]
pub struct ExecuteMessage<'a> {
    pub portal: &'a str,
    /// 0 = no limit
    pub max_rows: i32,
}

impl FrontendMessage for ExecuteMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'E'), |buf| {
            put_cstr(buf, self.portal);
            buf.put_i32(self.max_rows);
        });
    }
}

/// Close message ('C') - Close a statement or portal
#[derive(Debug, Clone)]
pub struct CloseMessage<'a> {
    /// 'S' for statement, 'P' for portal
    pub kind: u8,
    pub name: &'a str,
}

impl FrontendMessage for CloseMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'C'), |buf| {
            buf.put_u8(self.kind);
            put_cstr(buf, self.name);
        });
    }
}

/// Sync message ('S') - Marks end of an extended query
#[derive(Debug, Clone, Copy)]
pub struct SyncMessage;

impl FrontendMessage for SyncMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'S'), |_| {});
    }
}

/// Terminate message ('X') - Close the connection
#[derive(Debug, Clone, Copy)]
pub struct TerminateMessage;

impl FrontendMessage for TerminateMessage {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'X'), |_| {});
    }
}

/// SASL Initial Response message ('p') - First SCRAM message
#[derive(Debug, Clone)]
pub struct SaslInitialResponseMessage<'a> {
    /// SASL mechanism name (e.g., "SCRAM-SHA-256")
    pub mechanism: &'a str,
    pub data: &'a [u8],
}

impl FrontendMessage for SaslInitialResponseMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'p'), |buf| {
            put_cstr(buf, self.mechanism);
            buf.put_i32(self.data.len() as i32);
            buf.put_slice(self.data);
        });
    }
}

/// SASL Response message ('p') - Subsequent SCRAM messages
#[derive(Debug, Clone)]
pub struct SaslResponseMessage<'a> {
    pub data: &'a [u8],
}

impl FrontendMessage for SaslResponseMessage<'_> {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(b'p'), |buf| buf.put_slice(self.data));
    }
}

// ============================================================================
// Raw messages and the receive backlog
// ============================================================================

/// One tagged protocol frame with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub tag: u8,
    pub payload: Bytes,
}

impl Message {
    pub fn new(tag: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }
}

impl FrontendMessage for Message {
    fn encode_into(&self, buf: &mut BytesMut) {
        frame(buf, Some(self.tag), |buf| buf.put_slice(&self.payload));
    }
}

/// Per-connection receive buffer with a read cursor.
///
/// Bytes before `pos` are consumed. An incomplete trailing frame leaves the
/// cursor at its tag byte so the next attempt re-parses it from the start.
#[derive(Debug, Default)]
pub struct Backlog {
    buf: BytesMut,
    pos: usize,
}

impl Backlog {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(8192),
            pos: 0,
        }
    }

    /// Append freshly received bytes.
    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Buffer to read socket data into directly.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Bytes received but not yet consumed.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Cut the next complete frame, or `None` when more bytes are needed.
    pub fn next_message(&mut self) -> PgResult<Option<Message>> {
        if self.pending() < HEADER_LEN {
            return Ok(None);
        }

        let tag = self.buf[self.pos];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buf[self.pos + 1..self.pos + HEADER_LEN]);
        let len = i32::from_be_bytes(len_bytes);

        if !(4..=MAX_MESSAGE_LEN).contains(&len) {
            return Err(PgError::Protocol(format!(
                "Invalid length {} for message {:?}",
                len, tag as char
            )));
        }

        let body_len = len as usize - 4;
        if self.pending() - HEADER_LEN < body_len {
            return Ok(None);
        }
        self.pos += HEADER_LEN;

        let payload = Bytes::copy_from_slice(&self.buf[self.pos..self.pos + body_len]);
        self.pos += body_len;
        Ok(Some(Message { tag, payload }))
    }

    /// Decode every complete frame currently buffered, then compact.
    pub fn drain_messages(&mut self) -> PgResult<Vec<Message>> {
        let mut messages = Vec::new();
        while let Some(msg) = self.next_message()? {
            messages.push(msg);
        }
        self.compact();
        Ok(messages)
    }

    /// Drop the consumed prefix.
    pub fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.advance(self.pos);
            self.pos = 0;
        }
    }

    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}

// ============================================================================
// Backend (Server -> Client) Messages
// ============================================================================

/// Field description in a RowDescription message
#[derive(Debug, Clone)]
pub struct FieldDescription {
    pub name: String,
    pub table_oid: i32,
    pub column_attr: i16,
    pub type_oid: Oid,
    pub type_size: i16,
    pub type_modifier: i32,
    pub format: Format,
}

/// Authentication request subtypes ('R').
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    Sasl { mechanisms: Vec<String> },
    SaslContinue { data: Bytes },
    SaslFinal { data: Bytes },
    /// Cleartext (3), MD5 (5), GSS and friends.
    Other { code: i32 },
}

/// Backend message types
#[derive(Debug, Clone)]
pub enum BackendMessage {
    Authentication(Authentication),

    // Query responses
    RowDescription {
        fields: Vec<FieldDescription>,
    },
    DataRow {
        values: Vec<Option<Bytes>>,
    },
    CommandComplete {
        tag: String,
    },
    EmptyQueryResponse,

    // Extended query protocol
    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,

    // Status
    ReadyForQuery {
        status: TransactionStatus,
    },
    ParameterStatus {
        name: String,
        value: String,
    },
    BackendKeyData {
        process_id: i32,
        secret_key: i32,
    },

    // Errors and notices
    ErrorResponse {
        fields: HashMap<u8, String>,
    },
    NoticeResponse {
        fields: HashMap<u8, String>,
    },

    // Other
    NotificationResponse {
        process_id: i32,
        channel: String,
        payload: String,
    },
    ParameterDescription {
        type_oids: Vec<Oid>,
    },
}

impl BackendMessage {
    /// Interpret a framed message.
    pub fn parse(msg: Message) -> PgResult<Self> {
        let tag = msg.tag;
        let mut body = PayloadReader::new(msg.payload);

        let decoded = match tag {
            b'R' => Self::decode_auth(&mut body)?,
            b'T' => Self::decode_row_description(&mut body)?,
            b'D' => Self::decode_data_row(&mut body)?,
            b'C' => BackendMessage::CommandComplete {
                tag: body.cstr()?,
            },
            b'Z' => BackendMessage::ReadyForQuery {
                status: TransactionStatus::try_from(body.u8()?)?,
            },
            b'E' => BackendMessage::ErrorResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'N' => BackendMessage::NoticeResponse {
                fields: read_error_fields(&mut body)?,
            },
            b'S' => BackendMessage::ParameterStatus {
                name: body.cstr()?,
                value: body.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            },
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'I' => BackendMessage::EmptyQueryResponse,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => Self::decode_parameter_description(&mut body)?,
            b'A' => BackendMessage::NotificationResponse {
                process_id: body.i32()?,
                channel: body.cstr()?,
                payload: body.cstr()?,
            },
            _ => {
                return Err(PgError::Protocol(format!(
                    "Unknown message type: {}",
                    tag as char
                )))
            }
        };

        Ok(decoded)
    }

    fn decode_auth(body: &mut PayloadReader) -> PgResult<Self> {
        let auth = match body.i32()? {
            0 => Authentication::Ok,
            10 => {
                let mut mechanisms = Vec::new();
                while !body.is_empty() {
                    let mech = body.cstr()?;
                    if mech.is_empty() {
                        break;
                    }
                    mechanisms.push(mech);
                }
                Authentication::Sasl { mechanisms }
            }
            11 => Authentication::SaslContinue { data: body.rest() },
            12 => Authentication::SaslFinal { data: body.rest() },
            code => Authentication::Other { code },
        };
        Ok(BackendMessage::Authentication(auth))
    }

    fn decode_row_description(body: &mut PayloadReader) -> PgResult<Self> {
        let num_fields = body.count()?;
        let mut fields = Vec::with_capacity(num_fields);

        for _ in 0..num_fields {
            let name = body.cstr()?;
            let table_oid = body.i32()?;
            let column_attr = body.i16()?;
            let type_oid = Oid::from_i32(body.i32()?);
            let type_size = body.i16()?;
            let type_modifier = body.i32()?;
            let format = if body.i16()? == 0 {
                Format::Text
            } else {
                Format::Binary
            };

            fields.push(FieldDescription {
                name,
                table_oid,
                column_attr,
                type_oid,
                type_size,
                type_modifier,
                format,
            });
        }

        Ok(BackendMessage::RowDescription { fields })
    }

    fn decode_data_row(body: &mut PayloadReader) -> PgResult<Self> {
        let num_cols = body.count()?;
        let mut values = Vec::with_capacity(num_cols);

        for _ in 0..num_cols {
            let len = body.i32()?;
            if len < 0 {
                values.push(None);
            } else {
                values.push(Some(body.bytes(len as usize)?));
            }
        }

        Ok(BackendMessage::DataRow { values })
    }

    fn decode_parameter_description(body: &mut PayloadReader) -> PgResult<Self> {
        let num_params = body.count()?;
        let mut type_oids = Vec::with_capacity(num_params);

        for _ in 0..num_params {
            type_oids.push(Oid::from_i32(body.i32()?));
        }

        Ok(BackendMessage::ParameterDescription { type_oids })
    }
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Bounds-checked reader over a message payload.
struct PayloadReader {
    buf: Bytes,
}

impl PayloadReader {
    fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    fn need(&self, n: usize) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::Protocol(format!(
                "Truncated message: needed {} bytes, {} left",
                n,
                self.buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    /// Non-negative 16-bit element count.
    fn count(&mut self) -> PgResult<usize> {
        let n = self.i16()?;
        usize::try_from(n).map_err(|_| PgError::Protocol(format!("Negative count: {}", n)))
    }

    fn bytes(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    fn rest(&mut self) -> Bytes {
        std::mem::take(&mut self.buf)
    }

    /// Read a null-terminated string.
    fn cstr(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Protocol("Missing null terminator in string".to_string()))?;

        let s = std::str::from_utf8(&self.buf[..end])
            .map(|s| s.to_owned())
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.buf[..end]).into_owned());

        self.buf.advance(end + 1);
        Ok(s)
    }
}

/// Read error/notice response fields
fn read_error_fields(body: &mut PayloadReader) -> PgResult<HashMap<u8, String>> {
    let mut fields = HashMap::new();

    while !body.is_empty() {
        let field_type = body.u8()?;
        if field_type == 0 {
            break;
        }
        let value = body.cstr()?;
        fields.insert(field_type, value);
    }

    Ok(fields)
}

/// Build a server error from ErrorResponse fields.
///
/// Severity prefers the non-localized `V` field and falls back to `S`.
pub fn server_error(fields: &HashMap<u8, String>) -> PgError {
    let severity = fields
        .get(&b'V')
        .or_else(|| fields.get(&b'S'))
        .cloned()
        .unwrap_or_else(|| "ERROR".to_string());

    PgError::Server {
        severity,
        code: fields.get(&b'C').cloned().unwrap_or_default(),
        message: fields
            .get(&b'M')
            .cloned()
            .unwrap_or_else(|| "Unknown error".to_string()),
        detail: fields.get(&b'D').cloned(),
        hint: fields.get(&b'H').cloned(),
    }
}
