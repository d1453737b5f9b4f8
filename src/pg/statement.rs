//! Statement request batches and response assembly.
//!
//! A statement without parameters goes out as one simple Query. With
//! parameters it is pipelined through the unnamed statement and portal:
//! Parse, Bind, Describe, Execute, Close, Sync.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;

use super::error::{PgError, PgResult};
use super::protocol::*;
use super::types::{self, Oid};
use crate::executor::Value;

/// Bind carries its parameter count as an Int16.
pub const MAX_PARAMS: usize = i16::MAX as usize;

/// Append the request for `sql` with `params` to `buf`.
///
/// Nothing is written when the request cannot be framed.
pub fn encode_request(buf: &mut BytesMut, sql: &str, params: &[Value]) -> PgResult<()> {
    if params.is_empty() {
        QueryMessage { query: sql }.encode_into(buf);
        return Ok(());
    }
    if params.len() > MAX_PARAMS {
        return Err(PgError::Config(format!(
            "{} parameters exceed the protocol limit of {}",
            params.len(),
            MAX_PARAMS
        )));
    }

    let encoded: Vec<Option<Vec<u8>>> = params.iter().map(types::encode_text).collect();

    ParseMessage {
        name: "",
        query: sql,
        param_types: &[],
    }
    .encode_into(buf);
    BindMessage {
        portal: "",
        statement: "",
        params: &encoded,
    }
    .encode_into(buf);
    DescribeMessage {
        kind: b'S',
        name: "",
    }
    .encode_into(buf);
    ExecuteMessage {
        portal: "",
        max_rows: 0,
    }
    .encode_into(buf);
    CloseMessage {
        kind: b'S',
        name: "",
    }
    .encode_into(buf);
    SyncMessage.encode_into(buf);
    Ok(())
}

/// Column metadata of a result set.
#[derive(Debug, Clone, Default)]
pub struct RowDescription {
    pub names: Vec<String>,
    pub type_oids: Vec<Oid>,
}

impl RowDescription {
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl From<Vec<FieldDescription>> for RowDescription {
    fn from(fields: Vec<FieldDescription>) -> Self {
        let (names, type_oids) = fields.into_iter().map(|f| (f.name, f.type_oid)).unzip();
        Self { names, type_oids }
    }
}

/// Raw text-format values of one row.
pub type DataRow = Vec<Option<Bytes>>;

/// Fully buffered result of one statement.
#[derive(Debug, Default)]
pub struct QueryResult {
    pub description: RowDescription,
    pub rows: VecDeque<DataRow>,
    /// Command tag (e.g., "SELECT 5" or "INSERT 0 1")
    pub command_tag: String,
}

impl QueryResult {
    /// Assemble the response to one request, up to and including
    /// ReadyForQuery.
    ///
    /// The first CommandComplete (or EmptyQueryResponse) closes the result
    /// set; later result sets of a multi-statement query are skipped. Any
    /// ErrorResponse in the stream wins. A stream without a terminal message
    /// is a protocol error.
    pub fn from_messages<I>(messages: I) -> PgResult<Self>
    where
        I: IntoIterator<Item = BackendMessage>,
    {
        let mut result = QueryResult::default();
        let mut complete = false;

        for msg in messages {
            match msg {
                BackendMessage::ErrorResponse { fields } => return Err(server_error(&fields)),
                _ if complete => {}
                BackendMessage::RowDescription { fields } => {
                    result.description = fields.into();
                }
                BackendMessage::DataRow { values } => {
                    if values.len() != result.description.len() {
                        return Err(PgError::Protocol(format!(
                            "DataRow has {} values, RowDescription has {} columns",
                            values.len(),
                            result.description.len()
                        )));
                    }
                    result.rows.push_back(values);
                }
                BackendMessage::CommandComplete { tag } => {
                    result.command_tag = tag;
                    complete = true;
                }
                BackendMessage::EmptyQueryResponse => {
                    complete = true;
                }
                _ => {}
            }
        }

        if !complete {
            return Err(PgError::Protocol(
                "Response ended without CommandComplete".to_string(),
            ));
        }

        Ok(result)
    }

    /// Trailing integer of the command tag, 0 when there is none.
    pub fn rows_affected(&self) -> u64 {
        parse_rows_affected(&self.command_tag)
    }
}

/// Parse rows affected from a PostgreSQL command tag.
///
/// Examples: "INSERT 0 5" -> 5, "UPDATE 10" -> 10, "BEGIN" -> 0
pub fn parse_rows_affected(tag: &str) -> u64 {
    tag.rsplit(' ')
        .next()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(name: &str) -> FieldDescription {
        FieldDescription {
            name: name.to_string(),
            table_oid: 0,
            column_attr: 0,
            type_oid: Oid::TEXT,
            type_size: -1,
            type_modifier: -1,
            format: Format::Text,
        }
    }

    fn data_row(values: &[Option<&'static str>]) -> BackendMessage {
        BackendMessage::DataRow {
            values: values
                .iter()
                .map(|v| v.map(|s| Bytes::from_static(s.as_bytes())))
                .collect(),
        }
    }

    fn ready() -> BackendMessage {
        BackendMessage::ReadyForQuery {
            status: TransactionStatus::Idle,
        }
    }

    fn decode_all(bytes: &[u8]) -> Vec<Message> {
        let mut backlog = Backlog::new();
        backlog.extend_from_slice(bytes);
        backlog.drain_messages().unwrap()
    }

    #[test]
    fn test_parse_rows_affected() {
        assert_eq!(parse_rows_affected("INSERT 0 5"), 5);
        assert_eq!(parse_rows_affected("UPDATE 10"), 10);
        assert_eq!(parse_rows_affected("DELETE 3"), 3);
        assert_eq!(parse_rows_affected("SELECT 100"), 100);
        assert_eq!(parse_rows_affected("BEGIN"), 0);
        assert_eq!(parse_rows_affected(""), 0);
    }

    #[test]
    fn test_simple_request_without_params() {
        let mut buf = BytesMut::new();
        encode_request(&mut buf, "SELECT 1", &[]).unwrap();
        let tags: Vec<u8> = decode_all(&buf).iter().map(|m| m.tag).collect();
        assert_eq!(tags, b"Q");
    }

    #[test]
    fn test_extended_request_batch() {
        let mut buf = BytesMut::new();
        encode_request(&mut buf, "SELECT $1, $2", &[Value::Int(1), Value::Null]).unwrap();
        let messages = decode_all(&buf);
        let tags: Vec<u8> = messages.iter().map(|m| m.tag).collect();
        assert_eq!(tags, b"PBDECS");
        assert_eq!(&messages[0].payload[..], b"\0SELECT $1, $2\0\0\0");
        assert_eq!(&messages[2].payload[..], b"S\0");
        assert_eq!(&messages[3].payload[..], b"\0\0\0\0\0");
    }

    #[test]
    fn test_too_many_params_rejected() {
        let mut buf = BytesMut::new();
        let params = vec![Value::Int(0); MAX_PARAMS + 1];
        let err = encode_request(&mut buf, "SELECT 1", &params).unwrap_err();
        assert!(matches!(err, PgError::Config(_)), "{}", err);
        assert!(!err.invalidates_connection());
        assert!(buf.is_empty());

        let params = vec![Value::Int(0); MAX_PARAMS];
        encode_request(&mut buf, "SELECT 1", &params).unwrap();
        let bind = &decode_all(&buf)[1];
        assert_eq!(&bind.payload[4..6], &i16::MAX.to_be_bytes());
    }

    #[test]
    fn test_assemble_select() {
        let result = QueryResult::from_messages(vec![
            BackendMessage::ParseComplete,
            BackendMessage::BindComplete,
            BackendMessage::RowDescription {
                fields: vec![field("id"), field("title")],
            },
            data_row(&[Some("1"), Some("hello")]),
            data_row(&[Some("2"), None]),
            BackendMessage::CommandComplete {
                tag: "SELECT 2".to_string(),
            },
            BackendMessage::CloseComplete,
            ready(),
        ])
        .unwrap();

        assert_eq!(result.description.names, ["id", "title"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[1][1], None);
        assert_eq!(result.rows_affected(), 2);
    }

    #[test]
    fn test_error_response_surfaces() {
        let mut fields = std::collections::HashMap::new();
        fields.insert(b'V', "ERROR".to_string());
        fields.insert(b'C', "42601".to_string());
        fields.insert(b'M', "syntax error".to_string());

        let err = QueryResult::from_messages(vec![
            BackendMessage::CommandComplete {
                tag: "INSERT 0 1".to_string(),
            },
            BackendMessage::ErrorResponse { fields },
            ready(),
        ])
        .unwrap_err();
        assert_eq!(err.code(), Some("42601"));
    }

    #[test]
    fn test_column_count_mismatch() {
        let err = QueryResult::from_messages(vec![
            BackendMessage::RowDescription {
                fields: vec![field("id")],
            },
            data_row(&[Some("1"), Some("extra")]),
        ])
        .unwrap_err();
        assert!(matches!(err, PgError::Protocol(_)));
    }

    #[test]
    fn test_missing_command_complete() {
        let err = QueryResult::from_messages(vec![
            BackendMessage::RowDescription {
                fields: vec![field("id")],
            },
            data_row(&[Some("1")]),
            ready(),
        ])
        .unwrap_err();
        assert!(err.invalidates_connection());
    }

    #[test]
    fn test_empty_query_completes() {
        let result =
            QueryResult::from_messages(vec![BackendMessage::EmptyQueryResponse, ready()]).unwrap();
        assert!(result.rows.is_empty());
        assert_eq!(result.rows_affected(), 0);
    }

    #[test]
    fn test_later_result_sets_skipped() {
        let result = QueryResult::from_messages(vec![
            BackendMessage::CommandComplete {
                tag: "UPDATE 4".to_string(),
            },
            BackendMessage::RowDescription {
                fields: vec![field("x")],
            },
            data_row(&[Some("1")]),
            BackendMessage::CommandComplete {
                tag: "SELECT 1".to_string(),
            },
            ready(),
        ])
        .unwrap();
        assert_eq!(result.rows_affected(), 4);
        assert!(result.rows.is_empty());
    }
}
