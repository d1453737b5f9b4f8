//! PostgreSQL type identifiers and text-format value conversion.
//!
//! Parameters are sent and results are requested in the text format, so
//! conversion here is between `Value` and the server's text rendering.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use crate::executor::Value;

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);

    // Character types
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);

    // Integer types
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const OID_TYPE: Oid = Oid(26);

    pub const TEXT: Oid = Oid(25);
    pub const VARCHAR: Oid = Oid(1043);
    pub const BPCHAR: Oid = Oid(1042);

    /// Let the server infer the parameter type.
    pub const UNSPECIFIED: Oid = Oid(0);

    /// Create from raw i32 value
    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    /// Get the raw i32 value
    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    /// Check if this is a text-like type
    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME
        )
    }

    /// Check if this is an integer type
    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }
}

// ============================================================================
// Text format
// ============================================================================

/// Render a parameter in text format. `None` is SQL NULL.
pub fn encode_text(value: &Value) -> Option<Vec<u8>> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(if *b { b"true".to_vec() } else { b"false".to_vec() }),
        Value::Int(i) => Some(i.to_string().into_bytes()),
        Value::Text(s) => Some(s.as_bytes().to_vec()),
        Value::Bytes(b) => Some(encode_bytea_hex(b)),
    }
}

/// Interpret a text-format column value using its type OID.
///
/// Values the OID promises but that fail to parse are kept as text rather
/// than rejected.
pub fn decode_text(oid: Oid, data: Option<&[u8]>) -> Value {
    let Some(data) = data else {
        return Value::Null;
    };

    if oid == Oid::BOOL {
        match data {
            b"t" => return Value::Bool(true),
            b"f" => return Value::Bool(false),
            _ => {}
        }
    } else if oid.is_integer() {
        if let Some(i) = std::str::from_utf8(data).ok().and_then(|s| s.parse().ok()) {
            return Value::Int(i);
        }
    } else if oid == Oid::BYTEA {
        if let Some(bytes) = decode_bytea_hex(data) {
            return Value::Bytes(bytes);
        }
    }

    match std::str::from_utf8(data) {
        Ok(s) => Value::Text(s.to_string()),
        Err(_) => Value::Bytes(data.to_vec()),
    }
}

/// Render bytes in the `\x`-prefixed hex input format of bytea.
fn encode_bytea_hex(data: &[u8]) -> Vec<u8> {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";

    let mut out = Vec::with_capacity(2 + data.len() * 2);
    out.extend_from_slice(b"\\x");
    for byte in data {
        out.push(DIGITS[(byte >> 4) as usize]);
        out.push(DIGITS[(byte & 0x0f) as usize]);
    }
    out
}

/// Decode the `\x`-prefixed hex output format of bytea.
fn decode_bytea_hex(data: &[u8]) -> Option<Vec<u8>> {
    let hex = data.strip_prefix(b"\\x")?;
    if hex.len() % 2 != 0 {
        return None;
    }

    fn nibble(c: u8) -> Option<u8> {
        match c {
            b'0'..=b'9' => Some(c - b'0'),
            b'a'..=b'f' => Some(c - b'a' + 10),
            b'A'..=b'F' => Some(c - b'A' + 10),
            _ => None,
        }
    }

    hex.chunks_exact(2)
        .map(|pair| Some(nibble(pair[0])? << 4 | nibble(pair[1])?))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::BOOL.is_integer());
    }

    #[test]
    fn test_encode_text_params() {
        assert_eq!(encode_text(&Value::Null), None);
        assert_eq!(encode_text(&Value::Bool(true)).unwrap(), b"true");
        assert_eq!(encode_text(&Value::Bool(false)).unwrap(), b"false");
        assert_eq!(encode_text(&Value::Int(-42)).unwrap(), b"-42");
        assert_eq!(encode_text(&Value::from("héllo")).unwrap(), "héllo".as_bytes());
        assert_eq!(
            encode_text(&Value::Bytes(vec![0xde, 0xad, 0x00, 0x0f])).unwrap(),
            b"\\xdead000f"
        );
        assert_eq!(encode_text(&Value::Bytes(Vec::new())).unwrap(), b"\\x");
    }

    #[test]
    fn test_bytea_survives_read_and_write_back() {
        let original = vec![0x00, 0xff, 0x80, b'\\', b'x'];
        let sent = encode_text(&Value::Bytes(original.clone())).unwrap();
        // The server echoes bytea input back in the same hex format
        assert_eq!(decode_text(Oid::BYTEA, Some(sent.as_slice())), Value::Bytes(original));
    }

    #[test]
    fn test_decode_text_by_oid() {
        assert_eq!(decode_text(Oid::BOOL, Some(b"t")), Value::Bool(true));
        assert_eq!(decode_text(Oid::INT8, Some(b"9001")), Value::Int(9001));
        assert_eq!(decode_text(Oid::TEXT, Some(b"1")), Value::from("1"));
        assert_eq!(decode_text(Oid::INT4, None), Value::Null);
        assert_eq!(
            decode_text(Oid::BYTEA, Some(b"\\xdeAD")),
            Value::Bytes(vec![0xde, 0xad])
        );
        assert_eq!(
            decode_text(Oid::TEXT, Some(&[0xff, 0xfe])),
            Value::Bytes(vec![0xff, 0xfe])
        );
    }
}
