//! Purpose: RESP2 wire codec used to talk to the remote store.
//! Exports: `RespValue`, `encode_command`, `encode_value`, `parse`, size limits.
//! Role: Pure framing layer; no I/O, no knowledge of commands or scripts.
//! Invariants: `parse` never consumes a partial frame; `Ok(None)` means "need more bytes".
//! Invariants: Nesting, bulk length, and array length are bounded before allocation.
use crate::core::error::{ClientResult, Error, ErrorKind};
use bytes::{BufMut, Bytes, BytesMut};

/// Maximum nesting depth for arrays.
pub const MAX_NESTING_DEPTH: usize = 32;

/// Maximum bulk string size (512MB).
pub const MAX_BULK_SIZE: usize = 512 * 1024 * 1024;

/// Maximum array elements.
pub const MAX_ELEMENTS: usize = 1_000_000;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RespValue {
    SimpleString(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<RespValue>),
}

impl RespValue {
    pub fn bulk(value: impl AsRef<[u8]>) -> Self {
        RespValue::Bulk(Bytes::copy_from_slice(value.as_ref()))
    }

    /// Text view of string-like replies.
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(text) => Some(text.clone()),
            RespValue::Bulk(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, RespValue::Null)
    }
}

/// Encode a command as an array of bulk strings.
pub fn encode_command<A: AsRef<[u8]>>(args: &[A], out: &mut BytesMut) {
    out.put_u8(b'*');
    out.put_slice(args.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    for arg in args {
        put_bulk(arg.as_ref(), out);
    }
}

/// Encode an arbitrary reply value.
pub fn encode_value(value: &RespValue, out: &mut BytesMut) {
    match value {
        RespValue::SimpleString(text) => {
            out.put_u8(b'+');
            out.put_slice(text.as_bytes());
            out.put_slice(b"\r\n");
        }
        RespValue::Error(text) => {
            out.put_u8(b'-');
            out.put_slice(text.as_bytes());
            out.put_slice(b"\r\n");
        }
        RespValue::Integer(n) => {
            out.put_u8(b':');
            out.put_slice(n.to_string().as_bytes());
            out.put_slice(b"\r\n");
        }
        RespValue::Bulk(bytes) => put_bulk(bytes, out),
        RespValue::Null => out.put_slice(b"$-1\r\n"),
        RespValue::Array(items) => {
            out.put_u8(b'*');
            out.put_slice(items.len().to_string().as_bytes());
            out.put_slice(b"\r\n");
            for item in items {
                encode_value(item, out);
            }
        }
    }
}

fn put_bulk(bytes: &[u8], out: &mut BytesMut) {
    out.put_u8(b'$');
    out.put_slice(bytes.len().to_string().as_bytes());
    out.put_slice(b"\r\n");
    out.put_slice(bytes);
    out.put_slice(b"\r\n");
}

/// Parse one value from the front of `data`.
///
/// Returns the value and the number of bytes it occupied, or `None` when the
/// buffer does not yet hold a complete frame.
pub fn parse(data: &[u8]) -> ClientResult<Option<(RespValue, usize)>> {
    parse_at(data, 0)
}

fn parse_at(data: &[u8], depth: usize) -> ClientResult<Option<(RespValue, usize)>> {
    if data.is_empty() {
        return Ok(None);
    }
    if depth > MAX_NESTING_DEPTH {
        return Err(protocol_error("maximum nesting depth exceeded"));
    }

    let Some(line_len) = find_crlf(&data[1..]) else {
        return Ok(None);
    };
    let line = &data[1..1 + line_len];
    let header_len = line_len + 3;

    match data[0] {
        b'+' => Ok(Some((RespValue::SimpleString(lossy(line)), header_len))),
        b'-' => Ok(Some((RespValue::Error(lossy(line)), header_len))),
        b':' => Ok(Some((RespValue::Integer(parse_int(line)?), header_len))),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok(Some((RespValue::Null, header_len)));
            }
            let len = usize::try_from(len)
                .map_err(|_| protocol_error(format!("invalid bulk length {len}")))?;
            if len > MAX_BULK_SIZE {
                return Err(protocol_error("bulk string too large"));
            }
            let end = header_len + len;
            if data.len() < end + 2 {
                return Ok(None);
            }
            if &data[end..end + 2] != b"\r\n" {
                return Err(protocol_error("bulk string missing terminator"));
            }
            let bytes = Bytes::copy_from_slice(&data[header_len..end]);
            Ok(Some((RespValue::Bulk(bytes), end + 2)))
        }
        b'*' => {
            let count = parse_int(line)?;
            if count == -1 {
                return Ok(Some((RespValue::Null, header_len)));
            }
            let count = usize::try_from(count)
                .map_err(|_| protocol_error(format!("invalid array length {count}")))?;
            if count > MAX_ELEMENTS {
                return Err(protocol_error("array too large"));
            }
            let mut items = Vec::with_capacity(count.min(64));
            let mut consumed = header_len;
            for _ in 0..count {
                match parse_at(&data[consumed..], depth + 1)? {
                    Some((item, used)) => {
                        items.push(item);
                        consumed += used;
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespValue::Array(items), consumed)))
        }
        other => Err(protocol_error(format!(
            "unexpected reply type byte 0x{other:02x}"
        ))),
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|window| window == b"\r\n")
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn parse_int(line: &[u8]) -> ClientResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|text| text.parse::<i64>().ok())
        .ok_or_else(|| protocol_error("invalid integer in reply"))
}

fn protocol_error(message: impl Into<String>) -> Error {
    Error::new(ErrorKind::Protocol).with_message(message)
}

#[cfg(test)]
mod tests {
    use super::{RespValue, encode_command, encode_value, parse};
    use crate::core::error::ErrorKind;
    use bytes::BytesMut;

    #[test]
    fn encodes_command_as_bulk_array() {
        let mut out = BytesMut::new();
        encode_command(&["GET", "proj:tag"], &mut out);
        assert_eq!(&out[..], b"*2\r\n$3\r\nGET\r\n$8\r\nproj:tag\r\n");
    }

    #[test]
    fn parses_scalar_replies() {
        let (value, used) = parse(b"+OK\r\n").expect("parse").expect("complete");
        assert_eq!(value, RespValue::SimpleString("OK".to_string()));
        assert_eq!(used, 5);

        let (value, _) = parse(b":42\r\n").expect("parse").expect("complete");
        assert_eq!(value, RespValue::Integer(42));

        let (value, _) = parse(b"$-1\r\n").expect("parse").expect("complete");
        assert!(value.is_null());

        let (value, _) = parse(b"-NOSCRIPT No matching script\r\n")
            .expect("parse")
            .expect("complete");
        assert_eq!(
            value,
            RespValue::Error("NOSCRIPT No matching script".to_string())
        );
    }

    #[test]
    fn bulk_strings_may_contain_crlf() {
        let (value, used) = parse(b"$4\r\na\r\nb\r\n").expect("parse").expect("complete");
        assert_eq!(value.as_text().as_deref(), Some("a\r\nb"));
        assert_eq!(used, 10);
    }

    #[test]
    fn partial_frames_need_more_bytes() {
        assert!(parse(b"").expect("parse").is_none());
        assert!(parse(b"$5\r\nhel").expect("parse").is_none());
        assert!(parse(b"*3\r\n$7\r\nmessage\r\n").expect("parse").is_none());
    }

    #[test]
    fn parses_pubsub_message_and_reports_consumed_length() {
        let mut buf = BytesMut::new();
        let message = RespValue::Array(vec![
            RespValue::bulk("message"),
            RespValue::bulk("proj"),
            RespValue::bulk("[\"tag\",[\"1\"]]"),
        ]);
        encode_value(&message, &mut buf);
        buf.extend_from_slice(b"+trailing\r\n");

        let (value, used) = parse(&buf).expect("parse").expect("complete");
        assert_eq!(value, message);
        let (rest, _) = parse(&buf[used..]).expect("parse").expect("complete");
        assert_eq!(rest, RespValue::SimpleString("trailing".to_string()));
    }

    #[test]
    fn rejects_unknown_type_byte() {
        let err = parse(b"?what\r\n").expect_err("bad type");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn rejects_missing_bulk_terminator() {
        let err = parse(b"$3\r\nabcXY").expect_err("bad terminator");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn rejects_excessive_nesting() {
        let mut frame = Vec::new();
        for _ in 0..40 {
            frame.extend_from_slice(b"*1\r\n");
        }
        frame.extend_from_slice(b":1\r\n");
        let err = parse(&frame).expect_err("too deep");
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }
}
