//! Wire codec: newline-delimited inbound framing, `\r\n`-terminated JSON
//! replies outbound.
//!
//! Reworked from `oxidb-server`'s length-prefixed `read_message`/
//! `write_message` pair into line framing, since this protocol's clients
//! are plain `nc`-style text tools, not binary RPC clients.

use std::io::{self, BufRead, Write};

use serde_json::Value;

use crate::error::BrokerError;

/// Read the next line from `reader`, trimming the terminator and any
/// trailing whitespace the source also strips (`line.strip()` in
/// `original_source/python/aiomemq.py`).
///
/// Returns `Ok(None)` on clean EOF. The `\r\n` vs `\n` distinction is not
/// preserved — both are accepted as line terminators (lax inbound
/// framing, per spec).
pub fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    while matches!(buf.last(), Some(b'\n' | b'\r' | b' ' | b'\t')) {
        buf.pop();
    }
    Ok(Some(buf))
}

/// Decode a raw line into a JSON object, producing the same error taxonomy
/// as the source: non-UTF-8 bytes, then non-JSON text, then non-object
/// JSON are all distinct but wire-equivalent failures.
pub fn decode_line(line: &[u8]) -> Result<Value, BrokerError> {
    let text = std::str::from_utf8(line).map_err(|_| BrokerError::Utf8)?;
    let value: Value = serde_json::from_str(text).map_err(|_| BrokerError::Json)?;
    if !value.is_object() {
        return Err(BrokerError::Json);
    }
    Ok(value)
}

/// Write a single JSON reply followed by `\r\n`.
pub fn write_reply<W: Write>(writer: &mut W, value: &Value) -> io::Result<()> {
    writer.write_all(value.to_string().as_bytes())?;
    writer.write_all(b"\r\n")?;
    writer.flush()
}
