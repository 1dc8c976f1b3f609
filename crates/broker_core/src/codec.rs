use thiserror::Error;

use crate::Message;

/// Per-line codec failures. Decode failures are recoverable: the reader logs the line,
/// discards it, and keeps reading the channel.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("encoded frame would embed a raw newline")]
    EmbeddedNewline,
    #[error("failed to parse frame: {source}: `{line}`")]
    Parse {
        line: String,
        #[source]
        source: serde_json::Error,
    },
}

/// How much of an unparseable line is kept in the error (and therefore in logs).
const PARSE_ERROR_CONTEXT: usize = 256;

/// Encodes one message as a single line, without the trailing newline.
///
/// `serde_json` escapes control characters inside strings, so a raw `\n` in the output
/// would mean a malformed envelope; it is rejected rather than silently splitting the
/// frame across two lines.
pub fn encode_frame(msg: &Message) -> Result<String, CodecError> {
    let line = serde_json::to_string(msg).map_err(CodecError::Encode)?;
    if line.contains('\n') {
        return Err(CodecError::EmbeddedNewline);
    }
    Ok(line)
}

/// Decodes one line into a message.
///
/// Returns `Ok(None)` for blank lines; strips a trailing `\r` so CRLF-writing children
/// interoperate. A parse failure carries a truncated copy of the offending line.
pub fn decode_frame(line: &str) -> Result<Option<Message>, CodecError> {
    let line = line.strip_suffix('\r').unwrap_or(line);
    if line.trim().is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some).map_err(|source| CodecError::Parse {
        line: truncate(line, PARSE_ERROR_CONTEXT),
        source,
    })
}

fn truncate(line: &str, max: usize) -> String {
    if line.len() <= max {
        return line.to_string();
    }
    let mut end = max;
    while !line.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &line[..end])
}
