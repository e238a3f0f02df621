//! Newline-delimited framing over async byte streams.

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::jsonrpc::Message;

/// One unit read off the wire.
#[derive(Debug)]
pub enum Frame {
    Message(Message),
    /// A non-empty line that did not decode. Callers log and drop it.
    Malformed { line: String, reason: String },
}

/// Reads newline-terminated frames, skipping blank lines.
pub struct FrameReader<R> {
    inner: BufReader<R>,
    line: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            inner: BufReader::new(reader),
            line: Vec::new(),
        }
    }

    /// Wait until at least one byte is readable. Returns `false` on EOF.
    pub async fn wait_readable(&mut self) -> std::io::Result<bool> {
        Ok(!self.inner.fill_buf().await?.is_empty())
    }

    /// Next frame, or `None` at end of stream. Only transport failures are
    /// errors; undecodable bytes come back as [`Frame::Malformed`].
    pub async fn next(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            self.line.clear();
            if self.inner.read_until(b'\n', &mut self.line).await? == 0 {
                return Ok(None);
            }
            let text = match std::str::from_utf8(&self.line) {
                Ok(text) => text,
                Err(e) => {
                    return Ok(Some(Frame::Malformed {
                        line: truncate(String::from_utf8_lossy(&self.line).trim(), 200),
                        reason: format!("invalid UTF-8: {e}"),
                    }));
                }
            };
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some(match Message::parse(trimmed) {
                Ok(m) => Frame::Message(m),
                Err(reason) => Frame::Malformed {
                    line: truncate(trimmed, 200),
                    reason,
                },
            }));
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((i, _)) => format!("{}…", &s[..i]),
        None => s.to_string(),
    }
}

/// Encode a message as one line, including the terminator.
pub fn encode(message: &Message) -> String {
    encode_value(&message.to_value())
}

pub fn encode_value(value: &Value) -> String {
    // serde_json never emits raw newlines inside a compact document.
    let mut line = value.to_string();
    line.push('\n');
    line
}

/// Write one framed message and flush.
pub async fn write_message<W: AsyncWrite + Unpin>(
    writer: &mut W,
    message: &Message,
) -> std::io::Result<()> {
    writer.write_all(encode(message).as_bytes()).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn splits_lines_and_flags_malformed() {
        let input = b"{\"jsonrpc\":\"2.0\",\"method\":\"a\"}\n\n  \nnot json\n{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n";
        let mut reader = FrameReader::new(&input[..]);

        assert!(matches!(reader.next().await.unwrap(), Some(Frame::Message(Message::Notification { .. }))));
        assert!(matches!(reader.next().await.unwrap(), Some(Frame::Malformed { .. })));
        assert!(matches!(reader.next().await.unwrap(), Some(Frame::Message(Message::Response { .. }))));
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_utf8_line_is_malformed_not_fatal() {
        let input = b"\xff\xfe garbage\n{\"jsonrpc\":\"2.0\",\"method\":\"notifications/message\"}\n";
        let mut reader = FrameReader::new(&input[..]);

        match reader.next().await.unwrap() {
            Some(Frame::Malformed { reason, .. }) => assert!(reason.contains("UTF-8")),
            other => panic!("expected malformed frame, got {other:?}"),
        }
        assert!(matches!(reader.next().await.unwrap(), Some(Frame::Message(Message::Notification { .. }))));
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn final_line_without_terminator_is_read() {
        let input = b"{\"jsonrpc\":\"2.0\",\"method\":\"x\"}";
        let mut reader = FrameReader::new(&input[..]);
        assert!(reader.wait_readable().await.unwrap());
        assert!(matches!(reader.next().await.unwrap(), Some(Frame::Message(_))));
        assert!(!reader.wait_readable().await.unwrap());
    }

    #[tokio::test]
    async fn encoded_message_is_single_line() {
        let msg = Message::request(1, "tools/call", json!({"arguments": {"text": "a\nb"}}));
        let line = encode(&msg);
        assert_eq!(line.matches('\n').count(), 1);
        let mut out = Vec::new();
        write_message(&mut out, &msg).await.unwrap();
        assert_eq!(out, line.as_bytes());
    }
}
