//! # Server-Sent Events Decoder
//!
//! Incremental `text/event-stream` parser. Network chunks do not line up with
//! message boundaries, so bytes are buffered until a full line is
//! available and a message is emitted on every blank line.
//!
//! Supported fields: `event`, `data` (multi-line, joined with `\n`), `id`
//! and `retry`. Lines starting with `:` are comments (keep-alives).
//!
//! A line longer than `MAX_LINE_BYTES` is discarded together with the rest
//! of its message, so a misbehaving upstream cannot grow the buffer forever.

/// Longest line kept in memory while waiting for its newline.
pub const MAX_LINE_BYTES: usize = 4 * 1024 * 1024;

/// One decoded SSE message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseMessage {
    /// `event:` field; `None` means the default `message` type.
    pub event: Option<String>,
    pub data: String,
    /// `id:` field carried by this message, if any.
    pub id: Option<String>,
    /// Reconnection delay in milliseconds requested by the server.
    pub retry: Option<u64>,
}

impl SseMessage {
    /// Plain data messages (no `event:` or `event: message`).
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Incremental decoder state.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
    retry: Option<u64>,
    last_event_id: Option<String>,
    /// The bytes before the next newline belong to an oversized line.
    truncated_line: bool,
    /// Drop lines until the blank line that ends the current message.
    skipping: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last `id:` seen on the stream; sent back as `Last-Event-ID` on reconnect.
    pub fn last_event_id(&self) -> Option<&str> {
        self.last_event_id.as_deref()
    }

    /// Feeds one network chunk and returns every message it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseMessage> {
        self.buf.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut start = 0;
        while let Some(pos) = self.buf[start..].iter().position(|b| *b == b'\n') {
            let end = start + pos;
            let mut line = &self.buf[start..end];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            // '\n' never occurs inside a multi-byte sequence, so a full line is valid to decode.
            let line = String::from_utf8_lossy(line).into_owned();
            start = end + 1;
            if self.truncated_line {
                self.truncated_line = false;
                continue;
            }
            if let Some(msg) = self.process_line(&line) {
                out.push(msg);
            }
        }
        self.buf.drain(..start);

        if self.buf.len() > MAX_LINE_BYTES {
            log::warn!(
                "SSE line exceeds {} bytes without a newline; dropping the message",
                MAX_LINE_BYTES
            );
            self.buf.clear();
            self.truncated_line = true;
            self.skipping = true;
        }
        out
    }

    fn process_line(&mut self, line: &str) -> Option<SseMessage> {
        if self.skipping {
            if line.is_empty() {
                self.skipping = false;
                self.event = None;
                self.data.clear();
                self.id = None;
                self.retry = None;
            }
            return None;
        }
        if line.is_empty() {
            return self.flush();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => {
                if !value.contains('\0') {
                    self.id = Some(value.to_string());
                    self.last_event_id = Some(value.to_string());
                }
            }
            "retry" => {
                if let Ok(ms) = value.trim().parse::<u64>() {
                    self.retry = Some(ms);
                }
            }
            other => log::trace!("Ignoring unknown SSE field '{}'", other),
        }
        None
    }

    fn flush(&mut self) -> Option<SseMessage> {
        let event = self.event.take();
        let id = self.id.take();
        let retry = self.retry.take();
        if self.data.is_empty() {
            // A retry-only block still matters to the caller.
            return retry.map(|retry| SseMessage {
                retry: Some(retry),
                ..Default::default()
            });
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseMessage { event, data, id, retry })
    }
}
