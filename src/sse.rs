//! Incremental Server-Sent Events parsing.
//!
//! The parser consumes raw response-body chunks and yields complete events.
//! Bytes are buffered and only decoded at line boundaries, so multi-byte
//! UTF-8 sequences split across chunks never corrupt a line. Lines may be
//! terminated by `\n`, `\r\n`, or a bare `\r`.

/// A parsed Server-Sent Event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    /// Event ID for resumption support
    pub id: Option<String>,
    /// Event type (servers default to "message" when absent)
    pub event: Option<String>,
    /// Event data, repeated `data:` lines joined with `\n`
    pub data: String,
    /// Server-suggested retry interval in milliseconds
    pub retry: Option<u64>,
}

/// Streaming SSE parser.
///
/// Feed it body chunks as they arrive; each call returns the events that
/// became complete. State carries over between calls, including a partial
/// line and a CR seen at the very end of the previous chunk.
#[derive(Debug, Default)]
pub struct SseParser {
    buf: Vec<u8>,
    pending_cr: bool,
    id: Option<String>,
    event: Option<String>,
    data: Vec<String>,
    retry: Option<u64>,
}

impl SseParser {
    /// Create a new parser.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and collect any events it completes.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut input = chunk;

        // A CR at the end of the previous chunk may be the first half of a
        // CRLF pair; swallow the LF that opens this chunk.
        if self.pending_cr {
            self.pending_cr = false;
            if input.first() == Some(&b'\n') {
                input = &input[1..];
            }
        }

        self.buf.extend_from_slice(input);

        let mut events = Vec::new();
        let mut start = 0;
        let mut i = 0;

        while i < self.buf.len() {
            match self.buf[i] {
                b'\n' => {
                    let line = self.buf[start..i].to_vec();
                    if let Some(ev) = self.handle_line(&line) {
                        events.push(ev);
                    }
                    i += 1;
                    start = i;
                }
                b'\r' => {
                    let line = self.buf[start..i].to_vec();
                    if let Some(ev) = self.handle_line(&line) {
                        events.push(ev);
                    }
                    if i + 1 < self.buf.len() {
                        // Consume the LF of a CRLF pair if present.
                        i += if self.buf[i + 1] == b'\n' { 2 } else { 1 };
                    } else {
                        self.pending_cr = true;
                        i += 1;
                    }
                    start = i;
                }
                _ => i += 1,
            }
        }

        self.buf.drain(..start);
        events
    }

    /// Handle one complete line; a blank line dispatches the current event.
    fn handle_line(&mut self, line: &[u8]) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }

        let line = String::from_utf8_lossy(line);

        if line.starts_with(':') {
            // Comment; servers use these as keepalives.
            return None;
        }

        let (field, value) = match line.find(':') {
            Some(pos) => {
                let value = &line[pos + 1..];
                // The grammar strips exactly one leading space.
                (&line[..pos], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line.as_ref(), ""),
        };

        match field {
            "id" => self.id = Some(value.to_string()),
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "retry" => {
                if let Ok(ms) = value.parse() {
                    self.retry = Some(ms);
                }
            }
            _ => {}
        }

        None
    }

    /// Emit the accumulated event, if it carried any data.
    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.id = None;
            self.event = None;
            self.retry = None;
            return None;
        }

        Some(SseEvent {
            id: self.id.take(),
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
            retry: self.retry.take(),
        })
    }
}
