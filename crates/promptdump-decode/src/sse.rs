//! Server-Sent Events (SSE) parsing

/// A single SSE event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

impl SseEvent {
    /// OpenAI style end-of-stream marker
    pub fn is_done(&self) -> bool {
        self.data == "[DONE]"
    }
}

/// Incremental SSE parser for streaming response bodies
///
/// Raw bytes are buffered until an event is complete, so chunks may split
/// UTF-8 sequences and `\r\n` line endings anywhere.
pub struct SseParser {
    buffer: Vec<u8>,
    events: Vec<SseEvent>,
}

impl SseParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Add data to the parser
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
        self.parse_buffer();
    }

    /// Parse whatever is left in the buffer as a final event. Bodies often
    /// end without the blank line that terminates the last event.
    pub fn finish(&mut self) {
        let rest = std::mem::take(&mut self.buffer);
        self.push_event(&rest);
    }

    pub fn events(&self) -> &[SseEvent] {
        &self.events
    }

    pub fn take_events(&mut self) -> Vec<SseEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_done(&self) -> bool {
        self.events.iter().any(SseEvent::is_done)
    }

    fn parse_buffer(&mut self) {
        while let Some((end, next)) = event_boundary(&self.buffer) {
            let raw: Vec<u8> = self.buffer.drain(..next).collect();
            self.push_event(&raw[..end]);
        }
    }

    fn push_event(&mut self, raw: &[u8]) {
        if let Some(event) = parse_event(&String::from_utf8_lossy(raw)) {
            self.events.push(event);
        }
    }
}

/// Find the blank line ending the first event. Returns the length of the
/// event including its last line terminator, and the offset just past the
/// blank line. A `\r` at the very end of the buffer may still be followed
/// by `\n`, so it never completes a boundary.
fn event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    (0..buf.len()).find_map(|i| {
        if buf[i] != b'\n' {
            return None;
        }
        let rest = &buf[i + 1..];
        if rest.starts_with(b"\n") {
            Some((i + 1, i + 2))
        } else if rest.starts_with(b"\r\n") {
            Some((i + 1, i + 3))
        } else {
            None
        }
    })
}

impl Default for SseParser {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a complete body into its events
pub fn parse_events(body: &[u8]) -> Vec<SseEvent> {
    let mut parser = SseParser::new();
    parser.feed(body);
    parser.finish();
    parser.take_events()
}

fn parse_event(text: &str) -> Option<SseEvent> {
    let mut event = None;
    let mut data_lines = Vec::new();
    let mut id = None;
    let mut retry = None;

    for line in text.lines() {
        if let Some(rest) = line.strip_prefix("event:") {
            event = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            data_lines.push(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("id:") {
            id = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("retry:") {
            retry = rest.trim().parse().ok();
        }
    }

    if data_lines.is_empty() {
        return None;
    }

    Some(SseEvent {
        event,
        data: data_lines.join("\n"),
        id,
        retry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_events_split_across_feeds() {
        let mut parser = SseParser::new();
        parser.feed(b"event: content_block_delta\nda");
        assert!(parser.events().is_empty());
        parser.feed(b"ta: {\"a\":1}\n\ndata: [DONE]\n\n");

        let events = parser.take_events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, "{\"a\":1}");
        assert!(events[1].is_done());
    }

    #[test]
    fn test_crlf_separators() {
        let events = parse_events(b"id: 7\r\nretry: 3000\r\ndata: one\r\n\r\ndata: two\r\n\r\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].retry, Some(3000));
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn test_utf8_split_across_feeds() {
        let text = "data: caf\u{e9} \u{1f600}\n\n".as_bytes();
        let mut parser = SseParser::new();
        // split inside the two-byte and four-byte sequences
        let e = text.iter().position(|&b| b == 0xc3).unwrap() + 1;
        let emoji = text.iter().position(|&b| b == 0xf0).unwrap() + 2;
        parser.feed(&text[..e]);
        parser.feed(&text[e..emoji]);
        parser.feed(&text[emoji..]);

        let events = parser.take_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "caf\u{e9} \u{1f600}");
    }

    #[test]
    fn test_crlf_blank_line_split_across_feeds() {
        let mut parser = SseParser::new();
        parser.feed(b"data: a\r\n\r");
        assert!(parser.events().is_empty());
        parser.feed(b"\n");
        assert_eq!(parser.events().len(), 1);
        assert_eq!(parser.events()[0].data, "a");

        parser.feed(b"data: b\r");
        parser.feed(b"\n\r\ndata: c\n");
        parser.feed(b"\n");
        let events = parser.take_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[1].data, "b");
        assert_eq!(events[2].data, "c");
    }

    #[test]
    fn test_unterminated_last_event() {
        let mut parser = SseParser::new();
        parser.feed(b"data: first\n\ndata: last");
        assert_eq!(parser.events().len(), 1);
        parser.finish();
        assert_eq!(parser.events()[1].data, "last");
    }

    #[test]
    fn test_comments_and_multiline_data() {
        let events = parse_events(b": keep-alive\n\ndata: a\ndata: b\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "a\nb");
    }
}
