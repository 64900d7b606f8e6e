//! Server-Sent Events (SSE) parser with line buffering.
//!
//! SSE lines can span multiple TCP packets, and so can a multi-byte UTF-8
//! character, so bytes are buffered until a full line is available.

use futures::{Stream, StreamExt};

use crate::error::TransportError;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// The event type (from "event:" line)
    pub event: Option<String>,
    /// The event data (from "data:" lines)
    pub data: String,
    /// The event ID (from "id:" line)
    pub id: Option<String>,
}

impl SseEvent {
    /// Whether this event carries a JSON-RPC message.
    pub fn is_message(&self) -> bool {
        matches!(self.event.as_deref(), None | Some("message"))
    }
}

/// Largest event (buffered line plus accumulated data) a parser accepts.
pub const MAX_EVENT_SIZE: usize = 8 * 1024 * 1024;

/// SSE parser that handles line buffering across TCP packets.
#[derive(Debug)]
pub struct SseParser {
    buffer: Vec<u8>,
    /// Leading bytes of `buffer` already known to hold no newline.
    scanned: usize,
    max_event_size: usize,
    current_event: Option<String>,
    current_data: Vec<String>,
    data_len: usize,
    current_id: Option<String>,
}

impl Default for SseParser {
    fn default() -> Self {
        Self::with_max_event_size(MAX_EVENT_SIZE)
    }
}

impl SseParser {
    /// Create a new SSE parser.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_event_size(max_event_size: usize) -> Self {
        Self {
            buffer: Vec::new(),
            scanned: 0,
            max_event_size: max_event_size.max(1),
            current_event: None,
            current_data: Vec::new(),
            data_len: 0,
            current_id: None,
        }
    }

    /// Feed bytes into the parser and return any complete events.
    ///
    /// Fails once an event grows past the size limit; the partial event is
    /// discarded.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<SseEvent>, TransportError> {
        self.buffer.extend_from_slice(bytes);

        let mut events = Vec::new();
        let mut consumed = 0;
        let mut search_from = self.scanned;
        while let Some(offset) = self.buffer[search_from..].iter().position(|b| *b == b'\n') {
            let newline = search_from + offset;
            let line = String::from_utf8_lossy(&self.buffer[consumed..newline]).into_owned();
            consumed = newline + 1;
            search_from = consumed;
            self.process_line(line.trim_end_matches('\r'), &mut events);
        }
        self.buffer.drain(..consumed);
        self.scanned = self.buffer.len();

        if self.buffer.len() + self.data_len > self.max_event_size {
            self.reset();
            return Err(TransportError::MalformedMessage(format!(
                "event exceeds {} bytes",
                self.max_event_size
            )));
        }
        Ok(events)
    }

    fn process_line(&mut self, line: &str, events: &mut Vec<SseEvent>) {
        if line.is_empty() {
            if let Some(event) = self.finalize_event() {
                events.push(event);
            }
            return;
        }

        match Self::parse_field(line) {
            Some(("event", value)) => self.current_event = Some(value.to_string()),
            Some(("data", value)) => {
                self.data_len += value.len();
                self.current_data.push(value.to_string());
            }
            Some(("id", value)) => self.current_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.scanned = 0;
        self.current_event = None;
        self.current_data.clear();
        self.data_len = 0;
        self.current_id = None;
    }

    fn parse_field(line: &str) -> Option<(&str, &str)> {
        // Lines starting with : are comments (keep-alives).
        if line.starts_with(':') {
            return None;
        }

        match line.split_once(':') {
            Some((field, value)) => Some((field, value.strip_prefix(' ').unwrap_or(value))),
            None => Some((line, "")),
        }
    }

    fn finalize_event(&mut self) -> Option<SseEvent> {
        if self.current_data.is_empty() {
            self.current_event = None;
            self.current_id = None;
            return None;
        }

        let event = SseEvent {
            event: self.current_event.take(),
            data: self.current_data.join("\n"),
            id: self.current_id.take(),
        };
        self.current_data.clear();
        self.data_len = 0;
        Some(event)
    }
}

/// Pull the next non-empty batch of events from a byte stream.
///
/// Returns `None` once the stream ends.
pub(crate) async fn next_events<S, B>(
    stream: &mut S,
    parser: &mut SseParser,
) -> Option<Result<Vec<SseEvent>, TransportError>>
where
    S: Stream<Item = Result<B, reqwest::Error>> + Unpin,
    B: AsRef<[u8]>,
{
    loop {
        match stream.next().await? {
            Ok(chunk) => match parser.feed(chunk.as_ref()) {
                Ok(events) if events.is_empty() => {}
                Ok(events) => return Some(Ok(events)),
                Err(e) => return Some(Err(e)),
            },
            Err(e) => return Some(Err(e.into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"data: {\"jsonrpc\":\"2.0\"}\n\n").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"jsonrpc":"2.0"}"#);
        assert!(events[0].is_message());
    }

    #[test]
    fn test_endpoint_event() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"event: endpoint\ndata: /messages?session=abc\n\n").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("endpoint"));
        assert_eq!(events[0].data, "/messages?session=abc");
        assert!(!events[0].is_message());
    }

    #[test]
    fn test_split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.feed(b"data: {\"id\":").unwrap().is_empty());
        assert!(parser.feed(b" 1}\n").unwrap().is_empty());

        let events = parser.feed(b"\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, r#"{"id": 1}"#);
    }

    #[test]
    fn test_multibyte_character_split_across_chunks() {
        let mut parser = SseParser::new();
        let bytes = "data: caf\u{e9}\n\n".as_bytes();
        let split = bytes.iter().position(|b| *b == 0xc3).unwrap() + 1;

        assert!(parser.feed(&bytes[..split]).unwrap().is_empty());
        let events = parser.feed(&bytes[split..]).unwrap();
        assert_eq!(events[0].data, "caf\u{e9}");
    }

    #[test]
    fn test_multiline_data_and_id() {
        let mut parser = SseParser::new();
        let events = parser.feed(b"id: 7\ndata: line one\ndata: line two\n\n").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.as_deref(), Some("7"));
        assert_eq!(events[0].data, "line one\nline two");
    }

    #[test]
    fn test_comments_and_crlf() {
        let mut parser = SseParser::new();
        let events = parser.feed(b": keep-alive\r\n\r\ndata: hello\r\n\r\n").unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "hello");
    }

    #[test]
    fn test_unterminated_line_hits_size_limit() {
        let mut parser = SseParser::with_max_event_size(16);
        assert!(parser.feed(b"data: 0123456").unwrap().is_empty());

        let result = parser.feed(b"789abcdef");
        assert!(matches!(result, Err(TransportError::MalformedMessage(_))));

        // The oversized event is dropped and parsing resumes cleanly.
        let events = parser.feed(b"data: ok\n\n").unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "ok");
    }

    #[test]
    fn test_accumulated_data_hits_size_limit() {
        let mut parser = SseParser::with_max_event_size(12);
        assert!(parser.feed(b"data: 12345678\n").unwrap().is_empty());
        assert!(parser.feed(b"data: 12345678\n").is_err());
    }

    #[test]
    fn test_completed_events_reset_size_accounting() {
        let mut parser = SseParser::with_max_event_size(16);
        for _ in 0..10 {
            let events = parser.feed(b"data: 12345678\n\n").unwrap();
            assert_eq!(events.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_next_events_reports_oversized_event() {
        let chunks: Vec<Result<&'static [u8], reqwest::Error>> =
            vec![Ok(b"data: 0123456789abcdef0123".as_slice())];
        let mut stream = futures::stream::iter(chunks);
        let mut parser = SseParser::with_max_event_size(16);

        let result = next_events(&mut stream, &mut parser).await.unwrap();
        assert!(matches!(result, Err(TransportError::MalformedMessage(_))));
    }

    #[tokio::test]
    async fn test_next_events_skips_partial_chunks() {
        let chunks: Vec<Result<&'static [u8], reqwest::Error>> = vec![
            Ok(b"data: fir".as_slice()),
            Ok(b"st\n\ndata: second\n\n".as_slice()),
        ];
        let mut stream = futures::stream::iter(chunks);
        let mut parser = SseParser::new();

        let batch = next_events(&mut stream, &mut parser).await.unwrap().unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[1].data, "second");
        assert!(next_events(&mut stream, &mut parser).await.is_none());
    }
}
