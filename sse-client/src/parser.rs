//! Subscriber-side `text/event-stream` framing.
//!
//! [`LineSplitter`] turns the raw body chunks into whole lines; [`FrameParser`] folds those
//! lines into events, one per blank-line boundary.

/// One dispatched event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
    pub id: Option<String>,
}

/// Accumulates `event:`, `data:` and `id:` fields until a blank line dispatches them.
///
/// Successive `data:` lines are concatenated without a separator. State only resets at a
/// dispatch boundary, so a stream that never sends a blank line keeps accumulating.
#[derive(Debug, Default)]
pub struct FrameParser {
    event: String,
    data: String,
    id: Option<String>,
}

impl FrameParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one line (without its terminator). Returns an event at a dispatch boundary.
    pub fn process_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.starts_with(':') {
            return None;
        }
        if line.trim().is_empty() {
            if self.data.trim().is_empty() {
                self.reset();
                return None;
            }
            let event = SseEvent {
                event: std::mem::take(&mut self.event),
                data: std::mem::take(&mut self.data),
                id: self.id.take(),
            };
            return Some(event);
        }

        if let Some(event) = line.strip_prefix("event:") {
            self.event = event.trim().to_string();
        } else if let Some(data) = line.strip_prefix("data:") {
            self.data.push_str(data.trim());
        } else if let Some(id) = line.strip_prefix("id:") {
            self.id = Some(id.trim().to_string());
        }
        None
    }

    fn reset(&mut self) {
        self.event.clear();
        self.data.clear();
        self.id = None;
    }
}

/// Reassembles lines from arbitrarily split body chunks. Strips `\r` before `\n`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                if self.pending.last() == Some(&b'\r') {
                    self.pending.pop();
                }
                lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                self.pending.clear();
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// The unterminated tail left when the stream ends, if any.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut FrameParser, lines: &[&str]) -> Vec<SseEvent> {
        lines
            .iter()
            .filter_map(|line| parser.process_line(line))
            .collect()
    }

    #[test]
    fn multi_line_data_is_joined_without_separator() {
        let mut parser = FrameParser::new();

        let events = feed(
            &mut parser,
            &["event:red", "id:1", "data:[10,", "data:11,", "data:12]", ""],
        );

        assert_eq!(
            events,
            vec![SseEvent {
                event: "red".to_string(),
                data: "[10,11,12]".to_string(),
                id: Some("1".to_string()),
            }]
        );
    }

    #[test]
    fn comments_then_blank_line_dispatch_nothing() {
        let mut parser = FrameParser::new();

        let events = feed(&mut parser, &[":Accepted", ":Ping", ""]);

        assert!(events.is_empty());
    }

    #[test]
    fn event_without_data_is_dropped_and_state_reset() {
        let mut parser = FrameParser::new();

        let events = feed(
            &mut parser,
            &["event:orphan", "id:9", "  ", "event:next", "data:x", ""],
        );

        assert_eq!(
            events,
            vec![SseEvent {
                event: "next".to_string(),
                data: "x".to_string(),
                id: None,
            }]
        );
    }

    #[test]
    fn fields_are_trimmed_and_unknown_lines_ignored() {
        let mut parser = FrameParser::new();

        let events = feed(
            &mut parser,
            &["event: blue ", "retry:3000", "weird", "id: 5", "data: payload ", ""],
        );

        assert_eq!(events[0].event, "blue");
        assert_eq!(events[0].data, "payload");
        assert_eq!(events[0].id.as_deref(), Some("5"));
    }

    #[test]
    fn consecutive_events_do_not_leak_state() {
        let mut parser = FrameParser::new();

        let events = feed(
            &mut parser,
            &["event:a", "id:1", "data:one", "", "data:two", ""],
        );

        assert_eq!(events.len(), 2);
        assert_eq!(events[1].event, "");
        assert_eq!(events[1].id, None);
        assert_eq!(events[1].data, "two");
    }

    #[test]
    fn lines_are_reassembled_across_chunks() {
        let mut splitter = LineSplitter::new();

        assert!(splitter.push(b"event:r").is_empty());
        assert_eq!(splitter.push(b"ed\r\ndata:1\n\nda"), vec!["event:red", "data:1", ""]);
        assert_eq!(splitter.push(b"ta:2"), Vec::<String>::new());
        assert_eq!(splitter.finish().as_deref(), Some("data:2"));
        assert_eq!(splitter.finish(), None);
    }
}
