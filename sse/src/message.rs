//! `text/event-stream` wire framing.

/// Media type of an event stream response.
pub const CONTENT_TYPE: &str = "text/event-stream";

/// Comment frame written to an idle subscriber to keep intermediaries from timing out.
pub const PING: &str = ":Ping\n";

/// Comment frame written once, right after the handshake headers.
pub const ACCEPTED: &str = ":Accepted\n";

/// One published event, ready to be encoded once and written to many subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub event_type: String,
    pub id: Option<String>,
    pub data: String,
}

impl Message {
    pub fn new(event_type: &str, data: &str, id: Option<&str>) -> Self {
        Self {
            event_type: event_type.trim().to_string(),
            id: id
                .filter(|id| !id.trim().is_empty())
                .map(|id| id.to_string()),
            data: data.to_string(),
        }
    }

    /// Encodes the event as a single frame:
    ///
    /// ```text
    /// event:<type>
    /// id:<id>          (only when an id is present)
    /// data:<line>      (one per "\n"-separated segment of the payload)
    ///                  (blank line terminates the event)
    /// ```
    pub fn encode(&self) -> String {
        let mut frame = format!("event:{}\n", self.event_type);
        if let Some(id) = &self.id {
            frame.push_str(&format!("id:{id}\n"));
        }
        for line in data_lines(&self.data) {
            frame.push_str(&format!("data:{line}\n"));
        }
        frame.push('\n');
        frame
    }
}

// Trailing empty segments are dropped, but an empty payload still yields one data line.
fn data_lines(data: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = data.split('\n').collect();
    while lines.len() > 1 && lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines
}
