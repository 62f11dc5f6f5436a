use crate::types::{ChatEvent, ToolCall, ToolOutput, ToolPayload};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::collections::VecDeque;
use std::fmt::Display;
use tracing::{debug, warn};

// One line of the assistant's NDJSON response.
#[derive(Deserialize)]
struct WireEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_name: Option<String>,
    #[serde(default)]
    tool_args: Value,
    #[serde(default)]
    output: Value,
    #[serde(default)]
    tool_call_id: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCall>>,
}

/// Decodes a single NDJSON line into a [`ChatEvent`].
///
/// Blank lines yield `None`. A line that is not valid JSON, or whose `type`
/// is not one the widget understands, becomes an `Error` event carrying the
/// raw line so the rest of the stream keeps flowing.
pub fn parse_event_line(line: &str) -> Option<ChatEvent> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }

    let wire = match serde_json::from_str::<WireEvent>(trimmed) {
        Ok(wire) => wire,
        Err(err) => {
            warn!(%err, line = trimmed, "malformed response line");
            return Some(ChatEvent::Error {
                text: format!("Failed to parse response: {trimmed}"),
            });
        }
    };

    let event = match wire.kind.as_str() {
        "token" => ChatEvent::Token {
            text: wire.content.unwrap_or_default(),
        },
        "final_response" => ChatEvent::FinalResponse {
            text: wire.content.unwrap_or_default(),
        },
        "tool_output" => {
            let name = wire.tool_name.unwrap_or_default();
            let output = ToolPayload::from_output(&name, wire.output);
            ChatEvent::ToolOutput(ToolOutput {
                name,
                args: wire.tool_args,
                output,
                call_id: wire.tool_call_id,
            })
        }
        "agent_tool_call" => ChatEvent::AgentToolCall {
            calls: wire.tool_calls.unwrap_or_default(),
        },
        "error" => ChatEvent::Error {
            text: format!(
                "Error: {}",
                wire.content.as_deref().unwrap_or("Unknown error")
            ),
        },
        other => {
            warn!(kind = other, line = trimmed, "unrecognized event type");
            ChatEvent::Error {
                text: format!("Failed to parse response: {trimmed}"),
            }
        }
    };
    debug!(kind = wire.kind.as_str(), "ingested event");
    Some(event)
}

/// Text shown in the conversation when the transport itself fails.
pub fn transport_error_text(err: impl Display) -> String {
    format!("Network or API error: {err}")
}

/// Incremental NDJSON decoder.
///
/// Bytes are pushed in whatever chunks the transport delivers. A multi-byte
/// character split across chunks is held back until it completes, and an
/// unterminated trailing line stays buffered until more data or
/// [`StreamIngestor::finish`].
#[derive(Debug, Default)]
pub struct StreamIngestor {
    pending: Vec<u8>,
    buffer: String,
}

impl StreamIngestor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns the events for every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<ChatEvent> {
        self.decode(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            if let Some(event) = parse_event_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Parses whatever is left once the stream has closed.
    pub fn finish(&mut self) -> Option<ChatEvent> {
        if !self.pending.is_empty() {
            let tail = std::mem::take(&mut self.pending);
            self.buffer.push_str(&String::from_utf8_lossy(&tail));
        }
        let rest = std::mem::take(&mut self.buffer);
        parse_event_line(&rest)
    }

    fn decode(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.pending);
        let mut rest = bytes.as_slice();

        loop {
            match std::str::from_utf8(rest) {
                Ok(text) => {
                    self.buffer.push_str(text);
                    return;
                }
                Err(err) => {
                    let (valid, after) = rest.split_at(err.valid_up_to());
                    self.buffer.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(invalid) => {
                            self.buffer.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[invalid..];
                        }
                        None => {
                            // incomplete character at the end of the chunk
                            self.pending = after.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }
}

struct IngestState<S> {
    body: S,
    ingestor: StreamIngestor,
    queue: VecDeque<ChatEvent>,
    done: bool,
}

/// Turns a response body into a lazy, ordered stream of chat events.
///
/// The stream ends when the body does. A transport error mid-body is
/// reported as one final `Error` event.
pub fn ingest<S, B, E>(body: S) -> impl Stream<Item = ChatEvent>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = IngestState {
        body,
        ingestor: StreamIngestor::new(),
        queue: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.queue.pop_front() {
                return Some((event, state));
            }
            if state.done {
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let events = state.ingestor.push(chunk.as_ref());
                    state.queue.extend(events);
                }
                Some(Err(err)) => {
                    warn!(%err, "response body failed mid-stream");
                    state.queue.push_back(ChatEvent::Error {
                        text: transport_error_text(err),
                    });
                    state.done = true;
                }
                None => {
                    state.queue.extend(state.ingestor.finish());
                    state.done = true;
                }
            }
        }
    })
}
