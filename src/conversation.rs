//! Ordered chat log and the events that mutate it.
//!
//! During a turn the store may hold one *open* agent message. Tokens
//! accumulate into it and a final response overwrites and closes it. A tool
//! event takes over the open message only while it is still empty, otherwise
//! it is appended; either way the open message is closed so later tokens start
//! a new agent message below the tool entry. Errors always append.
//!
//! Every mutation, including the start and end of a request, publishes a
//! [`ConversationSnapshot`] over a `watch` channel. A view holding the
//! receiver can render streamed text and the loading state while a send is
//! still running, and scroll to the latest entry when the revision moves.

use crate::types::{ChatEvent, ChatMessage, MessageKind};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// What a view renders: the log and whether a response is in flight.
#[derive(Clone, Debug, PartialEq)]
pub struct ConversationSnapshot {
    pub revision: u64,
    pub messages: Arc<[ChatMessage]>,
    pub is_loading: bool,
}

impl ConversationSnapshot {
    fn empty() -> Self {
        Self {
            revision: 0,
            messages: Arc::from(Vec::new()),
            is_loading: false,
        }
    }
}

pub struct ConversationStore {
    messages: Vec<ChatMessage>,
    in_flight: bool,
    open_agent: Option<usize>,
    next_seq: u64,
    revision: u64,
    changes: watch::Sender<ConversationSnapshot>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    pub fn new() -> Self {
        let (changes, _) = watch::channel(ConversationSnapshot::empty());
        Self {
            messages: Vec::new(),
            in_flight: false,
            open_agent: None,
            next_seq: 0,
            revision: 0,
            changes,
        }
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight
    }

    /// Receives a fresh snapshot after every mutation.
    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.changes.subscribe()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            revision: self.revision,
            messages: Arc::from(self.messages.as_slice()),
            is_loading: self.in_flight,
        }
    }

    /// Appends the user's message. Returns `false` without touching the log
    /// when the text is blank or a response is still in flight.
    pub fn append_user(&mut self, text: &str) -> bool {
        let text = text.trim();
        if text.is_empty() || self.in_flight {
            return false;
        }
        self.push(MessageKind::User {
            content: text.to_string(),
        });
        self.notify();
        true
    }

    pub fn begin_request(&mut self) {
        self.in_flight = true;
        self.notify();
    }

    pub fn finish_request(&mut self) {
        self.in_flight = false;
        self.open_agent = None;
        self.notify();
    }

    /// Opens an empty agent message for streamed tokens to fill in.
    pub fn begin_agent_turn(&mut self) {
        let index = self.push(MessageKind::Agent {
            content: String::new(),
        });
        self.open_agent = Some(index);
        self.notify();
    }

    pub fn apply(&mut self, event: ChatEvent) {
        match event {
            ChatEvent::Token { text } => {
                if let Some(content) = self.open_agent_content() {
                    content.push_str(&text);
                } else {
                    let index = self.push(MessageKind::Agent { content: text });
                    self.open_agent = Some(index);
                }
            }
            ChatEvent::FinalResponse { text } => {
                if let Some(content) = self.open_agent_content() {
                    *content = text;
                } else {
                    self.push(MessageKind::Agent { content: text });
                }
                self.open_agent = None;
            }
            ChatEvent::ToolOutput(tool) => self.place(MessageKind::ToolOutput(tool)),
            ChatEvent::AgentToolCall { calls } => {
                self.place(MessageKind::AgentToolCall { calls })
            }
            ChatEvent::Error { text } => {
                self.push(MessageKind::Error { content: text });
            }
        }
        self.notify();
    }

    /// Drops the whole conversation.
    pub fn reset(&mut self) {
        self.messages.clear();
        self.open_agent = None;
        self.notify();
    }

    fn push(&mut self, kind: MessageKind) -> usize {
        self.next_seq += 1;
        let id = format!("{}-{}", kind.label(), self.next_seq);
        debug!(%id, "message appended");
        self.messages.push(ChatMessage { id, kind });
        self.messages.len() - 1
    }

    // tool entries replace an untouched placeholder, never agent text
    fn place(&mut self, kind: MessageKind) {
        match self.open_agent.take() {
            Some(index) if self.is_empty_agent(index) => self.messages[index].kind = kind,
            _ => {
                self.push(kind);
            }
        }
    }

    fn is_empty_agent(&self, index: usize) -> bool {
        matches!(
            self.messages.get(index).map(|m| &m.kind),
            Some(MessageKind::Agent { content }) if content.is_empty()
        )
    }

    fn open_agent_content(&mut self) -> Option<&mut String> {
        let index = self.open_agent?;
        match self.messages.get_mut(index).map(|m| &mut m.kind) {
            Some(MessageKind::Agent { content }) => Some(content),
            _ => None,
        }
    }

    fn notify(&mut self) {
        self.revision += 1;
        self.changes.send_replace(self.snapshot());
    }
}
