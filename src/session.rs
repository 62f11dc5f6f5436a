//! Chat session orchestration
//!
//! [`ChatSession`] runs one send cycle at a time:
//!
//! 1. ignore blank input or a send while a response is in flight
//! 2. consult the [`RateLimiter`]; a rejection raises a short-lived
//!    [`LimitNotice`] and nothing is sent
//! 3. append the user message, mark the conversation in flight, clear input
//! 4. POST the message with the session's thread id
//! 5. feed the response body through [`ingest`] into the [`ConversationStore`]
//! 6. turn any transport failure into a single error message
//! 7. clear the in-flight flag on every exit path
//!
//! It is the only type a view needs: it exposes the messages, the loading
//! flag, the input field and the limit notice. A send holds the session
//! mutably until it ends, so a view follows a running turn through
//! [`ChatSession::subscribe`] instead.

use crate::ai::{
    AssistantTransport, ChatRequest, IdentityResolver, ResponseMode, ingest,
    transport_error_text,
};
use crate::clock::Clock;
use crate::conversation::{ConversationSnapshot, ConversationStore};
use crate::rate_limit::{RateDecision, RateLimitConfig, RateLimiter, RateStatus, format_cooldown};
use crate::storage::KeyValueStore;
use crate::types::{ChatEvent, ChatMessage};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

pub const THREAD_ID_KEY: &str = "steve_chat_thread_id";
pub const LIMIT_NOTICE_DURATION: Duration = Duration::from_secs(3);

// ============================================
// Thread identity
// ============================================

/// Keeps the conversation thread id stable across restarts.
pub struct SessionStore {
    store: Arc<dyn KeyValueStore>,
}

impl SessionStore {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// Returns the stored thread id, or creates `thread-<now>` and stores it.
    pub fn thread_id(&self, now_ms: i64) -> String {
        match self.store.get(THREAD_ID_KEY) {
            Ok(Some(id)) if !id.trim().is_empty() => return id.trim().to_string(),
            Ok(_) => {}
            Err(err) => warn!(%err, "could not read stored thread id"),
        }

        let id = format!("thread-{now_ms}");
        if let Err(err) = self.store.set(THREAD_ID_KEY, &id) {
            warn!(%err, "could not persist thread id");
        }
        id
    }
}

// ============================================
// Outcomes
// ============================================

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LimitNotice {
    pub retry_after: Duration,
    pub shown_at: i64,
}

impl LimitNotice {
    pub fn message(&self) -> String {
        format!(
            "Message limit reached. Please wait {} before sending more messages.",
            format_cooldown(self.retry_after)
        )
    }

    pub fn is_visible(&self, now_ms: i64) -> bool {
        let shown_for = now_ms.saturating_sub(self.shown_at);
        shown_for >= 0 && (shown_for as u128) < LIMIT_NOTICE_DURATION.as_millis()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendOutcome {
    /// Blank input, or a response is still in flight.
    Ignored,
    /// The rate limit is saturated; nothing was sent.
    RateLimited { retry_after: Duration },
    /// The response body was consumed.
    Completed,
    /// The request failed before a body arrived.
    Failed,
}

// clears the in-flight flag however the turn ends, including cancellation
struct InFlight<'a>(&'a mut ConversationStore);

impl<'a> InFlight<'a> {
    fn begin(store: &'a mut ConversationStore) -> Self {
        store.begin_request();
        Self(store)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.finish_request();
    }
}

// ============================================
// Session
// ============================================

pub struct ChatSession<T: AssistantTransport> {
    transport: T,
    mode: ResponseMode,
    limiter: RateLimiter,
    clock: Arc<dyn Clock>,
    conversation: ConversationStore,
    thread_id: String,
    input_value: String,
    limit_notice: Option<LimitNotice>,
}

impl<T: AssistantTransport> ChatSession<T> {
    pub fn new(
        transport: T,
        mode: ResponseMode,
        limiter: RateLimiter,
        sessions: &SessionStore,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let thread_id = sessions.thread_id(clock.now_ms());
        Self {
            transport,
            mode,
            limiter,
            clock,
            conversation: ConversationStore::new(),
            thread_id,
            input_value: String::new(),
            limit_notice: None,
        }
    }

    /// Resolves the network identity, then builds the limiter and thread id
    /// on top of `store`.
    pub async fn start(
        transport: T,
        mode: ResponseMode,
        limits: RateLimitConfig,
        resolver: &dyn IdentityResolver,
        store: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let identity = resolver.resolve().await;
        let limiter = RateLimiter::new(Arc::clone(&store), identity, limits);
        let sessions = SessionStore::new(store);
        let session = Self::new(transport, mode, limiter, &sessions, clock);
        info!(
            thread_id = %session.thread_id,
            mode = ?session.mode,
            "chat session started"
        );
        session
    }

    pub fn messages(&self) -> &[ChatMessage] {
        self.conversation.messages()
    }

    pub fn is_loading(&self) -> bool {
        self.conversation.is_in_flight()
    }

    pub fn input_value(&self) -> &str {
        &self.input_value
    }

    pub fn set_input_value(&mut self, value: impl Into<String>) {
        self.input_value = value.into();
    }

    pub fn thread_id(&self) -> &str {
        &self.thread_id
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    pub fn identity(&self) -> &str {
        self.limiter.identity()
    }

    /// Snapshots of the messages and loading flag, published on every change
    /// including those made while a send is still running.
    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.conversation.subscribe()
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.conversation.snapshot()
    }

    /// The limit notice, while it is still within its display time.
    pub fn limit_notice(&self) -> Option<LimitNotice> {
        let now = self.clock.now_ms();
        self.limit_notice.filter(|notice| notice.is_visible(now))
    }

    pub fn rate_status(&self) -> RateStatus {
        self.limiter.status(self.clock.now_ms())
    }

    pub fn reset(&mut self) {
        self.conversation.reset();
    }

    /// Sends whatever is in the input field.
    pub async fn submit_input(&mut self) -> SendOutcome {
        let text = self.input_value.clone();
        self.send_message(&text).await
    }

    pub async fn send_message(&mut self, text: &str) -> SendOutcome {
        let text = text.trim();
        if text.is_empty() || self.is_loading() {
            return SendOutcome::Ignored;
        }

        let now = self.clock.now_ms();
        if let RateDecision::Rejected { retry_after } = self.limiter.check_and_record(now) {
            self.limit_notice = Some(LimitNotice {
                retry_after,
                shown_at: now,
            });
            return SendOutcome::RateLimited { retry_after };
        }

        self.conversation.append_user(text);
        self.input_value.clear();

        let request = ChatRequest {
            message: text.to_string(),
            thread_id: self.thread_id.clone(),
        };
        let turn = InFlight::begin(&mut self.conversation);
        run_turn(&self.transport, self.mode, &request, &mut *turn.0).await
    }
}

async fn run_turn<T: AssistantTransport>(
    transport: &T,
    mode: ResponseMode,
    request: &ChatRequest,
    conversation: &mut ConversationStore,
) -> SendOutcome {
    let body = match transport.send(request, mode).await {
        Ok(body) => body,
        Err(err) => {
            warn!(%err, "chat request failed");
            conversation.apply(ChatEvent::Error {
                text: transport_error_text(&err),
            });
            return SendOutcome::Failed;
        }
    };

    if mode.uses_placeholder() {
        conversation.begin_agent_turn();
    }

    let mut events = std::pin::pin!(ingest(body));
    while let Some(event) = events.next().await {
        conversation.apply(event);
    }
    SendOutcome::Completed
}
