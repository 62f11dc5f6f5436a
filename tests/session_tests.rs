//! End-to-end tests for the chat send cycle
//!
//! A scripted transport replays canned response bodies so the whole cycle
//! (limiter, request, ingestion, conversation) runs without a network.

use async_trait::async_trait;
use futures::{StreamExt, stream};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use steve_chat::ai::{
    AssistantTransport, ByteStream, ChatError, ChatRequest, ChatResult, FALLBACK_IDENTITY,
    ResponseMode, StaticIdentity,
};
use steve_chat::clock::ManualClock;
use steve_chat::storage::{KeyValueStore, MemoryStore};
use steve_chat::{
    ChatSession, MessageKind, RateLimitConfig, RateStatus, SendOutcome, ToolPayload,
};

const T0: i64 = 1_700_000_000_000;

enum Reply {
    Body(Vec<ChatResult<Vec<u8>>>),
    Fail(ChatError),
    Hang,
    /// Delivers the chunks, then the body never ends.
    Stall(Vec<ChatResult<Vec<u8>>>),
}

#[derive(Default)]
struct Script {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<(ChatRequest, ResponseMode)>>,
}

#[derive(Clone, Default)]
struct ScriptedTransport {
    script: Arc<Script>,
}

impl ScriptedTransport {
    fn reply(&self, reply: Reply) -> &Self {
        self.script.replies.lock().unwrap().push_back(reply);
        self
    }

    fn requests(&self) -> Vec<(ChatRequest, ResponseMode)> {
        self.script.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl AssistantTransport for ScriptedTransport {
    async fn send(&self, request: &ChatRequest, mode: ResponseMode) -> ChatResult<ByteStream> {
        self.script
            .requests
            .lock()
            .unwrap()
            .push((request.clone(), mode));
        let reply = self.script.replies.lock().unwrap().pop_front();
        match reply {
            Some(Reply::Body(chunks)) => Ok(Box::pin(stream::iter(chunks))),
            Some(Reply::Fail(err)) => Err(err),
            Some(Reply::Hang) => futures::future::pending().await,
            Some(Reply::Stall(chunks)) => {
                Ok(Box::pin(stream::iter(chunks).chain(stream::pending())))
            }
            None => Ok(Box::pin(stream::iter(body(
                r#"{"type":"final_response","content":"ok"}"#,
                64,
            )))),
        }
    }
}

/// Splits `text` into byte chunks of `size`, ignoring character boundaries.
fn body(text: &str, size: usize) -> Vec<ChatResult<Vec<u8>>> {
    text.as_bytes()
        .chunks(size)
        .map(|chunk| Ok(chunk.to_vec()))
        .collect()
}

struct Harness {
    transport: ScriptedTransport,
    clock: ManualClock,
    store: Arc<dyn KeyValueStore>,
}

impl Harness {
    fn new() -> Self {
        Self {
            transport: ScriptedTransport::default(),
            clock: ManualClock::new(T0),
            store: Arc::new(MemoryStore::new()),
        }
    }

    async fn session(&self, mode: ResponseMode) -> ChatSession<ScriptedTransport> {
        self.session_as(mode, "198.51.100.23").await
    }

    async fn session_as(&self, mode: ResponseMode, identity: &str) -> ChatSession<ScriptedTransport> {
        ChatSession::start(
            self.transport.clone(),
            mode,
            RateLimitConfig::default(),
            &StaticIdentity::new(identity),
            Arc::clone(&self.store),
            Arc::new(self.clock.clone()),
        )
        .await
    }
}

fn labels(session: &ChatSession<ScriptedTransport>) -> Vec<&'static str> {
    session.messages().iter().map(|m| m.kind.label()).collect()
}

#[tokio::test]
async fn hello_gets_a_single_agent_reply() {
    let harness = Harness::new();
    harness.transport.reply(Reply::Body(body(
        "{\"type\":\"final_response\",\"content\":\"Hi there\"}\n",
        5,
    )));
    let mut session = harness.session(ResponseMode::Buffered).await;

    let outcome = session.send_message("Hello").await;

    assert_eq!(outcome, SendOutcome::Completed);
    assert!(!session.is_loading());
    assert_eq!(labels(&session), vec!["user", "agent"]);
    assert_eq!(session.messages()[0].content(), Some("Hello"));
    assert_eq!(session.messages()[1].content(), Some("Hi there"));

    let requests = harness.transport.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].0.message, "Hello");
    assert_eq!(requests[0].0.thread_id, format!("thread-{T0}"));
    assert_eq!(requests[0].1, ResponseMode::Buffered);
}

#[tokio::test]
async fn tool_output_precedes_final_answer() {
    let harness = Harness::new();
    harness.transport.reply(Reply::Body(body(
        concat!(
            "{\"type\":\"tool_output\",\"tool_name\":\"weather-data\",\"output\":{\"currentTemperature\":21}}\n",
            "{\"type\":\"final_response\",\"content\":\"It's 21°C\"}\n",
        ),
        3,
    )));
    let mut session = harness.session(ResponseMode::Buffered).await;

    session.send_message("Weather in Lisbon?").await;

    assert_eq!(labels(&session), vec!["user", "tool_output", "agent"]);
    let tool = session.messages()[1].tool().expect("tool output");
    assert_eq!(tool.name, "weather-data");
    match &tool.output {
        ToolPayload::Weather(weather) => assert_eq!(weather.current_temperature, 21.0),
        other => panic!("expected typed weather payload, got {other:?}"),
    }
    assert_eq!(session.messages()[2].content(), Some("It's 21°C"));
}

#[tokio::test]
async fn streamed_tokens_fill_one_agent_message() {
    let harness = Harness::new();
    harness.transport.reply(Reply::Body(body(
        concat!(
            "{\"type\":\"token\",\"content\":\"I build \"}\n",
            "{\"type\":\"token\",\"content\":\"agents ✨\"}\n",
            "{\"type\":\"final_response\",\"content\":\"I build agents ✨\"}",
        ),
        4,
    )));
    let mut session = harness.session(ResponseMode::Streamed).await;

    session.send_message("What do you do?").await;

    assert_eq!(labels(&session), vec!["user", "agent"]);
    assert_eq!(session.messages()[1].content(), Some("I build agents ✨"));
    assert_eq!(harness.transport.requests()[0].1, ResponseMode::Streamed);
}

#[tokio::test]
async fn streamed_tool_call_replaces_empty_placeholder() {
    let harness = Harness::new();
    harness.transport.reply(Reply::Body(body(
        concat!(
            "{\"type\":\"agent_tool_call\",\"tool_calls\":[{\"name\":\"github-profile\",\"args\":{}}]}\n",
            "{\"type\":\"tool_output\",\"tool_name\":\"github-profile\",\"output\":{\"username\":\"steve\",\"num_repos\":12}}\n",
            "{\"type\":\"token\",\"content\":\"Twelve repos.\"}\n",
        ),
        16,
    )));
    let mut session = harness.session(ResponseMode::Streamed).await;

    session.send_message("Show me your GitHub").await;

    assert_eq!(
        labels(&session),
        vec!["user", "agent_tool_call", "tool_output", "agent"]
    );
    assert!(matches!(
        session.messages()[2].tool().map(|t| &t.output),
        Some(ToolPayload::GithubProfile(profile)) if profile.num_repos == 12
    ));
    assert_eq!(session.messages()[3].content(), Some("Twelve repos."));
}

#[tokio::test]
async fn malformed_line_is_reported_and_stream_continues() {
    let harness = Harness::new();
    harness.transport.reply(Reply::Body(body(
        "{\"type\":\"final_resp\n{\"type\":\"final_response\",\"content\":\"still here\"}\n",
        7,
    )));
    let mut session = harness.session(ResponseMode::Buffered).await;

    session.send_message("hi").await;

    assert_eq!(labels(&session), vec!["user", "error", "agent"]);
    assert_eq!(
        session.messages()[1].content(),
        Some("Failed to parse response: {\"type\":\"final_resp")
    );
    assert_eq!(session.messages()[2].content(), Some("still here"));
}

#[tokio::test]
async fn http_failure_becomes_one_error_message() {
    let harness = Harness::new();
    harness.transport.reply(Reply::Fail(ChatError::Status {
        status: 403,
        detail: "Could not validate API key".into(),
    }));
    let mut session = harness.session(ResponseMode::Streamed).await;

    let outcome = session.send_message("hi").await;

    assert_eq!(outcome, SendOutcome::Failed);
    assert!(!session.is_loading());
    assert_eq!(labels(&session), vec!["user", "error"]);
    assert_eq!(
        session.messages()[1].content(),
        Some("Network or API error: HTTP error! status: 403, detail: Could not validate API key")
    );

    // the session keeps working afterwards
    assert_eq!(session.send_message("again").await, SendOutcome::Completed);
}

#[tokio::test]
async fn body_failure_mid_stream_releases_loading() {
    let harness = Harness::new();
    let mut chunks = body("{\"type\":\"token\",\"content\":\"par\"}\n", 8);
    chunks.push(Err(ChatError::Timeout));
    harness.transport.reply(Reply::Body(chunks));
    let mut session = harness.session(ResponseMode::Streamed).await;

    session.send_message("hi").await;

    assert!(!session.is_loading());
    assert_eq!(labels(&session), vec!["user", "agent", "error"]);
    assert_eq!(session.messages()[1].content(), Some("par"));
    assert_eq!(
        session.messages()[2].content(),
        Some("Network or API error: request timed out")
    );
}

#[tokio::test]
async fn blank_input_sends_nothing() {
    let harness = Harness::new();
    let mut session = harness.session(ResponseMode::Buffered).await;

    assert_eq!(session.send_message("").await, SendOutcome::Ignored);
    assert_eq!(session.send_message("   ").await, SendOutcome::Ignored);

    assert!(session.messages().is_empty());
    assert!(harness.transport.requests().is_empty());
    assert_eq!(session.rate_status(), RateStatus::Open { remaining: 10 });
}

#[tokio::test]
async fn submit_clears_the_input_field() {
    let harness = Harness::new();
    let mut session = harness.session(ResponseMode::Buffered).await;

    session.set_input_value("  Tell me about your projects  ");
    assert_eq!(session.submit_input().await, SendOutcome::Completed);

    assert_eq!(session.input_value(), "");
    assert_eq!(
        harness.transport.requests()[0].0.message,
        "Tell me about your projects"
    );
}

#[tokio::test]
async fn eleventh_message_is_blocked_for_an_hour() {
    let harness = Harness::new();
    let mut session = harness.session(ResponseMode::Buffered).await;

    for n in 0..10 {
        assert_eq!(
            session.send_message(&format!("message {n}")).await,
            SendOutcome::Completed
        );
    }
    let outcome = session.send_message("one too many").await;

    assert_eq!(
        outcome,
        SendOutcome::RateLimited {
            retry_after: Duration::from_millis(3_600_000)
        }
    );
    assert_eq!(harness.transport.requests().len(), 10);
    assert_eq!(session.messages().len(), 20);
    let notice = session.limit_notice().expect("notice is shown");
    assert_eq!(
        notice.message(),
        "Message limit reached. Please wait 60:00 before sending more messages."
    );

    harness.clock.advance(Duration::from_secs(3));
    assert!(session.limit_notice().is_none());

    harness.clock.advance(Duration::from_secs(3600));
    assert_eq!(session.send_message("back again").await, SendOutcome::Completed);
    assert_eq!(session.rate_status(), RateStatus::Open { remaining: 9 });
}

#[tokio::test]
async fn limit_persists_across_sessions() {
    let harness = Harness::new();
    {
        let mut session = harness.session(ResponseMode::Buffered).await;
        for _ in 0..10 {
            session.send_message("hi").await;
        }
    }

    let mut reopened = harness.session(ResponseMode::Buffered).await;
    assert!(matches!(
        reopened.rate_status(),
        RateStatus::Saturated { .. }
    ));
    assert!(matches!(
        reopened.send_message("hi").await,
        SendOutcome::RateLimited { .. }
    ));
    assert!(reopened.messages().is_empty());
}

// Visitors whose identity lookup failed all share FALLBACK_IDENTITY and
// therefore one counter. This is accepted behaviour.
#[tokio::test]
async fn failed_lookups_share_one_bucket() {
    let harness = Harness::new();
    let mut first = harness
        .session_as(ResponseMode::Buffered, FALLBACK_IDENTITY)
        .await;
    for _ in 0..6 {
        first.send_message("hi").await;
    }

    let mut second = harness
        .session_as(ResponseMode::Buffered, FALLBACK_IDENTITY)
        .await;
    for _ in 0..4 {
        assert_eq!(second.send_message("hi").await, SendOutcome::Completed);
    }
    assert!(matches!(
        second.send_message("hi").await,
        SendOutcome::RateLimited { .. }
    ));

    let mut other = harness.session_as(ResponseMode::Buffered, "192.0.2.1").await;
    assert_eq!(other.send_message("hi").await, SendOutcome::Completed);
}

#[tokio::test]
async fn thread_id_is_reused_by_the_next_session() {
    let harness = Harness::new();
    let first = harness.session(ResponseMode::Buffered).await;
    harness.clock.advance(Duration::from_secs(86_400));
    let second = harness.session(ResponseMode::Streamed).await;

    assert_eq!(first.thread_id(), second.thread_id());
}

#[tokio::test]
async fn cancelled_send_does_not_stay_loading() {
    let harness = Harness::new();
    harness.transport.reply(Reply::Hang);
    let mut session = harness.session(ResponseMode::Buffered).await;

    let result = tokio::time::timeout(Duration::from_millis(50), session.send_message("hello?")).await;

    assert!(result.is_err());
    assert!(!session.is_loading());
    assert_eq!(labels(&session), vec!["user"]);
}

#[tokio::test]
async fn view_is_notified_of_every_change() {
    let harness = Harness::new();
    harness.transport.reply(Reply::Body(body(
        concat!(
            "{\"type\":\"token\",\"content\":\"a\"}\n",
            "{\"type\":\"token\",\"content\":\"b\"}\n",
        ),
        64,
    )));
    let mut session = harness.session(ResponseMode::Streamed).await;
    let mut changes = session.subscribe();

    session.send_message("hi").await;

    assert!(changes.has_changed().unwrap());
    let latest = changes.borrow_and_update().clone();
    // user message, request start, placeholder, two tokens, request end
    assert_eq!(latest.revision, 6);
    assert!(!latest.is_loading);
    assert_eq!(latest.messages.len(), 2);
    assert_eq!(latest.messages[1].content(), Some("ab"));
    assert_eq!(latest, session.snapshot());
}

#[tokio::test]
async fn view_follows_a_streamed_turn_while_it_runs() {
    let harness = Harness::new();
    harness.transport.reply(Reply::Stall(body(
        "{\"type\":\"token\",\"content\":\"Hel\"}\n",
        64,
    )));
    let mut session = harness.session(ResponseMode::Streamed).await;
    let mut view = session.subscribe();

    let send = session.send_message("hi");
    let first_token = async {
        loop {
            view.changed().await.unwrap();
            let snapshot = view.borrow_and_update().clone();
            if snapshot.messages.last().and_then(|m| m.content()) == Some("Hel") {
                return snapshot;
            }
        }
    };
    let snapshot = tokio::select! {
        outcome = send => panic!("send finished on a stalled body: {outcome:?}"),
        snapshot = first_token => snapshot,
    };

    assert!(snapshot.is_loading);
    let labels: Vec<_> = snapshot.messages.iter().map(|m| m.kind.label()).collect();
    assert_eq!(labels, vec!["user", "agent"]);
    assert_eq!(snapshot.messages[0].content(), Some("hi"));

    // abandoning the turn is published too
    assert!(!session.is_loading());
    assert!(!view.borrow_and_update().is_loading);
}

#[tokio::test]
async fn identical_replies_yield_identical_conversations() {
    let reply = concat!(
        "{\"type\":\"agent_tool_call\",\"tool_calls\":[{\"name\":\"linkedin-profile\",\"args\":{}}]}\n",
        "{\"type\":\"tool_output\",\"tool_name\":\"linkedin-profile\",\"output\":{\"name\":\"Steve\",\"headline\":\"AI Engineer\"}}\n",
        "{\"type\":\"error\",\"content\":\"rate limited upstream\"}\n",
        "{\"type\":\"final_response\",\"content\":\"Here is my profile.\"}\n",
    );

    let mut runs = Vec::new();
    for _ in 0..2 {
        let harness = Harness::new();
        harness.transport.reply(Reply::Body(body(reply, 11)));
        let mut session = harness.session(ResponseMode::Streamed).await;
        session.send_message("LinkedIn?").await;
        runs.push(session.messages().to_vec());
    }

    assert_eq!(runs[0], runs[1]);
    assert!(matches!(
        &runs[0][3].kind,
        MessageKind::Error { content } if content == "Error: rate limited upstream"
    ));
}
