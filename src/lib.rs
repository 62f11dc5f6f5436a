//! Client core of the portfolio chat widget.
//!
//! The widget sends a visitor's message to the assistant, reads back its
//! newline-delimited JSON events and keeps the conversation the view renders.
//! A per-identity limiter caps how many messages a visitor can send per hour.
//!
//! Host specifics (HTTP, storage, identity lookup, time) sit behind small
//! traits so the whole cycle runs headless in tests.
pub mod ai;
pub mod clock;
pub mod config;
pub mod conversation;
pub mod rate_limit;
pub mod session;
pub mod storage;
pub mod types;

pub use ai::{ChatError, ChatResult, ResponseMode};
pub use config::ChatConfig;
pub use conversation::{ConversationSnapshot, ConversationStore};
pub use rate_limit::{RateDecision, RateLimitConfig, RateLimiter, RateStatus, RateWindow};
pub use session::{ChatSession, LimitNotice, SendOutcome, SessionStore};
pub use types::{ChatEvent, ChatMessage, MessageKind, ToolCall, ToolOutput, ToolPayload};
