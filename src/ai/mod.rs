//! Talking to the assistant.
//!
//! - `client` - request types, the `AssistantTransport` seam and its reqwest implementation
//! - `stream` - NDJSON ingestion of the response body into `ChatEvent`s
//! - `identity` - network identity lookup used to bucket rate limits
mod client;
mod identity;
mod stream;

pub use client::{
    AssistantTransport, ByteStream, ChatError, ChatRequest, ChatResult, HttpTransport,
    ResponseMode,
};
pub use identity::{FALLBACK_IDENTITY, IdentityResolver, IpLookupResolver, StaticIdentity};
pub use stream::{StreamIngestor, ingest, parse_event_line, transport_error_text};
