//! Upstream result sources: the department event stream, the commune
//! query, and transcript replay.

pub mod client;
pub mod sse;

pub use client::{replay_transcript, ApiClient, StreamError, StreamOutcome};
pub use sse::StreamEvent;
