//! Resilient HTTP request layer.
//!
//! Unary calls with timeout and cancellation, `{code, message, data}` envelope
//! decoding, server-push event streams, and transparent recovery from an
//! expired access token through a single shared refresh.

pub mod client;
pub mod config;
pub mod credential;
pub mod envelope;
pub mod error;
pub mod events;
pub mod executor;
pub mod interceptor;
pub mod refresh;
pub mod request;
pub mod stream;

pub use client::{ApiClient, ApiClientBuilder};
pub use config::ClientConfig;
pub use credential::{Credential, MemorySessionStore, SessionStore};
pub use envelope::Envelope;
pub use error::{RequestError, Result};
pub use events::ClientEvent;
pub use refresh::{RefreshSnapshot, TokenRefresher};
pub use request::{FormData, Method, RequestSpec};
pub use stream::{ByteStream, EventStream, StreamEvent};
