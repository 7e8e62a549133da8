//! Client lifecycle events.
//!
//! Emitted on a broadcast channel so an application can surface notices
//! (display errors, forced logout) without the transport layer knowing about
//! any UI.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// A call failed with a message meant for the end user.
    RequestFailed {
        url: String,
        status: Option<u16>,
        message: String,
        timestamp: DateTime<Utc>,
    },

    /// A refresh cycle stored a new credential.
    CredentialRefreshed { timestamp: DateTime<Utc> },

    /// Refresh failed and the credential was cleared. Re-login required.
    SessionExpired {
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl ClientEvent {
    pub fn request_failed(url: impl Into<String>, status: Option<u16>, message: impl Into<String>) -> Self {
        Self::RequestFailed {
            url: url.into(),
            status,
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn credential_refreshed() -> Self {
        Self::CredentialRefreshed {
            timestamp: Utc::now(),
        }
    }

    pub fn session_expired(reason: impl Into<String>) -> Self {
        Self::SessionExpired {
            reason: reason.into(),
            timestamp: Utc::now(),
        }
    }

    /// Event name for subscription matching.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::RequestFailed { .. } => "request_failed",
            Self::CredentialRefreshed { .. } => "credential_refreshed",
            Self::SessionExpired { .. } => "session_expired",
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RequestFailed { timestamp, .. }
            | Self::CredentialRefreshed { timestamp }
            | Self::SessionExpired { timestamp, .. } => *timestamp,
        }
    }

    /// Human-readable notice.
    pub fn to_message(&self) -> String {
        match self {
            Self::RequestFailed {
                url,
                status: Some(status),
                message,
                ..
            } => format!("Request to {url} failed (HTTP {status}): {message}"),
            Self::RequestFailed { url, message, .. } => {
                format!("Request to {url} failed: {message}")
            }
            Self::CredentialRefreshed { .. } => "Session credential refreshed".to_string(),
            Self::SessionExpired { reason, .. } => {
                format!("Session expired, please sign in again ({reason})")
            }
        }
    }
}

/// Fan-out of [`ClientEvent`]s. Sending never fails the caller.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: ClientEvent) {
        trace!(event = event.event_name(), "Emitting client event");
        // no subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages() {
        let event = ClientEvent::request_failed("http://x/a", Some(500), "boom");
        assert_eq!(event.event_name(), "request_failed");
        assert_eq!(event.to_message(), "Request to http://x/a failed (HTTP 500): boom");

        let event = ClientEvent::session_expired("refresh rejected");
        assert!(event.to_message().contains("refresh rejected"));
    }

    #[test]
    fn serializes_with_tag() {
        let value = serde_json::to_value(ClientEvent::credential_refreshed()).unwrap();
        assert_eq!(value["type"], "credential_refreshed");
        assert!(value.get("timestamp").is_some());
    }

    #[tokio::test]
    async fn bus_delivers_to_subscribers() {
        let bus = EventBus::new(4);
        bus.emit(ClientEvent::credential_refreshed());

        let mut rx = bus.subscribe();
        bus.emit(ClientEvent::session_expired("x"));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.event_name(), "session_expired");
    }
}
