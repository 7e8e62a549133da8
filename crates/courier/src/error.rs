use std::time::Duration;

use reqwest::StatusCode;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("invalid header `{name}`: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to serialize request body: {source}")]
    Serialize { source: serde_json::Error },

    #[error("request to {url} timed out after {}ms", .timeout.as_millis())]
    Timeout { url: String, timeout: Duration },

    #[error("request to {url} was cancelled")]
    Cancelled { url: String },

    #[error("HTTP request failed: {source}")]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        body: String,
    },

    #[error("server rejected request (code={code}): {message}")]
    Envelope {
        code: i64,
        message: String,
        data: Value,
    },

    #[error("unauthorized: {url} rejected the request")]
    Unauthorized { url: String },

    #[error("credential refresh failed: {reason}")]
    RefreshFailed { reason: String },

    #[error("stream unavailable: {source}")]
    StreamUnavailable { source: Box<RequestError> },

    #[error("failed to decode payload: {source}")]
    Decode {
        #[from]
        source: serde_json::Error,
    },
}

pub type Result<T, E = RequestError> = std::result::Result<T, E>;

impl RequestError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_header(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidHeader {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn refresh_failed(reason: impl Into<String>) -> Self {
        Self::RefreshFailed {
            reason: reason.into(),
        }
    }

    pub fn stream_unavailable(source: RequestError) -> Self {
        match source {
            already @ Self::StreamUnavailable { .. } => already,
            other => Self::StreamUnavailable {
                source: Box::new(other),
            },
        }
    }

    /// The session is gone and the user has to authenticate again.
    pub fn requires_relogin(&self) -> bool {
        match self {
            Self::RefreshFailed { .. } | Self::Unauthorized { .. } => true,
            Self::StreamUnavailable { source } => source.requires_relogin(),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Timeout { .. } => true,
            Self::Transport { source } => source.is_timeout(),
            Self::StreamUnavailable { source } => source.is_timeout(),
            _ => false,
        }
    }

    /// Failures that carry a message meant for the end user rather than a developer.
    pub fn is_display_error(&self) -> bool {
        matches!(self, Self::HttpStatus { .. } | Self::Envelope { .. })
    }

    /// Server-supplied diagnostic payload of an envelope failure.
    pub fn envelope_data(&self) -> Option<&Value> {
        match self {
            Self::Envelope { data, .. } => Some(data),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Unauthorized { .. } => Some(StatusCode::UNAUTHORIZED),
            Self::Transport { source } => source.status(),
            Self::StreamUnavailable { source } => source.status(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_unavailable_does_not_nest() {
        let inner = RequestError::refresh_failed("expired");
        let once = RequestError::stream_unavailable(inner);
        let twice = RequestError::stream_unavailable(once);

        match twice {
            RequestError::StreamUnavailable { source } => {
                assert!(matches!(*source, RequestError::RefreshFailed { .. }));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn classification() {
        let refresh = RequestError::refresh_failed("gone");
        assert!(refresh.requires_relogin());
        assert!(!refresh.is_display_error());

        let envelope = RequestError::Envelope {
            code: 40001,
            message: "name taken".to_string(),
            data: serde_json::json!({"field": "name"}),
        };
        assert!(envelope.is_display_error());
        assert_eq!(
            envelope.envelope_data(),
            Some(&serde_json::json!({"field": "name"}))
        );

        let timeout = RequestError::Timeout {
            url: "http://localhost/x".to_string(),
            timeout: Duration::from_millis(5),
        };
        assert!(timeout.is_timeout());
        assert_eq!(
            timeout.to_string(),
            "request to http://localhost/x timed out after 5ms"
        );

        let wrapped = RequestError::stream_unavailable(RequestError::Unauthorized {
            url: "http://localhost/chat".to_string(),
        });
        assert!(wrapped.requires_relogin());
        assert_eq!(
            wrapped.to_string(),
            "stream unavailable: unauthorized: http://localhost/chat rejected the request"
        );
        assert_eq!(wrapped.status(), Some(StatusCode::UNAUTHORIZED));
    }
}
