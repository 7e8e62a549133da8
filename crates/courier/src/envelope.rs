//! Response envelope codec.
//!
//! Every non-streaming, non-binary response body is wrapped as
//! `{"code": <int>, "message": <string>, "data": <any>}`. `code == 0` is the
//! only success discriminant; on failure `data` carries whatever diagnostic
//! payload the server attached and is never interpreted as the caller's type.

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

use crate::error::RequestError;

pub const SUCCESS_CODE: i64 = 0;

/// Used when a failure envelope arrives without a message.
const FALLBACK_MESSAGE: &str = "server error";

/// Longest slice of an error body kept for diagnostics.
const MAX_ERROR_BODY: usize = 512;

#[derive(Debug, Clone, PartialEq)]
pub enum Envelope<T> {
    Success { message: String, data: T },
    Failure { code: i64, message: String, data: Value },
}

#[derive(Deserialize)]
struct WireEnvelope {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Value,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self::Success {
            message: "success".to_string(),
            data,
        }
    }

    pub fn failure(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self::Failure {
            code,
            message: message.into(),
            data,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Success { .. } => SUCCESS_CODE,
            Self::Failure { code, .. } => *code,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Success { message, .. } | Self::Failure { message, .. } => message,
        }
    }

    #[inline]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn into_result(self) -> Result<T, RequestError> {
        match self {
            Self::Success { data, .. } => Ok(data),
            Self::Failure {
                code,
                message,
                data,
            } => Err(RequestError::Envelope {
                code,
                message,
                data,
            }),
        }
    }
}

impl<T: DeserializeOwned> Envelope<T> {
    /// Parse an envelope. `data` is only decoded as `T` when `code == 0`.
    pub fn from_slice(body: &[u8]) -> Result<Self, serde_json::Error> {
        let wire: WireEnvelope = serde_json::from_slice(body)?;
        Self::from_wire(wire)
    }

    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let wire: WireEnvelope = serde_json::from_value(value)?;
        Self::from_wire(wire)
    }

    fn from_wire(wire: WireEnvelope) -> Result<Self, serde_json::Error> {
        if wire.code == SUCCESS_CODE {
            Ok(Self::Success {
                message: wire.message.unwrap_or_default(),
                data: serde_json::from_value(wire.data)?,
            })
        } else {
            Ok(Self::Failure {
                code: wire.code,
                message: wire
                    .message
                    .filter(|m| !m.is_empty())
                    .unwrap_or_else(|| FALLBACK_MESSAGE.to_string()),
                data: wire.data,
            })
        }
    }
}

impl<T: Serialize> Serialize for Envelope<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("Envelope", 3)?;
        match self {
            Self::Success { message, data } => {
                state.serialize_field("code", &SUCCESS_CODE)?;
                state.serialize_field("message", message)?;
                state.serialize_field("data", data)?;
            }
            Self::Failure {
                code,
                message,
                data,
            } => {
                state.serialize_field("code", code)?;
                state.serialize_field("message", message)?;
                state.serialize_field("data", data)?;
            }
        }
        state.end()
    }
}

/// Reject responses whose HTTP status is outside the success range.
///
/// A 401 only reaches this point once the auth interceptor has given up on it.
pub fn check_status(status: StatusCode, url: &str, body: &[u8]) -> Result<(), RequestError> {
    if status == StatusCode::UNAUTHORIZED {
        return Err(RequestError::Unauthorized {
            url: url.to_string(),
        });
    }

    if !status.is_success() {
        let end = body.len().min(MAX_ERROR_BODY);
        return Err(RequestError::HttpStatus {
            status,
            url: url.to_string(),
            body: String::from_utf8_lossy(&body[..end]).into_owned(),
        });
    }

    Ok(())
}

/// Full envelope decoding of a buffered response.
pub fn decode_response<T: DeserializeOwned>(
    status: StatusCode,
    url: &str,
    body: &[u8],
) -> Result<T, RequestError> {
    check_status(status, url, body)?;
    Envelope::<T>::from_slice(body)?.into_result()
}
