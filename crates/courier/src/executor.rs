//! Unary request executor.
//!
//! Turns a [`RequestSpec`] into one HTTP exchange bounded by a timeout and by
//! cancellation. The executor holds no state across calls.

use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, RequestBuilder, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::RequestError;
use crate::request::{
    CONTENT_TYPE_JSON, CONTENT_TYPE_TEXT, RequestBody, RequestSpec, ResponseMode,
};

/// Response as produced by the executor, before any envelope decoding.
#[derive(Debug)]
pub enum RawResponse {
    /// Body fully read within the call's timeout.
    Buffered {
        status: StatusCode,
        url: String,
        body: Bytes,
    },
    /// Headers received; the body is left for a downstream decoder.
    Streaming {
        url: String,
        response: reqwest::Response,
    },
}

impl RawResponse {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Buffered { status, .. } => *status,
            Self::Streaming { response, .. } => response.status(),
        }
    }

    pub fn url(&self) -> &str {
        match self {
            Self::Buffered { url, .. } | Self::Streaming { url, .. } => url,
        }
    }

    /// Status, final URL and body, reading a streaming body to the end if needed.
    pub async fn into_buffered(self) -> Result<(StatusCode, String, Bytes), RequestError> {
        match self {
            Self::Buffered { status, url, body } => Ok((status, url, body)),
            Self::Streaming { url, response } => {
                let status = response.status();
                let body = response.bytes().await?;
                Ok((status, url, body))
            }
        }
    }
}

pub struct Executor {
    client: Client,
    default_timeout: Duration,
    shutdown: CancellationToken,
}

impl Executor {
    pub fn new(client: Client, default_timeout: Duration, shutdown: CancellationToken) -> Self {
        Self {
            client,
            default_timeout,
            shutdown,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Run one exchange for `spec` against the already-resolved `url`.
    ///
    /// `authorization` is the session credential chosen by the interceptor; an
    /// explicit authorization set on the request always wins over it.
    pub async fn fetch(
        &self,
        spec: &RequestSpec,
        url: &str,
        authorization: Option<&str>,
    ) -> Result<RawResponse, RequestError> {
        let request = self.build_request(spec, url, authorization)?;
        let timeout = spec.timeout_override().unwrap_or(self.default_timeout);
        let mode = spec.mode();
        let started = Instant::now();

        debug!(method = %spec.method(), %url, timeout_ms = timeout.as_millis() as u64, "Dispatching request");

        let exchange = exchange(request, mode, url.to_string());

        // Whichever branch finishes first drops the others, which aborts the
        // in-flight exchange and disarms the timer on every exit path.
        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RequestError::Cancelled { url: url.to_string() }),
            _ = caller_cancelled(spec.cancellation()) => Err(RequestError::Cancelled { url: url.to_string() }),
            result = tokio::time::timeout(timeout, exchange) => match result {
                Ok(result) => result,
                Err(_) => Err(RequestError::Timeout { url: url.to_string(), timeout }),
            },
        };

        match &outcome {
            Ok(response) => debug!(
                %url,
                status = response.status().as_u16(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Request completed"
            ),
            Err(e) => debug!(%url, error = %e, "Request failed"),
        }
        outcome
    }

    pub(crate) fn build_request(
        &self,
        spec: &RequestSpec,
        url: &str,
        authorization: Option<&str>,
    ) -> Result<RequestBuilder, RequestError> {
        // negotiated values replace caller-supplied ones instead of appending
        let mut headers = spec.headers().clone();
        match spec.body() {
            // reqwest writes the multipart content type together with its boundary
            RequestBody::Form(_) => {
                headers.remove(CONTENT_TYPE);
            }
            RequestBody::Json(_) => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_JSON));
            }
            RequestBody::Empty => {
                headers.insert(CONTENT_TYPE, HeaderValue::from_static(CONTENT_TYPE_TEXT));
            }
        }

        if let Some(value) = spec.explicit_authorization().or(authorization) {
            let value = HeaderValue::from_str(value)
                .map_err(|e| RequestError::invalid_header(AUTHORIZATION.as_str(), e.to_string()))?;
            headers.insert(AUTHORIZATION, value);
        }

        let builder = self
            .client
            .request(spec.method().clone(), url)
            .headers(headers);

        let builder = match spec.body() {
            RequestBody::Form(form) => builder.multipart(form.to_multipart()?),
            RequestBody::Json(bytes) => builder.body(bytes.clone()),
            RequestBody::Empty => builder,
        };

        Ok(builder)
    }
}

async fn exchange(
    request: RequestBuilder,
    mode: ResponseMode,
    url: String,
) -> Result<RawResponse, RequestError> {
    let response = request.send().await?;
    if mode == ResponseMode::Raw {
        return Ok(RawResponse::Streaming { url, response });
    }
    let status = response.status();
    let body = response.bytes().await?;
    Ok(RawResponse::Buffered { status, url, body })
}

async fn caller_cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}
