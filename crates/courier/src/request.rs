//! Request description shared by every transport mode.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::RequestError;

pub use reqwest::Method;

pub const CONTENT_TYPE_JSON: &str = "application/json;charset=UTF-8";
pub const CONTENT_TYPE_TEXT: &str = "text/plain;charset=UTF-8";

/// How the response of a call is handed back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseMode {
    /// Body is a `{code, message, data}` envelope.
    #[default]
    Envelope,
    /// Body is returned as raw bytes; binary responses carry no envelope.
    Blob,
    /// Body is left unread for a downstream decoder.
    Raw,
}

/// Request payload. JSON and multipart form are mutually exclusive.
#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    /// Pre-serialized JSON so replays reuse the exact same bytes.
    Json(Bytes),
    Form(FormData),
}

impl RequestBody {
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

#[derive(Debug, Clone)]
pub enum FormValue {
    Text(String),
    File {
        bytes: Bytes,
        file_name: String,
        mime: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct FormField {
    pub name: String,
    pub value: FormValue,
}

/// Multipart form payload.
///
/// Kept as plain data and rebuilt into a `reqwest` form on every dispatch so a
/// request replayed after a token refresh sends the same fields again.
#[derive(Debug, Clone, Default)]
pub struct FormData {
    fields: Vec<FormField>,
}

impl FormData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.push(FormField {
            name: name.into(),
            value: FormValue::Text(value.into()),
        });
        self
    }

    pub fn file(
        mut self,
        name: impl Into<String>,
        file_name: impl Into<String>,
        bytes: impl Into<Bytes>,
        mime: Option<&str>,
    ) -> Self {
        self.fields.push(FormField {
            name: name.into(),
            value: FormValue::File {
                bytes: bytes.into(),
                file_name: file_name.into(),
                mime: mime.map(str::to_owned),
            },
        });
        self
    }

    /// Build text fields from a flat serializable object. Null members are skipped.
    pub fn from_serializable<T: Serialize>(value: &T) -> Result<Self, RequestError> {
        let mut form = Self::new();
        for (name, value) in flatten_object(value)? {
            if let Some(value) = value {
                form = form.text(name, value);
            }
        }
        Ok(form)
    }

    pub fn fields(&self) -> &[FormField] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub(crate) fn to_multipart(&self) -> Result<Form, RequestError> {
        let mut form = Form::new();
        for field in &self.fields {
            form = match &field.value {
                FormValue::Text(text) => form.text(field.name.clone(), text.clone()),
                FormValue::File {
                    bytes,
                    file_name,
                    mime,
                } => {
                    let mut part = Part::bytes(bytes.to_vec()).file_name(file_name.clone());
                    if let Some(mime) = mime {
                        part = part.mime_str(mime)?;
                    }
                    form.part(field.name.clone(), part)
                }
            };
        }
        Ok(form)
    }
}

/// Immutable description of one call.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    target: String,
    base_url: Option<String>,
    query: Vec<(String, Option<String>)>,
    body: RequestBody,
    authorization: Option<String>,
    headers: HeaderMap,
    timeout: Option<Duration>,
    mode: ResponseMode,
    cancellation: Option<CancellationToken>,
}

impl RequestSpec {
    pub fn new(method: Method, target: impl Into<String>) -> Self {
        Self {
            method,
            target: target.into(),
            base_url: None,
            query: Vec::new(),
            body: RequestBody::Empty,
            authorization: None,
            headers: HeaderMap::new(),
            timeout: None,
            mode: ResponseMode::Envelope,
            cancellation: None,
        }
    }

    pub fn get(target: impl Into<String>) -> Self {
        Self::new(Method::GET, target)
    }

    pub fn post(target: impl Into<String>) -> Self {
        Self::new(Method::POST, target)
    }

    pub fn put(target: impl Into<String>) -> Self {
        Self::new(Method::PUT, target)
    }

    pub fn delete(target: impl Into<String>) -> Self {
        Self::new(Method::DELETE, target)
    }

    pub fn patch(target: impl Into<String>) -> Self {
        Self::new(Method::PATCH, target)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), Some(value.to_string())));
        self
    }

    /// Add a query entry that is omitted entirely when `value` is `None`.
    pub fn query_opt<V: ToString>(mut self, key: impl Into<String>, value: Option<V>) -> Self {
        self.query.push((key.into(), value.map(|v| v.to_string())));
        self
    }

    /// Add every member of a flat serializable object as a query entry.
    pub fn query_object<T: Serialize>(mut self, value: &T) -> Result<Self, RequestError> {
        self.query.extend(flatten_object(value)?);
        Ok(self)
    }

    /// Serialize `body` as JSON. Replaces any form payload.
    pub fn json<T: Serialize + ?Sized>(mut self, body: &T) -> Result<Self, RequestError> {
        let bytes =
            serde_json::to_vec(body).map_err(|source| RequestError::Serialize { source })?;
        self.body = RequestBody::Json(Bytes::from(bytes));
        Ok(self)
    }

    /// Send a multipart form. Replaces any JSON payload.
    pub fn form(mut self, form: FormData) -> Self {
        self.body = RequestBody::Form(form);
        self
    }

    /// Explicit `Authorization` value; the session credential is not attached when set.
    pub fn authorization(mut self, value: impl Into<String>) -> Self {
        self.authorization = Some(value.into());
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Result<Self, RequestError> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RequestError::invalid_header(name, e.to_string()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|e| RequestError::invalid_header(name, e.to_string()))?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Resolve relative targets against this address instead of the client's.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Abort the call (including time spent queued behind a refresh) when `token` fires.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    pub(crate) fn with_mode(mut self, mode: ResponseMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn base_url_override(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    pub fn body(&self) -> &RequestBody {
        &self.body
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn explicit_authorization(&self) -> Option<&str> {
        self.authorization.as_deref()
    }

    /// True when the caller supplied its own auth header by either route.
    pub fn has_explicit_authorization(&self) -> bool {
        self.authorization.is_some() || self.headers.contains_key(AUTHORIZATION)
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    /// Full URL for this call: absolute targets pass through, relative ones get
    /// the base address prefixed, then the query string is appended.
    pub fn resolve_url(&self, default_base: &str) -> Result<String, RequestError> {
        let base = self.base_url.as_deref().unwrap_or(default_base);
        let url = if is_absolute(&self.target) {
            self.target.clone()
        } else {
            join_base(base, &self.target)
        };

        let query = build_query(&self.query);
        let full = if query.is_empty() {
            url
        } else if url.contains('?') {
            format!("{url}&{query}")
        } else {
            format!("{url}?{query}")
        };

        Url::parse(&full).map_err(|e| RequestError::invalid_url(&full, e.to_string()))?;
        Ok(full)
    }
}

/// `http`/`https` URLs are used as-is; anything else is a path.
pub fn is_absolute(target: &str) -> bool {
    Url::parse(target)
        .map(|url| matches!(url.scheme(), "http" | "https"))
        .unwrap_or(false)
}

fn join_base(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) if !base.is_empty() && !path.is_empty() => format!("{base}/{path}"),
        _ => format!("{base}{path}"),
    }
}

/// `key=value` pairs joined by `&`, each component percent-encoded.
/// Entries without a value are dropped, not sent empty.
pub fn build_query(params: &[(String, Option<String>)]) -> String {
    params
        .iter()
        .filter_map(|(key, value)| {
            value.as_ref().map(|value| {
                format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(value)
                )
            })
        })
        .collect::<Vec<_>>()
        .join("&")
}

fn flatten_object<T: Serialize>(value: &T) -> Result<Vec<(String, Option<String>)>, RequestError> {
    let value =
        serde_json::to_value(value).map_err(|source| RequestError::Serialize { source })?;
    match value {
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| (key, scalar_to_string(value)))
            .collect()),
        Value::Null => Ok(Vec::new()),
        other => Err(RequestError::Serialize {
            source: serde::ser::Error::custom(format!(
                "expected a flat object, got {}",
                json_kind(&other)
            )),
        }),
    }
}

fn scalar_to_string(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        nested => Some(nested.to_string()),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
