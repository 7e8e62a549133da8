//! The client facade used by the business API layer.

use std::sync::Arc;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{ClientConfig, create_client};
use crate::credential::{Credential, MemorySessionStore, SessionStore};
use crate::envelope::{check_status, decode_response};
use crate::error::RequestError;
use crate::events::{ClientEvent, EventBus};
use crate::executor::{Executor, RawResponse};
use crate::interceptor::AuthInterceptor;
use crate::refresh::{EndpointRefresher, RefreshCoordinator, RefreshSnapshot, TokenRefresher};
use crate::request::{RequestSpec, ResponseMode};
use crate::stream::{self, ByteStream, EventStream};

/// Cheap to clone; clones share the session, the refresh coordinator and the
/// connection pool.
#[derive(Clone)]
pub struct ApiClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: ClientConfig,
    executor: Arc<Executor>,
    session: Arc<dyn SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    interceptor: AuthInterceptor,
    events: EventBus,
    shutdown: CancellationToken,
}

pub struct ApiClientBuilder {
    config: ClientConfig,
    session: Option<Arc<dyn SessionStore>>,
    refresher: Option<Arc<dyn TokenRefresher>>,
    http_client: Option<Client>,
}

impl ApiClientBuilder {
    /// Share a session store with the rest of the application.
    pub fn session_store(mut self, session: Arc<dyn SessionStore>) -> Self {
        self.session = Some(session);
        self
    }

    /// Replace the default refresh endpoint call.
    pub fn refresher(mut self, refresher: Arc<dyn TokenRefresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }

    pub fn http_client(mut self, client: Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn build(self) -> Result<ApiClient, RequestError> {
        let config = self.config;
        let http = match self.http_client {
            Some(client) => client,
            None => create_client(&config)?,
        };

        let shutdown = CancellationToken::new();
        let executor = Arc::new(Executor::new(http, config.default_timeout, shutdown.clone()));

        let session: Arc<dyn SessionStore> = match self.session {
            Some(session) => session,
            None => Arc::new(MemorySessionStore::new()),
        };
        let refresher: Arc<dyn TokenRefresher> = match self.refresher {
            Some(refresher) => refresher,
            None => Arc::new(EndpointRefresher::new(
                Arc::clone(&executor),
                config.base_url.clone(),
                config.refresh_path.clone(),
            )),
        };

        let events = EventBus::new(config.event_capacity);
        let coordinator = Arc::new(RefreshCoordinator::new(
            refresher,
            Arc::clone(&session),
            events.clone(),
            shutdown.clone(),
        ));
        let interceptor = AuthInterceptor::new(
            Arc::clone(&executor),
            Arc::clone(&session),
            Arc::clone(&coordinator),
            config.base_url.clone(),
        );

        debug!(base_url = %config.base_url, timeout_ms = config.default_timeout.as_millis() as u64, "API client ready");
        Ok(ApiClient {
            inner: Arc::new(ClientInner {
                config,
                executor,
                session,
                coordinator,
                interceptor,
                events,
                shutdown,
            }),
        })
    }
}

impl ApiClient {
    pub fn new(config: ClientConfig) -> Result<Self, RequestError> {
        Self::builder(config).build()
    }

    pub fn builder(config: ClientConfig) -> ApiClientBuilder {
        ApiClientBuilder {
            config,
            session: None,
            refresher: None,
            http_client: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn session(&self) -> &Arc<dyn SessionStore> {
        &self.inner.session
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.events.subscribe()
    }

    pub fn coordinator_snapshot(&self) -> RefreshSnapshot {
        self.inner.coordinator.snapshot()
    }

    /// Abort every in-flight and queued call and end open streams.
    pub fn shutdown(&self) {
        info!("Shutting down API client");
        self.inner.shutdown.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Run an enveloped call and return its decoded `data`.
    pub async fn send<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T, RequestError> {
        let spec = spec.with_mode(ResponseMode::Envelope);
        let result = async {
            let (status, url, body) = self.inner.interceptor.execute(&spec).await?.into_buffered().await?;
            decode_response(status, &url, &body)
        }
        .await;
        self.report(&spec, result)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        self.send(RequestSpec::get(path)).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(RequestSpec::post(path).json(body)?).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(RequestSpec::put(path).json(body)?).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, RequestError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.send(RequestSpec::patch(path).json(body)?).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, RequestError> {
        self.send(RequestSpec::delete(path)).await
    }

    /// Binary download. The body carries no envelope and is returned as-is.
    pub async fn blob(&self, spec: RequestSpec) -> Result<Bytes, RequestError> {
        let spec = spec.with_mode(ResponseMode::Blob);
        let result = async {
            let (status, url, body) = self.inner.interceptor.execute(&spec).await?.into_buffered().await?;
            check_status(status, &url, &body)?;
            Ok::<_, RequestError>(body)
        }
        .await;
        self.report(&spec, result)
    }

    /// Unparsed response body for a downstream decoder.
    ///
    /// Setup failures (including a non-success status) are reported as
    /// [`RequestError::StreamUnavailable`] before any chunk is produced. The
    /// timeout covers setup only; an open stream ends on [`shutdown`](Self::shutdown).
    pub async fn bytes_stream(&self, spec: RequestSpec) -> Result<ByteStream, RequestError> {
        let spec = spec.with_mode(ResponseMode::Raw);
        let response = self
            .inner
            .interceptor
            .execute(&spec)
            .await
            .map_err(RequestError::stream_unavailable)?;

        let status = response.status();
        if !status.is_success() {
            let url = response.url().to_string();
            let timeout = spec
                .timeout_override()
                .unwrap_or(self.inner.executor.default_timeout());
            let body = match tokio::time::timeout(timeout, response.into_buffered()).await {
                Ok(Ok((_, _, body))) => body,
                _ => Bytes::new(),
            };
            let err = match check_status(status, &url, &body) {
                Err(e) => e,
                Ok(()) => RequestError::HttpStatus {
                    status,
                    url,
                    body: String::new(),
                },
            };
            warn!(status = status.as_u16(), "Stream request rejected");
            return Err(RequestError::stream_unavailable(err));
        }

        let shutdown = self.inner.shutdown.clone().cancelled_owned();
        let stream: ByteStream = match response {
            RawResponse::Streaming { response, .. } => Box::pin(
                response
                    .bytes_stream()
                    .map_err(RequestError::from)
                    .take_until(shutdown),
            ),
            RawResponse::Buffered { body, .. } => Box::pin(futures::stream::iter([Ok(body)])),
        };
        Ok(stream)
    }

    /// Server-push events with the raw trimmed payload.
    pub async fn text_events(&self, spec: RequestSpec) -> Result<EventStream<String>, RequestError> {
        Ok(stream::text_events(self.bytes_stream(spec).await?))
    }

    /// Server-push events with the payload parsed as JSON.
    pub async fn json_events<T>(&self, spec: RequestSpec) -> Result<EventStream<T>, RequestError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        Ok(stream::json_events(self.bytes_stream(spec).await?))
    }

    /// Run a login call and store the returned credential in the session.
    pub async fn sign_in(&self, spec: RequestSpec) -> Result<Credential, RequestError> {
        let credential: Credential = self.send(spec).await?;
        self.inner.session.set_credential(credential.clone());
        info!(token_type = %credential.token_type, "Signed in");
        Ok(credential)
    }

    pub fn sign_out(&self) {
        self.inner.session.clear();
        info!("Signed out");
    }

    fn report<T>(&self, spec: &RequestSpec, result: Result<T, RequestError>) -> Result<T, RequestError> {
        if let Err(e) = &result {
            if e.is_display_error() {
                let url = spec
                    .resolve_url(&self.inner.config.base_url)
                    .unwrap_or_else(|_| spec.target().to_string());
                let message = match e {
                    RequestError::Envelope { message, .. } => message.clone(),
                    other => other.to_string(),
                };
                self.inner.events.emit(ClientEvent::request_failed(
                    url,
                    e.status().map(|s| s.as_u16()),
                    message,
                ));
            }
        }
        result
    }
}
