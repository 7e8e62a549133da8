//! Attaches the session credential to outbound calls and recovers from 401.

use std::sync::Arc;

use reqwest::StatusCode;
use tracing::{debug, instrument, warn};

use crate::credential::SessionStore;
use crate::error::RequestError;
use crate::executor::{Executor, RawResponse};
use crate::refresh::RefreshCoordinator;
use crate::request::{RequestSpec, is_absolute};

pub struct AuthInterceptor {
    executor: Arc<Executor>,
    session: Arc<dyn SessionStore>,
    coordinator: Arc<RefreshCoordinator>,
    base_url: String,
}

impl AuthInterceptor {
    pub fn new(
        executor: Arc<Executor>,
        session: Arc<dyn SessionStore>,
        coordinator: Arc<RefreshCoordinator>,
        base_url: impl Into<String>,
    ) -> Self {
        Self {
            executor,
            session,
            coordinator,
            base_url: base_url.into(),
        }
    }

    /// Run `spec`, replaying it at most once after a credential refresh.
    ///
    /// The returned response may still carry a 401 (a replay that was rejected
    /// again, or a call the interceptor does not manage); the envelope codec
    /// turns it into [`RequestError::Unauthorized`].
    #[instrument(skip_all, fields(method = %spec.method(), target = spec.target()))]
    pub async fn execute(&self, spec: &RequestSpec) -> Result<RawResponse, RequestError> {
        let url = spec.resolve_url(&self.base_url)?;
        let managed = !spec.has_explicit_authorization() && self.targets_api(spec, &url);
        let mut retried = false;

        loop {
            // read before dispatch so a refresh finishing mid-flight is detected
            let generation = self.coordinator.generation();
            let authorization = if managed {
                self.session
                    .current_credential()
                    .map(|credential| credential.authorization())
            } else {
                None
            };

            let response = self
                .executor
                .fetch(spec, &url, authorization.as_deref())
                .await?;

            if authorization.is_none() || response.status() != StatusCode::UNAUTHORIZED {
                return Ok(response);
            }

            if retried {
                warn!(%url, "Request rejected again after credential refresh");
                return Ok(response);
            }
            retried = true;

            self.coordinator
                .wait_for_refresh(spec.method(), &url, generation, spec.cancellation())
                .await?;
            debug!(%url, "Replaying request with refreshed credential");
        }
    }

    /// Only calls to our own API carry the session credential.
    fn targets_api(&self, spec: &RequestSpec, url: &str) -> bool {
        if !is_absolute(spec.target()) {
            return true;
        }
        let base = spec.base_url_override().unwrap_or(self.base_url.as_str());
        !base.is_empty() && url.starts_with(base)
    }
}
