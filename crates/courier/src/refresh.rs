//! Single-flight credential refresh.
//!
//! Any number of calls rejected with 401 while the same credential is current
//! collapse into one refresh round-trip. The first rejected call starts the
//! cycle; every rejected call (including the first) parks on the queue until
//! the cycle ends, then is resumed to replay itself or failed together with the
//! rest.
//!
//! All transitions of the refreshing flag, the queue and the generation
//! counter happen under one lock, so a queue that has begun draining can never
//! gain entries.

use std::collections::VecDeque;
use std::mem;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use reqwest::Method;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::credential::{Credential, SessionStore};
use crate::envelope::decode_response;
use crate::error::RequestError;
use crate::events::{ClientEvent, EventBus};
use crate::executor::{Executor, RawResponse};
use crate::request::RequestSpec;

/// Exchanges the current credential for a new one.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, current: &Credential) -> Result<Credential, RequestError>;
}

/// Calls the refresh endpoint of the API directly, without going through the
/// auth interceptor, so a rejected refresh can never queue behind itself.
pub struct EndpointRefresher {
    executor: Arc<Executor>,
    base_url: String,
    path: String,
}

impl EndpointRefresher {
    pub fn new(executor: Arc<Executor>, base_url: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            executor,
            base_url: base_url.into(),
            path: path.into(),
        }
    }
}

#[async_trait]
impl TokenRefresher for EndpointRefresher {
    async fn refresh(&self, current: &Credential) -> Result<Credential, RequestError> {
        let spec = RequestSpec::post(self.path.as_str()).authorization(current.refresh_authorization());
        let url = spec.resolve_url(&self.base_url)?;

        match self.executor.fetch(&spec, &url, None).await? {
            RawResponse::Buffered { status, url, body } => decode_response(status, &url, &body),
            RawResponse::Streaming { url, .. } => Err(RequestError::refresh_failed(format!(
                "unexpected streaming response from {url}"
            ))),
        }
    }
}

/// A call parked until the current refresh cycle ends.
struct PendingRequest {
    method: Method,
    url: String,
    resume: oneshot::Sender<Result<(), RequestError>>,
}

#[derive(Default)]
struct RefreshState {
    refreshing: bool,
    queue: VecDeque<PendingRequest>,
    /// Bumped every time a refresh stores a new credential.
    generation: u64,
    /// Completed cycles, successful or not.
    cycles: u64,
}

/// Point-in-time view of the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSnapshot {
    pub refreshing: bool,
    pub queued: usize,
    pub cycles: u64,
    pub generation: u64,
}

pub struct RefreshCoordinator {
    state: Mutex<RefreshState>,
    refresher: Arc<dyn TokenRefresher>,
    session: Arc<dyn SessionStore>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl RefreshCoordinator {
    pub fn new(
        refresher: Arc<dyn TokenRefresher>,
        session: Arc<dyn SessionStore>,
        events: EventBus,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            state: Mutex::new(RefreshState::default()),
            refresher,
            session,
            events,
            shutdown,
        }
    }

    /// Credential generation; read before dispatch and handed back to
    /// [`wait_for_refresh`](Self::wait_for_refresh) on a 401.
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub fn snapshot(&self) -> RefreshSnapshot {
        let state = self.state.lock();
        RefreshSnapshot {
            refreshing: state.refreshing,
            queued: state.queue.len(),
            cycles: state.cycles,
            generation: state.generation,
        }
    }

    /// Park a call rejected with 401 until a refresh settles.
    ///
    /// `seen_generation` is the generation observed when the rejected call was
    /// dispatched. If a refresh already completed since then, the call returns
    /// at once and may replay with the newer credential. `Ok(())` means the
    /// caller should replay; an error is final for the call.
    pub async fn wait_for_refresh(
        self: &Arc<Self>,
        method: &Method,
        url: &str,
        seen_generation: u64,
        cancel: Option<&CancellationToken>,
    ) -> Result<(), RequestError> {
        let (resume, resumed) = oneshot::channel();

        let initiator = {
            let mut state = self.state.lock();
            if state.generation != seen_generation {
                debug!(%url, "Credential already refreshed since dispatch");
                return Ok(());
            }
            if !state.refreshing && !self.session.is_authenticated() {
                return Err(RequestError::refresh_failed("no credential to refresh"));
            }

            state.queue.push_back(PendingRequest {
                method: method.clone(),
                url: url.to_string(),
                resume,
            });
            !mem::replace(&mut state.refreshing, true)
        };

        if initiator {
            debug!(%method, %url, "Starting credential refresh");
            tokio::spawn(Arc::clone(self).run_cycle());
        } else {
            debug!(%method, %url, "Queued behind credential refresh");
        }

        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => Err(RequestError::Cancelled { url: url.to_string() }),
            _ = cancelled => Err(RequestError::Cancelled { url: url.to_string() }),
            outcome = resumed => outcome.unwrap_or_else(|_| {
                Err(RequestError::refresh_failed("refresh ended without a result"))
            }),
        }
    }

    #[instrument(skip(self))]
    async fn run_cycle(self: Arc<Self>) {
        let mut guard = CycleGuard {
            coordinator: Arc::clone(&self),
            armed: true,
        };

        let outcome = match self.session.current_credential() {
            Some(current) => self.refresher.refresh(&current).await,
            None => Err(RequestError::refresh_failed("no credential to refresh")),
        };
        guard.armed = false;

        match outcome {
            Ok(credential) => {
                // visible to replays before any of them is resumed
                self.session.set_credential(credential);
                let queue = self.finish_cycle(true);
                info!(resumed = queue.len(), "Credential refreshed");
                for entry in queue {
                    debug!(method = %entry.method, url = %entry.url, "Resuming queued request");
                    // a cancelled waiter has dropped its receiver
                    let _ = entry.resume.send(Ok(()));
                }
                self.events.emit(ClientEvent::credential_refreshed());
            }
            Err(e) if matches!(e, RequestError::Cancelled { .. }) || self.shutdown.is_cancelled() => {
                // a local abort says nothing about the credential
                let queue = self.finish_cycle(false);
                info!(cancelled = queue.len(), "Credential refresh cancelled, session kept");
                for entry in queue {
                    let _ = entry.resume.send(Err(RequestError::Cancelled { url: entry.url }));
                }
            }
            Err(e) => {
                let reason = match e {
                    RequestError::RefreshFailed { reason } => reason,
                    other => other.to_string(),
                };
                self.session.clear();
                let queue = self.finish_cycle(false);
                warn!(error = %reason, rejected = queue.len(), "Credential refresh failed, session cleared");
                for entry in queue {
                    let _ = entry
                        .resume
                        .send(Err(RequestError::refresh_failed(reason.clone())));
                }
                self.events.emit(ClientEvent::session_expired(reason));
            }
        }
    }

    /// Close the cycle and take its queue in one step.
    fn finish_cycle(&self, refreshed: bool) -> VecDeque<PendingRequest> {
        let mut state = self.state.lock();
        state.refreshing = false;
        state.cycles += 1;
        if refreshed {
            state.generation += 1;
        }
        mem::take(&mut state.queue)
    }
}

/// Fails the queue if the refresh task dies before reporting an outcome.
struct CycleGuard {
    coordinator: Arc<RefreshCoordinator>,
    armed: bool,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let queue = self.coordinator.finish_cycle(false);
        warn!(rejected = queue.len(), "Refresh task aborted");
        for entry in queue {
            let _ = entry
                .resume
                .send(Err(RequestError::refresh_failed("refresh task aborted")));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::MemorySessionStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    struct GatedRefresher {
        calls: AtomicUsize,
        gate: Notify,
        fail: bool,
        shutdown: CancellationToken,
    }

    #[async_trait]
    impl TokenRefresher for GatedRefresher {
        async fn refresh(&self, current: &Credential) -> Result<Credential, RequestError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::select! {
                _ = self.gate.notified() => {}
                _ = self.shutdown.cancelled() => {
                    return Err(RequestError::Cancelled {
                        url: "http://localhost/auth/token/refresh".to_string(),
                    });
                }
            }
            if self.fail {
                Err(RequestError::refresh_failed("refresh token revoked"))
            } else {
                Ok(Credential::new("fresh", "r2", current.token_type.clone()))
            }
        }
    }

    struct Harness {
        coordinator: Arc<RefreshCoordinator>,
        refresher: Arc<GatedRefresher>,
        session: Arc<MemorySessionStore>,
        events: EventBus,
        shutdown: CancellationToken,
    }

    fn harness(fail: bool) -> Harness {
        let shutdown = CancellationToken::new();
        let refresher = Arc::new(GatedRefresher {
            calls: AtomicUsize::new(0),
            gate: Notify::new(),
            fail,
            shutdown: shutdown.clone(),
        });
        let session = Arc::new(MemorySessionStore::with_credential(Credential::new(
            "stale", "r1", "bearer",
        )));
        let events = EventBus::new(8);
        let coordinator = Arc::new(RefreshCoordinator::new(
            refresher.clone(),
            session.clone(),
            events.clone(),
            shutdown.clone(),
        ));
        Harness {
            coordinator,
            refresher,
            session,
            events,
            shutdown,
        }
    }

    fn spawn_waiters(
        coordinator: &Arc<RefreshCoordinator>,
        count: usize,
        generation: u64,
    ) -> Vec<tokio::task::JoinHandle<Result<(), RequestError>>> {
        (0..count)
            .map(|i| {
                let coordinator = Arc::clone(coordinator);
                tokio::spawn(async move {
                    let url = format!("http://localhost/items/{i}");
                    coordinator
                        .wait_for_refresh(&Method::GET, &url, generation, None)
                        .await
                })
            })
            .collect()
    }

    async fn until_queued(coordinator: &RefreshCoordinator, count: usize) {
        while coordinator.snapshot().queued < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn concurrent_waiters_share_one_refresh() {
        let h = harness(false);
        let generation = h.coordinator.generation();
        let waiters = spawn_waiters(&h.coordinator, 8, generation);

        until_queued(&h.coordinator, 8).await;
        assert!(h.coordinator.snapshot().refreshing);
        h.refresher.gate.notify_one();

        for waiter in waiters {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.session.current_credential().unwrap().access_token, "fresh");
        assert_eq!(
            h.coordinator.snapshot(),
            RefreshSnapshot {
                refreshing: false,
                queued: 0,
                cycles: 1,
                generation: generation + 1,
            }
        );
    }

    #[tokio::test]
    async fn late_rejection_after_refresh_replays_immediately() {
        let h = harness(false);
        let before = h.coordinator.generation();
        let waiters = spawn_waiters(&h.coordinator, 1, before);
        until_queued(&h.coordinator, 1).await;
        h.refresher.gate.notify_one();
        waiters.into_iter().next().unwrap().await.unwrap().unwrap();

        // dispatched with the old credential, rejected after the cycle ended
        h.coordinator
            .wait_for_refresh(&Method::GET, "http://localhost/late", before, None)
            .await
            .unwrap();
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.coordinator.snapshot().cycles, 1);
    }

    #[tokio::test]
    async fn failed_refresh_rejects_all_and_clears_session() {
        let h = harness(true);
        let mut events = h.events.subscribe();
        let waiters = spawn_waiters(&h.coordinator, 5, h.coordinator.generation());

        until_queued(&h.coordinator, 5).await;
        h.refresher.gate.notify_one();

        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, RequestError::RefreshFailed { ref reason } if reason == "refresh token revoked"));
        }
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
        assert!(!h.session.is_authenticated());

        let event = events.recv().await.unwrap();
        assert_eq!(event.event_name(), "session_expired");

        let snapshot = h.coordinator.snapshot();
        assert!(!snapshot.refreshing);
        assert_eq!(snapshot.cycles, 1);
        assert_eq!(snapshot.generation, 0);
    }

    #[tokio::test]
    async fn no_credential_fails_without_refreshing() {
        let h = harness(false);
        h.session.clear();
        let err = h
            .coordinator
            .wait_for_refresh(&Method::GET, "http://localhost/x", 0, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RequestError::RefreshFailed { .. }));
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.coordinator.snapshot().cycles, 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_leaves_others_untouched() {
        let h = harness(false);
        let token = CancellationToken::new();
        let cancelled = {
            let coordinator = Arc::clone(&h.coordinator);
            let token = token.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_refresh(&Method::GET, "http://localhost/c", 0, Some(&token))
                    .await
            })
        };
        let others = spawn_waiters(&h.coordinator, 3, 0);
        until_queued(&h.coordinator, 4).await;

        token.cancel();
        let err = tokio::time::timeout(Duration::from_secs(1), cancelled)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, RequestError::Cancelled { .. }));

        h.refresher.gate.notify_one();
        for waiter in others {
            waiter.await.unwrap().unwrap();
        }
        assert_eq!(h.refresher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_mid_refresh_keeps_the_session() {
        let h = harness(false);
        let mut events = h.events.subscribe();
        let waiters = spawn_waiters(&h.coordinator, 3, h.coordinator.generation());
        until_queued(&h.coordinator, 3).await;

        h.shutdown.cancel();
        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, RequestError::Cancelled { .. }), "{err:?}");
        }
        while h.coordinator.snapshot().refreshing {
            tokio::task::yield_now().await;
        }

        assert!(h.session.is_authenticated());
        assert_eq!(h.session.current_credential().unwrap().access_token, "stale");
        assert_eq!(h.coordinator.snapshot().generation, 0);
        assert!(matches!(
            events.try_recv(),
            Err(tokio::sync::broadcast::error::TryRecvError::Empty)
        ));
    }
}
