//! Resilient client over one raw ensemble session.
//!
//! [`CoordinationClient`] wraps a raw [`EnsembleSession`] and turns its failure modes
//! into the taxonomy documented in [`super::error`]:
//!
//! - Every call gets one session window (the configured session timeout). Connection
//!   loss inside that window is retried; the caller never sees it.
//! - When the raw session reports expiry, or the client stays `SUSPENDED` for a full
//!   session timeout, the client moves to `EXPIRED`. Every later call fails with
//!   [`CoordinationError::SessionExpired`]; ephemeral nodes are never recreated.
//! - If the first connect never succeeds the client ends in `DISCONNECTED` and every
//!   call fails with [`CoordinationError::ConnectionFailed`].
//!
//! # Notification Context
//!
//! All callbacks (watch fires, async operation completions, [`CoordinationClient::notify`]
//! jobs and the connection-lost hook) run on one dispatcher task, strictly one after
//! another, in submission order. Callbacks may call back into the client; they must
//! not wait for another callback to run.
//!
//! # Watches
//!
//! A [`Watch`] is a one-shot handle. Passing it to a read registers it; it fires at
//! most once and is then forgotten. Continued notification requires passing it again
//! on a fresh read, normally from inside the callback itself.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::ensemble::{
    CreateMode, EnsembleConnector, EnsembleError, EnsembleSession, Op, OpResult, SessionEvent,
    SessionEvents, SessionId, Stat, WatchKind, WatchedEvent,
};
use super::error::{CoordinationError, CoordinationResult};
use super::retry;
use super::session::{SessionState, SessionStateCell};
use crate::metrics;

/// Callback run once when the session becomes unusable for good.
pub type ConnectionLostHook = Box<dyn FnOnce() + Send + 'static>;

type WatchCallback = Arc<dyn Fn(WatchedEvent) -> BoxFuture<'static, ()> + Send + Sync>;

static NEXT_WATCH_ID: AtomicU64 = AtomicU64::new(1);

/// One-shot watch handle.
///
/// Clones share identity: registering the same handle twice on the same target
/// before it fires yields one notification.
#[derive(Clone)]
pub struct Watch {
    id: u64,
    callback: WatchCallback,
}

impl Watch {
    /// Wrap an async callback.
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(WatchedEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            id: NEXT_WATCH_ID.fetch_add(1, Ordering::Relaxed),
            callback: Arc::new(move |event| -> BoxFuture<'static, ()> { Box::pin(callback(event)) }),
        }
    }

    /// Identity shared by all clones of this handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Callback future for `event`, detached from any registration.
    ///
    /// Lets the owner replay its own watch, typically by handing the future to
    /// [`CoordinationClient::notify`] after a failed re-arm.
    pub fn trigger(&self, event: WatchedEvent) -> BoxFuture<'static, ()> {
        (self.callback)(event)
    }
}

impl fmt::Debug for Watch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watch").field("id", &self.id).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum WatchTarget {
    Children,
    Data,
}

impl WatchTarget {
    fn for_event(kind: WatchKind) -> &'static [WatchTarget] {
        match kind {
            WatchKind::NodeChildrenChanged => &[WatchTarget::Children],
            WatchKind::NodeCreated | WatchKind::NodeDataChanged => &[WatchTarget::Data],
            WatchKind::NodeDeleted => &[WatchTarget::Data, WatchTarget::Children],
        }
    }
}

type WatchRegistry = DashMap<(WatchTarget, String), Vec<Watch>>;

enum Notification {
    Job(BoxFuture<'static, ()>),
    Watch(WatchedEvent),
}

struct ClientInner {
    connect_string: String,
    session_timeout: Duration,
    state: SessionStateCell,
    session: RwLock<Option<Arc<dyn EnsembleSession>>>,
    watches: Arc<WatchRegistry>,
    notify_tx: mpsc::UnboundedSender<Notification>,
    conn_lost: Mutex<Option<ConnectionLostHook>>,
    failure: Mutex<Option<String>>,
    suspend_epoch: AtomicU64,
}

impl ClientInner {
    fn enqueue(&self, job: BoxFuture<'static, ()>) {
        if self.notify_tx.send(Notification::Job(job)).is_err() {
            debug!("Notification dispatcher gone, dropping job");
        }
    }

    fn fire_connection_lost(&self) {
        if let Some(hook) = self.conn_lost.lock().take() {
            self.enqueue(Box::pin(async move { hook() }));
        }
    }

    async fn expire(&self, reason: &'static str) {
        if self.state.transition(SessionState::Expired) {
            warn!(reason, "Coordination session expired");
            let session = self.session.read().clone();
            if let Some(session) = session {
                if let Err(e) = session.close().await {
                    debug!(error = %e, "Closing expired session failed");
                }
            }
            self.watches.clear();
            self.fire_connection_lost();
        }
    }

    fn arm_expiry_timer(self: &Arc<Self>) {
        let epoch = self.suspend_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(inner.session_timeout).await;
            if inner.state.get() == SessionState::Suspended
                && inner.suspend_epoch.load(Ordering::SeqCst) == epoch
            {
                inner
                    .expire("suspended for longer than the session timeout")
                    .await;
            }
        });
    }
}

/// Resilient coordination client. Cheap to clone; clones share one session.
#[derive(Clone)]
pub struct CoordinationClient {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for CoordinationClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinationClient")
            .field("connect_string", &self.inner.connect_string)
            .field("session_timeout", &self.inner.session_timeout)
            .field("state", &self.inner.state.get())
            .finish()
    }
}

impl CoordinationClient {
    /// Start connecting to the ensemble in the background.
    ///
    /// Returns immediately in `CONNECTING`; calls made before the session is
    /// established wait for it within their own session window. `conn_lost` runs once
    /// on the notification context if the session is lost for good (expiry or a failed
    /// first connect), but not on [`close`](Self::close).
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        connector: Arc<dyn EnsembleConnector>,
        connect_string: impl Into<String>,
        session_timeout: Duration,
        conn_lost: Option<ConnectionLostHook>,
    ) -> Self {
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let watches: Arc<WatchRegistry> = Arc::new(DashMap::new());
        let inner = Arc::new(ClientInner {
            connect_string: connect_string.into(),
            session_timeout,
            state: SessionStateCell::new(),
            session: RwLock::new(None),
            watches: Arc::clone(&watches),
            notify_tx,
            conn_lost: Mutex::new(conn_lost),
            failure: Mutex::new(None),
            suspend_epoch: AtomicU64::new(0),
        });
        inner.state.transition(SessionState::Connecting);

        tokio::spawn(run_dispatcher(watches, notify_rx));
        tokio::spawn(connect_and_pump(Arc::clone(&inner), connector));

        Self { inner }
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.inner.state.get()
    }

    /// Observe session state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Configured session timeout; also the retry window of every call.
    pub fn session_timeout(&self) -> Duration {
        self.inner.session_timeout
    }

    /// Connect string this client was created with.
    pub fn connect_string(&self) -> &str {
        &self.inner.connect_string
    }

    /// Identifier of the raw session, once established.
    pub fn session_id(&self) -> Option<SessionId> {
        self.inner.session.read().as_ref().map(|s| s.session_id())
    }

    /// Wait (within one session window) until the session is `CONNECTED`.
    pub async fn await_connected(&self) -> CoordinationResult<()> {
        let deadline = Instant::now() + self.inner.session_timeout;
        match self.session_for(deadline).await {
            Ok(_) => Ok(()),
            Err(CoordinationError::ConnectionLoss) => Err(CoordinationError::TimedOut {
                op: "await_connected",
                timeout: self.inner.session_timeout,
            }),
            Err(e) => Err(e),
        }
    }

    async fn session_for(&self, deadline: Instant) -> CoordinationResult<Arc<dyn EnsembleSession>> {
        let mut rx = self.inner.state.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                SessionState::Connected => {
                    let session = self.inner.session.read().clone();
                    if let Some(session) = session {
                        return Ok(session);
                    }
                }
                SessionState::Expired => return Err(CoordinationError::SessionExpired),
                SessionState::Closed => return Err(CoordinationError::Closed),
                SessionState::Disconnected => {
                    let reason = self
                        .inner
                        .failure
                        .lock()
                        .clone()
                        .unwrap_or_else(|| "no session".to_string());
                    return Err(CoordinationError::ConnectionFailed(reason));
                }
                SessionState::Connecting | SessionState::Suspended => {}
            }
            match tokio::time::timeout_at(deadline, rx.changed()).await {
                Ok(Ok(())) => continue,
                Ok(Err(_)) => return Err(CoordinationError::Closed),
                Err(_) => return Err(CoordinationError::ConnectionLoss),
            }
        }
    }

    async fn execute<T, F, Fut>(&self, op: &'static str, f: F) -> CoordinationResult<T>
    where
        F: Fn(Arc<dyn EnsembleSession>) -> Fut,
        Fut: Future<Output = Result<T, EnsembleError>>,
    {
        let started = std::time::Instant::now();
        let f = &f;
        let result =
            retry::within_session_window(op, self.inner.session_timeout, move |deadline| async move {
                let session = self.session_for(deadline).await?;
                f(session).await.map_err(CoordinationError::from)
            })
            .await;

        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.as_metric_label(),
        };
        metrics::record_op(op, status, started.elapsed().as_secs_f64());
        result
    }

    fn register_watch(&self, target: WatchTarget, path: &str, watch: &Watch) {
        let mut entry = self
            .inner
            .watches
            .entry((target, path.to_string()))
            .or_default();
        if !entry.iter().any(|w| w.id == watch.id) {
            entry.push(watch.clone());
        }
    }

    fn unregister_watch(&self, target: WatchTarget, path: &str, watch: &Watch) {
        let key = (target, path.to_string());
        if let Some(mut entry) = self.inner.watches.get_mut(&key) {
            entry.retain(|w| w.id != watch.id);
        }
        self.inner.watches.remove_if(&key, |_, list| list.is_empty());
    }

    /// Create a node, returning its actual path (including any sequence suffix).
    pub async fn create(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        let data = data.into();
        self.execute("create", move |session| {
            let data = data.clone();
            async move { session.create(path, data, mode).await }
        })
        .await
    }

    /// Create a node unless it already exists.
    ///
    /// An existing node counts as success, so a create whose acknowledgement was lost
    /// in a connection blip is safe to repeat. Returns the path of the node.
    pub async fn create_if_needed(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        mode: CreateMode,
    ) -> CoordinationResult<String> {
        let data = data.into();
        self.execute("create_if_needed", move |session| {
            let data = data.clone();
            async move {
                match session.create(path, data, mode).await {
                    Err(EnsembleError::NodeExists(_)) => Ok(path.to_string()),
                    other => other,
                }
            }
        })
        .await
    }

    /// Node metadata, or `None` if the node does not exist.
    ///
    /// A watch fires on creation, deletion or data change of `path`.
    pub async fn exists(&self, path: &str, watch: Option<Watch>) -> CoordinationResult<Option<Stat>> {
        if let Some(w) = &watch {
            self.register_watch(WatchTarget::Data, path, w);
        }
        let armed = watch.is_some();
        let result = self
            .execute("exists", move |session| async move {
                session.exists(path, armed).await
            })
            .await;
        if let (Err(_), Some(w)) = (&result, &watch) {
            self.unregister_watch(WatchTarget::Data, path, w);
        }
        result
    }

    /// Node data and metadata.
    pub async fn get_data(
        &self,
        path: &str,
        watch: Option<Watch>,
    ) -> CoordinationResult<(Bytes, Stat)> {
        if let Some(w) = &watch {
            self.register_watch(WatchTarget::Data, path, w);
        }
        let armed = watch.is_some();
        let result = self
            .execute("get_data", move |session| async move {
                session.get_data(path, armed).await
            })
            .await;
        if let (Err(_), Some(w)) = (&result, &watch) {
            self.unregister_watch(WatchTarget::Data, path, w);
        }
        result
    }

    /// Replace node data.
    pub async fn set_data(
        &self,
        path: &str,
        data: impl Into<Bytes>,
        version: Option<i32>,
    ) -> CoordinationResult<Stat> {
        let data = data.into();
        self.execute("set_data", move |session| {
            let data = data.clone();
            async move { session.set_data(path, data, version).await }
        })
        .await
    }

    /// Child names of `path`, in the order the ensemble returns them.
    ///
    /// A watch fires when a child is added or removed, or `path` is deleted.
    pub async fn get_children(
        &self,
        path: &str,
        watch: Option<Watch>,
    ) -> CoordinationResult<Vec<String>> {
        if let Some(w) = &watch {
            self.register_watch(WatchTarget::Children, path, w);
        }
        let armed = watch.is_some();
        let result = self
            .execute("get_children", move |session| async move {
                session.get_children(path, armed).await
            })
            .await;
        if let (Err(_), Some(w)) = (&result, &watch) {
            self.unregister_watch(WatchTarget::Children, path, w);
        }
        result
    }

    /// Delete a node. Returns `false` if it was already gone.
    pub async fn delete_if_exists(&self, path: &str, version: Option<i32>) -> CoordinationResult<bool> {
        self.execute("delete", move |session| async move {
            match session.delete(path, version).await {
                Ok(()) => Ok(true),
                Err(EnsembleError::NoNode(_)) => Ok(false),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Apply all operations atomically.
    pub async fn multi(&self, ops: Vec<Op>) -> CoordinationResult<Vec<OpResult>> {
        let ops = &ops;
        self.execute("multi", move |session| {
            let ops = ops.clone();
            async move { session.multi(ops).await }
        })
        .await
    }

    /// List children on the notification context and hand the result to `callback`.
    ///
    /// Never blocks the caller. The callback receives exactly one result.
    pub fn get_children_async<F, Fut>(
        &self,
        path: impl Into<String>,
        watch: Option<Watch>,
        callback: F,
    ) where
        F: FnOnce(CoordinationResult<Vec<String>>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let client = self.clone();
        let path = path.into();
        self.inner.enqueue(Box::pin(async move {
            let result = client.get_children(&path, watch).await;
            callback(result).await;
        }));
    }

    /// Read node data on the notification context and hand the result to `callback`.
    pub fn get_data_async<F, Fut>(&self, path: impl Into<String>, watch: Option<Watch>, callback: F)
    where
        F: FnOnce(CoordinationResult<(Bytes, Stat)>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let client = self.clone();
        let path = path.into();
        self.inner.enqueue(Box::pin(async move {
            let result = client.get_data(&path, watch).await;
            callback(result).await;
        }));
    }

    /// Run `job` on the notification context after everything queued so far.
    pub fn notify<Fut>(&self, job: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.inner.enqueue(Box::pin(job));
    }

    /// Close the session. Its ephemeral nodes are removed by the ensemble.
    ///
    /// Idempotent. Has no effect on an expired client.
    pub async fn close(&self) {
        if self.inner.state.transition(SessionState::Closed) {
            let session = self.inner.session.read().clone();
            if let Some(session) = session {
                if let Err(e) = session.close().await {
                    debug!(error = %e, "Raw session close failed");
                }
            }
            self.inner.watches.clear();
            info!(connect_string = %self.inner.connect_string, "Coordination client closed");
        }
    }
}

async fn connect_and_pump(inner: Arc<ClientInner>, connector: Arc<dyn EnsembleConnector>) {
    let window = inner.session_timeout;
    let connect_string = inner.connect_string.clone();
    let connect_string = connect_string.as_str();
    let connector = &connector;

    let connected = retry::within_session_window("connect", window, move |_| async move {
        connector
            .connect(connect_string, window)
            .await
            .map_err(CoordinationError::from)
    })
    .await;

    let (session, mut events): (Arc<dyn EnsembleSession>, SessionEvents) = match connected {
        Ok(pair) => pair,
        Err(e) => {
            error!(connect_string, error = %e, "Failed to establish coordination session");
            *inner.failure.lock() = Some(e.to_string());
            if inner.state.transition(SessionState::Disconnected) {
                inner.fire_connection_lost();
            }
            return;
        }
    };

    *inner.session.write() = Some(Arc::clone(&session));
    if inner.state.get() == SessionState::Closed {
        let _ = session.close().await;
        return;
    }
    info!(
        session_id = session.session_id(),
        connect_string, "Coordination session established"
    );

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::Connected => {
                if inner
                    .state
                    .transition_from(SessionState::Suspended, SessionState::Connected)
                {
                    info!(session_id = session.session_id(), "Coordination session restored");
                } else {
                    inner
                        .state
                        .transition_from(SessionState::Connecting, SessionState::Connected);
                }
            }
            SessionEvent::Disconnected => {
                if inner
                    .state
                    .transition_from(SessionState::Connected, SessionState::Suspended)
                {
                    warn!(
                        session_id = session.session_id(),
                        timeout_ms = window.as_millis() as u64,
                        "Coordination session suspended"
                    );
                    inner.arm_expiry_timer();
                }
            }
            SessionEvent::Expired => {
                inner.expire("ensemble reported session expiry").await;
            }
            SessionEvent::Watch(watched) => {
                let _ = inner.notify_tx.send(Notification::Watch(watched));
            }
        }
        if matches!(
            inner.state.get(),
            SessionState::Expired | SessionState::Closed
        ) {
            break;
        }
    }

    if !matches!(
        inner.state.get(),
        SessionState::Expired | SessionState::Closed
    ) {
        inner.expire("session event stream ended").await;
    }
    debug!(session_id = session.session_id(), "Session event pump stopped");
}

async fn run_dispatcher(watches: Arc<WatchRegistry>, mut rx: mpsc::UnboundedReceiver<Notification>) {
    while let Some(notification) = rx.recv().await {
        match notification {
            Notification::Job(job) => {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    error!("Notification callback panicked");
                }
            }
            Notification::Watch(event) => {
                for target in WatchTarget::for_event(event.kind) {
                    let Some((_, fired)) = watches.remove(&(*target, event.path.clone())) else {
                        continue;
                    };
                    for watch in fired {
                        debug!(watch_id = watch.id, kind = %event.kind, path = %event.path, "Watch fired");
                        if AssertUnwindSafe(watch.trigger(event.clone()))
                            .catch_unwind()
                            .await
                            .is_err()
                        {
                            error!(path = %event.path, "Watch callback panicked");
                        }
                    }
                }
            }
        }
    }
    debug!("Notification dispatcher stopped");
}
