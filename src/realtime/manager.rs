use super::{HeartbeatPolicy, MessageRouter, NoticeBoard, RealtimeConfig, RealtimeError};
use crate::auth::SessionHandle;
use crate::domain_model::{AccessToken, ConnectionNotice, ConnectionState, RealtimeMessage};
use crate::domain_port::*;
use crate::logger::*;
use reqwest::Url;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const OUTBOUND_CAP: usize = 256;
const TRANSITION_CAP: usize = 64;

/// Keeps one live realtime channel open for the signed-in session.
///
/// The channel authenticates with the session's access token, reconnects
/// after unexpected drops until the budget is spent, pings on an interval,
/// and hands every inbound message to the [`MessageRouter`]. Clearing the
/// session closes the channel; a rotated token reopens it.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: RealtimeConfig,
    connector: Arc<dyn Connector>,
    session: SessionHandle,
    router: MessageRouter,
    state: watch::Sender<ConnectionState>,
    transitions: broadcast::Sender<ConnectionState>,
    notices: NoticeBoard,
    attempts: AtomicU32,
    running: tokio::sync::Mutex<Option<Running>>,
    outbound: Mutex<Option<mpsc::Sender<ConnMessage>>>,
    disposed: AtomicBool,
    shutdown: CancellationToken,
}

struct Running {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

#[derive(Debug, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    Dropped,
}

impl ConnectionManager {
    /// Build a manager and start following `session`. Requires a Tokio
    /// runtime.
    pub fn new(
        config: RealtimeConfig,
        connector: Arc<dyn Connector>,
        session: SessionHandle,
    ) -> Self {
        let (transitions, _) = broadcast::channel(TRANSITION_CAP);
        let inner = Arc::new(Inner {
            notices: NoticeBoard::new(config.warning_delay),
            config,
            connector,
            session,
            router: MessageRouter::new(),
            state: watch::Sender::new(ConnectionState::Disconnected),
            transitions,
            attempts: AtomicU32::new(0),
            running: tokio::sync::Mutex::new(None),
            outbound: Mutex::new(None),
            disposed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        });
        tokio::spawn(follow_session(Arc::downgrade(&inner)));
        Self { inner }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    /// Open the channel. A no-op while it is already connecting or up.
    pub async fn connect(&self) -> Result<(), RealtimeError> {
        self.inner.connect().await
    }

    /// Close the channel on purpose. No reconnect follows.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await;
    }

    /// Disconnect, stop following the session and refuse further connects.
    pub async fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.disconnect().await;
        self.inner.shutdown.cancel();
        debug!("connection manager disposed");
    }

    /// Serialize `message` and queue it on the open channel. Returns `false`
    /// when the channel is not connected.
    pub fn send<M: Serialize>(&self, message: &M) -> bool {
        self.inner.send(message)
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Every transition in order, for consumers that must not miss
    /// intermediate states.
    pub fn subscribe_transitions(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.transitions.subscribe()
    }

    pub fn subscribe_notices(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.inner.notices.subscribe()
    }

    /// Reconnect attempts spent since the channel was last up.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::Acquire)
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.shutdown.cancel();
    }
}

impl Inner {
    fn outbound(&self) -> MutexGuard<'_, Option<mpsc::Sender<ConnMessage>>> {
        self.outbound.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn channel_url(&self, token: &AccessToken) -> Result<Url, RealtimeError> {
        let mut url = Url::parse(&self.config.url)
            .map_err(|e| RealtimeError::InvalidUrl(format!("{}: {e}", self.config.url)))?;
        url.query_pairs_mut().append_pair("token", token.as_str());
        Ok(url)
    }

    /// Move to `next` if the state machine allows it.
    fn transition(&self, next: ConnectionState) -> bool {
        let mut from = next;
        let moved = self.state.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            if !state.can_transition_to(next) {
                warn!(from = %state, to = %next, "illegal connection transition ignored");
                return false;
            }
            from = std::mem::replace(state, next);
            true
        });
        if moved {
            info!(%from, to = %next, "realtime connection state changed");
            let _ = self.transitions.send(next);
            self.notices.observe(from, next);
        }
        moved
    }

    async fn connect(self: &Arc<Self>) -> Result<(), RealtimeError> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(RealtimeError::Disposed);
        }
        let token = self.session.access_token().ok_or(RealtimeError::NoSession)?;
        self.channel_url(&token)?;

        let mut running = self.running.lock().await;
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            debug!(state = %*self.state.borrow(), "realtime channel already active");
            return Ok(());
        }

        self.attempts.store(0, Ordering::Release);
        self.transition(ConnectionState::Connecting);
        let cancel = self.shutdown.child_token();
        let handle = tokio::spawn(self.clone().lifecycle(cancel.clone()));
        *running = Some(Running { cancel, handle });
        Ok(())
    }

    async fn disconnect(&self) {
        let mut running = self.running.lock().await;
        if let Some(Running { cancel, handle }) = running.take() {
            cancel.cancel();
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!("realtime lifecycle task panicked: {e}");
                }
            }
        }
        self.outbound().take();
        self.transition(ConnectionState::Disconnected);
    }

    fn send<M: Serialize>(&self, message: &M) -> bool {
        if *self.state.borrow() != ConnectionState::Connected {
            warn!("cannot send, realtime channel is not open");
            return false;
        }
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "unserializable realtime message");
                return false;
            }
        };
        match self.outbound().as_ref() {
            Some(outbound) => match outbound.try_send(ConnMessage::Text(text)) {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "realtime outbound queue rejected message");
                    false
                }
            },
            None => {
                warn!("cannot send, realtime channel is not open");
                false
            }
        }
    }

    /// Drives one logical channel from `Connecting` until it is cancelled,
    /// the session goes away, or the reconnect budget runs out.
    async fn lifecycle(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            let Some(token) = self.session.access_token() else {
                info!("session gone, realtime channel stays closed");
                self.transition(ConnectionState::Disconnected);
                return;
            };
            let url = match self.channel_url(&token) {
                Ok(url) => url,
                Err(e) => {
                    error!("{e}");
                    self.transition(ConnectionState::Error);
                    return;
                }
            };

            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                opened = self.connector.open(url.as_str()) => opened,
            };

            match opened {
                Ok((sender, receiver)) => {
                    self.attempts.store(0, Ordering::Release);
                    self.transition(ConnectionState::Connected);
                    if self.session_loop(sender, receiver, &cancel).await == SessionEnd::Cancelled {
                        return;
                    }
                }
                Err(e) => {
                    warn!(error = %e, "realtime handshake failed");
                }
            }

            if cancel.is_cancelled() {
                return;
            }
            if !self.session.is_signed_in() {
                info!("session cleared, not reconnecting");
                self.transition(ConnectionState::Disconnected);
                return;
            }

            self.transition(ConnectionState::Reconnecting);
            let spent = self.attempts.load(Ordering::Acquire);
            let max = self.config.max_reconnect_attempts;
            if spent >= max {
                error!(attempts = spent, "reconnect budget exhausted, giving up");
                self.transition(ConnectionState::Error);
                return;
            }
            self.attempts.store(spent + 1, Ordering::Release);
            info!(
                attempt = spent + 1,
                max,
                delay_ms = self.config.reconnect_interval.as_millis() as u64,
                "scheduling reconnect"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.reconnect_interval) => {}
            }
            self.transition(ConnectionState::Connecting);
        }
    }

    /// Pump one open channel until it drops or `cancel` fires.
    async fn session_loop(
        &self,
        mut sender: Box<dyn ConnSender>,
        mut receiver: Box<dyn ConnReceiver>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let (outbound_tx, mut outbound_rx) = mpsc::channel(OUTBOUND_CAP);
        *self.outbound() = Some(outbound_tx);

        let period = self.config.heartbeat_interval;
        let mut heartbeat = if period.is_zero() {
            debug!("heartbeat disabled");
            None
        } else {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            Some(interval)
        };
        let ping = serde_json::to_string(&RealtimeMessage::ping()).unwrap_or_default();
        let mut pong_deadline: Option<Instant> = None;

        let end = loop {
            let deadline = pong_deadline;
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    let _ = sender.send(ConnMessage::Close).await;
                    break SessionEnd::Cancelled;
                }

                _ = until(deadline) => {
                    warn!("heartbeat went unanswered, dropping realtime channel");
                    break SessionEnd::Dropped;
                }

                _ = tick(heartbeat.as_mut()) => {
                    trace!("sending heartbeat");
                    if let Err(e) = sender.send(ConnMessage::Text(ping.clone())).await {
                        warn!(error = %e, "heartbeat send failed");
                        break SessionEnd::Dropped;
                    }
                    if let HeartbeatPolicy::ReconnectOnMissedPong { timeout } = self.config.heartbeat {
                        pong_deadline.get_or_insert_with(|| Instant::now() + timeout);
                    }
                }

                Some(message) = outbound_rx.recv() => {
                    if let Err(e) = sender.send(message).await {
                        warn!(error = %e, "realtime send failed");
                        break SessionEnd::Dropped;
                    }
                }

                inbound = receiver.next() => match inbound {
                    Some(Ok(ConnMessage::Text(text))) => {
                        if self.on_text(&text) {
                            pong_deadline = None;
                        }
                    }
                    Some(Ok(ConnMessage::Ping)) => {
                        if let Err(e) = sender.send(ConnMessage::Pong).await {
                            warn!(error = %e, "pong send failed");
                            break SessionEnd::Dropped;
                        }
                    }
                    Some(Ok(ConnMessage::Pong)) => pong_deadline = None,
                    Some(Ok(ConnMessage::Binary(bytes))) => {
                        debug!(len = bytes.len(), "binary realtime frame ignored");
                    }
                    Some(Ok(ConnMessage::Close)) | None => {
                        info!("realtime channel closed by peer");
                        break SessionEnd::Dropped;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "realtime channel failed");
                        break SessionEnd::Dropped;
                    }
                },
            }
        };

        self.outbound().take();
        end
    }

    /// Handle one inbound text frame. Returns `true` for a heartbeat reply.
    fn on_text(&self, text: &str) -> bool {
        let message = match serde_json::from_str::<RealtimeMessage>(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "malformed realtime message dropped");
                return false;
            }
        };
        if message.kind == RealtimeMessage::PONG {
            trace!("heartbeat answered");
            return true;
        }
        trace!(kind = %message.kind, "realtime message received");
        self.router.dispatch(&message);
        false
    }
}

async fn tick(heartbeat: Option<&mut Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Closes the channel when the session is cleared and reopens it with the
/// new credentials when the token rotates.
async fn follow_session(inner: Weak<Inner>) {
    let (mut changes, shutdown) = match inner.upgrade() {
        Some(inner) => (inner.session.subscribe(), inner.shutdown.clone()),
        None => return,
    };
    let mut bound = changes
        .borrow_and_update()
        .as_ref()
        .map(|s| s.access_token.clone());

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }

        let current = changes
            .borrow_and_update()
            .as_ref()
            .map(|s| s.access_token.clone());
        if current == bound {
            continue;
        }
        bound = current;

        let Some(manager) = inner.upgrade() else { break };
        let state = *manager.state.borrow();
        if bound.is_none() {
            info!("session cleared, closing realtime channel");
            manager.disconnect().await;
        } else if state != ConnectionState::Disconnected {
            info!(%state, "session token changed, reopening realtime channel");
            // a live channel swaps tokens without surfacing an outage
            if state.is_active() {
                manager.notices.begin_restart();
            }
            manager.disconnect().await;
            if let Err(e) = manager.connect().await {
                manager.notices.abandon_restart();
                warn!(error = %e, "could not reopen realtime channel");
            }
        }
    }
    trace!("session follower stopped");
}
