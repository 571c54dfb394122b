use crate::domain_model::{ConnectionNotice, ConnectionState};
use crate::logger::*;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

const NOTICE_CAP: usize = 16;

/// Derives the one-time status notices from connection transitions.
pub(crate) struct NoticeBoard {
    delay: Duration,
    feed: broadcast::Sender<ConnectionNotice>,
    state: Arc<Mutex<NoticeState>>,
}

#[derive(Default)]
struct NoticeState {
    /// The channel is coming up from `Disconnected` or `Error`.
    announce: bool,
    /// A token rotation is swapping the channel; its teardown is not an outage.
    restarting: bool,
    warned: bool,
    timer: Option<JoinHandle<()>>,
}

impl NoticeBoard {
    pub(crate) fn new(delay: Duration) -> Self {
        let (feed, _) = broadcast::channel(NOTICE_CAP);
        Self {
            delay,
            feed,
            state: Arc::new(Mutex::new(NoticeState::default())),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionNotice> {
        self.feed.subscribe()
    }

    /// Hide the `Disconnected -> Connecting` pair of the next restart.
    pub(crate) fn begin_restart(&self) {
        lock(&self.state).restarting = true;
    }

    /// The restart never reached `Connecting`; treat it as a plain disconnect.
    pub(crate) fn abandon_restart(&self) {
        let mut state = lock(&self.state);
        if std::mem::take(&mut state.restarting) {
            state.announce = false;
            self.settle(&mut state);
        }
    }

    pub(crate) fn observe(&self, from: ConnectionState, to: ConnectionState) {
        let mut state = lock(&self.state);
        match to {
            ConnectionState::Connecting => {
                if std::mem::take(&mut state.restarting) {
                    return;
                }
                if matches!(from, ConnectionState::Disconnected | ConnectionState::Error) {
                    state.announce = true;
                }
            }
            ConnectionState::Connected => {
                self.settle(&mut state);
                if std::mem::take(&mut state.announce) {
                    let _ = self.feed.send(ConnectionNotice::Connected);
                }
            }
            ConnectionState::Reconnecting | ConnectionState::Error => {
                if state.timer.is_none() && !state.warned {
                    state.timer = Some(self.arm());
                }
            }
            ConnectionState::Disconnected => {
                if state.restarting {
                    return;
                }
                state.announce = false;
                self.settle(&mut state);
            }
        }
    }

    fn settle(&self, state: &mut NoticeState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        if std::mem::take(&mut state.warned) {
            let _ = self.feed.send(ConnectionNotice::ReconnectingCleared);
        }
    }

    fn arm(&self) -> JoinHandle<()> {
        let delay = self.delay;
        let feed = self.feed.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut state = lock(&state);
            state.timer = None;
            state.warned = true;
            warn!("realtime channel still down, raising reconnecting warning");
            let _ = feed.send(ConnectionNotice::ReconnectingWarning);
        })
    }
}

impl Drop for NoticeBoard {
    fn drop(&mut self) {
        if let Some(timer) = lock(&self.state).timer.take() {
            timer.abort();
        }
    }
}

fn lock(state: &Mutex<NoticeState>) -> MutexGuard<'_, NoticeState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
