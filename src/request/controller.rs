use super::{RequestOptions, Schedule};
use crate::http::ApiError;
use crate::logger::*;
use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type Service<P, T> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<T, ApiError>> + Send + Sync>;

/// What a consumer renders: the last result, the last error, and whether a
/// call is outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestState<T> {
    pub data: Option<T>,
    pub error: Option<ApiError>,
    pub loading: bool,
}

impl<T> Default for RequestState<T> {
    fn default() -> Self {
        Self {
            data: None,
            error: None,
            loading: false,
        }
    }
}

/// Wraps one async service with caching, retry, debounce or throttle
/// scheduling, and cancellation.
///
/// `run` resolves to `Some(data)` on success and `None` when the call failed
/// (the error lands in [`RequestState::error`]) or was cancelled. Calls that
/// a debounce or throttle window folds together all resolve with the result
/// of the one execution they were folded into.
///
/// Dropping the controller disposes it: pending timers are cleared and no
/// in-flight call can touch its state afterwards.
pub struct RequestController<P, T> {
    inner: Arc<Inner<P, T>>,
}

struct Inner<P, T> {
    service: Service<P, T>,
    options: RequestOptions<P, T>,
    state: watch::Sender<RequestState<T>>,
    lifecycle: Mutex<Lifecycle>,
    scheduler: Mutex<Scheduler<P, T>>,
    disposed: AtomicBool,
}

/// Every `cancel` starts a new epoch; a call may only write state while the
/// epoch it started in is still current.
struct Lifecycle {
    epoch: u64,
    token: CancellationToken,
}

struct Ticket {
    epoch: u64,
    token: CancellationToken,
}

struct Scheduler<P, T> {
    latest_params: Option<P>,
    last_execution: Option<Instant>,
    pending: Option<PendingRun<P, T>>,
    next_run: u64,
}

/// A debounced or trailing-throttle execution waiting on its timer.
struct PendingRun<P, T> {
    id: u64,
    params: P,
    waiters: Vec<oneshot::Sender<Option<T>>>,
    timer: JoinHandle<()>,
}

enum Admission<P, T> {
    Now(P),
    Later(oneshot::Receiver<Option<T>>),
}

impl<P, T> RequestController<P, T>
where
    P: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    /// Build a controller around `service`.
    ///
    /// When the options are not manual and carry default parameters, the
    /// first run is started right away, which requires a Tokio runtime.
    pub fn new<F, Fut>(service: F, options: RequestOptions<P, T>) -> Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ApiError>> + Send + 'static,
    {
        let service: Service<P, T> = Arc::new(move |params| service(params).boxed());
        let auto_run = (!options.manual)
            .then(|| options.default_params.clone())
            .flatten();

        let inner = Arc::new(Inner {
            service,
            state: watch::Sender::new(RequestState {
                loading: auto_run.is_some(),
                ..RequestState::default()
            }),
            lifecycle: Mutex::new(Lifecycle {
                epoch: 0,
                token: CancellationToken::new(),
            }),
            scheduler: Mutex::new(Scheduler {
                latest_params: options.default_params.clone(),
                last_execution: None,
                pending: None,
                next_run: 0,
            }),
            disposed: AtomicBool::new(false),
            options,
        });

        if let Some(params) = auto_run {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(async move {
                if let Some(inner) = weak.upgrade() {
                    inner.run(params).await;
                }
            });
        }

        Self { inner }
    }

    pub async fn run(&self, params: P) -> Option<T> {
        self.inner.run(params).await
    }

    /// Run again with the most recent parameters.
    pub async fn refresh(&self) -> Option<T> {
        let params = self.inner.scheduler().latest_params.clone();
        match params {
            Some(params) => self.inner.run(params).await,
            None => {
                warn!("refresh requested before any run");
                None
            }
        }
    }

    /// Stop everything currently outstanding. Idempotent.
    ///
    /// In-flight calls stop writing state, scheduled executions never fire,
    /// and retry loops end. Callers waiting on them resolve to `None`. Later
    /// calls to `run` work normally.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    /// Cancel and refuse every further run.
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            debug!("request controller disposed");
        }
        self.inner.cancel();
    }

    /// Overwrite the held data without calling the service.
    pub fn mutate(&self, data: T) {
        self.mutate_with(|_| data);
    }

    pub fn mutate_with(&self, f: impl FnOnce(Option<&T>) -> T) {
        let mut next = None;
        self.inner.state.send_modify(|state| {
            let data = f(state.data.as_ref());
            next = Some(data.clone());
            state.data = Some(data);
        });
        if let (Some(cache), Some(data)) = (&self.inner.options.cache, next) {
            cache.store.put(&cache.key, data, cache.ttl);
        }
    }

    pub fn state(&self) -> RequestState<T> {
        self.inner.state.borrow().clone()
    }

    pub fn data(&self) -> Option<T> {
        self.inner.state.borrow().data.clone()
    }

    pub fn error(&self) -> Option<ApiError> {
        self.inner.state.borrow().error.clone()
    }

    pub fn loading(&self) -> bool {
        self.inner.state.borrow().loading
    }

    pub fn subscribe(&self) -> watch::Receiver<RequestState<T>> {
        self.inner.state.subscribe()
    }
}

impl<P, T> Drop for RequestController<P, T> {
    fn drop(&mut self) {
        self.inner.disposed.store(true, Ordering::Release);
        self.inner.cancel();
    }
}

impl<P, T> Inner<P, T> {
    fn scheduler(&self) -> MutexGuard<'_, Scheduler<P, T>> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel(&self) {
        let token = {
            let mut lifecycle = self.lifecycle();
            lifecycle.epoch += 1;
            std::mem::replace(&mut lifecycle.token, CancellationToken::new())
        };
        token.cancel();

        // dropping the waiters resolves their runs to `None`
        if let Some(pending) = self.scheduler().pending.take() {
            trace!(run = pending.id, "scheduled run cleared");
            pending.timer.abort();
        }

        self.state.send_if_modified(|state| std::mem::replace(&mut state.loading, false));
    }

    fn ticket(&self) -> Ticket {
        let lifecycle = self.lifecycle();
        Ticket {
            epoch: lifecycle.epoch,
            token: lifecycle.token.clone(),
        }
    }

    /// Apply `f` to the state unless `ticket` has been cancelled since it was
    /// issued.
    fn commit(&self, ticket: &Ticket, f: impl FnOnce(&mut RequestState<T>)) -> bool {
        let lifecycle = self.lifecycle();
        if lifecycle.epoch != ticket.epoch {
            return false;
        }
        self.state.send_modify(f);
        true
    }
}

impl<P, T> Inner<P, T>
where
    P: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    async fn run(self: &Arc<Self>, params: P) -> Option<T> {
        if self.disposed.load(Ordering::Acquire) {
            warn!("run on a disposed request controller ignored");
            return None;
        }
        self.scheduler().latest_params = Some(params.clone());

        match self.options.schedule {
            Schedule::Immediate => self.execute(params).await,
            Schedule::Debounce(wait) => {
                let waiter = self.debounce(params, wait);
                waiter.await.ok().flatten()
            }
            Schedule::Throttle(window) => match self.throttle(params, window) {
                Admission::Now(params) => self.execute(params).await,
                Admission::Later(waiter) => waiter.await.ok().flatten(),
            },
        }
    }

    fn debounce(self: &Arc<Self>, params: P, wait: Duration) -> oneshot::Receiver<Option<T>> {
        let (tx, rx) = oneshot::channel();
        let mut scheduler = self.scheduler();

        let mut waiters = match scheduler.pending.take() {
            Some(superseded) => {
                superseded.timer.abort();
                superseded.waiters
            }
            None => Vec::new(),
        };
        waiters.push(tx);

        let id = scheduler.next_run;
        scheduler.next_run += 1;
        scheduler.pending = Some(PendingRun {
            id,
            params,
            waiters,
            timer: self.spawn_timer(id, wait),
        });
        rx
    }

    fn throttle(self: &Arc<Self>, params: P, window: Duration) -> Admission<P, T> {
        let mut scheduler = self.scheduler();
        let now = Instant::now();

        if let Some(pending) = scheduler.pending.as_mut() {
            let (tx, rx) = oneshot::channel();
            pending.params = params;
            pending.waiters.push(tx);
            return Admission::Later(rx);
        }

        let due = scheduler
            .last_execution
            .map(|last| last + window)
            .filter(|due| *due > now);
        let Some(due) = due else {
            scheduler.last_execution = Some(now);
            return Admission::Now(params);
        };

        let (tx, rx) = oneshot::channel();
        let id = scheduler.next_run;
        scheduler.next_run += 1;
        scheduler.pending = Some(PendingRun {
            id,
            params,
            waiters: vec![tx],
            timer: self.spawn_timer(id, due - now),
        });
        Admission::Later(rx)
    }

    fn spawn_timer(self: &Arc<Self>, id: u64, delay: Duration) -> JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.fire(id).await;
            }
        })
    }

    async fn fire(self: &Arc<Self>, id: u64) {
        let due = {
            let mut scheduler = self.scheduler();
            if scheduler.pending.as_ref().is_some_and(|p| p.id == id) {
                scheduler.last_execution = Some(Instant::now());
                scheduler.pending.take()
            } else {
                None
            }
        };
        let Some(PendingRun {
            params, waiters, ..
        }) = due
        else {
            trace!(run = id, "scheduled run superseded");
            return;
        };

        let result = self.execute(params).await;
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
    }

    fn cached(&self) -> Option<T> {
        let cache = self.options.cache.as_ref()?;
        let hit = cache.store.get(&cache.key)?;
        debug!(key = %cache.key, "served from cache");
        Some(hit)
    }

    fn call(&self, params: P) -> BoxFuture<'static, Result<T, ApiError>> {
        match &self.options.cache {
            Some(cache) => cache
                .store
                .fill(&cache.key, cache.ttl, || (self.service)(params)),
            None => (self.service)(params),
        }
    }

    async fn execute(self: &Arc<Self>, params: P) -> Option<T> {
        let ticket = self.ticket();

        if let Some(hit) = self.cached() {
            let applied = self.commit(&ticket, |state| {
                state.data = Some(hit.clone());
                state.error = None;
                state.loading = false;
            });
            if !applied {
                return None;
            }
            if let Some(on_finally) = &self.options.on_finally {
                on_finally(&params);
            }
            return Some(hit);
        }

        let started = self.commit(&ticket, |state| {
            state.loading = true;
            state.error = None;
        });
        if !started {
            return None;
        }

        let retries = self.options.retry_count;
        let mut attempt = 0;
        let outcome = loop {
            let call = self.call(params.clone());
            let result = tokio::select! {
                biased;
                _ = ticket.token.cancelled() => return None,
                result = call => result,
            };

            match result {
                Ok(data) => break Ok(data),
                Err(error) if attempt < retries && !error.is_fatal() => {
                    attempt += 1;
                    warn!(attempt, retries, error = %error, "request failed, retrying");
                    tokio::select! {
                        biased;
                        _ = ticket.token.cancelled() => return None,
                        _ = tokio::time::sleep(self.options.retry_interval) => {}
                    }
                }
                Err(error) => break Err(error),
            }
        };

        match outcome {
            Ok(data) => {
                let applied = self.commit(&ticket, |state| {
                    state.data = Some(data.clone());
                    state.error = None;
                    state.loading = false;
                });
                if !applied {
                    return None;
                }
                if let Some(on_success) = &self.options.on_success {
                    on_success(&data, &params);
                }
                if let Some(on_finally) = &self.options.on_finally {
                    on_finally(&params);
                }
                Some(data)
            }
            Err(error) => {
                debug!(error = %error, "request failed");
                let applied = self.commit(&ticket, |state| {
                    state.error = Some(error.clone());
                    state.loading = false;
                });
                if !applied {
                    return None;
                }
                if let Some(on_error) = &self.options.on_error {
                    on_error(&error, &params);
                }
                if let Some(on_finally) = &self.options.on_finally {
                    on_finally(&params);
                }
                None
            }
        }
    }
}
