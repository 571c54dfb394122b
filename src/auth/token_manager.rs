use crate::auth::SessionHandle;
use crate::domain_model::*;
use crate::http::ApiError;
use crate::logger::*;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use reqwest::{Client, Request, Response, StatusCode, Url};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast;

pub const LOGIN_ROUTE: &str = "/login";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogoutReason {
    /// The refresh endpoint itself answered 401.
    SessionExpired,
    /// The refresh call failed or returned unusable credentials.
    RefreshFailed,
}

/// Signal for the UI to drop to the login page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutEvent {
    pub reason: LogoutReason,
    pub redirect_to: &'static str,
    pub message: String,
}

type PendingRefresh = Shared<BoxFuture<'static, Result<AccessToken, ApiError>>>;

/// Attaches the session credential to outbound calls and recovers from
/// authorization failures with one shared refresh per failure wave.
///
/// Cloning yields another handle onto the same refresh slot.
#[derive(Clone)]
pub struct TokenManager {
    inner: Arc<TokenManagerInner>,
}

struct TokenManagerInner {
    http: Client,
    refresh_url: Url,
    session: SessionHandle,
    pending: Mutex<Option<PendingRefresh>>,
    refreshes: AtomicU64,
    logout_tx: broadcast::Sender<LogoutEvent>,
}

impl TokenManager {
    pub fn new(http: Client, refresh_url: Url, session: SessionHandle) -> Self {
        let (logout_tx, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(TokenManagerInner {
                http,
                refresh_url,
                session,
                pending: Mutex::new(None),
                refreshes: AtomicU64::new(0),
                logout_tx,
            }),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.inner.session
    }

    /// Fires once per forced logout, whatever the number of failed callers.
    pub fn subscribe_logout(&self) -> broadcast::Receiver<LogoutEvent> {
        self.inner.logout_tx.subscribe()
    }

    /// Number of refresh calls issued so far.
    pub fn refresh_count(&self) -> u64 {
        self.inner.refreshes.load(Ordering::Relaxed)
    }

    /// Add the current access token as a bearer credential. No-op when signed out.
    pub fn attach(&self, request: &mut Request) {
        if let Some(token) = self.inner.session.access_token() {
            set_bearer(request, &token);
        }
    }

    pub fn is_refresh_request(&self, request: &Request) -> bool {
        request.url().path() == self.inner.refresh_url.path()
    }

    /// Send `request` with credentials attached.
    ///
    /// A 401 is never returned to the caller directly: the request waits on
    /// the shared refresh and is re-issued once with the new token. A second
    /// 401 surfaces as [`ApiError::Unauthorized`].
    pub async fn execute(&self, mut request: Request) -> Result<Response, ApiError> {
        let replay = request.try_clone();
        self.attach(&mut request);

        // identity of the call without its body, for the 401 path
        let mut failed = Request::new(request.method().clone(), request.url().clone());
        *failed.headers_mut() = request.headers().clone();

        let response = self.inner.http.execute(request).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let token = self.handle_unauthorized(&failed).await?;
        let mut retry = replay.ok_or_else(|| {
            ApiError::InvalidRequest("request body cannot be replayed after refresh".to_string())
        })?;
        set_bearer(&mut retry, &token);
        debug!(url = %retry.url(), "replaying request with refreshed token");

        let response = self.inner.http.execute(retry).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(url = %response.url(), "request rejected again after refresh");
            return Err(ApiError::Unauthorized);
        }
        Ok(response)
    }

    /// Resolve an authorization failure of `failed` into a usable token.
    ///
    /// A 401 from the refresh endpoint ends the session. Otherwise every
    /// caller joins the single in-flight refresh, creating it if none exists.
    pub async fn handle_unauthorized(&self, failed: &Request) -> Result<AccessToken, ApiError> {
        if self.is_refresh_request(failed) {
            self.inner
                .terminate(LogoutReason::SessionExpired, "login expired, please sign in again")
                .await;
            return Err(ApiError::SessionExpired);
        }

        // nothing to refresh: signed out, or a failed refresh already ended it
        let Some(current) = self.inner.session.access_token() else {
            return Err(ApiError::SessionExpired);
        };
        // the session moved on while this request was in flight
        if bearer_of(failed).is_some_and(|sent| sent != current.bearer()) {
            return Ok(current);
        }

        self.pending_refresh().await
    }

    fn pending_refresh(&self) -> PendingRefresh {
        let mut slot = self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pending) = slot.as_ref() {
            return pending.clone();
        }

        let inner = self.inner.clone();
        // runs detached so that callers giving up cannot strand the slot
        let task = tokio::spawn(async move {
            let result = inner.refresh().await;
            inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            result
        });
        let pending = async move {
            task.await
                .unwrap_or_else(|e| Err(ApiError::Transport(format!("refresh task failed: {e}"))))
        }
        .boxed()
        .shared();

        *slot = Some(pending.clone());
        pending
    }
}

impl TokenManagerInner {
    async fn refresh(&self) -> Result<AccessToken, ApiError> {
        self.refreshes.fetch_add(1, Ordering::Relaxed);
        match self.request_refresh().await {
            Ok(grant) => {
                let access = AccessToken(grant.token);
                let refresh = RefreshToken(grant.refresh_token);
                match self.session.replace_tokens(access.clone(), refresh).await {
                    Ok(true) => {}
                    Ok(false) => {
                        // logged out while the refresh was in flight
                        return Err(ApiError::SessionExpired);
                    }
                    Err(e) => warn!(error = %e, "refreshed tokens were not persisted"),
                }
                info!("access token refreshed");
                Ok(access)
            }
            Err(e) => {
                warn!(error = %e, "token refresh failed");
                self.terminate(LogoutReason::RefreshFailed, "session expired, please sign in again")
                    .await;
                Err(ApiError::SessionExpired)
            }
        }
    }

    async fn request_refresh(&self) -> Result<RefreshGrant, ApiError> {
        let refresh_token = self
            .session
            .refresh_token()
            .ok_or_else(|| ApiError::InvalidRequest("no refresh token".to_string()))?;

        let response = self
            .http
            .post(self.refresh_url.clone())
            .json(&RefreshRequest {
                refresh_token: refresh_token.as_str(),
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::from_status(status, None));
        }

        let envelope = response.json::<Envelope<RefreshGrant>>().await?;
        if !envelope.is_success() {
            return Err(ApiError::Application {
                code: envelope.code,
                message: envelope.server_message().unwrap_or("refresh rejected").to_string(),
            });
        }
        envelope
            .data
            .ok_or_else(|| ApiError::Decode("refresh response carries no credentials".to_string()))
    }

    /// Clear the session and tell the UI, once per actual logout.
    async fn terminate(&self, reason: LogoutReason, message: &str) {
        if self.session.clear().await {
            info!(?reason, "session cleared, redirecting to login");
            let _ = self.logout_tx.send(LogoutEvent {
                reason,
                redirect_to: LOGIN_ROUTE,
                message: message.to_string(),
            });
        }
    }
}

fn set_bearer(request: &mut Request, token: &AccessToken) {
    match HeaderValue::from_str(&token.bearer()) {
        Ok(mut value) => {
            value.set_sensitive(true);
            request.headers_mut().insert(AUTHORIZATION, value);
        }
        Err(_) => warn!("access token is not a valid header value; sending without it"),
    }
}

fn bearer_of(request: &Request) -> Option<String> {
    request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}
