use crate::auth::{SessionHandle, TokenManager};
use crate::domain_model::Envelope;
use crate::http::ApiError;
use crate::logger::*;
use chrono::Utc;
use nanoid::nanoid;
use reqwest::header::{CONTENT_TYPE, HeaderValue};
use reqwest::{Client, Method, Request, Response, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Prefix of every endpoint, e.g. `https://gateway.example/api/v1`.
    pub base_url: String,
    pub timeout: Duration,
    /// Path of the refresh endpoint relative to `base_url`.
    pub refresh_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            timeout: Duration::from_secs(10),
            refresh_path: "/auth/refresh".to_string(),
        }
    }
}

/// Typed REST access for the portals. Every call goes through the
/// [`TokenManager`] and is unwrapped from the `{code, data, message}` envelope.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
    tokens: TokenManager,
}

impl ApiClient {
    pub fn new(config: &ApiConfig, session: SessionHandle) -> Result<Self, ApiError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        let refresh_url = join(&base_url, &config.refresh_path)?;
        let tokens = TokenManager::new(http.clone(), refresh_url, session);
        Ok(Self {
            base_url,
            http,
            tokens,
        })
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.call(Method::GET, path, None::<&()>, None::<&()>).await
    }

    pub async fn get_with_query<T, Q>(&self, path: &str, query: &Q) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
    {
        self.call(Method::GET, path, Some(query), None::<&()>).await
    }

    pub async fn post<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.call(Method::POST, path, None::<&()>, Some(body)).await
    }

    pub async fn put<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.call(Method::PUT, path, None::<&()>, Some(body)).await
    }

    pub async fn patch<T, B>(&self, path: &str, body: &B) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        self.call(Method::PATCH, path, None::<&()>, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.call(Method::DELETE, path, None::<&()>, None::<&()>).await
    }

    async fn call<T, Q, B>(
        &self,
        method: Method,
        path: &str,
        query: Option<&Q>,
        body: Option<&B>,
    ) -> Result<T, ApiError>
    where
        T: DeserializeOwned,
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
    {
        let request = self.build(method, path, query, body)?;
        let method = request.method().clone();
        let url = request.url().clone();

        let response = self.tokens.execute(request).await.inspect_err(|e| {
            warn!(%method, %url, error = %e, "request failed");
        })?;
        decode(response).await
    }

    fn build<Q, B>(
        &self,
        method: Method,
        path: &str,
        query: Option<&Q>,
        body: Option<&B>,
    ) -> Result<Request, ApiError>
    where
        Q: Serialize + ?Sized,
        B: Serialize + ?Sized,
    {
        let url = join(&self.base_url, path)?;
        let mut builder = self
            .http
            .request(method, url)
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .header(REQUEST_ID_HEADER, request_id());
        if let Some(query) = query {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.build()?)
    }
}

fn join(base_url: &str, path: &str) -> Result<Url, ApiError> {
    let path = path.trim_start_matches('/');
    Url::parse(&format!("{}/{}", base_url, path))
        .map_err(|e| ApiError::InvalidRequest(format!("bad url for {path}: {e}")))
}

/// `<unix-millis>-<random>`, unique enough to trace one call across services.
fn request_id() -> String {
    format!("{}-{}", Utc::now().timestamp_millis(), nanoid!(10))
}

/// Unwrap the envelope of `response` into the caller's type.
async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ApiError> {
    let status = response.status();
    let bytes = response.bytes().await?;

    if !status.is_success() {
        let envelope = serde_json::from_slice::<Envelope<Value>>(&bytes).ok();
        return Err(ApiError::from_status(
            status,
            envelope.as_ref().and_then(|e| e.server_message()),
        ));
    }

    let envelope = serde_json::from_slice::<Envelope<Value>>(&bytes)?;
    if !envelope.is_success() {
        return Err(ApiError::Application {
            code: envelope.code,
            message: envelope
                .server_message()
                .unwrap_or("request rejected")
                .to_string(),
        });
    }

    Ok(serde_json::from_value(envelope.data.unwrap_or(Value::Null))?)
}
