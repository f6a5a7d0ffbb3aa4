pub mod retry;

use crate::clock::ServerClock;
use crate::settings::Settings;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use reqwest::header::{HeaderMap, AUTHORIZATION, DATE, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};

pub use retry::{spawn_fetch, FetchTask, RetryPolicy};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ApiError {
    #[error("network error: {0}")]
    Network(String),
    #[error("server responded {status}: {body}")]
    Status {
        status: u16,
        body: String,
        retry_after_ms: Option<u64>,
    },
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("not logged in")]
    NotLoggedIn,
    #[error("canceled")]
    Canceled,
}

impl ApiError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Connectivity problems, garbled bodies and the usual transient statuses.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) | ApiError::Decode(_) => true,
            ApiError::Status { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            ApiError::NotLoggedIn | ApiError::Canceled => false,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ApiError::Status { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ApiError::Decode(e.to_string())
        } else {
            ApiError::Network(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    /// Stable subject claim; client keys are stored per subject.
    pub sub: String,
    pub id_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginState {
    Loading,
    LoggedIn(User),
    LoggedOut,
}

impl LoginState {
    pub fn user(&self) -> Option<&User> {
        match self {
            LoginState::LoggedIn(user) => Some(user),
            _ => None,
        }
    }
}

/// Waits until the login state is no longer loading and returns the user,
/// if any.
pub async fn resolve_login(login: &mut tokio::sync::watch::Receiver<LoginState>) -> Option<User> {
    let state = login
        .wait_for(|s| !matches!(s, LoginState::Loading))
        .await
        .ok()?;
    state.user().cloned()
}

/// Reads the `exp` claim of a JWT as unix milliseconds, without verifying it.
pub fn jwt_expiration_ms(jwt: &str) -> Option<i64> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?.as_f64()?;
    Some((exp * 1000.0) as i64)
}

/// Thin wrapper over `reqwest::Client` that knows the API host, attaches the
/// platform and visitor headers, and feeds response dates into the server
/// clock.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    platform: String,
    clock: Arc<ServerClock>,
    visitor: Mutex<Option<String>>,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>, platform: impl Into<String>, clock: Arc<ServerClock>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            platform: platform.into(),
            clock,
            visitor: Mutex::new(None),
        }
    }

    pub fn from_settings(settings: &Settings, clock: Arc<ServerClock>) -> Self {
        Self::new(settings.api_base_url.clone(), settings.platform.clone(), clock)
    }

    pub fn platform(&self) -> &str {
        &self.platform
    }

    pub fn clock(&self) -> &Arc<ServerClock> {
        &self.clock
    }

    pub fn url(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!("{}{}", self.base_url, path)
    }

    pub fn visitor(&self) -> Option<String> {
        self.visitor.lock().ok().and_then(|v| v.clone())
    }

    pub fn set_visitor(&self, uid: &str) {
        if let Ok(mut v) = self.visitor.lock() {
            if v.as_deref() != Some(uid) {
                log::debug!("[api] visitor changed");
                *v = Some(uid.to_string());
            }
        }
    }

    fn headers(&self, auth: Option<&str>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(token) = auth {
            if let Ok(value) = format!("bearer {}", token).parse() {
                headers.insert(AUTHORIZATION, value);
            }
        }
        if let Some(visitor) = self.visitor() {
            if let Ok(value) = visitor.parse() {
                headers.insert("Visitor", value);
            }
        }
        headers
    }

    async fn check(&self, resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if let Some(date) = resp.headers().get(DATE).and_then(|d| d.to_str().ok()) {
            self.clock.observe_http_date(date);
        }
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let retry_after_ms = resp
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs <= 180)
            .map(|secs| secs * 1000);
        let body = resp.text().await.unwrap_or_default();
        Err(ApiError::Status {
            status: status.as_u16(),
            body,
            retry_after_ms,
        })
    }

    pub async fn post_json<B, T>(&self, path: &str, body: &B, auth: Option<&str>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let resp = self
            .http
            .post(self.url(path))
            .headers(self.headers(auth))
            .json(body)
            .send()
            .await?;
        let resp = self.check(resp).await?;
        Ok(resp.json::<T>().await?)
    }

    /// POST where only the status matters.
    pub async fn post_json_empty<B>(&self, path: &str, body: &B, auth: Option<&str>) -> Result<(), ApiError>
    where
        B: Serialize + ?Sized,
    {
        let resp = self
            .http
            .post(self.url(path))
            .headers(self.headers(auth))
            .json(body)
            .send()
            .await?;
        self.check(resp).await.map(|_| ())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str, auth: Option<&str>) -> Result<T, ApiError> {
        let resp = self
            .http
            .get(self.url(path))
            .headers(self.headers(auth))
            .send()
            .await?;
        let resp = self.check(resp).await?;
        Ok(resp.json::<T>().await?)
    }

    pub async fn get_bytes(&self, path: &str, auth: Option<&str>) -> Result<Vec<u8>, ApiError> {
        let resp = self
            .http
            .get(self.url(path))
            .headers(self.headers(auth))
            .send()
            .await?;
        let resp = self.check(resp).await?;
        Ok(resp.bytes().await?.to_vec())
    }

    pub async fn post_multipart(
        &self,
        path: &str,
        form: reqwest::multipart::Form,
        auth: Option<&str>,
    ) -> Result<(), ApiError> {
        let resp = self
            .http
            .post(self.url(path))
            .headers(self.headers(auth))
            .multipart(form)
            .send()
            .await?;
        self.check(resp).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jwt_with_payload(payload: &str) -> String {
        format!("eyJhbGciOiJIUzI1NiJ9.{}.sig", URL_SAFE_NO_PAD.encode(payload))
    }

    #[test]
    fn jwt_exp_is_read_in_ms() {
        let jwt = jwt_with_payload(r#"{"sub":"u","exp":1700000000}"#);
        assert_eq!(jwt_expiration_ms(&jwt), Some(1_700_000_000_000));
    }

    #[test]
    fn jwt_without_exp_is_none() {
        assert_eq!(jwt_expiration_ms(&jwt_with_payload(r#"{"sub":"u"}"#)), None);
        assert_eq!(jwt_expiration_ms("garbage"), None);
    }

    #[test]
    fn retryable_statuses() {
        let status = |s| ApiError::Status {
            status: s,
            body: String::new(),
            retry_after_ms: None,
        };
        assert!(status(429).is_retryable());
        assert!(status(503).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!status(501).is_retryable());
        assert!(ApiError::Network("reset".into()).is_retryable());
        assert!(!ApiError::Canceled.is_retryable());
    }

    #[test]
    fn absolute_urls_pass_through() {
        let client = ApiClient::new("https://api.example.com/", "desktop", Arc::new(ServerClock::new()));
        assert_eq!(client.url("/api/1/x"), "https://api.example.com/api/1/x");
        assert_eq!(client.url("https://cdn.example.com/a.mp4"), "https://cdn.example.com/a.mp4");
    }
}
