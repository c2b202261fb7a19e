//! Auth Service Client
//!
//! HTTP implementation of [`AuthBackend`] against the account service:
//!
//! - `GET  /api/auth/me`        → current user, 401 means "no session"
//! - `POST /api/auth/refresh`   → exchange the refresh token for a session
//! - `POST /api/credits/apply`  → idempotent grant keyed by order id

use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use credits_core::{AuthBackend, ReconcileError, Result, User};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

/// Account service client
pub struct HttpAuthBackend {
    http: reqwest::Client,
    base_url: String,
    session_token: Mutex<Option<String>>,
    refresh_token: Option<String>,
    user_cache: Option<PathBuf>,
}

#[derive(Deserialize)]
struct UserDto {
    id: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    is_guest: bool,
    #[serde(default)]
    credit_balance: u64,
}

impl From<UserDto> for User {
    fn from(dto: UserDto) -> Self {
        Self {
            id: dto.id,
            email: dto.email,
            is_guest: dto.is_guest,
            credit_balance: dto.credit_balance,
        }
    }
}

#[derive(Deserialize)]
struct RefreshResponse {
    session_token: String,
    user: Option<UserDto>,
}

#[derive(Serialize)]
struct ApplyCreditsRequest<'a> {
    order_id: &'a str,
    user_id: &'a str,
    amount: u32,
}

impl HttpAuthBackend {
    pub fn new(base_url: &str) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session_token: Mutex::new(None),
            refresh_token: None,
            user_cache: None,
        }
    }

    /// Create from environment variables; `None` without `AUTH_API_URL`
    pub fn from_env(user_cache: Option<PathBuf>) -> Option<Self> {
        let base_url = std::env::var("AUTH_API_URL").ok().filter(|v| !v.is_empty())?;
        let mut backend = Self::new(&base_url);
        backend.refresh_token = std::env::var("AUTH_REFRESH_TOKEN").ok();
        backend.user_cache = user_cache;
        if let Ok(token) = std::env::var("AUTH_SESSION_TOKEN") {
            backend.set_session_token(Some(token));
        }
        Some(backend)
    }

    fn set_session_token(&self, token: Option<String>) {
        *self
            .session_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token;
    }

    fn session_token(&self) -> Option<String> {
        self.session_token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.session_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

fn session_error(e: &reqwest::Error) -> ReconcileError {
    ReconcileError::SessionUnavailable(format!("auth service: {e}"))
}

#[async_trait]
impl AuthBackend for HttpAuthBackend {
    async fn get_current_user(&self) -> Result<Option<User>> {
        let response = self
            .authorized(self.http.get(self.url("/api/auth/me")))
            .send()
            .await
            .map_err(|e| session_error(&e))?;

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let user: UserDto = response.json().await.map_err(|e| session_error(&e))?;
                Ok(Some(user.into()))
            }
            status => Err(ReconcileError::SessionUnavailable(format!(
                "auth service returned {status}"
            ))),
        }
    }

    async fn refresh_session(&self) -> Result<Option<User>> {
        let Some(refresh_token) = &self.refresh_token else {
            tracing::debug!("no refresh token configured");
            return Ok(None);
        };

        let response = self
            .http
            .post(self.url("/api/auth/refresh"))
            .json(&serde_json::json!({ "refresh_token": refresh_token }))
            .send()
            .await
            .map_err(|e| session_error(&e))?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(ReconcileError::SessionUnavailable(format!(
                "refresh returned {}",
                response.status()
            )));
        }

        let refreshed: RefreshResponse = response.json().await.map_err(|e| session_error(&e))?;
        self.set_session_token(Some(refreshed.session_token));

        match refreshed.user {
            Some(user) => Ok(Some(user.into())),
            None => self.get_current_user().await,
        }
    }

    async fn apply_credits(&self, order_id: &str, user_id: &str, amount: u32) -> Result<()> {
        let apply_failed = |reason: String| ReconcileError::ApplyFailed {
            order_id: order_id.to_string(),
            reason,
        };

        let response = self
            .authorized(self.http.post(self.url("/api/credits/apply")))
            .json(&ApplyCreditsRequest {
                order_id,
                user_id,
                amount,
            })
            .send()
            .await
            .map_err(|e| apply_failed(e.to_string()))?;

        // 409: the service already granted this order
        if response.status().is_success() || response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(apply_failed(format!("{status}: {body}")))
    }

    async fn persist_user(&self, user: &User) -> Result<()> {
        let Some(path) = &self.user_cache else {
            return Ok(());
        };
        let json = serde_json::to_vec_pretty(user)?;
        tokio::fs::write(path, json).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_dto_defaults() {
        let dto: UserDto = serde_json::from_str(r#"{"id": "u-1"}"#).unwrap();
        let user = User::from(dto);
        assert_eq!(user.id, "u-1");
        assert!(!user.is_guest);
        assert_eq!(user.credit_balance, 0);
    }

    #[tokio::test]
    async fn test_persist_user_writes_cache() {
        let path = std::env::temp_dir().join(format!("credits-user-{}.json", std::process::id()));
        let mut backend = HttpAuthBackend::new("http://127.0.0.1:9");
        backend.user_cache = Some(path.clone());

        backend
            .persist_user(&User::new("u-1", "alice@example.com"))
            .await
            .unwrap();

        let cached: User = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(cached.email, "alice@example.com");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_refresh_without_token_is_no_session() {
        let backend = HttpAuthBackend::new("http://127.0.0.1:9");
        assert!(backend.refresh_session().await.unwrap().is_none());
    }
}
