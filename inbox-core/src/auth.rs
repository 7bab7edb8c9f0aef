use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid base url: {0}")]
    Url(#[from] url::ParseError),
    #[error("authentication failed with {status}: {body}")]
    Api { status: StatusCode, body: String },
}

/// Result of a successful login or refresh.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthSession {
    pub token: String,
    pub user_id: String,
    pub email: String,
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    token: String,
    record: AuthRecord,
}

#[derive(Debug, Deserialize)]
struct AuthRecord {
    id: String,
    email: String,
}

#[derive(Clone)]
pub struct AuthClient {
    http: Client,
    base_url: Url,
}

impl AuthClient {
    pub fn new(base_url: &str) -> Result<Self, AuthError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    /// Password login against the users collection.
    pub async fn login(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let url = self
            .base_url
            .join("/api/collections/users/auth-with-password")?;
        let response = self
            .http
            .post(url)
            .json(&login_body(email, password))
            .send()
            .await?;
        Self::session_from(response).await
    }

    /// Exchanges a still-valid token for a fresh one. Fails with an Api
    /// error once the token has expired; callers must re-login then.
    pub async fn refresh(&self, token: &str) -> Result<AuthSession, AuthError> {
        let url = self.base_url.join("/api/collections/users/auth-refresh")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", token)
            .send()
            .await?;
        Self::session_from(response).await
    }

    async fn session_from(response: reqwest::Response) -> Result<AuthSession, AuthError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Api { status, body });
        }
        let payload: AuthResponse = response.json().await?;
        Ok(AuthSession {
            token: payload.token,
            user_id: payload.record.id,
            email: payload.record.email,
        })
    }
}

fn login_body<'a>(email: &'a str, password: &'a str) -> impl Serialize + 'a {
    #[derive(Serialize)]
    struct LoginBody<'a> {
        identity: &'a str,
        password: &'a str,
    }
    LoginBody {
        identity: email,
        password,
    }
}
