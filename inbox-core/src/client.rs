use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum InboxError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

/// A document to be created in the remote inbox collection.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Vec<u8>,
    pub user_id: String,
    /// Stable per-file identifier; lets the server deduplicate re-uploads
    /// after a crash mid-transfer.
    pub source_key: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct InboxRecord {
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Clone)]
pub struct InboxClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl InboxClient {
    pub fn new(base_url: &str, token: impl Into<String>) -> Result<Self, InboxError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    pub fn with_http(http: Client, base_url: &str, token: impl Into<String>) -> Result<Self, InboxError> {
        Ok(Self {
            http,
            base_url: Url::parse(base_url)?,
            token: token.into(),
        })
    }

    /// Lightweight reachability probe. Any HTTP response, success or not,
    /// proves the server is reachable; only transport failures bubble up.
    pub async fn check_health(&self) -> Result<(), InboxError> {
        let url = self.endpoint("/api/health")?;
        self.http.get(url).send().await?;
        Ok(())
    }

    /// Creates one record in the `files_inbox` collection via an
    /// authenticated multipart upload.
    pub async fn upload_document(&self, doc: NewDocument) -> Result<InboxRecord, InboxError> {
        let url = self.endpoint("/api/collections/files_inbox/records")?;
        let part = Part::bytes(doc.bytes)
            .file_name(doc.file_name.clone())
            .mime_str(&doc.mime_type)?;
        let form = Form::new()
            .part("file", part)
            .text("name", doc.file_name)
            .text("user", doc.user_id)
            .text("status", "pending")
            .text("source_key", doc.source_key);

        let response = self
            .http
            .post(url)
            .header("Authorization", &self.token)
            .multipart(form)
            .send()
            .await?;
        Self::handle_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, InboxError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, InboxError> {
        if response.status().is_success() {
            Ok(response.json::<T>().await?)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(InboxError::Api { status, body })
        }
    }
}

impl InboxError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            InboxError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    /// Transport-level failure: the server never produced a status code.
    pub fn is_connectivity(&self) -> bool {
        match self {
            InboxError::Request(err) => {
                err.is_connect() || err.is_timeout() || err.is_request() && err.status().is_none()
            }
            _ => false,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}
