use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Serialize;

use crate::config::ApiConfig;
use crate::reading::{ErrorKind, QueuedReading, ReadingKind};

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("server rejected reading with status {status}: {body}")]
    Rejected { status: StatusCode, body: String },
    #[error("edit of reading {0} has no remote reading id")]
    MissingOriginalId(String),
}

impl UploadError {
    /// Whether retrying the same request later can succeed.
    pub fn kind(&self) -> ErrorKind {
        match self {
            UploadError::Transport(_) => ErrorKind::Transient,
            UploadError::Rejected { status, .. } => classify_status(*status),
            UploadError::MissingOriginalId(_) => ErrorKind::Permanent,
        }
    }
}

pub fn classify_status(status: StatusCode) -> ErrorKind {
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

/// Sends one queued reading to the backend.
///
/// `ApiClient` is the production implementation; tests script the outcome.
#[allow(async_fn_in_trait)]
pub trait ReadingUploader {
    async fn upload(&self, reading: &QueuedReading) -> Result<(), UploadError>;
}

/// Answers whether the backend can currently be reached.
#[allow(async_fn_in_trait)]
pub trait Reachability {
    async fn is_reachable(&self) -> bool;
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct CreateRoomReading<'a> {
    room_id: &'a str,
    project_id: &'a str,
    date: DateTime<Utc>,
    humidity: f64,
    temperature: f64,
    equipment_used: Vec<String>,
}

#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
struct UpdateRoomReading {
    date: DateTime<Utc>,
    humidity: f64,
    temperature: f64,
}

#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    pub fn new(config: &ApiConfig) -> Result<Self, anyhow::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn create(&self, reading: &QueuedReading) -> Result<reqwest::Response, UploadError> {
        let body = CreateRoomReading {
            room_id: &reading.room_id,
            project_id: &reading.project_id,
            date: reading.date,
            humidity: reading.humidity,
            temperature: reading.temperature,
            equipment_used: Vec::new(),
        };
        let builder = self.client.post(self.url("/readings/room")).json(&body);
        Ok(self.authorize(builder).send().await?)
    }

    async fn update(&self, reading: &QueuedReading) -> Result<reqwest::Response, UploadError> {
        let original_id = reading
            .original_reading_id
            .as_deref()
            .ok_or_else(|| UploadError::MissingOriginalId(reading.id.clone()))?;
        let body = UpdateRoomReading {
            date: reading.date,
            humidity: reading.humidity,
            temperature: reading.temperature,
        };
        let builder = self
            .client
            .patch(self.url(&format!("/readings/room/{original_id}")))
            .json(&body);
        Ok(self.authorize(builder).send().await?)
    }
}

impl ReadingUploader for ApiClient {
    async fn upload(&self, reading: &QueuedReading) -> Result<(), UploadError> {
        let response = match reading.kind {
            ReadingKind::New => self.create(reading).await?,
            ReadingKind::Edit => self.update(reading).await?,
        };

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(UploadError::Rejected { status, body })
    }
}

impl Reachability for ApiClient {
    async fn is_reachable(&self) -> bool {
        match self.client.get(self.url("/health")).send().await {
            Ok(_) => true,
            Err(e) => {
                log::debug!("Backend unreachable: {e}");
                false
            }
        }
    }
}
