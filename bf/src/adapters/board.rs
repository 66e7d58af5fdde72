//! Board API client
//!
//! Thin wrapper over the work-tracking board's HTTP API: post comments,
//! list item updates, write the status column, look up users.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

use crate::config::BoardConfig;

/// Errors from board operations
#[derive(Debug, Error)]
pub enum BoardError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Insufficient permissions: {0}")]
    Permissions(String),

    #[error("Rate limited")]
    RateLimited,

    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl BoardError {
    /// Whether the failure is an authorization problem
    pub fn is_permissions(&self) -> bool {
        matches!(self, BoardError::Auth(_) | BoardError::Permissions(_))
    }

    /// Whether retrying the call can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            BoardError::RateLimited => true,
            BoardError::Api { status, .. } => *status >= 500,
            BoardError::Network(_) => true,
            _ => false,
        }
    }
}

/// A user on the board platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoardUser {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
}

/// One update (comment) on a board item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardUpdate {
    pub id: String,
    pub body: String,
    /// Creation timestamp, Unix milliseconds
    pub created_at: i64,
    /// Update this one replies to, when the platform reports it
    #[serde(default)]
    pub reply_to_id: Option<String>,
    #[serde(default)]
    pub creator: Option<BoardUser>,
}

/// Operations the orchestrator performs against the board
#[async_trait]
pub trait BoardApi: Send + Sync {
    /// Post a comment on an item; returns the created comment id
    async fn post_update(&self, item_id: i64, body: &str) -> Result<String, BoardError>;

    /// All updates of an item, oldest first
    async fn list_updates(&self, item_id: i64) -> Result<Vec<BoardUpdate>, BoardError>;

    /// Write the item's status column
    async fn set_status_column(&self, item_id: i64, label: &str) -> Result<(), BoardError>;

    /// Look up a platform user by email
    async fn user_by_email(&self, email: &str) -> Result<Option<BoardUser>, BoardError>;
}

/// HTTP implementation of [`BoardApi`]
pub struct HttpBoardClient {
    base_url: String,
    api_token: String,
    http: Client,
}

impl HttpBoardClient {
    /// Create a client from configuration
    ///
    /// Reads the API token from the environment variable named in config.
    pub fn from_config(config: &BoardConfig) -> Result<Self, BoardError> {
        let api_token = std::env::var(&config.api_token_env)
            .map_err(|_| BoardError::Auth(format!("Environment variable {} not set", config.api_token_env)))?;
        let http = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(BoardError::Network)?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_token,
            http,
        })
    }

    async fn check(&self, response: reqwest::Response) -> Result<reqwest::Response, BoardError> {
        let status = response.status().as_u16();
        match status {
            401 => Err(BoardError::Auth("token rejected".to_string())),
            403 => Err(BoardError::Permissions(response.text().await.unwrap_or_default())),
            429 => Err(BoardError::RateLimited),
            s if s >= 400 => Err(BoardError::Api {
                status: s,
                message: response.text().await.unwrap_or_default(),
            }),
            _ => Ok(response),
        }
    }
}

#[async_trait]
impl BoardApi for HttpBoardClient {
    async fn post_update(&self, item_id: i64, body: &str) -> Result<String, BoardError> {
        let url = format!("{}/items/{}/updates", self.base_url, item_id);
        debug!(item_id, "Posting board update");

        let response = self
            .http
            .post(url)
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "body": body }))
            .send()
            .await?;
        let response = self.check(response).await?;

        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let created: Created = response
            .json()
            .await
            .map_err(|e| BoardError::InvalidResponse(e.to_string()))?;
        Ok(created.id)
    }

    async fn list_updates(&self, item_id: i64) -> Result<Vec<BoardUpdate>, BoardError> {
        let url = format!("{}/items/{}/updates", self.base_url, item_id);
        let response = self.http.get(url).bearer_auth(&self.api_token).send().await?;
        let response = self.check(response).await?;

        #[derive(Deserialize)]
        struct Updates {
            updates: Vec<BoardUpdate>,
        }
        let mut parsed: Updates = response
            .json()
            .await
            .map_err(|e| BoardError::InvalidResponse(e.to_string()))?;
        parsed.updates.sort_by_key(|u| u.created_at);
        Ok(parsed.updates)
    }

    async fn set_status_column(&self, item_id: i64, label: &str) -> Result<(), BoardError> {
        let url = format!("{}/items/{}/status", self.base_url, item_id);
        debug!(item_id, label, "Setting board status column");

        let response = self
            .http
            .put(url)
            .bearer_auth(&self.api_token)
            .json(&serde_json::json!({ "label": label }))
            .send()
            .await?;
        self.check(response).await?;
        Ok(())
    }

    async fn user_by_email(&self, email: &str) -> Result<Option<BoardUser>, BoardError> {
        let url = format!("{}/users", self.base_url);
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_token)
            .query(&[("email", email)])
            .send()
            .await?;
        let response = self.check(response).await?;

        #[derive(Deserialize)]
        struct Users {
            users: Vec<BoardUser>,
        }
        let parsed: Users = response
            .json()
            .await
            .map_err(|e| BoardError::InvalidResponse(e.to_string()))?;
        Ok(parsed.users.into_iter().next())
    }
}
