//! Telegram Bot API client and the update types the bot consumes.

use crate::config::TelegramConfig;
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors returned by the Bot API client.
#[derive(Debug, Error)]
pub enum BotApiError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Bot API error: {0}")]
    Api(String),

    #[error("File {0} has no download path")]
    MissingFilePath(String),
}

/// Incoming update delivered to the webhook
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    /// Available sizes of a photo, smallest first
    #[serde(default)]
    pub photo: Vec<PhotoSize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
    #[serde(default)]
    pub file_size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self) -> Result<T, BotApiError> {
        match (self.ok, self.result) {
            (true, Some(result)) => Ok(result),
            _ => Err(BotApiError::Api(
                self.description
                    .unwrap_or_else(|| "request not successful".to_string()),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_id: String,
    file_path: Option<String>,
}

/// The subset of the Bot API the service uses
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Download the content of an uploaded file
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, BotApiError>;

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), BotApiError>;

    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: Option<String>,
    ) -> Result<(), BotApiError>;

    /// Register the webhook URL; Telegram sends `secret_token` back in the
    /// `X-Telegram-Bot-Api-Secret-Token` header of every delivery
    async fn set_webhook(&self, url: &str, secret_token: &str) -> Result<bool, BotApiError>;
}

/// HTTPS client for the Telegram Bot API
pub struct TelegramClient {
    http: Client,
    base_url: String,
    token: String,
}

impl fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelegramClient")
            .field("base_url", &self.base_url)
            .finish_non_exhaustive()
    }
}

impl TelegramClient {
    pub fn new(config: &TelegramConfig, timeout: Duration) -> Result<Self, BotApiError> {
        let http = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            http,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            token: config.bot_token.clone(),
        })
    }

    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.base_url, self.token, file_path)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: serde_json::Value,
    ) -> Result<T, BotApiError> {
        let response: ApiResponse<T> = self
            .http
            .post(self.method_url(method))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        response.into_result()
    }
}

#[async_trait]
impl BotApi for TelegramClient {
    #[instrument(skip(self))]
    async fn download_file(&self, file_id: &str) -> Result<Vec<u8>, BotApiError> {
        let file: FileInfo = self.call("getFile", json!({ "file_id": file_id })).await?;
        let file_path = file
            .file_path
            .ok_or_else(|| BotApiError::MissingFilePath(file.file_id.clone()))?;

        let bytes = self
            .http
            .get(self.file_url(&file_path))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        debug!(size_bytes = bytes.len(), "Downloaded file");
        Ok(bytes.to_vec())
    }

    async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), BotApiError> {
        let _: serde_json::Value = self
            .call("sendMessage", json!({ "chat_id": chat_id, "text": text }))
            .await?;
        Ok(())
    }

    #[instrument(skip(self, bytes, caption), fields(size_bytes = bytes.len()))]
    async fn send_document(
        &self,
        chat_id: i64,
        file_name: &str,
        bytes: Vec<u8>,
        caption: Option<String>,
    ) -> Result<(), BotApiError> {
        let document = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/zip")?;

        let mut form = Form::new()
            .text("chat_id", chat_id.to_string())
            .part("document", document);
        if let Some(caption) = caption {
            form = form.text("caption", caption);
        }

        let response: ApiResponse<serde_json::Value> = self
            .http
            .post(self.method_url("sendDocument"))
            .multipart(form)
            .send()
            .await?
            .json()
            .await?;

        response.into_result().map(|_| ())
    }

    async fn set_webhook(&self, url: &str, secret_token: &str) -> Result<bool, BotApiError> {
        self.call(
            "setWebhook",
            json!({ "url": url, "secret_token": secret_token }),
        )
        .await
    }
}
