use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::storage_layout::UserId;

/// Main configuration for the intake service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Quota and storage configuration
    #[serde(default)]
    pub intake: IntakeConfig,
    /// Image filter configuration
    #[serde(default)]
    pub filter: FilterConfig,
    /// Telegram Bot API configuration
    pub telegram: TelegramConfig,
    /// Webhook API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Photo intake configuration
#[derive(Debug, Clone, Deserialize)]
pub struct IntakeConfig {
    /// Maximum number of accepted photos per user
    #[serde(default = "default_photo_limit")]
    pub photo_limit: u32,
    /// Directory holding one namespace directory per user
    #[serde(default = "default_storage_root")]
    pub storage_root: PathBuf,
    /// Upper bound for the image transform, in seconds
    #[serde(default = "default_transform_timeout_secs")]
    pub transform_timeout_secs: u64,
}

/// Brightness filter configuration
#[derive(Debug, Clone, Deserialize)]
pub struct FilterConfig {
    /// Brightness multiplier applied to every channel
    #[serde(default = "default_brightness")]
    pub brightness: f32,
    /// JPEG quality of the stored photo (1-100)
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
}

/// Telegram Bot API configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    pub bot_token: String,
    /// Bot API base URL
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    /// Secret path segment of the webhook URL, also registered as the
    /// `secret_token` Telegram echoes back in every delivery
    #[serde(default)]
    pub webhook_secret: String,
    /// Public host name the webhook is registered under
    pub public_host: Option<String>,
    /// The only user allowed to download every user's photos
    pub privileged_user_id: Option<i64>,
    /// Bot API request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// API configuration for the webhook endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

/// Shortest webhook secret accepted by `validate`
pub const MIN_WEBHOOK_SECRET_LEN: usize = 16;

// Default value functions
fn default_service_name() -> String {
    "partybox-intake".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_photo_limit() -> u32 {
    15
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("party_photos")
}

fn default_transform_timeout_secs() -> u64 {
    30
}

fn default_brightness() -> f32 {
    1.2
}

fn default_jpeg_quality() -> u8 {
    90
}

fn default_api_base_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    5000
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "partybox-intake")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/partybox").required(false))
            .add_source(config::File::with_name("/etc/partybox/partybox").required(false))
            // PARTYBOX__TELEGRAM__BOT_TOKEN -> telegram.bot_token
            .add_source(
                config::Environment::with_prefix("PARTYBOX")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.telegram.bot_token.trim().is_empty() {
            return Err(ConfigValidationError::MissingField(
                "telegram.bot_token".to_string(),
            ));
        }

        if self.intake.photo_limit == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "intake.photo_limit".to_string(),
                message: "Limit must be greater than 0".to_string(),
            });
        }

        if self.filter.brightness.is_nan() || self.filter.brightness <= 0.0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "filter.brightness".to_string(),
                message: "Brightness factor must be greater than 0".to_string(),
            });
        }

        if !(1..=100).contains(&self.filter.jpeg_quality) {
            return Err(ConfigValidationError::InvalidValue {
                field: "filter.jpeg_quality".to_string(),
                message: "Quality must be within 1..=100".to_string(),
            });
        }

        let secret = &self.telegram.webhook_secret;
        if secret.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "telegram.webhook_secret".to_string(),
            ));
        }

        // Telegram accepts 1-256 characters from this set for `secret_token`.
        let allowed = secret
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
        if !allowed || !(MIN_WEBHOOK_SECRET_LEN..=256).contains(&secret.len()) {
            return Err(ConfigValidationError::InvalidValue {
                field: "telegram.webhook_secret".to_string(),
                message: format!(
                    "Secret must be {}-256 characters of A-Z, a-z, 0-9, _ and -",
                    MIN_WEBHOOK_SECRET_LEN
                ),
            });
        }

        Ok(())
    }

    /// Get transform timeout as Duration
    pub fn transform_timeout(&self) -> Duration {
        Duration::from_secs(self.intake.transform_timeout_secs)
    }

    /// Get Bot API request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.telegram.request_timeout_secs)
    }

    /// The identity allowed to export every user's photos
    pub fn privileged_user(&self) -> Option<UserId> {
        self.telegram.privileged_user_id.map(UserId)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for IntakeConfig {
    fn default() -> Self {
        Self {
            photo_limit: default_photo_limit(),
            storage_root: default_storage_root(),
            transform_timeout_secs: default_transform_timeout_secs(),
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            brightness: default_brightness(),
            jpeg_quality: default_jpeg_quality(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
        }
    }
}
