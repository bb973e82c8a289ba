use crate::transcript::TranscriptModes;
use secrecy::{ExposeSecret, SecretBox};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid API key format for {service}: {reason}")]
    InvalidKeyFormat { service: String, reason: String },
    #[error("Environment error: {0}")]
    EnvError(#[from] env::VarError),
}

const GEMINI_KEY_VAR: &str = "GEMINI_API_KEY";

/// Configuration for API services
#[derive(Debug)]
pub struct ApiConfig {
    pub gemini_key: SecretBox<String>,
}

impl ApiConfig {
    /// Load API configuration from environment variables
    pub fn load() -> Result<Self, ConfigError> {
        // Load .env file if it exists (for development)
        dotenvy::dotenv().ok();

        let gemini_key = Self::load_api_key(GEMINI_KEY_VAR, "Gemini")?;

        Ok(Self { gemini_key })
    }

    /// Build from an explicit key, validating it the same way
    pub fn from_key(key: impl Into<String>) -> Result<Self, ConfigError> {
        let key = key.into();
        Self::validate_key_format(&key, "Gemini")?;
        Ok(Self {
            gemini_key: SecretBox::new(Box::new(key)),
        })
    }

    /// Load and validate a single API key from environment
    fn load_api_key(env_var: &str, service_name: &str) -> Result<SecretBox<String>, ConfigError> {
        let key = env::var(env_var).map_err(|_| ConfigError::MissingEnvVar(env_var.to_string()))?;

        Self::validate_key_format(&key, service_name)?;

        Ok(SecretBox::new(Box::new(key)))
    }

    fn validate_key_format(key: &str, service: &str) -> Result<(), ConfigError> {
        if key.trim().is_empty() {
            return Err(ConfigError::InvalidKeyFormat {
                service: service.to_string(),
                reason: "API key cannot be empty".to_string(),
            });
        }

        if service == "Gemini" && !key.starts_with("AIza") {
            return Err(ConfigError::InvalidKeyFormat {
                service: service.to_string(),
                reason: "Gemini keys should start with 'AIza'".to_string(),
            });
        }

        Ok(())
    }

    /// Get Gemini API key (use only when making API calls)
    pub fn gemini_key(&self) -> &str {
        self.gemini_key.expose_secret()
    }
}

/// Load configuration with helpful error messages for development
pub fn load_config() -> Result<ApiConfig, ConfigError> {
    match ApiConfig::load() {
        Ok(config) => {
            log::info!("Successfully loaded API configuration");
            Ok(config)
        }
        Err(ConfigError::MissingEnvVar(var)) => {
            log::error!("Missing required environment variable: {}", var);
            log::error!("Create a .env file in the project root with:");
            log::error!("{}=your_api_key_here", var);
            Err(ConfigError::MissingEnvVar(var))
        }
        Err(e) => {
            log::error!("Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Runtime settings of the live tutor
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Websocket endpoint of the bidirectional API (without query)
    pub endpoint: String,
    pub model: String,
    /// REST base of the image tool, e.g. `https://host/v1beta`
    pub image_api_base: String,
    /// Model used by the image tool
    pub image_model: String,
    pub voice_name: String,
    /// Rate of outbound microphone frames
    pub input_sample_rate: u32,
    /// Rate assumed for model audio that does not state one
    pub output_sample_rate: u32,
    pub capture_chunk_size: usize,
    pub connect_timeout: Duration,
    pub tool_timeout: Duration,
    pub history_capacity: usize,
    pub history_path: PathBuf,
    pub transcript_modes: TranscriptModes,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent".to_string(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            image_api_base: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            image_model: "gemini-2.5-flash-image".to_string(),
            voice_name: "Puck".to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            capture_chunk_size: 4096,
            connect_timeout: Duration::from_secs(15),
            tool_timeout: Duration::from_secs(60),
            history_capacity: 10,
            history_path: default_history_path(),
            transcript_modes: TranscriptModes::default(),
        }
    }
}

/// `<data dir>/live-tutor/history.json`, or the working directory when the
/// platform has no data dir.
pub fn default_history_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("live-tutor")
        .join("history.json")
}
