use std::env;
use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::error::{FlowError, Result};

pub const ENV_LLM_API_KEY: &str = "FIREFLOW_LLM_API_KEY";
pub const ENV_GEOCODER_API_KEY: &str = "FIREFLOW_GEOCODER_API_KEY";
pub const ENV_DB_PATH: &str = "FIREFLOW_DB_PATH";
pub const ENV_ENCRYPTION_KEY: &str = "FIREFLOW_ENCRYPTION_KEY";

/// Environment-provided secrets. Missing required keys are a hard
/// start-up failure; values never appear in logs or events.
#[derive(Clone)]
pub struct Secrets {
    pub llm_api_key: String,
    pub geocoder_api_key: Option<String>,
    pub db_path: PathBuf,
    /// AES-256-GCM key protecting persisted PII bindings.
    pub encryption_key: [u8; 32],
}

impl Secrets {
    pub fn from_env() -> Result<Self> {
        let llm_api_key = required(ENV_LLM_API_KEY)?;
        let geocoder_api_key = env::var(ENV_GEOCODER_API_KEY)
            .ok()
            .filter(|v| !v.trim().is_empty());
        let db_path = env::var(ENV_DB_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("fireflow.db"));

        let key_b64 = required(ENV_ENCRYPTION_KEY)?;
        let key_bytes = BASE64
            .decode(key_b64.trim())
            .map_err(|_| FlowError::InvalidSecret(ENV_ENCRYPTION_KEY))?;
        let encryption_key: [u8; 32] = key_bytes
            .try_into()
            .map_err(|_| FlowError::InvalidSecret(ENV_ENCRYPTION_KEY))?;

        Ok(Self {
            llm_api_key,
            geocoder_api_key,
            db_path,
            encryption_key,
        })
    }
}

fn required(name: &'static str) -> Result<String> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(FlowError::MissingSecret(name))
}

// Secrets are deliberately opaque in debug output.
impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Secrets")
            .field("llm_api_key", &"<redacted>")
            .field(
                "geocoder_api_key",
                &self.geocoder_api_key.as_ref().map(|_| "<redacted>"),
            )
            .field("db_path", &self.db_path)
            .field("encryption_key", &"<redacted>")
            .finish()
    }
}
