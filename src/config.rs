use std::time::Duration;

use anyhow::Result;

const DEFAULT_DB_PATH: &str = "data/facilities.sqlite";
const DEFAULT_VISION_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_VISION_MODEL: &str = "gpt-4o";

/// Pipeline configuration, built once at process start and passed down.
/// Nothing reads the environment after construction.
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    /// Pause between stages within one facility.
    pub stage_delay: Duration,
    /// Pause between facilities.
    pub facility_delay: Duration,
    vision_api_key: Option<String>,
    pub vision_api_url: String,
    pub vision_model: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            db_path: std::env::var("FACILITY_DB").unwrap_or_else(|_| DEFAULT_DB_PATH.into()),
            stage_delay: Duration::from_secs(2),
            facility_delay: Duration::from_secs(5),
            vision_api_key: std::env::var("VISION_API_KEY").ok().filter(|k| !k.is_empty()),
            vision_api_url: std::env::var("VISION_API_URL")
                .unwrap_or_else(|_| DEFAULT_VISION_URL.into()),
            vision_model: std::env::var("VISION_MODEL")
                .unwrap_or_else(|_| DEFAULT_VISION_MODEL.into()),
        }
    }

    /// The vision credential is only required when a vision stage is
    /// actually requested; callers check it before starting the batch.
    pub fn vision_api_key(&self) -> Result<&str> {
        self.vision_api_key
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("VISION_API_KEY must be set to run the vision stage"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_vision_key_is_an_error() {
        let cfg = Config {
            db_path: ":memory:".into(),
            stage_delay: Duration::from_secs(0),
            facility_delay: Duration::from_secs(0),
            vision_api_key: None,
            vision_api_url: DEFAULT_VISION_URL.into(),
            vision_model: DEFAULT_VISION_MODEL.into(),
        };
        assert!(cfg.vision_api_key().is_err());
    }

    #[test]
    fn delays_differ() {
        let cfg = Config::from_env();
        assert!(cfg.facility_delay > cfg.stage_delay);
    }
}
