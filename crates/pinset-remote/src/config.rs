use serde::{Deserialize, Serialize};

pub const DEFAULT_STORAGE_URL: &str = "https://storage.googleapis.com";
pub const DEFAULT_CIPD_SERVICE_URL: &str = "https://chrome-infra-packages.appspot.com";

/// Endpoints and credentials of the remote backends.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RemoteConfig {
    pub storage_url: String,
    pub storage_token: Option<String>,
    pub cipd_binary: String,
    pub cipd_service_url: String,
    pub git_binary: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            storage_url: DEFAULT_STORAGE_URL.to_owned(),
            storage_token: None,
            cipd_binary: "cipd".to_owned(),
            cipd_service_url: DEFAULT_CIPD_SERVICE_URL.to_owned(),
            git_binary: "git".to_owned(),
        }
    }
}

impl RemoteConfig {
    #[must_use]
    pub fn with_storage_url(mut self, url: &str) -> Self {
        self.storage_url = url.trim_end_matches('/').to_owned();
        self
    }

    #[must_use]
    pub fn with_token(mut self, token: &str) -> Self {
        self.storage_token = Some(token.to_owned());
        self
    }

    /// Fill the token from `PINSET_STORAGE_TOKEN` when not configured.
    #[must_use]
    pub fn with_env_token(mut self) -> Self {
        if self.storage_token.is_none() {
            self.storage_token = std::env::var("PINSET_STORAGE_TOKEN")
                .ok()
                .filter(|t| !t.is_empty());
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_point_at_public_services() {
        let config = RemoteConfig::default();
        assert_eq!(config.storage_url, DEFAULT_STORAGE_URL);
        assert_eq!(config.cipd_binary, "cipd");
        assert!(config.storage_token.is_none());
    }

    #[test]
    fn storage_url_strips_trailing_slash() {
        let config = RemoteConfig::default()
            .with_storage_url("http://127.0.0.1:9000/")
            .with_token("secret123");
        assert_eq!(config.storage_url, "http://127.0.0.1:9000");
        assert_eq!(config.storage_token.as_deref(), Some("secret123"));
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: RemoteConfig =
            serde_json::from_str(r#"{"cipd_binary": "/opt/cipd"}"#).unwrap();
        assert_eq!(config.cipd_binary, "/opt/cipd");
        assert_eq!(config.cipd_service_url, DEFAULT_CIPD_SERVICE_URL);
    }
}
