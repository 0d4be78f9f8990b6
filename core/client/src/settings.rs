//! Settings file for the OneDrive client.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

use graphdrive_common::{Error, Result, SecretString};

use crate::auth::{AuthConfig, EXPIRY_MARGIN_SECS};

/// Microsoft identity platform authorization endpoint (multi-tenant).
pub const DEFAULT_AUTHORIZE_URL: &str =
    "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
/// Microsoft identity platform token endpoint (multi-tenant).
pub const DEFAULT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
/// Graph API base URL.
pub const DEFAULT_BROWSE_URL: &str = "https://graph.microsoft.com/v1.0/";
/// Scope that makes the identity platform hand out a refresh token.
pub const OFFLINE_ACCESS: &str = "offline_access";

fn default_authorize_url() -> String {
    DEFAULT_AUTHORIZE_URL.to_string()
}

fn default_token_url() -> String {
    DEFAULT_TOKEN_URL.to_string()
}

fn default_browse_url() -> String {
    DEFAULT_BROWSE_URL.to_string()
}

fn default_max_threads() -> usize {
    4
}

fn default_refresh_interval() -> u64 {
    3600
}

fn default_connect_retries() -> u32 {
    50
}

fn default_request_timeout() -> u64 {
    60
}

/// Static client configuration, loaded once at startup.
///
/// Only `refresh_token` changes over the lifetime of a deployment: the
/// identity platform rotates it on every refresh, and callers write the
/// new value back with [`Settings::save`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Application (client) ID of the app registration.
    pub client_id: String,
    /// Client secret; absent for public (desktop) clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<SecretString>,
    /// Redirect URI registered for the app.
    pub redirect_uri: String,
    /// Requested scopes, e.g. `Files.ReadWrite` and `offline_access`.
    pub permissions: Vec<String>,
    /// Refresh token from a previous run; empty on first run.
    #[serde(default)]
    pub refresh_token: SecretString,
    #[serde(default = "default_authorize_url")]
    pub authorize_url: String,
    #[serde(default = "default_token_url", alias = "auth_url")]
    pub token_url: String,
    /// Graph base URL the drive paths are appended to.
    #[serde(default = "default_browse_url")]
    pub browse_url: String,
    /// Upper bound on concurrent transfers in batch operations.
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    /// Longest lifetime (seconds) assumed for an access token.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,
    /// Attempts made to reach the drive when connecting.
    #[serde(default = "default_connect_retries")]
    pub number_retry_connection: u32,
    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
}

impl Settings {
    /// Create settings with defaults for everything but the app registration.
    pub fn new(
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
        permissions: Vec<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: None,
            redirect_uri: redirect_uri.into(),
            permissions,
            refresh_token: SecretString::default(),
            authorize_url: default_authorize_url(),
            token_url: default_token_url(),
            browse_url: default_browse_url(),
            max_threads: default_max_threads(),
            refresh_interval: default_refresh_interval(),
            number_retry_connection: default_connect_retries(),
            request_timeout: default_request_timeout(),
        }
    }

    /// Parse and validate settings from JSON text.
    pub fn from_json(json: &str) -> Result<Self> {
        let settings: Self = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("Invalid settings: {}", e)))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load and validate a settings file.
    ///
    /// # Errors
    /// - File missing or unreadable
    /// - Malformed JSON or missing required keys
    /// - Validation failure (see [`Settings::validate`])
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("Could not read settings {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Write the settings back, e.g. after the refresh token rotated.
    ///
    /// Written to a sibling `.tmp` file, then renamed into place.
    pub async fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");

        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Check the settings for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(Error::Config("client_id must not be empty".to_string()));
        }

        for (key, value) in [
            ("redirect_uri", &self.redirect_uri),
            ("authorize_url", &self.authorize_url),
            ("token_url", &self.token_url),
            ("browse_url", &self.browse_url),
        ] {
            Url::parse(value)
                .map_err(|e| Error::Config(format!("{} is not a valid URL: {}", key, e)))?;
        }

        if !self
            .permissions
            .iter()
            .any(|p| p.eq_ignore_ascii_case(OFFLINE_ACCESS))
        {
            return Err(Error::Config(format!(
                "permissions must include \"{}\" to obtain a refresh token",
                OFFLINE_ACCESS
            )));
        }

        if self.max_threads == 0 {
            return Err(Error::Config("max_threads must be at least 1".to_string()));
        }

        if self.refresh_interval <= EXPIRY_MARGIN_SECS {
            return Err(Error::Config(format!(
                "refresh_interval must exceed {} seconds",
                EXPIRY_MARGIN_SECS
            )));
        }

        Ok(())
    }

    /// Whether a refresh token from an earlier run is available.
    pub fn has_refresh_token(&self) -> bool {
        !self.refresh_token.is_empty()
    }

    /// OAuth2 configuration derived from these settings.
    pub fn auth_config(&self) -> AuthConfig {
        AuthConfig {
            client_id: self.client_id.clone(),
            client_secret: self.client_secret.clone(),
            redirect_url: self.redirect_uri.clone(),
            authorize_url: self.authorize_url.clone(),
            token_url: self.token_url.clone(),
            scopes: self.permissions.clone(),
            max_token_lifetime: self.refresh_interval,
        }
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "client_id": "00000000-0000-0000-0000-000000000000",
        "redirect_uri": "https://login.microsoftonline.com/common/oauth2/nativeclient",
        "permissions": ["Files.ReadWrite.All", "offline_access"],
        "refresh_token": "",
        "auth_url": "https://login.microsoftonline.com/common/oauth2/v2.0/token",
        "max_threads": 8
    }"#;

    #[test]
    fn test_parse_with_defaults() {
        let settings = Settings::from_json(SAMPLE).unwrap();

        assert_eq!(settings.max_threads, 8);
        assert_eq!(settings.refresh_interval, 3600);
        assert_eq!(settings.number_retry_connection, 50);
        assert_eq!(settings.browse_url, DEFAULT_BROWSE_URL);
        assert_eq!(settings.token_url, DEFAULT_TOKEN_URL);
        assert!(settings.client_secret.is_none());
        assert!(!settings.has_refresh_token());
    }

    #[test]
    fn test_missing_offline_access_rejected() {
        let json = SAMPLE.replace(", \"offline_access\"", "");
        let err = Settings::from_json(&json).unwrap_err();
        assert!(matches!(err, Error::Config(msg) if msg.contains("offline_access")));
    }

    #[test]
    fn test_missing_required_key_rejected() {
        let err = Settings::from_json(r#"{"client_id": "abc"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut settings = Settings::from_json(SAMPLE).unwrap();
        settings.browse_url = "not a url".to_string();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_zero_threads_rejected() {
        let mut settings = Settings::from_json(SAMPLE).unwrap();
        settings.max_threads = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_auth_config_carries_scopes() {
        let settings = Settings::from_json(SAMPLE).unwrap();
        let config = settings.auth_config();

        assert_eq!(config.client_id, settings.client_id);
        assert_eq!(config.scopes, settings.permissions);
        assert_eq!(config.max_token_lifetime, 3600);
    }

    #[tokio::test]
    async fn test_save_and_reload_keeps_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Settings.json");

        let mut settings = Settings::from_json(SAMPLE).unwrap();
        settings.refresh_token = SecretString::new("M.R3_BAY.rotated");
        settings.save(&path).await.unwrap();

        let reloaded = Settings::load(&path).await.unwrap();
        assert_eq!(reloaded.refresh_token.expose(), "M.R3_BAY.rotated");
        assert_eq!(reloaded.max_threads, 8);
        assert!(!dir.path().join("Settings.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Settings::load(dir.path().join("absent.json")).await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
