//! Cached Spotify bearer token with transparent refresh.
//!
//! The interactive authorization-code grant lives outside this crate; the
//! manager starts from a previously persisted token and keeps it fresh via
//! the refresh-token grant, rotating the cache file on every refresh.

use crate::error::SpotifyError;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const TOKEN_ENDPOINT: &str = "https://accounts.spotify.com/api/token";

/// Refresh the token proactively if it expires within this many seconds
const PROACTIVE_REFRESH_THRESHOLD_SECS: i64 = 60;

/// Timeout for token refresh requests (10 seconds)
const REFRESH_TIMEOUT_SECS: u64 = 10;

/// Persisted token data
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PersistedToken {
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<i64>, // Unix timestamp
}

impl PersistedToken {
    /// Whether the token expires within the proactive-refresh threshold.
    /// A token without an expiration time is assumed fine.
    fn needs_refresh(&self, now_ts: i64) -> bool {
        self.expires_at
            .is_some_and(|expires_at| expires_at - now_ts <= PROACTIVE_REFRESH_THRESHOLD_SECS)
    }
}

/// Token endpoint response for the refresh-token grant
#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
    /// Spotify rotates refresh tokens only occasionally; absent means
    /// the previous one stays valid
    refresh_token: Option<String>,
}

/// Supplies a valid bearer token on demand, refreshing transparently.
pub struct TokenManager {
    client: reqwest::Client,
    client_id: String,
    client_secret: String,
    token_path: PathBuf,
    token: Mutex<Option<PersistedToken>>,
}

impl TokenManager {
    /// Create a token manager, loading any cached token from `token_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created or an existing
    /// token cache file cannot be parsed.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        token_path: PathBuf,
    ) -> Result<Self, SpotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REFRESH_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        let token = if token_path.exists() {
            let content = fs::read_to_string(&token_path)?;
            let persisted: PersistedToken = serde_json::from_str(&content)?;
            info!("Loaded cached Spotify token from {:?}", token_path);
            Some(persisted)
        } else {
            info!("No cached token file found at {:?}", token_path);
            None
        };

        Ok(Self {
            client,
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            token_path,
            token: Mutex::new(token),
        })
    }

    /// Get a non-expired access token, refreshing proactively if the cached
    /// one expires within 60 seconds.
    ///
    /// # Errors
    ///
    /// Returns an error when no cached token exists, the token cannot be
    /// refreshed, or the refresh request fails.
    pub async fn access_token(&self) -> Result<String, SpotifyError> {
        let mut guard = self.token.lock().await;

        let Some(current) = guard.as_ref() else {
            return Err(SpotifyError::AuthFailed {
                reason: format!(
                    "no cached token at {:?}; authorize this client first",
                    self.token_path
                ),
            });
        };

        if !current.needs_refresh(Utc::now().timestamp()) {
            return Ok(current.access_token.clone());
        }

        let Some(refresh_token) = current.refresh_token.clone() else {
            return Err(SpotifyError::TokenExpired);
        };

        debug!("Access token expires soon, refreshing");
        let refreshed = self.refresh(&refresh_token).await?;
        if let Err(e) = self.save(&refreshed) {
            // A failed cache write costs a refresh on next startup, nothing more
            warn!("Failed to persist refreshed token: {e}");
        }
        let access_token = refreshed.access_token.clone();
        *guard = Some(refreshed);
        Ok(access_token)
    }

    /// Remove the cached token file. Used for logout.
    pub async fn clear(&self) {
        *self.token.lock().await = None;
        if self.token_path.exists() {
            let _ = fs::remove_file(&self.token_path);
        }
    }

    async fn refresh(&self, refresh_token: &str) -> Result<PersistedToken, SpotifyError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];

        let response = self
            .client
            .post(TOKEN_ENDPOINT)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SpotifyError::AuthFailed {
                reason: format!("token refresh failed with status {status}"),
            });
        }

        let refreshed: RefreshResponse = response.json().await?;
        info!("Refreshed Spotify access token");

        Ok(PersistedToken {
            access_token: refreshed.access_token,
            refresh_token: refreshed
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: Some(Utc::now().timestamp() + refreshed.expires_in),
        })
    }

    fn save(&self, token: &PersistedToken) -> Result<(), SpotifyError> {
        if let Some(parent) = self.token_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(token)?;
        fs::write(&self.token_path, content)?;
        debug!("Saved Spotify token to {:?}", self.token_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_refresh_thresholds() {
        let token = PersistedToken {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at: Some(1_000),
        };

        // Well before expiry
        assert!(!token.needs_refresh(1_000 - 3600));
        // Inside the 60s threshold
        assert!(token.needs_refresh(1_000 - 30));
        // Already expired
        assert!(token.needs_refresh(2_000));

        let no_expiry = PersistedToken {
            access_token: "a".to_string(),
            refresh_token: None,
            expires_at: None,
        };
        assert!(!no_expiry.needs_refresh(0));
    }

    #[test]
    fn test_missing_cache_file_yields_auth_error() -> Result<(), SpotifyError> {
        let dir = tempfile::tempdir()?;
        let manager = TokenManager::new("id", "secret", dir.path().join("token.json"))?;

        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        let result = runtime.block_on(manager.access_token());
        assert!(matches!(result, Err(SpotifyError::AuthFailed { .. })));
        Ok(())
    }

    #[test]
    fn test_cached_token_roundtrip() -> Result<(), SpotifyError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("token.json");
        let token = PersistedToken {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            // Far enough in the future that no refresh is attempted
            expires_at: Some(Utc::now().timestamp() + 3600),
        };
        fs::write(&path, serde_json::to_string_pretty(&token)?)?;

        let manager = TokenManager::new("id", "secret", path)?;
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        let fetched = runtime.block_on(manager.access_token())?;
        assert_eq!(fetched, "access");
        Ok(())
    }

    #[test]
    fn test_clear_removes_cached_token() -> Result<(), SpotifyError> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("token.json");
        let token = PersistedToken {
            access_token: "access".to_string(),
            refresh_token: Some("refresh".to_string()),
            expires_at: Some(Utc::now().timestamp() + 3600),
        };
        fs::write(&path, serde_json::to_string_pretty(&token)?)?;

        let manager = TokenManager::new("id", "secret", path.clone())?;
        let runtime = tokio::runtime::Builder::new_current_thread().build()?;
        runtime.block_on(manager.clear());

        assert!(!path.exists());
        // The in-memory token is gone too, not just the file
        let result = runtime.block_on(manager.access_token());
        assert!(matches!(result, Err(SpotifyError::AuthFailed { .. })));
        Ok(())
    }
}
