use thiserror::Error;

#[derive(Debug, Error)]
pub enum SpotifyError {
    #[error("Spotify authentication failed: {reason}")]
    AuthFailed { reason: String },

    #[error("Spotify token expired and no refresh token is available")]
    TokenExpired,

    #[error("Spotify API returned status {status}")]
    ApiStatus { status: reqwest::StatusCode },

    #[error("Network request failed: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Failed to decode Spotify response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
