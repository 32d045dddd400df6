//! Spotify "currently playing" snapshot fetcher.

use crate::error::SpotifyError;
use crate::token::TokenManager;
use async_trait::async_trait;
use podtrack_core::{EpisodeSnapshot, PlayableItem, PlayingItem, ShowSnapshot, Snapshot, SnapshotSource};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const CURRENTLY_PLAYING_URL: &str =
    "https://api.spotify.com/v1/me/player/currently-playing?additional_types=episode";

/// Default timeout for HTTP requests (10 seconds)
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// Wire shape of the currently-playing endpoint.
/// The API returns many more fields; serde ignores unknown fields by default.
#[derive(Debug, Deserialize)]
struct CurrentlyPlayingResponse {
    #[serde(default)]
    is_playing: bool,
    progress_ms: Option<u64>,
    currently_playing_type: Option<String>,
    item: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct EpisodePayload {
    id: String,
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    duration_ms: u64,
    #[serde(default)]
    images: Vec<ImagePayload>,
    show: Option<ShowPayload>,
}

#[derive(Debug, Deserialize)]
struct ShowPayload {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    publisher: String,
    #[serde(default)]
    images: Vec<ImagePayload>,
}

#[derive(Debug, Deserialize)]
struct ImagePayload {
    url: String,
}

fn image_urls(images: Vec<ImagePayload>) -> Vec<String> {
    images.into_iter().map(|image| image.url).collect()
}

impl From<EpisodePayload> for EpisodeSnapshot {
    fn from(payload: EpisodePayload) -> Self {
        let show = payload.show.map_or_else(ShowSnapshot::default, |show| ShowSnapshot {
            id: show.id,
            name: show.name,
            publisher: show.publisher,
            images: image_urls(show.images),
        });
        Self {
            id: payload.id,
            name: payload.name,
            description: payload.description,
            duration_ms: payload.duration_ms,
            images: image_urls(payload.images),
            show,
        }
    }
}

/// Parse a currently-playing response body into a snapshot.
fn snapshot_from_body(body: &str) -> Result<Snapshot, SpotifyError> {
    let response: CurrentlyPlayingResponse = serde_json::from_str(body)?;

    let kind = response.currently_playing_type.as_deref().unwrap_or("unknown");
    let item = match (kind, response.item) {
        ("episode", Some(raw)) => {
            let episode: EpisodePayload = serde_json::from_value(raw)?;
            PlayableItem::Episode(episode.into())
        }
        // Tracks, ads, and anything the API withholds (null item)
        _ => PlayableItem::Other,
    };

    Ok(Snapshot::Item(PlayingItem {
        is_playing: response.is_playing,
        progress_ms: response.progress_ms.unwrap_or(0),
        item,
    }))
}

/// Fetches playback snapshots from the Spotify Web API.
pub struct SpotifySnapshotFetcher {
    client: reqwest::Client,
    tokens: Arc<TokenManager>,
}

impl SpotifySnapshotFetcher {
    /// Create a new fetcher over a token manager.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(tokens: Arc<TokenManager>) -> Result<Self, SpotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(5))
            .user_agent("Podtrack/0.1 (https://github.com/podtrack/podtrack)")
            .build()?;

        Ok(Self { client, tokens })
    }

    /// One authenticated request to the currently-playing endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error on auth failure, network failure, unexpected HTTP
    /// status, or an undecodable body. Callers polling through
    /// [`SnapshotSource`] receive `Unavailable` for all of these.
    pub async fn fetch(&self) -> Result<Snapshot, SpotifyError> {
        let token = self.tokens.access_token().await?;

        let response = self
            .client
            .get(CURRENTLY_PLAYING_URL)
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            // Empty body: nothing currently playing
            reqwest::StatusCode::NO_CONTENT => Ok(Snapshot::Empty),
            reqwest::StatusCode::OK => {
                let body = response.text().await?;
                if body.trim().is_empty() {
                    return Ok(Snapshot::Empty);
                }
                snapshot_from_body(&body)
            }
            reqwest::StatusCode::UNAUTHORIZED => Err(SpotifyError::AuthFailed {
                reason: "access token rejected".to_string(),
            }),
            status => Err(SpotifyError::ApiStatus { status }),
        }
    }
}

#[async_trait]
impl SnapshotSource for SpotifySnapshotFetcher {
    fn name(&self) -> &'static str {
        "spotify"
    }

    async fn poll(&self) -> Snapshot {
        match self.fetch().await {
            Ok(snapshot) => {
                debug!("Polled Spotify: {:?}", snapshot);
                snapshot
            }
            Err(e) => {
                // Transient failures carry no playback information; the
                // tracking loop must not mistake them for "nothing playing"
                warn!("Poll failed, reporting unavailable: {e}");
                Snapshot::Unavailable
            }
        }
    }
}
