use podtrack_core::{
    token_cache_path, Config, CoreError, EpisodeLedger, JsonFileStore, PlaybackTracker,
    RecentEpisode,
};
use podtrack_spotify::{SpotifySnapshotFetcher, TokenManager};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load config or create template on first run
    let config = match Config::load_or_create() {
        Ok(config) => config,
        Err(e @ CoreError::ConfigNotFound { .. }) => {
            info!("{e}");
            return;
        }
        Err(e) => {
            error!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(config).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ledger = EpisodeLedger::open(Box::new(JsonFileStore::new()))?;

    let tokens = Arc::new(TokenManager::new(
        config.spotify.client_id,
        config.spotify.client_secret,
        token_cache_path(),
    )?);

    // `podtrack reset` wipes the history and the cached token, then exits
    if std::env::args().nth(1).as_deref() == Some("reset") {
        let mut ledger = ledger;
        ledger.clear()?;
        tokens.clear().await;
        info!("Removed listening history and cached Spotify token");
        return Ok(());
    }

    let fetcher = Arc::new(SpotifySnapshotFetcher::new(tokens)?);

    // Ctrl+C triggers graceful shutdown: the tracker closes any open
    // session before exiting
    let cancel_token = CancellationToken::new();
    let ctrlc_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, shutting down gracefully...");
            ctrlc_token.cancel();
        }
    });

    let tracker = Arc::new(PlaybackTracker::new(
        fetcher,
        ledger,
        config.tracking.poll_interval_ms,
        Some(cancel_token),
    ));

    let handle = Arc::clone(&tracker).start();
    handle.await?;

    let recent = tracker.recently_played(config.tracking.history_limit).await;
    if recent.is_empty() {
        info!("No episodes in listening history");
    } else {
        info!("Recently played episodes:");
        for episode in &recent {
            info!("  {}", describe(episode));
        }
    }

    Ok(())
}

fn describe(episode: &RecentEpisode) -> String {
    format!(
        "{} - {} [{} / {} across {} session(s), last played {}]",
        episode.show_name,
        episode.name,
        format_ms(episode.total_played_ms),
        format_ms(episode.duration_ms),
        episode.session_count,
        episode.last_played_at.format("%Y-%m-%d %H:%M"),
    )
}

fn format_ms(ms: u64) -> String {
    let total_secs = ms / 1000;
    format!("{}m{:02}s", total_secs / 60, total_secs % 60)
}
