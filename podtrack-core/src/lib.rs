pub mod config;
pub mod error;
pub mod ledger;
pub mod paths;
pub mod snapshot;
pub mod source;
pub mod store;
pub mod tracker;

pub use config::{Config, SpotifyConfig, TrackingConfig, CONFIG_TEMPLATE};
pub use error::{CoreError, Result};
pub use ledger::{EpisodeLedger, EpisodeRecord, ListeningSession, ShowMeta, HISTORY_STORE_KEY};
pub use paths::{config_dir, config_path, store_dir, token_cache_path, CONFIG_DIR_NAME};
pub use snapshot::{EpisodeSnapshot, PlayableItem, PlayingItem, ShowSnapshot, Snapshot};
pub use source::SnapshotSource;
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use tracker::{PlaybackTracker, RecentEpisode, TrackerState};
