//! Durable per-episode listening records.
//!
//! The ledger is a passive store: it applies the session transitions the
//! tracking loop asks for and persists the full record map as one JSON
//! entry in an injected [`KeyValueStore`]. Enforcing "at most one open
//! session across the ledger" is the loop's job, not the ledger's.

use crate::error::Result;
use crate::snapshot::EpisodeSnapshot;
use crate::store::KeyValueStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// Store key holding the episode-id -> record map.
pub const HISTORY_STORE_KEY: &str = "listening_history";

/// One contiguous open-to-close interval of listening to an episode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningSession {
    pub started_at: DateTime<Utc>,
    /// None while the session is open
    pub ended_at: Option<DateTime<Utc>>,
    /// Last observed playback position during this session
    pub progress_ms: u64,
}

impl ListeningSession {
    #[must_use]
    pub const fn is_open(&self) -> bool {
        self.ended_at.is_none()
    }
}

/// Parent show identity, recorded once and kept unless the provider
/// supplies a non-empty replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShowMeta {
    pub id: String,
    pub name: String,
    pub publisher: String,
    pub images: Vec<String>,
}

/// Accumulated listening record for one distinct episode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub id: String,
    pub name: String,
    pub description: String,
    pub duration_ms: u64,
    pub images: Vec<String>,
    pub show: ShowMeta,
    /// Last observed playback position, clamped to `[0, duration_ms]`
    pub progress_ms: u64,
    /// Cumulative distinct listening time; never exceeds `duration_ms`
    pub total_played_ms: u64,
    pub first_played_at: DateTime<Utc>,
    pub last_played_at: DateTime<Utc>,
    /// Sessions in non-decreasing `started_at` order
    pub sessions: Vec<ListeningSession>,
}

impl EpisodeRecord {
    fn new(episode: &EpisodeSnapshot, now: DateTime<Utc>) -> Self {
        Self {
            id: episode.id.clone(),
            name: episode.name.clone(),
            description: episode.description.clone(),
            duration_ms: episode.duration_ms,
            images: episode.images.clone(),
            show: ShowMeta {
                id: episode.show.id.clone(),
                name: episode.show.name.clone(),
                publisher: episode.show.publisher.clone(),
                images: episode.show.images.clone(),
            },
            progress_ms: 0,
            total_played_ms: 0,
            first_played_at: now,
            last_played_at: now,
            sessions: Vec::new(),
        }
    }

    /// Merge snapshot metadata into the record. Empty or missing fields
    /// from a later snapshot never erase previously known values.
    fn merge_metadata(&mut self, episode: &EpisodeSnapshot) {
        merge_string(&mut self.name, &episode.name);
        merge_string(&mut self.description, &episode.description);
        if episode.duration_ms > 0 {
            self.duration_ms = episode.duration_ms;
        }
        if !episode.images.is_empty() {
            self.images = episode.images.clone();
        }
        merge_string(&mut self.show.id, &episode.show.id);
        merge_string(&mut self.show.name, &episode.show.name);
        merge_string(&mut self.show.publisher, &episode.show.publisher);
        if !episode.show.images.is_empty() {
            self.show.images = episode.show.images.clone();
        }
    }

    /// Upper bound for `total_played_ms` and `progress_ms`. A zero
    /// duration means the provider never told us, so nothing is capped.
    const fn play_cap(&self) -> u64 {
        if self.duration_ms == 0 {
            u64::MAX
        } else {
            self.duration_ms
        }
    }

    fn set_progress(&mut self, progress_ms: u64) {
        self.progress_ms = progress_ms.min(self.play_cap());
    }

    fn add_played(&mut self, elapsed_ms: u64) {
        self.total_played_ms = self
            .total_played_ms
            .saturating_add(elapsed_ms)
            .min(self.play_cap());
    }

    fn open_session_mut(&mut self) -> Option<&mut ListeningSession> {
        self.sessions.iter_mut().rev().find(|s| s.is_open())
    }

    /// Whether this record currently has an open session.
    #[must_use]
    pub fn has_open_session(&self) -> bool {
        self.sessions.iter().any(ListeningSession::is_open)
    }
}

fn merge_string(current: &mut String, observed: &str) {
    if !observed.is_empty() {
        observed.clone_into(current);
    }
}

/// The durable store of per-episode listening records.
pub struct EpisodeLedger {
    store: Box<dyn KeyValueStore>,
    records: HashMap<String, EpisodeRecord>,
}

impl EpisodeLedger {
    /// Open the ledger, loading any previously persisted history.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or the persisted
    /// history fails to deserialize.
    pub fn open(store: Box<dyn KeyValueStore>) -> Result<Self> {
        let records = match store.get(HISTORY_STORE_KEY)? {
            Some(json) => serde_json::from_str(&json)?,
            None => HashMap::new(),
        };
        info!("Opened episode ledger with {} record(s)", records.len());
        Ok(Self { store, records })
    }

    /// Open a new session for an episode, creating or updating its record.
    /// `progress_ms` is the playback position from the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails. The in-memory record is
    /// updated regardless.
    pub fn open_session(
        &mut self,
        episode: &EpisodeSnapshot,
        progress_ms: u64,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let record = self
            .records
            .entry(episode.id.clone())
            .or_insert_with(|| EpisodeRecord::new(episode, started_at));
        record.merge_metadata(episode);
        record.set_progress(progress_ms);
        record.last_played_at = started_at;
        let progress_ms = record.progress_ms;
        record.sessions.push(ListeningSession {
            started_at,
            ended_at: None,
            progress_ms,
        });
        debug!("Opened session for episode {}", episode.id);
        self.persist()
    }

    /// Attribute `elapsed_ms` of listening time to an episode's open
    /// session and refresh its metadata and progress. `progress_ms` is the
    /// playback position from the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails. The in-memory record is
    /// updated regardless.
    pub fn extend_session(
        &mut self,
        episode: &EpisodeSnapshot,
        progress_ms: u64,
        elapsed_ms: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let record = self
            .records
            .entry(episode.id.clone())
            .or_insert_with(|| EpisodeRecord::new(episode, now));
        record.merge_metadata(episode);
        record.set_progress(progress_ms);
        record.add_played(elapsed_ms);
        record.last_played_at = now;
        let progress_ms = record.progress_ms;
        if let Some(session) = record.open_session_mut() {
            session.progress_ms = progress_ms;
        } else {
            // The loop believed a session was open but the record lost it
            // (e.g. history cleared mid-run). Reopen rather than drop time.
            record.sessions.push(ListeningSession {
                started_at: now,
                ended_at: None,
                progress_ms,
            });
        }
        self.persist()
    }

    /// Close the open session for an episode, attributing `elapsed_ms` of
    /// listening time. A no-op (not an error) if the episode has no record
    /// or no open session.
    ///
    /// # Errors
    ///
    /// Returns an error if persisting fails. The in-memory record is
    /// updated regardless.
    pub fn close_open_session(
        &mut self,
        episode_id: &str,
        ended_at: DateTime<Utc>,
        elapsed_ms: u64,
    ) -> Result<()> {
        let Some(record) = self.records.get_mut(episode_id) else {
            return Ok(());
        };
        if !record.has_open_session() {
            return Ok(());
        }
        record.add_played(elapsed_ms);
        record.last_played_at = ended_at;
        if let Some(session) = record.open_session_mut() {
            session.ended_at = Some(ended_at);
        }
        debug!("Closed session for episode {}", episode_id);
        self.persist()
    }

    /// Look up a single record.
    #[must_use]
    pub fn get(&self, episode_id: &str) -> Option<&EpisodeRecord> {
        self.records.get(episode_id)
    }

    /// All records, most recently played first.
    #[must_use]
    pub fn list(&self) -> Vec<&EpisodeRecord> {
        let mut records: Vec<&EpisodeRecord> = self.records.values().collect();
        records.sort_by(|a, b| {
            b.last_played_at
                .cmp(&a.last_played_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        records
    }

    /// Number of distinct episodes ever observed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Wipe all records, in memory and in the store. Used for logout/reset.
    ///
    /// # Errors
    ///
    /// Returns an error if the store entry cannot be removed.
    pub fn clear(&mut self) -> Result<()> {
        self.records.clear();
        info!("Cleared listening history");
        self.store.remove(HISTORY_STORE_KEY)
    }

    fn persist(&mut self) -> Result<()> {
        let json = serde_json::to_string(&self.records)?;
        self.store.set(HISTORY_STORE_KEY, &json)
    }
}
