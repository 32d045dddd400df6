//! Snapshot model: one poll's observation of provider playback state.

/// Result of polling the provider for "what's playing now".
///
/// `Unavailable` means the poll produced no new information (network hiccup,
/// missing credential, decode failure). It is deliberately distinct from
/// `Empty`, which is the provider positively reporting that nothing is
/// playing.
#[derive(Debug, Clone)]
pub enum Snapshot {
    /// Nothing currently playing
    Empty,
    /// Something is loaded in the player
    Item(PlayingItem),
    /// Transient provider/auth error; treated as "no new information"
    Unavailable,
}

/// The loaded player item and its playback flags.
#[derive(Debug, Clone)]
pub struct PlayingItem {
    /// Whether the item is actively playing (false = paused)
    pub is_playing: bool,
    /// Playback position within the item, in milliseconds
    pub progress_ms: u64,
    /// What kind of content is loaded
    pub item: PlayableItem,
}

/// Content kind of the loaded item.
#[derive(Debug, Clone)]
pub enum PlayableItem {
    /// A podcast episode with full metadata
    Episode(EpisodeSnapshot),
    /// Anything else (music track, ad, unknown) - not tracked
    Other,
}

/// Episode metadata as observed in a single snapshot.
///
/// Fields may be empty when the provider omits them; the ledger merges
/// these into stored records without erasing previously known values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpisodeSnapshot {
    pub id: String,
    pub name: String,
    pub description: String,
    pub duration_ms: u64,
    pub images: Vec<String>,
    pub show: ShowSnapshot,
}

/// Parent show identity as observed in a single snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShowSnapshot {
    pub id: String,
    pub name: String,
    pub publisher: String,
    pub images: Vec<String>,
}

impl Snapshot {
    /// The episode in this snapshot, if one is loaded (playing or paused).
    #[must_use]
    pub fn episode(&self) -> Option<&EpisodeSnapshot> {
        match self {
            Self::Item(PlayingItem {
                item: PlayableItem::Episode(episode),
                ..
            }) => Some(episode),
            _ => None,
        }
    }
}
