pub mod error;
pub mod fetcher;
pub mod token;

pub use error::SpotifyError;
pub use fetcher::SpotifySnapshotFetcher;
pub use token::TokenManager;
