use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarmonizerError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Turn channel closed")]
    ChannelClosed,
}

pub type Result<T> = std::result::Result<T, HarmonizerError>;
