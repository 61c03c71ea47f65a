use canvas_core::CanvasError;
use canvas_history::HistoryError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("malformed CRDT payload: {0}")]
    Decode(String),

    #[error("failed to apply CRDT update: {0}")]
    Apply(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("text edit at {index} is outside block {block} (length {len})")]
    TextRange { block: String, index: u32, len: u32 },

    #[error("local replica I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("history checkout needs a synced local replica")]
    NotSynced,

    #[error(transparent)]
    Canvas(#[from] CanvasError),

    #[error(transparent)]
    History(#[from] HistoryError),
}

impl SyncError {
    pub fn code(&self) -> &'static str {
        match self {
            SyncError::Decode(_) => "CRDT_DECODE",
            SyncError::Apply(_) => "CRDT_APPLY",
            SyncError::BlockNotFound(_) => "BLOCK_NOT_FOUND",
            SyncError::TextRange { .. } => "TEXT_RANGE",
            SyncError::Io(_) => "REPLICA_IO",
            SyncError::NotSynced => "NOT_SYNCED",
            SyncError::Canvas(e) => e.code(),
            SyncError::History(e) => e.code(),
        }
    }
}
