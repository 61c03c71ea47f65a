use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HistoryError {
    #[error("history state not found: {0}")]
    NotFound(String),

    #[error("history state {0} has {1} child state(s) and cannot be deleted")]
    HasChildren(String, usize),

    #[error("history chain through {0} contains a cycle")]
    Cycle(String),

    #[error("only the project owner can {0}")]
    Forbidden(&'static str),

    #[error("history label cannot be empty")]
    EmptyIntent,
}

impl HistoryError {
    pub fn code(&self) -> &'static str {
        match self {
            HistoryError::NotFound(_) => "HISTORY_NOT_FOUND",
            HistoryError::HasChildren(_, _) => "HISTORY_HAS_CHILDREN",
            HistoryError::Cycle(_) => "HISTORY_CYCLE",
            HistoryError::Forbidden(_) => "FORBIDDEN",
            HistoryError::EmptyIntent => "EMPTY_INTENT",
        }
    }
}
