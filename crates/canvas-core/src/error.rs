use thiserror::Error;

/// Errors raised by the canvas graph layer.
///
/// Only structurally invalid input produces one of these; missing optional fields and
/// corrupt persisted JSON are recovered locally.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CanvasError {
    #[error("{0} is missing a stable id")]
    MissingId(&'static str),

    #[error("link {0} is missing an endpoint")]
    MissingEndpoint(String),

    #[error("a block cannot be connected to itself: {0}")]
    SelfLoop(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("blocks {0} and {1} are already connected")]
    DuplicateConnection(String, String),

    #[error("block {0} is read-only for the current user")]
    ReadOnly(String),

    #[error("the core block cannot be {0}")]
    CoreBlockImmutable(&'static str),
}

impl CanvasError {
    /// Stable machine-readable code, used across the wasm and HTTP boundaries
    pub fn code(&self) -> &'static str {
        match self {
            CanvasError::MissingId(_) => "MISSING_ID",
            CanvasError::MissingEndpoint(_) => "MISSING_ENDPOINT",
            CanvasError::SelfLoop(_) => "SELF_LOOP",
            CanvasError::BlockNotFound(_) => "BLOCK_NOT_FOUND",
            CanvasError::DuplicateConnection(_, _) => "DUPLICATE_CONNECTION",
            CanvasError::ReadOnly(_) => "READ_ONLY",
            CanvasError::CoreBlockImmutable(_) => "CORE_BLOCK_IMMUTABLE",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(CanvasError::MissingId("block").code(), "MISSING_ID");
        assert_eq!(CanvasError::SelfLoop("a".into()).code(), "SELF_LOOP");
        assert_eq!(
            CanvasError::SelfLoop("a".into()).to_string(),
            "a block cannot be connected to itself: a"
        );
    }
}
