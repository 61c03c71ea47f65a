//! Temporal history for canvas projects: a tree of graph diffs with a movable "present".

pub mod diff;
pub mod error;
pub mod temporal;
pub mod tree;

pub use diff::{diff_graphs, HistoryDiff};
pub use error::HistoryError;
pub use temporal::{StateId, TemporalState, TemporalSummary, AUTOSAVE_INTENT};
pub use tree::{TemporalTree, DEFAULT_CACHE_SIZE};
