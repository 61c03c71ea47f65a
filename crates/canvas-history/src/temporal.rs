use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::diff::HistoryDiff;

pub type StateId = String;

/// Intent recorded for background saves
pub const AUTOSAVE_INTENT: &str = "autosave";

/// One node of a project's history tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalState {
    pub id: StateId,
    pub project_id: String,
    /// `None` only for a branch root
    pub parent_id: Option<StateId>,
    #[serde(default)]
    pub author_id: Option<String>,
    pub intent: String,
    #[serde(default)]
    pub diff: HistoryDiff,
    #[serde(default)]
    pub is_snapshot: bool,
    pub timestamp: DateTime<Utc>,
}

impl TemporalState {
    pub fn is_autosave(&self) -> bool {
        self.intent == AUTOSAVE_INTENT
    }

    pub fn summary(&self, current_state_id: Option<&str>) -> TemporalSummary {
        TemporalSummary {
            id: self.id.clone(),
            parent_id: self.parent_id.clone(),
            author_id: self.author_id.clone(),
            intent: self.intent.clone(),
            is_snapshot: self.is_snapshot,
            timestamp: self.timestamp,
            is_current: current_state_id == Some(self.id.as_str()),
        }
    }
}

/// History listing entry, without the diff payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalSummary {
    pub id: StateId,
    pub parent_id: Option<StateId>,
    pub author_id: Option<String>,
    pub intent: String,
    pub is_snapshot: bool,
    pub timestamp: DateTime<Utc>,
    pub is_current: bool,
}
