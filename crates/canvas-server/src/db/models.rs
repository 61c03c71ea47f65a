use canvas_history::{HistoryDiff, TemporalState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Project database model
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Project {
    pub id: String,
    pub name: String,
    pub owner_id: String,
    pub current_state_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Row of `temporal_states`; the diff column holds JSON text
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TemporalRow {
    pub id: String,
    pub project_id: String,
    pub parent_id: Option<String>,
    pub author_id: Option<String>,
    pub intent: String,
    pub diff: String,
    pub is_snapshot: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<TemporalRow> for TemporalState {
    fn from(row: TemporalRow) -> Self {
        TemporalState {
            diff: HistoryDiff::from_json_str(&row.diff),
            id: row.id,
            project_id: row.project_id,
            parent_id: row.parent_id,
            author_id: row.author_id,
            intent: row.intent,
            is_snapshot: row.is_snapshot,
            timestamp: row.timestamp,
        }
    }
}

impl From<&TemporalState> for TemporalRow {
    fn from(state: &TemporalState) -> Self {
        TemporalRow {
            id: state.id.clone(),
            project_id: state.project_id.clone(),
            parent_id: state.parent_id.clone(),
            author_id: state.author_id.clone(),
            intent: state.intent.clone(),
            diff: state.diff.to_json_string(),
            is_snapshot: state.is_snapshot,
            timestamp: state.timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::Mutation;

    #[test]
    fn test_temporal_row_round_trip() {
        let state = TemporalState {
            id: "s1".into(),
            project_id: "p1".into(),
            parent_id: Some("s0".into()),
            author_id: Some("u1".into()),
            intent: "v1".into(),
            diff: HistoryDiff::Mutations(vec![Mutation::BlockDelete { id: "a".into() }]),
            is_snapshot: true,
            timestamp: Utc::now(),
        };
        let row = TemporalRow::from(&state);
        assert!(row.diff.starts_with('['));
        assert_eq!(TemporalState::from(row), state);
    }

    #[test]
    fn test_corrupt_diff_column_replays_empty() {
        let row = TemporalRow {
            id: "s1".into(),
            project_id: "p1".into(),
            parent_id: None,
            author_id: None,
            intent: "autosave".into(),
            diff: "not json".into(),
            is_snapshot: false,
            timestamp: Utc::now(),
        };
        assert_eq!(TemporalState::from(row).diff, HistoryDiff::default());
    }
}
