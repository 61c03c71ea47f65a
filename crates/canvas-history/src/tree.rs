use std::collections::{HashMap, HashSet, VecDeque};

use canvas_core::{AccessContext, GraphState};
use chrono::Utc;
use uuid::Uuid;

use crate::diff::HistoryDiff;
use crate::error::HistoryError;
use crate::temporal::{StateId, TemporalState, TemporalSummary, AUTOSAVE_INTENT};

/// Reconstructed graphs kept per tree
pub const DEFAULT_CACHE_SIZE: usize = 64;

/// A project's history: an append-only tree of diffs plus the "present" pointer.
///
/// Nodes are immutable apart from their label and pin flag. Reconstruction folds diffs from
/// the root and memoizes every node it passes, so replay is paid once per branch prefix.
pub struct TemporalTree {
    project_id: String,
    states: HashMap<StateId, TemporalState>,
    /// Insertion order, oldest first
    order: Vec<StateId>,
    current_state_id: Option<StateId>,
    cache: HashMap<StateId, GraphState>,
    cache_order: VecDeque<StateId>,
    max_cached: usize,
}

impl TemporalTree {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            states: HashMap::new(),
            order: Vec::new(),
            current_state_id: None,
            cache: HashMap::new(),
            cache_order: VecDeque::new(),
            max_cached: DEFAULT_CACHE_SIZE,
        }
    }

    /// Rebuild a tree from persisted rows
    pub fn from_states(
        project_id: impl Into<String>,
        states: impl IntoIterator<Item = TemporalState>,
        current_state_id: Option<StateId>,
    ) -> Self {
        let mut tree = Self::new(project_id);
        let mut states: Vec<TemporalState> = states.into_iter().collect();
        states.sort_by_key(|s| s.timestamp);
        for state in states {
            tree.order.push(state.id.clone());
            tree.states.insert(state.id.clone(), state);
        }
        tree.current_state_id = current_state_id.filter(|id| tree.states.contains_key(id));
        tree
    }

    pub fn with_cache_size(mut self, max_cached: usize) -> Self {
        self.max_cached = max_cached;
        self
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn current_state_id(&self) -> Option<&str> {
        self.current_state_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TemporalState> {
        self.states.get(id)
    }

    /// All nodes, oldest first
    pub fn states(&self) -> impl Iterator<Item = &TemporalState> {
        self.order.iter().filter_map(|id| self.states.get(id))
    }

    pub fn children(&self, id: &str) -> Vec<&TemporalState> {
        self.states()
            .filter(|s| s.parent_id.as_deref() == Some(id))
            .collect()
    }

    pub fn history(&self) -> Vec<TemporalSummary> {
        let current = self.current_state_id();
        self.states().map(|s| s.summary(current)).collect()
    }

    /// Ids from `id` up to its root, `id` first.
    ///
    /// A parent that no longer exists ends the walk, the node is treated as a root.
    pub fn path_to_root(&self, id: &str) -> Result<Vec<StateId>, HistoryError> {
        if !self.states.contains_key(id) {
            return Err(HistoryError::NotFound(id.to_string()));
        }

        let mut path = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = Some(id.to_string());
        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                return Err(HistoryError::Cycle(current));
            }
            let Some(state) = self.states.get(&current) else {
                break;
            };
            cursor = match &state.parent_id {
                Some(parent) if self.states.contains_key(parent) => Some(parent.clone()),
                Some(parent) => {
                    tracing::warn!(state = %current, parent = %parent, "dangling history parent, treating as root");
                    None
                }
                None => None,
            };
            path.push(current);
        }
        Ok(path)
    }

    /// The graph as it was at `id`
    pub fn reconstruct(&mut self, id: &str) -> Result<GraphState, HistoryError> {
        let path = self.path_to_root(id)?;

        let mut graph = GraphState::new();
        let mut replay_from = path.len();
        for (i, state_id) in path.iter().enumerate() {
            if let Some(cached) = self.cache.get(state_id) {
                graph = cached.clone();
                replay_from = i;
                break;
            }
        }

        for state_id in path[..replay_from].iter().rev() {
            if let Some(state) = self.states.get(state_id) {
                graph = state.diff.apply(graph);
            }
            self.remember(state_id.clone(), graph.clone());
        }

        tracing::debug!(state = %id, replayed = replay_from, "reconstructed history state");
        Ok(graph)
    }

    fn remember(&mut self, id: StateId, graph: GraphState) {
        if self.max_cached == 0 {
            return;
        }
        if !self.cache.contains_key(&id) {
            self.cache_order.push_back(id.clone());
        }
        self.cache.insert(id, graph);
        while self.cache.len() > self.max_cached {
            match self.cache_order.pop_front() {
                Some(evicted) => {
                    self.cache.remove(&evicted);
                }
                None => break,
            }
        }
    }

    fn forget(&mut self, id: &str) {
        self.cache.remove(id);
        self.cache_order.retain(|cached| cached != id);
    }

    /// Append the live graph as a child of the present and advance the pointer.
    ///
    /// A blank or missing `intent` records an autosave; a named save is pinned.
    pub fn save(
        &mut self,
        live: &GraphState,
        author_id: Option<&str>,
        intent: Option<&str>,
    ) -> Result<TemporalState, HistoryError> {
        let parent_id = self.current_state_id.clone();
        let base = match &parent_id {
            Some(parent) => Some(self.reconstruct(parent)?),
            None => None,
        };

        let label = intent.map(str::trim).filter(|s| !s.is_empty());
        let state = TemporalState {
            id: Uuid::new_v4().to_string(),
            project_id: self.project_id.clone(),
            parent_id,
            author_id: author_id.map(str::to_string),
            intent: label.unwrap_or(AUTOSAVE_INTENT).to_string(),
            diff: HistoryDiff::between(base.as_ref(), live),
            is_snapshot: label.is_some(),
            timestamp: Utc::now(),
        };

        tracing::debug!(
            project = %self.project_id,
            state = %state.id,
            intent = %state.intent,
            snapshot_diff = state.diff.is_snapshot(),
            "saved history state"
        );

        self.order.push(state.id.clone());
        self.states.insert(state.id.clone(), state.clone());
        self.remember(state.id.clone(), live.clone());
        self.current_state_id = Some(state.id.clone());
        Ok(state)
    }

    /// Reconstruct without moving the present
    pub fn preview(&mut self, id: &str) -> Result<GraphState, HistoryError> {
        self.reconstruct(id)
    }

    /// Check out `id`: the caller overwrites the live document with the returned graph
    pub fn apply(&mut self, id: &str, access: &AccessContext) -> Result<GraphState, HistoryError> {
        if !access.can_apply_history() {
            return Err(HistoryError::Forbidden("apply a history state"));
        }
        let graph = self.reconstruct(id)?;
        self.current_state_id = Some(id.to_string());
        tracing::info!(project = %self.project_id, state = %id, "checked out history state");
        Ok(graph)
    }

    pub fn rename(&mut self, id: &str, intent: &str) -> Result<&TemporalState, HistoryError> {
        let intent = intent.trim();
        if intent.is_empty() {
            return Err(HistoryError::EmptyIntent);
        }
        let state = self
            .states
            .get_mut(id)
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))?;
        state.intent = intent.to_string();
        Ok(state)
    }

    pub fn pin(&mut self, id: &str) -> Result<&TemporalState, HistoryError> {
        let state = self
            .states
            .get_mut(id)
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))?;
        state.is_snapshot = true;
        Ok(state)
    }

    /// Remove a leaf. Internal nodes are refused since their children's diffs depend on them.
    ///
    /// Deleting the present moves the pointer to the parent.
    pub fn delete(&mut self, id: &str) -> Result<TemporalState, HistoryError> {
        if !self.states.contains_key(id) {
            return Err(HistoryError::NotFound(id.to_string()));
        }
        let children = self.children(id).len();
        if children > 0 {
            return Err(HistoryError::HasChildren(id.to_string(), children));
        }

        let state = self
            .states
            .remove(id)
            .ok_or_else(|| HistoryError::NotFound(id.to_string()))?;
        self.order.retain(|s| s != id);
        self.forget(id);

        if self.current_state_id.as_deref() == Some(id) {
            self.current_state_id = state
                .parent_id
                .clone()
                .filter(|parent| self.states.contains_key(parent));
        }
        Ok(state)
    }
}

impl std::fmt::Debug for TemporalTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TemporalTree")
            .field("project_id", &self.project_id)
            .field("states", &self.states.len())
            .field("current_state_id", &self.current_state_id)
            .field("cached", &self.cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::{Block, BlockType, Link, Position};
    use chrono::Duration;

    fn graph_with(count: usize) -> GraphState {
        let mut graph = GraphState::from_parts(vec![Block::core("core")], vec![]);
        for i in 0..count {
            let id = format!("b{}", i);
            graph.insert_block(
                Block::new(id.clone(), BlockType::Text, Position::new(500.0, i as f64 * 280.0))
                    .with_content(format!("note {}", i)),
            );
            graph.insert_link(Link::new(format!("l{}", i), "core", id));
        }
        graph
    }

    fn owner() -> AccessContext<'static> {
        AccessContext::new(Some("carol"), "carol")
    }

    #[test]
    fn test_saves_form_single_path() {
        let mut tree = TemporalTree::new("p1");
        let mut saved = Vec::new();
        for n in 1..=5 {
            let live = graph_with(n);
            let state = tree.save(&live, Some("carol"), None).unwrap();
            saved.push((state.id, live));
        }

        let (last_id, last_graph) = saved.last().unwrap().clone();
        assert_eq!(tree.path_to_root(&last_id).unwrap().len(), 5);
        for (id, _) in &saved {
            assert!(tree.children(id).len() <= 1);
        }
        assert_eq!(tree.reconstruct(&last_id).unwrap(), last_graph);
        assert_eq!(tree.current_state_id(), Some(last_id.as_str()));
    }

    #[test]
    fn test_replay_from_persisted_rows_matches_live() {
        let mut tree = TemporalTree::new("p1");
        let mut saved = Vec::new();
        let mut live = graph_with(2);
        for step in 0..4 {
            live.blocks.get_mut("b0").unwrap().position = Position::new(step as f64, 10.0);
            if step == 2 {
                live.remove_block("b1");
            }
            let state = tree.save(&live, None, None).unwrap();
            saved.push((state.id, live.clone()));
        }

        let rows: Vec<TemporalState> = tree.states().cloned().collect();
        let encoded: Vec<String> = rows
            .iter()
            .map(|s| serde_json::to_string(s).unwrap())
            .collect();
        let decoded = encoded
            .iter()
            .map(|raw| serde_json::from_str::<TemporalState>(raw).unwrap());

        let mut fresh = TemporalTree::from_states("p1", decoded, None).with_cache_size(1);
        for (id, graph) in &saved {
            assert_eq!(&fresh.reconstruct(id).unwrap(), graph);
        }
    }

    #[test]
    fn test_first_save_is_snapshot_diff() {
        let mut tree = TemporalTree::new("p1");
        let first = tree.save(&graph_with(1), None, None).unwrap();
        assert!(first.diff.is_snapshot());
        assert!(first.parent_id.is_none());

        let second = tree.save(&graph_with(2), None, None).unwrap();
        assert!(!second.diff.is_snapshot());
        assert_eq!(second.parent_id, Some(first.id));
    }

    #[test]
    fn test_named_save_is_pinned() {
        let mut tree = TemporalTree::new("p1");
        let auto = tree.save(&graph_with(1), None, Some("   ")).unwrap();
        assert_eq!(auto.intent, AUTOSAVE_INTENT);
        assert!(!auto.is_snapshot);

        let named = tree.save(&graph_with(1), None, Some(" v1 ")).unwrap();
        assert_eq!(named.intent, "v1");
        assert!(named.is_snapshot);
    }

    #[test]
    fn test_preview_keeps_present() {
        let mut tree = TemporalTree::new("p1");
        let v1 = tree.save(&graph_with(1), None, Some("v1")).unwrap();
        let v2 = tree.save(&graph_with(3), None, None).unwrap();

        assert_eq!(tree.preview(&v1.id).unwrap(), graph_with(1));
        assert_eq!(tree.current_state_id(), Some(v2.id.as_str()));
    }

    #[test]
    fn test_apply_checks_owner_and_branches() {
        let mut tree = TemporalTree::new("p1");
        let v1 = tree.save(&graph_with(1), None, Some("v1")).unwrap();
        tree.save(&graph_with(2), None, None).unwrap();

        let bob = AccessContext::new(Some("bob"), "carol");
        assert_eq!(
            tree.apply(&v1.id, &bob),
            Err(HistoryError::Forbidden("apply a history state"))
        );

        assert_eq!(tree.apply(&v1.id, &owner()).unwrap(), graph_with(1));
        assert_eq!(tree.current_state_id(), Some(v1.id.as_str()));

        let branch = tree.save(&graph_with(4), None, None).unwrap();
        assert_eq!(branch.parent_id.as_deref(), Some(v1.id.as_str()));
        assert_eq!(tree.children(&v1.id).len(), 2);
    }

    #[test]
    fn test_rename_and_pin() {
        let mut tree = TemporalTree::new("p1");
        let state = tree.save(&graph_with(1), None, None).unwrap();

        assert_eq!(tree.rename(&state.id, "  "), Err(HistoryError::EmptyIntent));
        assert_eq!(tree.rename(&state.id, "launch").unwrap().intent, "launch");
        assert!(tree.pin(&state.id).unwrap().is_snapshot);
        assert_eq!(
            tree.pin("missing").map(|s| s.id.clone()),
            Err(HistoryError::NotFound("missing".into()))
        );

        let summary = &tree.history()[0];
        assert_eq!(summary.intent, "launch");
        assert!(summary.is_current);
    }

    #[test]
    fn test_delete_refuses_internal_nodes() {
        let mut tree = TemporalTree::new("p1");
        let root = tree.save(&graph_with(1), None, None).unwrap();
        let leaf = tree.save(&graph_with(2), None, None).unwrap();

        assert_eq!(
            tree.delete(&root.id),
            Err(HistoryError::HasChildren(root.id.clone(), 1))
        );

        tree.delete(&leaf.id).unwrap();
        assert_eq!(tree.current_state_id(), Some(root.id.as_str()));
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.reconstruct(&root.id).unwrap(), graph_with(1));
    }

    #[test]
    fn test_dangling_parent_is_root() {
        let now = Utc::now();
        let orphan = TemporalState {
            id: "s2".into(),
            project_id: "p1".into(),
            parent_id: Some("gone".into()),
            author_id: None,
            intent: AUTOSAVE_INTENT.into(),
            diff: HistoryDiff::Snapshot(graph_with(1)),
            is_snapshot: false,
            timestamp: now,
        };
        let mut tree = TemporalTree::from_states("p1", vec![orphan], Some("s2".into()));
        assert_eq!(tree.path_to_root("s2").unwrap(), vec!["s2".to_string()]);
        assert_eq!(tree.reconstruct("s2").unwrap(), graph_with(1));
    }

    #[test]
    fn test_cycle_is_reported() {
        let now = Utc::now();
        let node = |id: &str, parent: &str, offset: i64| TemporalState {
            id: id.into(),
            project_id: "p1".into(),
            parent_id: Some(parent.into()),
            author_id: None,
            intent: AUTOSAVE_INTENT.into(),
            diff: HistoryDiff::default(),
            is_snapshot: false,
            timestamp: now + Duration::seconds(offset),
        };
        let mut tree =
            TemporalTree::from_states("p1", vec![node("a", "b", 0), node("b", "a", 1)], None);
        assert_eq!(tree.reconstruct("a"), Err(HistoryError::Cycle("a".into())));
        assert_eq!(tree.current_state_id(), None);
    }
}
