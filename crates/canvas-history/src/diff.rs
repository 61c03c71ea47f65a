use canvas_core::{apply_all, apply_graph_mutation, Block, GraphState, Mutation};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// What a history point stores: either a full graph or the mutations from its parent.
///
/// Serialized untagged: a snapshot is a `{"blocks": [...], "links": [...]}` object, a
/// mutation list is an array of `{"type", "payload"}` envelopes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HistoryDiff {
    Snapshot(GraphState),
    Mutations(Vec<Mutation>),
}

impl Default for HistoryDiff {
    fn default() -> Self {
        HistoryDiff::Mutations(Vec::new())
    }
}

impl HistoryDiff {
    /// Diff `next` against `base`, falling back to a snapshot when there is no base or when
    /// the mutation list would outgrow the snapshot itself
    pub fn between(base: Option<&GraphState>, next: &GraphState) -> Self {
        let Some(base) = base else {
            return HistoryDiff::Snapshot(next.clone());
        };
        let mutations = diff_graphs(base, next);
        if mutations.len() > next.blocks.len() + next.links.len() {
            HistoryDiff::Snapshot(next.clone())
        } else {
            HistoryDiff::Mutations(mutations)
        }
    }

    /// Replay this diff on top of `state`
    pub fn apply(&self, state: GraphState) -> GraphState {
        match self {
            HistoryDiff::Snapshot(snapshot) => apply_graph_mutation(
                state,
                &Mutation::GraphSnapshot {
                    state: snapshot.clone(),
                },
            ),
            HistoryDiff::Mutations(mutations) => apply_all(state, mutations),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        matches!(self, HistoryDiff::Snapshot(_))
    }

    /// Decode a persisted diff. Corrupt input becomes an empty mutation list.
    pub fn from_value(value: Value) -> Self {
        let (is_envelope, is_graph) = match &value {
            Value::Object(map) => (
                map.contains_key("type"),
                map.contains_key("blocks") || map.contains_key("links"),
            ),
            _ => (false, false),
        };

        match value {
            Value::Array(items) => HistoryDiff::Mutations(
                items
                    .into_iter()
                    .filter_map(|item| serde_json::from_value::<Mutation>(item).ok())
                    .collect(),
            ),
            Value::Object(_) if is_envelope => match serde_json::from_value::<Mutation>(value) {
                Ok(Mutation::GraphSnapshot { state }) => HistoryDiff::Snapshot(state),
                Ok(mutation) => HistoryDiff::Mutations(vec![mutation]),
                Err(_) => HistoryDiff::default(),
            },
            Value::Object(_) if is_graph => serde_json::from_value::<GraphState>(value)
                .map(HistoryDiff::Snapshot)
                .unwrap_or_else(|e| {
                    tracing::warn!(error = %e, "corrupt history snapshot, replaying as empty");
                    HistoryDiff::default()
                }),
            Value::String(raw) => match serde_json::from_str::<Value>(&raw) {
                Ok(Value::String(_)) | Err(_) => {
                    tracing::warn!("corrupt history diff string, replaying as empty");
                    HistoryDiff::default()
                }
                Ok(inner) => HistoryDiff::from_value(inner),
            },
            other => {
                tracing::warn!(kind = ?other, "unexpected history diff shape, replaying as empty");
                HistoryDiff::default()
            }
        }
    }

    /// Decode a diff stored as a JSON text column
    pub fn from_json_str(raw: &str) -> Self {
        match serde_json::from_str::<Value>(raw) {
            Ok(value) => HistoryDiff::from_value(value),
            Err(e) => {
                tracing::warn!(error = %e, "malformed history diff, replaying as empty");
                HistoryDiff::default()
            }
        }
    }

    pub fn to_json_string(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "[]".to_string())
    }
}

impl<'de> Deserialize<'de> for HistoryDiff {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Ok(HistoryDiff::from_value(value))
    }
}

/// Compute the mutations that turn `prev` into `next`.
///
/// Order: link removals, block removals, block creations, block changes, link creations,
/// so that every link is created after both of its endpoints exist.
pub fn diff_graphs(prev: &GraphState, next: &GraphState) -> Vec<Mutation> {
    let mut mutations = Vec::new();

    for (id, link) in &prev.links {
        if next.links.get(id) != Some(link) {
            mutations.push(Mutation::EdgeDelete { id: id.clone() });
        }
    }

    for id in prev.blocks.keys() {
        if !next.blocks.contains_key(id) {
            mutations.push(Mutation::BlockDelete { id: id.clone() });
        }
    }

    for (id, block) in &next.blocks {
        if !prev.blocks.contains_key(id) {
            mutations.push(Mutation::BlockCreate {
                block: block.clone(),
            });
        }
    }

    for (id, block) in &next.blocks {
        if let Some(before) = prev.blocks.get(id) {
            if before != block {
                mutations.push(block_mutation(before, block));
            }
        }
    }

    for (id, link) in &next.links {
        if prev.links.get(id) != Some(link) {
            mutations.push(Mutation::EdgeCreate { link: link.clone() });
        }
    }

    mutations
}

/// Smallest single mutation that turns `before` into `after`
fn block_mutation(before: &Block, after: &Block) -> Mutation {
    let candidates = [
        Mutation::BlockMove {
            id: after.id.clone(),
            position: after.position,
        },
        Mutation::BlockContent {
            id: after.id.clone(),
            content: after.data.content.clone(),
        },
        Mutation::BlockResize {
            id: after.id.clone(),
            width: after.width,
            height: after.height,
            position: Some(after.position),
        },
    ];

    let seed = GraphState::from_parts([before.clone()], []);
    candidates
        .into_iter()
        .find(|candidate| {
            apply_graph_mutation(seed.clone(), candidate).block(&after.id) == Some(after)
        })
        .unwrap_or_else(|| Mutation::BlockUpdate {
            block: after.clone(),
        })
}
