use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::block::{Block, BlockId, Position};
use crate::graph::GraphState;
use crate::link::{Link, LinkId};

/// A single graph transition.
///
/// Serialized as a `{"type": ..., "payload": ...}` envelope. Envelopes with an unknown type
/// or a payload of the wrong shape decode to [`Mutation::Unknown`], which the reducer ignores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "MutationEnvelope", into = "MutationEnvelope")]
pub enum Mutation {
    /// `blockDrag` / `blockMove`
    BlockMove { id: BlockId, position: Position },
    BlockResize {
        id: BlockId,
        width: Option<f64>,
        height: Option<f64>,
        position: Option<Position>,
    },
    BlockContent { id: BlockId, content: String },
    /// Merge side-car results (previews, uploads) into a block's metadata
    BlockMetadata {
        id: BlockId,
        metadata: Map<String, Value>,
    },
    BlockCreate { block: Block },
    /// Replace the whole value of an existing block
    BlockUpdate { block: Block },
    BlockDelete { id: BlockId },
    EdgeCreate { link: Link },
    EdgeDelete { id: LinkId },
    GraphSnapshot { state: GraphState },
    Unknown { kind: String },
}

/// Wire shape of a mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Serialize, Deserialize)]
struct MovePayload {
    #[serde(alias = "nodeId", alias = "blockId")]
    id: BlockId,
    #[serde(alias = "pos")]
    position: Position,
}

#[derive(Default, Serialize, Deserialize)]
struct SizePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    height: Option<f64>,
}

#[derive(Serialize, Deserialize)]
struct ResizePayload {
    #[serde(alias = "nodeId", alias = "blockId")]
    id: BlockId,
    #[serde(default)]
    dimensions: SizePatch,
    #[serde(default, alias = "pos", skip_serializing_if = "Option::is_none")]
    position: Option<Position>,
}

#[derive(Serialize, Deserialize)]
struct ContentPayload {
    #[serde(alias = "nodeId", alias = "blockId")]
    id: BlockId,
    content: String,
}

#[derive(Serialize, Deserialize)]
struct MetadataPayload {
    #[serde(alias = "nodeId", alias = "blockId")]
    id: BlockId,
    metadata: Map<String, Value>,
}

#[derive(Serialize, Deserialize)]
struct IdPayload {
    #[serde(alias = "nodeId", alias = "blockId", alias = "edgeId")]
    id: String,
}

impl Mutation {
    /// The envelope `type` string
    pub fn kind(&self) -> &str {
        match self {
            Mutation::BlockMove { .. } => "blockMove",
            Mutation::BlockResize { .. } => "blockResize",
            Mutation::BlockContent { .. } => "blockContent",
            Mutation::BlockMetadata { .. } => "blockMetadata",
            Mutation::BlockCreate { .. } => "blockCreate",
            Mutation::BlockUpdate { .. } => "blockUpdate",
            Mutation::BlockDelete { .. } => "blockDelete",
            Mutation::EdgeCreate { .. } => "edgeCreate",
            Mutation::EdgeDelete { .. } => "edgeDelete",
            Mutation::GraphSnapshot { .. } => "graphSnapshot",
            Mutation::Unknown { kind } => kind.as_str(),
        }
    }

    /// Decode an envelope. Never fails.
    pub fn from_envelope(envelope: MutationEnvelope) -> Self {
        let MutationEnvelope { kind, payload } = envelope;
        let decoded = match kind.as_str() {
            "blockDrag" | "blockMove" => serde_json::from_value::<MovePayload>(payload)
                .map(|p| Mutation::BlockMove {
                    id: p.id,
                    position: p.position,
                })
                .ok(),
            "blockResize" => serde_json::from_value::<ResizePayload>(payload)
                .map(|p| Mutation::BlockResize {
                    id: p.id,
                    width: p.dimensions.width,
                    height: p.dimensions.height,
                    position: p.position,
                })
                .ok(),
            "blockContent" => serde_json::from_value::<ContentPayload>(payload)
                .map(|p| Mutation::BlockContent {
                    id: p.id,
                    content: p.content,
                })
                .ok(),
            "blockMetadata" => serde_json::from_value::<MetadataPayload>(payload)
                .map(|p| Mutation::BlockMetadata {
                    id: p.id,
                    metadata: p.metadata,
                })
                .ok(),
            "blockCreate" => serde_json::from_value(payload)
                .map(|block| Mutation::BlockCreate { block })
                .ok(),
            "blockUpdate" => serde_json::from_value(payload)
                .map(|block| Mutation::BlockUpdate { block })
                .ok(),
            "blockDelete" => serde_json::from_value::<IdPayload>(payload)
                .map(|p| Mutation::BlockDelete { id: p.id })
                .ok(),
            "edgeCreate" => serde_json::from_value(payload)
                .map(|link| Mutation::EdgeCreate { link })
                .ok(),
            "edgeDelete" => serde_json::from_value::<IdPayload>(payload)
                .map(|p| Mutation::EdgeDelete { id: p.id })
                .ok(),
            "graphSnapshot" => serde_json::from_value(payload)
                .map(|state| Mutation::GraphSnapshot { state })
                .ok(),
            _ => None,
        };

        decoded.unwrap_or_else(|| {
            tracing::debug!(kind = %kind, "unrecognized mutation, treating as no-op");
            Mutation::Unknown { kind }
        })
    }

    pub fn to_envelope(&self) -> MutationEnvelope {
        let payload = match self {
            Mutation::BlockMove { id, position } => serde_json::to_value(MovePayload {
                id: id.clone(),
                position: *position,
            }),
            Mutation::BlockResize {
                id,
                width,
                height,
                position,
            } => serde_json::to_value(ResizePayload {
                id: id.clone(),
                dimensions: SizePatch {
                    width: *width,
                    height: *height,
                },
                position: *position,
            }),
            Mutation::BlockContent { id, content } => serde_json::to_value(ContentPayload {
                id: id.clone(),
                content: content.clone(),
            }),
            Mutation::BlockMetadata { id, metadata } => serde_json::to_value(MetadataPayload {
                id: id.clone(),
                metadata: metadata.clone(),
            }),
            Mutation::BlockCreate { block } | Mutation::BlockUpdate { block } => {
                serde_json::to_value(block)
            }
            Mutation::BlockDelete { id } | Mutation::EdgeDelete { id } => {
                serde_json::to_value(IdPayload { id: id.clone() })
            }
            Mutation::EdgeCreate { link } => serde_json::to_value(link),
            Mutation::GraphSnapshot { state } => serde_json::to_value(state),
            Mutation::Unknown { .. } => Ok(Value::Null),
        };

        MutationEnvelope {
            kind: self.kind().to_string(),
            payload: payload.unwrap_or_default(),
        }
    }

    /// The block this mutation addresses, if any
    pub fn block_id(&self) -> Option<&str> {
        match self {
            Mutation::BlockMove { id, .. }
            | Mutation::BlockResize { id, .. }
            | Mutation::BlockContent { id, .. }
            | Mutation::BlockMetadata { id, .. }
            | Mutation::BlockDelete { id } => Some(id),
            Mutation::BlockCreate { block } | Mutation::BlockUpdate { block } => Some(&block.id),
            _ => None,
        }
    }
}

impl From<MutationEnvelope> for Mutation {
    fn from(envelope: MutationEnvelope) -> Self {
        Mutation::from_envelope(envelope)
    }
}

impl From<Mutation> for MutationEnvelope {
    fn from(mutation: Mutation) -> Self {
        mutation.to_envelope()
    }
}

/// Apply one mutation to a graph, producing the next graph.
///
/// Total: mutations addressing missing blocks, links with missing endpoints and unknown
/// mutation types leave the state unchanged. The core block stays pinned to its anchor.
pub fn apply_graph_mutation(mut state: GraphState, mutation: &Mutation) -> GraphState {
    match mutation {
        Mutation::BlockMove { id, position } => {
            if let Some(block) = state.blocks.get_mut(id) {
                block.position = *position;
                block.pin_if_core();
            }
        }
        Mutation::BlockResize {
            id,
            width,
            height,
            position,
        } => {
            if let Some(block) = state.blocks.get_mut(id) {
                if width.is_some() {
                    block.width = *width;
                }
                if height.is_some() {
                    block.height = *height;
                }
                if let Some(position) = position {
                    block.position = *position;
                }
                block.pin_if_core();
            }
        }
        Mutation::BlockContent { id, content } => {
            if let Some(block) = state.blocks.get_mut(id) {
                block.data.content = content.clone();
            }
        }
        Mutation::BlockMetadata { id, metadata } => {
            if let Some(block) = state.blocks.get_mut(id) {
                for (key, value) in metadata {
                    block.data.metadata.insert(key.clone(), value.clone());
                }
            }
        }
        Mutation::BlockCreate { block } => {
            let conflicting_core = block.is_core()
                && state
                    .core_block()
                    .is_some_and(|core| core.id != block.id);
            if !conflicting_core {
                state.insert_block(block.clone());
            }
        }
        Mutation::BlockUpdate { block } => {
            if state.contains_block(&block.id) {
                state.insert_block(block.clone());
            }
        }
        Mutation::BlockDelete { id } => {
            state.remove_block(id);
        }
        Mutation::EdgeCreate { link } => {
            state.insert_link(link.clone());
        }
        Mutation::EdgeDelete { id } => {
            state.links.remove(id);
        }
        Mutation::GraphSnapshot { state: snapshot } => {
            let mut next = snapshot.clone();
            for block in next.blocks.values_mut() {
                block.pin_if_core();
            }
            next.retain_valid_links();
            return next;
        }
        Mutation::Unknown { .. } => {}
    }
    state
}

/// Fold an ordered list of mutations over a starting state
pub fn apply_all<'a>(
    state: GraphState,
    mutations: impl IntoIterator<Item = &'a Mutation>,
) -> GraphState {
    mutations.into_iter().fold(state, apply_graph_mutation)
}
