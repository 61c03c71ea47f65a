use serde::{Deserialize, Serialize};

use crate::error::CanvasError;
use crate::graph::GraphState;
use crate::link::Link;
use crate::mutation::Mutation;

/// A connection dragged between two handles, not yet part of the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProposal {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub source_handle: Option<String>,
    #[serde(default)]
    pub target_handle: Option<String>,
}

/// Validate a proposed connection and turn it into an `edgeCreate` mutation.
///
/// Self-loops, missing endpoints and exact duplicates (same endpoints and handles) are
/// rejected before any mutation exists.
pub fn validate_connection(
    state: &GraphState,
    proposal: &ConnectionProposal,
    link_id: impl Into<String>,
) -> Result<Mutation, CanvasError> {
    if proposal.source == proposal.target {
        return Err(CanvasError::SelfLoop(proposal.source.clone()));
    }
    for endpoint in [&proposal.source, &proposal.target] {
        if !state.contains_block(endpoint) {
            return Err(CanvasError::BlockNotFound(endpoint.clone()));
        }
    }

    let duplicate = state.links.values().any(|l| {
        l.source == proposal.source
            && l.target == proposal.target
            && l.source_handle == proposal.source_handle
            && l.target_handle == proposal.target_handle
    });
    if duplicate {
        return Err(CanvasError::DuplicateConnection(
            proposal.source.clone(),
            proposal.target.clone(),
        ));
    }

    let mut link = Link::new(link_id, proposal.source.clone(), proposal.target.clone());
    link.source_handle = proposal.source_handle.clone();
    link.target_handle = proposal.target_handle.clone();
    Ok(Mutation::EdgeCreate { link })
}
