pub mod access;
pub mod block;
pub mod connection;
pub mod error;
pub mod graph;
pub mod layout;
pub mod link;
pub mod mutation;
pub mod transform;

pub use access::AccessContext;
pub use block::{
    Block, BlockData, BlockId, BlockPayload, BlockSpec, BlockType, Dimensions, Position,
    CORE_BLOCK_X, CORE_BLOCK_Y,
};
pub use connection::{validate_connection, ConnectionProposal};
pub use error::CanvasError;
pub use graph::GraphState;
pub use layout::{layout, HORIZONTAL_SPACING, VERTICAL_GAP};
pub use link::{Link, LinkId, Side, DEFAULT_LINK_TYPE};
pub use mutation::{apply_all, apply_graph_mutation, Mutation, MutationEnvelope};
pub use transform::{
    graph_from_rows, graph_to_rows, prepare_block_for_db, prepare_link_for_db, transform_block,
    transform_link, BlockRow, LinkRow,
};
