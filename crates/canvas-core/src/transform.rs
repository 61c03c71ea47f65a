//! Mapping between persisted relational rows and in-memory graph values.
//!
//! Rows store `data` and `metadata` as JSON strings. Reading never fails on corrupt JSON:
//! the column is treated as an empty object so one bad block cannot block a project load.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::block::{Block, BlockData, BlockType, Position, RESERVED_DATA_KEYS};
use crate::error::CanvasError;
use crate::graph::GraphState;
use crate::link::Link;

/// Width used when persisting a block that carries no size at all
pub const FALLBACK_BLOCK_WIDTH: f64 = 200.0;
/// Height used when persisting a block that carries no size at all
pub const FALLBACK_BLOCK_HEIGHT: f64 = 100.0;

/// A row of the `blocks` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
pub struct BlockRow {
    pub id: String,
    pub project_id: String,
    pub owner_id: String,
    pub block_type: String,
    pub position_x: f64,
    pub position_y: f64,
    pub width: f64,
    pub height: f64,
    pub content: String,
    pub data: Option<String>,
    pub metadata: Option<String>,
    pub is_locked: bool,
    #[cfg_attr(feature = "sqlx", sqlx(default))]
    pub created_at: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "sqlx", sqlx(default))]
    pub updated_at: Option<DateTime<Utc>>,
    /// Joined from the owner's profile
    #[cfg_attr(feature = "sqlx", sqlx(default))]
    pub author_name: Option<String>,
    #[cfg_attr(feature = "sqlx", sqlx(default))]
    pub author_color: Option<String>,
}

/// A row of the `links` table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "sqlx", derive(sqlx::FromRow))]
#[serde(rename_all = "camelCase")]
pub struct LinkRow {
    pub id: String,
    pub project_id: String,
    pub source_block_id: String,
    pub target_block_id: String,
    pub source_handle: Option<String>,
    pub target_handle: Option<String>,
    pub link_type: String,
    pub animated: bool,
    pub data: Option<String>,
    pub label: Option<String>,
    #[cfg_attr(feature = "sqlx", sqlx(default))]
    pub created_at: Option<DateTime<Utc>>,
    #[cfg_attr(feature = "sqlx", sqlx(default))]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Parse a persisted JSON object column, substituting an empty object on any defect
pub fn parse_json_object(raw: Option<&str>) -> Map<String, Value> {
    let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
        return Map::new();
    };
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::Object(map)) => map,
        Ok(Value::Null) => Map::new(),
        Ok(other) => {
            tracing::warn!(kind = ?other, "expected a JSON object column, using empty object");
            Map::new()
        }
        Err(e) => {
            tracing::warn!(error = %e, "malformed JSON column, using empty object");
            Map::new()
        }
    }
}

/// Convert a persisted block row into a graph block
pub fn transform_block(row: &BlockRow) -> Block {
    let block_type = BlockType::parse(&row.block_type).unwrap_or_else(|| {
        tracing::warn!(block = %row.id, kind = %row.block_type, "unknown block type, rendering as text");
        BlockType::Text
    });

    let mut extra = parse_json_object(row.data.as_deref());
    for key in RESERVED_DATA_KEYS {
        extra.remove(key);
    }

    let mut block = Block {
        id: row.id.clone(),
        block_type,
        position: Position::new(row.position_x, row.position_y),
        width: Some(row.width),
        height: Some(row.height),
        measured: None,
        data: BlockData {
            content: row.content.clone(),
            block_type: Some(row.block_type.clone()),
            metadata: parse_json_object(row.metadata.as_deref()),
            owner_id: Some(row.owner_id.clone()),
            is_locked: row.is_locked,
            author_name: row.author_name.clone(),
            author_color: row.author_color.clone(),
            updated_at: row.updated_at,
            extra,
        },
        selected: false,
        draggable: true,
        deletable: true,
    };
    block.pin_if_core();
    block
}

/// Convert a graph block into a row for persistence.
///
/// The stored type comes from `data.blockType` when it names a known type, then the node
/// type. An existing owner on the block wins over `owner_id`.
pub fn prepare_block_for_db(
    block: &Block,
    project_id: &str,
    owner_id: &str,
) -> Result<BlockRow, CanvasError> {
    if block.id.trim().is_empty() {
        return Err(CanvasError::MissingId("block"));
    }

    let block_type = block
        .data
        .block_type
        .as_deref()
        .and_then(BlockType::parse)
        .unwrap_or(block.block_type);

    let measured = block.measured;
    let width = block
        .width
        .or(measured.map(|m| m.width))
        .unwrap_or(FALLBACK_BLOCK_WIDTH);
    let height = block
        .height
        .or(measured.map(|m| m.height))
        .unwrap_or(FALLBACK_BLOCK_HEIGHT);

    let position = if block_type == BlockType::Core {
        Position::anchor()
    } else {
        block.position
    };

    Ok(BlockRow {
        id: block.id.clone(),
        project_id: project_id.to_string(),
        owner_id: block
            .data
            .owner_id
            .clone()
            .unwrap_or_else(|| owner_id.to_string()),
        block_type: block_type.as_str().to_string(),
        position_x: position.x,
        position_y: position.y,
        width,
        height,
        content: block.data.content.clone(),
        data: Some(Value::Object(block.data.extra.clone()).to_string()),
        metadata: Some(Value::Object(block.data.metadata.clone()).to_string()),
        is_locked: block.data.is_locked,
        created_at: None,
        updated_at: Some(Utc::now()),
        author_name: block.data.author_name.clone(),
        author_color: block.data.author_color.clone(),
    })
}

/// Convert a persisted link row into a graph link
pub fn transform_link(row: &LinkRow) -> Link {
    Link {
        id: row.id.clone(),
        source: row.source_block_id.clone(),
        target: row.target_block_id.clone(),
        source_handle: row.source_handle.clone(),
        target_handle: row.target_handle.clone(),
        link_type: if row.link_type.trim().is_empty() {
            crate::link::DEFAULT_LINK_TYPE.to_string()
        } else {
            row.link_type.clone()
        },
        animated: row.animated,
        data: parse_json_object(row.data.as_deref()),
        label: row.label.clone(),
    }
}

/// Convert a graph link into a row for persistence
pub fn prepare_link_for_db(link: &Link, project_id: &str) -> Result<LinkRow, CanvasError> {
    if link.id.trim().is_empty() {
        return Err(CanvasError::MissingId("link"));
    }
    if link.source.trim().is_empty() || link.target.trim().is_empty() {
        return Err(CanvasError::MissingEndpoint(link.id.clone()));
    }

    Ok(LinkRow {
        id: link.id.clone(),
        project_id: project_id.to_string(),
        source_block_id: link.source.clone(),
        target_block_id: link.target.clone(),
        source_handle: link.source_handle.clone(),
        target_handle: link.target_handle.clone(),
        link_type: link.link_type.clone(),
        animated: link.animated,
        data: Some(Value::Object(link.data.clone()).to_string()),
        label: link.label.clone(),
        created_at: None,
        updated_at: Some(Utc::now()),
    })
}

/// Assemble a graph from a project's rows, skipping links with missing endpoints
pub fn graph_from_rows(blocks: &[BlockRow], links: &[LinkRow]) -> GraphState {
    GraphState::from_parts(
        blocks.iter().map(transform_block),
        links.iter().map(transform_link),
    )
}

/// Flatten a graph into rows for a full project write
pub fn graph_to_rows(
    state: &GraphState,
    project_id: &str,
    owner_id: &str,
) -> Result<(Vec<BlockRow>, Vec<LinkRow>), CanvasError> {
    let blocks = state
        .blocks
        .values()
        .map(|b| prepare_block_for_db(b, project_id, owner_id))
        .collect::<Result<Vec<_>, _>>()?;
    let links = state
        .links
        .values()
        .map(|l| prepare_link_for_db(l, project_id))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((blocks, links))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{Dimensions, CORE_BLOCK_X, CORE_BLOCK_Y};
    use serde_json::json;

    fn row(id: &str, block_type: &str) -> BlockRow {
        BlockRow {
            id: id.to_string(),
            project_id: "p1".to_string(),
            owner_id: "u1".to_string(),
            block_type: block_type.to_string(),
            position_x: 10.0,
            position_y: 20.0,
            width: 320.0,
            height: 240.0,
            content: "body".to_string(),
            data: None,
            metadata: None,
            is_locked: false,
            created_at: None,
            updated_at: None,
            author_name: Some("Ada".to_string()),
            author_color: Some("#ff0000".to_string()),
        }
    }

    #[test]
    fn test_round_trip_preserves_identity() {
        let node: Block = serde_json::from_value(json!({
            "id": "n1",
            "type": "text",
            "position": {"x": 50.0, "y": 60.0},
            "measured": {"width": 200.0, "height": 100.0},
            "data": {"content": "hello"}
        }))
        .unwrap();

        let row = prepare_block_for_db(&node, "p1", "u1").unwrap();
        assert_eq!(row.width, 200.0);
        assert_eq!(row.height, 100.0);
        assert_eq!(row.owner_id, "u1");

        let back = transform_block(&row);
        assert_eq!(back.id, "n1");
        assert_eq!(back.block_type, BlockType::Text);
        assert_eq!(back.position, Position::new(50.0, 60.0));
        assert_eq!(back.content(), "hello");
    }

    #[test]
    fn test_prepare_rejects_missing_id() {
        let node = Block::new("  ", BlockType::Text, Position::default());
        assert_eq!(
            prepare_block_for_db(&node, "p1", "u1"),
            Err(CanvasError::MissingId("block"))
        );
    }

    #[test]
    fn test_prepare_uses_fallback_size_and_type_override() {
        let mut node = Block::new("n2", BlockType::Text, Position::default());
        node.data.block_type = Some("snippet".to_string());
        let row = prepare_block_for_db(&node, "p1", "u1").unwrap();
        assert_eq!(row.block_type, "snippet");
        assert_eq!((row.width, row.height), (200.0, 100.0));

        node.data.block_type = Some("nonsense".to_string());
        let row = prepare_block_for_db(&node, "p1", "u1").unwrap();
        assert_eq!(row.block_type, "text");
    }

    #[test]
    fn test_core_row_is_pinned_and_fixed() {
        let mut core = row("core", "core");
        core.position_x = 400.0;
        let block = transform_block(&core);
        assert_eq!(block.position, Position::new(CORE_BLOCK_X, CORE_BLOCK_Y));
        assert!(!block.draggable);
        assert!(!block.deletable);
    }

    #[test]
    fn test_malformed_json_is_empty() {
        let mut bad = row("b", "link");
        bad.data = Some("{not json".to_string());
        bad.metadata = Some("[1, 2]".to_string());
        let block = transform_block(&bad);
        assert!(block.data.extra.is_empty());
        assert!(block.data.metadata.is_empty());
        assert_eq!(block.data.author_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_data_column_is_folded_into_bag() {
        let mut r = row("b", "palette");
        r.data = Some(r#"{"emoji":"🎨","content":"ignored"}"#.to_string());
        r.metadata = Some(r##"{"colors":["#fff"]}"##.to_string());
        let block = transform_block(&r);
        assert_eq!(block.data.extra.get("emoji"), Some(&json!("🎨")));
        assert_eq!(block.content(), "body");

        let back = prepare_block_for_db(&block, "p1", "someone-else").unwrap();
        assert_eq!(back.owner_id, "u1");
        assert_eq!(parse_json_object(back.metadata.as_deref()), block.data.metadata);
    }

    #[test]
    fn test_unknown_block_type_renders_as_text() {
        let block = transform_block(&row("x", "hologram"));
        assert_eq!(block.block_type, BlockType::Text);
        assert_eq!(block.effective_size(), Dimensions::new(320.0, 240.0));
    }

    #[test]
    fn test_link_round_trip_and_dangling_filter() {
        let mut link = Link::new("l1", "a", "b");
        link.data.insert("weight".into(), json!(2));
        let persisted = prepare_link_for_db(&link, "p1").unwrap();
        assert_eq!(transform_link(&persisted), link);

        let graph = graph_from_rows(&[row("a", "text")], &[row_link("l1", "a", "missing")]);
        assert!(graph.links.is_empty());
        assert_eq!(graph.blocks.len(), 1);
    }

    #[test]
    fn test_prepare_link_requires_endpoints() {
        let link = Link::new("l1", "a", "");
        assert_eq!(
            prepare_link_for_db(&link, "p1"),
            Err(CanvasError::MissingEndpoint("l1".to_string()))
        );
    }

    fn row_link(id: &str, source: &str, target: &str) -> LinkRow {
        LinkRow {
            id: id.to_string(),
            project_id: "p1".to_string(),
            source_block_id: source.to_string(),
            target_block_id: target.to_string(),
            source_handle: None,
            target_handle: None,
            link_type: String::new(),
            animated: false,
            data: Some("oops".to_string()),
            label: None,
            created_at: None,
            updated_at: None,
        }
    }
}
