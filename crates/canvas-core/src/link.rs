use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::block::BlockId;

pub type LinkId = String;

/// Rendering kind used when a link does not specify one
pub const DEFAULT_LINK_TYPE: &str = "connection";

fn default_link_type() -> String {
    DEFAULT_LINK_TYPE.to_string()
}

/// The side of a block a connector sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
    Top,
    Bottom,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Left => "left",
            Side::Right => "right",
            Side::Top => "top",
            Side::Bottom => "bottom",
        }
    }

    /// Handle id used on the source block, e.g. `"right"`
    pub fn source_handle(&self) -> String {
        self.as_str().to_string()
    }

    /// Handle id used on the target block, e.g. `"left-target"`
    pub fn target_handle(&self) -> String {
        format!("{}-target", self.as_str())
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
            Side::Top => Side::Bottom,
            Side::Bottom => Side::Top,
        }
    }

    /// Parse a handle id, accepting both source and `-target` forms
    pub fn from_handle(handle: &str) -> Option<Self> {
        match handle.trim_end_matches("-target") {
            "left" => Some(Side::Left),
            "right" => Some(Side::Right),
            "top" => Some(Side::Top),
            "bottom" => Some(Side::Bottom),
            _ => None,
        }
    }
}

/// A directed connection between two blocks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Link {
    pub id: LinkId,
    pub source: BlockId,
    pub target: BlockId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    #[serde(rename = "type", default = "default_link_type")]
    pub link_type: String,
    #[serde(default)]
    pub animated: bool,
    #[serde(default)]
    pub data: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

impl Link {
    pub fn new(id: impl Into<LinkId>, source: impl Into<BlockId>, target: impl Into<BlockId>) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            source_handle: None,
            target_handle: None,
            link_type: default_link_type(),
            animated: false,
            data: Map::new(),
            label: None,
        }
    }

    /// Attach the link to the given side of its source and the facing side of its target
    pub fn on_side(mut self, side: Side) -> Self {
        self.source_handle = Some(side.source_handle());
        self.target_handle = Some(side.opposite().target_handle());
        self
    }

    pub fn touches(&self, block_id: &str) -> bool {
        self.source == block_id || self.target == block_id
    }

    pub fn is_self_loop(&self) -> bool {
        self.source == self.target
    }

    /// Side requested by the source handle, if it names one
    pub fn source_side(&self) -> Option<Side> {
        self.source_handle.as_deref().and_then(Side::from_handle)
    }

    /// Visual emphasis stored under `data.weight`
    pub fn weight(&self) -> Option<f64> {
        self.data.get("weight").and_then(Value::as_f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_handles() {
        assert_eq!(Side::Right.source_handle(), "right");
        assert_eq!(Side::Left.target_handle(), "left-target");
        assert_eq!(Side::from_handle("bottom-target"), Some(Side::Bottom));
        assert_eq!(Side::from_handle("middle"), None);

        let link = Link::new("l", "a", "b").on_side(Side::Right);
        assert_eq!(link.source_handle.as_deref(), Some("right"));
        assert_eq!(link.target_handle.as_deref(), Some("left-target"));
    }

    #[test]
    fn test_link_defaults() {
        let link: Link = serde_json::from_value(json!({
            "id": "l1",
            "source": "a",
            "target": "b",
            "data": {"weight": 3}
        }))
        .unwrap();
        assert_eq!(link.link_type, "connection");
        assert!(!link.animated);
        assert_eq!(link.weight(), Some(3.0));
        assert!(link.touches("a"));
        assert!(!link.is_self_loop());
    }
}
