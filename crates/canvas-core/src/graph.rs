use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::block::{Block, BlockId};
use crate::link::{Link, LinkId};

/// The whole project graph, keyed by id for deterministic iteration and comparison.
///
/// Serialized as `{"blocks": [...], "links": [...]}`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphState {
    #[serde(default, with = "keyed")]
    pub blocks: BTreeMap<BlockId, Block>,
    #[serde(default, with = "keyed")]
    pub links: BTreeMap<LinkId, Link>,
}

impl GraphState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a graph from unordered parts. Later duplicates win; dangling links are dropped.
    pub fn from_parts(
        blocks: impl IntoIterator<Item = Block>,
        links: impl IntoIterator<Item = Link>,
    ) -> Self {
        let mut state = Self {
            blocks: blocks
                .into_iter()
                .map(|mut b| {
                    b.pin_if_core();
                    (b.id.clone(), b)
                })
                .collect(),
            links: links.into_iter().map(|l| (l.id.clone(), l)).collect(),
        };
        state.retain_valid_links();
        state
    }

    pub fn block(&self, id: &str) -> Option<&Block> {
        self.blocks.get(id)
    }

    pub fn link(&self, id: &str) -> Option<&Link> {
        self.links.get(id)
    }

    pub fn contains_block(&self, id: &str) -> bool {
        self.blocks.contains_key(id)
    }

    /// The project's anchor block, if loaded
    pub fn core_block(&self) -> Option<&Block> {
        self.blocks.values().find(|b| b.is_core())
    }

    pub fn insert_block(&mut self, mut block: Block) {
        block.pin_if_core();
        self.blocks.insert(block.id.clone(), block);
    }

    /// Insert a link if both endpoints exist and it is not a self-loop
    pub fn insert_link(&mut self, link: Link) -> bool {
        if link.is_self_loop()
            || !self.contains_block(&link.source)
            || !self.contains_block(&link.target)
        {
            return false;
        }
        self.links.insert(link.id.clone(), link);
        true
    }

    /// Remove a block and every link touching it
    pub fn remove_block(&mut self, id: &str) -> Option<Block> {
        let removed = self.blocks.remove(id)?;
        self.links.retain(|_, link| !link.touches(id));
        Some(removed)
    }

    pub fn links_touching<'a>(&'a self, block_id: &'a str) -> impl Iterator<Item = &'a Link> + 'a {
        self.links.values().filter(move |l| l.touches(block_id))
    }

    /// Drop links that are self-loops or reference missing blocks
    pub fn retain_valid_links(&mut self) {
        let blocks = &self.blocks;
        self.links.retain(|id, link| {
            let valid = !link.is_self_loop()
                && blocks.contains_key(&link.source)
                && blocks.contains_key(&link.target);
            if !valid {
                tracing::debug!(link = %id, "dropping link with missing or identical endpoints");
            }
            valid
        });
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.links.is_empty()
    }
}

/// Values with an intrinsic key, so maps can be stored as plain sequences
pub trait Keyed {
    fn key(&self) -> &str;
}

impl Keyed for Block {
    fn key(&self) -> &str {
        &self.id
    }
}

impl Keyed for Link {
    fn key(&self) -> &str {
        &self.id
    }
}

mod keyed {
    use super::Keyed;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S, T>(map: &BTreeMap<String, T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        serializer.collect_seq(map.values())
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<BTreeMap<String, T>, D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de> + Keyed,
    {
        let items = Vec::<T>::deserialize(deserializer)?;
        Ok(items
            .into_iter()
            .map(|item| (item.key().to_string(), item))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockType, Position};
    use serde_json::json;

    #[test]
    fn test_serializes_as_sequences() {
        let state = GraphState::from_parts(
            vec![
                Block::core("core"),
                Block::new("a", BlockType::Text, Position::new(10.0, 20.0)),
            ],
            vec![Link::new("l1", "core", "a")],
        );
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(value["blocks"].as_array().unwrap().len(), 2);
        assert_eq!(value["links"][0]["id"], json!("l1"));

        let back: GraphState = serde_json::from_value(value).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn test_from_parts_filters_dangling_links() {
        let state = GraphState::from_parts(
            vec![Block::core("core")],
            vec![
                Link::new("l1", "core", "ghost"),
                Link::new("l2", "core", "core"),
            ],
        );
        assert!(state.links.is_empty());
        assert_eq!(state.blocks.len(), 1);
    }

    #[test]
    fn test_remove_block_cascades() {
        let mut state = GraphState::from_parts(
            vec![
                Block::core("core"),
                Block::new("a", BlockType::Text, Position::default()),
                Block::new("b", BlockType::Text, Position::default()),
            ],
            vec![Link::new("l1", "core", "a"), Link::new("l2", "core", "b")],
        );
        assert!(state.remove_block("a").is_some());
        assert!(state.link("l1").is_none());
        assert!(state.link("l2").is_some());
        assert!(state.remove_block("a").is_none());
    }
}
