use canvas_core::{apply_graph_mutation, Block, GraphState, Link, Mutation};
use serde::de::DeserializeOwned;
use serde::Serialize;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Doc, GetString, Map, MapRef, OffsetKind, Options, Out, ReadTxn, StateVector, Text,
    TextPrelim, Transact, TransactionMut, Update,
};

use crate::error::SyncError;

/// Root map holding block id -> block JSON
pub const BLOCKS_MAP: &str = "blocks";
/// Root map holding link id -> link JSON
pub const LINKS_MAP: &str = "links";
/// Root map holding block id -> collaborative text body
pub const CONTENTS_MAP: &str = "contents";

/// The live, replicated canvas of one project.
///
/// Blocks and links are stored as whole JSON values (last writer wins per id). Text-like
/// blocks additionally own an entry in `contents`, which is the canonical body: the `content`
/// field inside the block JSON is only a cache once that entry exists.
///
/// Every local write returns the encoded update so the caller can ship and persist it.
pub struct CanvasDoc {
    doc: Doc,
    blocks: MapRef,
    links: MapRef,
    contents: MapRef,
}

impl CanvasDoc {
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    pub fn with_client_id(client_id: u64) -> Self {
        Self::with_options(Options::with_client_id(client_id))
    }

    /// Text offsets are counted in UTF-16 code units, the unit browser editors use
    fn with_options(options: Options) -> Self {
        Self::from_doc(Doc::with_options(Options {
            offset_kind: OffsetKind::Utf16,
            ..options
        }))
    }

    fn from_doc(doc: Doc) -> Self {
        let blocks = doc.get_or_insert_map(BLOCKS_MAP);
        let links = doc.get_or_insert_map(LINKS_MAP);
        let contents = doc.get_or_insert_map(CONTENTS_MAP);
        Self {
            doc,
            blocks,
            links,
            contents,
        }
    }

    pub fn client_id(&self) -> u64 {
        self.doc.client_id()
    }

    /// Materialize the current graph, with text bodies taken from `contents`
    pub fn graph(&self) -> GraphState {
        let txn = self.doc.transact();

        let mut blocks = Vec::new();
        for (key, value) in self.blocks.iter(&txn) {
            if let Some(mut block) = decode_entry::<Block>(key, &value) {
                block.id = key.to_string();
                if let Some(text) = self.text_in(&txn, key) {
                    block.data.content = text;
                }
                blocks.push(block);
            }
        }

        let mut links = Vec::new();
        for (key, value) in self.links.iter(&txn) {
            if let Some(mut link) = decode_entry::<Link>(key, &value) {
                link.id = key.to_string();
                links.push(link);
            }
        }

        GraphState::from_parts(blocks, links)
    }

    pub fn block(&self, id: &str) -> Option<Block> {
        self.graph().blocks.remove(id)
    }

    /// Current body of a block's collaborative text, if it has one
    pub fn text(&self, block_id: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.text_in(&txn, block_id)
    }

    fn text_in<T: ReadTxn>(&self, txn: &T, block_id: &str) -> Option<String> {
        match self.contents.get(txn, block_id) {
            Some(Out::YText(text)) => Some(text.get_string(txn)),
            _ => None,
        }
    }

    /// Run a mutation through the reducer and write only the keys it changed
    pub fn apply_mutation(&self, mutation: &Mutation) -> Vec<u8> {
        let prev = self.graph();
        let next = apply_graph_mutation(prev.clone(), mutation);
        self.write(&prev, &next)
    }

    /// Overwrite the live maps with `graph`, used when checking out a history state
    pub fn replace_graph(&self, graph: &GraphState) -> Vec<u8> {
        let prev = self.graph();
        let next = apply_graph_mutation(
            GraphState::new(),
            &Mutation::GraphSnapshot {
                state: graph.clone(),
            },
        );
        self.write(&prev, &next)
    }

    fn write(&self, prev: &GraphState, next: &GraphState) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        self.write_delta(&mut txn, prev, next);
        txn.encode_update_v1()
    }

    fn write_delta(&self, txn: &mut TransactionMut, prev: &GraphState, next: &GraphState) {
        for id in prev.links.keys() {
            if !next.links.contains_key(id) {
                self.links.remove(txn, id);
            }
        }
        for id in prev.blocks.keys() {
            if !next.blocks.contains_key(id) {
                self.blocks.remove(txn, id);
                self.contents.remove(txn, id);
            }
        }

        for (id, block) in &next.blocks {
            if prev.blocks.get(id) == Some(block) {
                continue;
            }
            if block.block_type.spec().text_like {
                self.sync_text(txn, id, block.content());
            }
            put_entry(&self.blocks, txn, id, block);
        }
        for (id, link) in &next.links {
            if prev.links.get(id) != Some(link) {
                put_entry(&self.links, txn, id, link);
            }
        }
    }

    fn sync_text(&self, txn: &mut TransactionMut, block_id: &str, content: &str) {
        match self.contents.get(&*txn, block_id) {
            Some(Out::YText(text)) => {
                if text.get_string(&*txn) != content {
                    let len = text.len(&*txn);
                    text.remove_range(txn, 0, len);
                    text.insert(txn, 0, content);
                }
            }
            _ => {
                self.contents.insert(txn, block_id, TextPrelim::new(content));
            }
        }
    }

    /// Splice a block's collaborative text. Offsets are UTF-16 code units and must not split
    /// a surrogate pair.
    pub fn edit_text(
        &self,
        block_id: &str,
        index: u32,
        delete: u32,
        insert: &str,
    ) -> Result<Vec<u8>, SyncError> {
        let block = self
            .block(block_id)
            .ok_or_else(|| SyncError::BlockNotFound(block_id.to_string()))?;

        let mut txn = self.doc.transact_mut();
        let text = match self.contents.get(&txn, block_id) {
            Some(Out::YText(text)) => text,
            _ => self
                .contents
                .insert(&mut txn, block_id, TextPrelim::new(block.content())),
        };

        let current = text.get_string(&txn);
        let len = text.len(&txn);
        let delete = delete.min(len.saturating_sub(index));
        if index > len
            || !is_utf16_boundary(&current, index)
            || !is_utf16_boundary(&current, index + delete)
        {
            return Err(SyncError::TextRange {
                block: block_id.to_string(),
                index,
                len,
            });
        }
        if delete > 0 {
            text.remove_range(&mut txn, index, delete);
        }
        if !insert.is_empty() {
            text.insert(&mut txn, index, insert);
        }
        Ok(txn.encode_update_v1())
    }

    /// Merge an update produced by another replica
    pub fn apply_update(&self, update: &[u8]) -> Result<(), SyncError> {
        let update = Update::decode_v1(update).map_err(|e| SyncError::Decode(e.to_string()))?;
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| SyncError::Apply(e.to_string()))?;
        Ok(())
    }

    pub fn state_vector(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `state_vector` is missing
    pub fn diff_since(&self, state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        let sv = StateVector::decode_v1(state_vector).map_err(|e| SyncError::Decode(e.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&sv))
    }

    pub fn encode_state(&self) -> Vec<u8> {
        self.doc
            .transact()
            .encode_state_as_update_v1(&StateVector::default())
    }
}

fn is_utf16_boundary(text: &str, offset: u32) -> bool {
    let mut units = 0u32;
    for ch in text.chars() {
        if units >= offset {
            return units == offset;
        }
        units += ch.len_utf16() as u32;
    }
    units == offset
}

impl Default for CanvasDoc {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CanvasDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasDoc")
            .field("client_id", &self.client_id())
            .finish()
    }
}

fn decode_entry<T: DeserializeOwned>(key: &str, value: &Out) -> Option<T> {
    match value {
        Out::Any(Any::String(raw)) => match serde_json::from_str(raw) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "skipping malformed CRDT entry");
                None
            }
        },
        _ => {
            tracing::warn!(key = %key, "skipping non-JSON CRDT entry");
            None
        }
    }
}

fn put_entry<T: Serialize>(map: &MapRef, txn: &mut TransactionMut, key: &str, value: &T) {
    match serde_json::to_string(value) {
        Ok(raw) => {
            map.insert(txn, key, raw);
        }
        Err(e) => tracing::error!(key = %key, error = %e, "failed to encode CRDT entry"),
    }
}
