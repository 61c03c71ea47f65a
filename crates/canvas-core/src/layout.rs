//! Deterministic tree layout around the core block.
//!
//! Blocks reachable from the core through outgoing links form a tree. Direct children
//! attached to the core's `left` handle grow to the left, every other child grows to the
//! right, and deeper levels inherit their parent's side. Each subtree is stacked
//! vertically and centered on its parent's vertical center.

use std::collections::{HashMap, HashSet};

use crate::block::{Block, Position};
use crate::graph::GraphState;
use crate::link::Side;

/// Horizontal distance between a parent's outer edge and its children
pub const HORIZONTAL_SPACING: f64 = 120.0;
/// Vertical gap between sibling subtrees
pub const VERTICAL_GAP: f64 = 40.0;

/// Outgoing tree edge: the link that attached `child` to its parent
#[derive(Debug, Clone)]
struct TreeEdge {
    link_id: String,
    child: String,
}

struct Tree {
    children: HashMap<String, Vec<TreeEdge>>,
}

impl Tree {
    /// Breadth-first spanning tree from `root`. Each block is claimed by the first parent
    /// that reaches it, which keeps the layout well-defined when the graph has cycles.
    fn build(state: &GraphState, root: &str) -> Self {
        let mut outgoing: HashMap<&str, Vec<(&str, &str)>> = HashMap::new();
        for link in state.links.values() {
            outgoing
                .entry(link.source.as_str())
                .or_default()
                .push((link.id.as_str(), link.target.as_str()));
        }

        let mut children: HashMap<String, Vec<TreeEdge>> = HashMap::new();
        let mut visited: HashSet<&str> = HashSet::from([root]);
        let mut queue = std::collections::VecDeque::from([root]);

        while let Some(parent) = queue.pop_front() {
            let mut candidates = outgoing.remove(parent).unwrap_or_default();
            // Keep siblings in their current visual order so repeated layouts are stable
            candidates.sort_by(|(la, a), (lb, b)| {
                let ya = state.block(a).map_or(0.0, |blk| blk.position.y);
                let yb = state.block(b).map_or(0.0, |blk| blk.position.y);
                ya.total_cmp(&yb).then_with(|| la.cmp(lb))
            });

            for (link_id, child) in candidates {
                if !state.contains_block(child) || !visited.insert(child) {
                    continue;
                }
                children
                    .entry(parent.to_string())
                    .or_default()
                    .push(TreeEdge {
                        link_id: link_id.to_string(),
                        child: child.to_string(),
                    });
                queue.push_back(child);
            }
        }

        Tree { children }
    }

    fn children_of(&self, id: &str) -> &[TreeEdge] {
        self.children.get(id).map(Vec::as_slice).unwrap_or(&[])
    }
}

struct Placer<'a> {
    tree: &'a Tree,
    heights: HashMap<String, f64>,
    out: &'a mut GraphState,
}

impl Placer<'_> {
    fn block_height(&self, id: &str) -> f64 {
        self.out
            .block(id)
            .map_or(0.0, |b| b.effective_size().height)
    }

    /// `max(own height, stacked children + gaps)`, memoized
    fn subtree_height(&mut self, id: &str) -> f64 {
        if let Some(h) = self.heights.get(id) {
            return *h;
        }
        let tree = self.tree;
        let edges = tree.children_of(id);
        let mut stacked = 0.0;
        for edge in edges {
            stacked += self.subtree_height(&edge.child);
        }
        if !edges.is_empty() {
            stacked += (edges.len() - 1) as f64 * VERTICAL_GAP;
        }
        let height = self.block_height(id).max(stacked);
        self.heights.insert(id.to_string(), height);
        height
    }

    fn stack_height(&mut self, edges: &[TreeEdge]) -> f64 {
        let mut total = 0.0;
        for edge in edges {
            total += self.subtree_height(&edge.child);
        }
        if !edges.is_empty() {
            total += (edges.len() - 1) as f64 * VERTICAL_GAP;
        }
        total
    }

    /// Stack `edges` vertically, centered on `center_y`, beside a parent spanning
    /// `[parent_left, parent_right]` horizontally
    fn place_children(
        &mut self,
        edges: &[TreeEdge],
        center_y: f64,
        parent_left: f64,
        parent_right: f64,
        side: Side,
    ) {
        if let [only] = edges {
            let height = self.subtree_height(&only.child);
            self.place_subtree(&only.child, center_y - height / 2.0, parent_left, parent_right, side);
            return;
        }

        let mut cursor = center_y - self.stack_height(edges) / 2.0;
        for edge in edges {
            let height = self.subtree_height(&edge.child);
            self.place_subtree(&edge.child, cursor, parent_left, parent_right, side);
            cursor += height + VERTICAL_GAP;
        }
    }

    fn place_subtree(
        &mut self,
        id: &str,
        slot_top: f64,
        parent_left: f64,
        parent_right: f64,
        side: Side,
    ) {
        let slot_height = self.subtree_height(id);
        let Some(size) = self.out.block(id).map(Block::effective_size) else {
            return;
        };

        let x = match side {
            Side::Left => parent_left - HORIZONTAL_SPACING - size.width,
            _ => parent_right + HORIZONTAL_SPACING,
        };
        let y = slot_top + (slot_height - size.height) / 2.0;

        if let Some(block) = self.out.blocks.get_mut(id) {
            block.position = Position::new(x, y);
        }

        let tree = self.tree;
        self.place_children(
            tree.children_of(id),
            y + size.height / 2.0,
            x,
            x + size.width,
            side,
        );
    }
}

/// Lay out every block reachable from the core block.
///
/// Blocks outside the core's tree keep their positions. Links along the tree are rewritten
/// so their handles match the side the child was placed on.
pub fn layout(state: &GraphState) -> GraphState {
    let mut out = state.clone();
    let Some(mut core) = out.core_block().cloned() else {
        return out;
    };
    core.pin_if_core();
    out.insert_block(core.clone());

    let tree = Tree::build(state, &core.id);
    let (left, right): (Vec<TreeEdge>, Vec<TreeEdge>) = tree
        .children_of(&core.id)
        .iter()
        .cloned()
        .partition(|edge| {
            state
                .link(&edge.link_id)
                .and_then(|l| l.source_side())
                == Some(Side::Left)
        });

    let size = core.effective_size();
    let center_y = core.position.y + size.height / 2.0;
    let core_left = core.position.x;
    let core_right = core.position.x + size.width;

    {
        let mut placer = Placer {
            tree: &tree,
            heights: HashMap::new(),
            out: &mut out,
        };
        placer.place_children(&left, center_y, core_left, core_right, Side::Left);
        placer.place_children(&right, center_y, core_left, core_right, Side::Right);
    }

    normalize_handles(&mut out, &tree, &left, Side::Left);
    normalize_handles(&mut out, &tree, &right, Side::Right);
    out
}

/// Rewrite link handles along a side of the tree to the realized side
fn normalize_handles(out: &mut GraphState, tree: &Tree, edges: &[TreeEdge], side: Side) {
    let mut stack: Vec<&TreeEdge> = edges.iter().collect();
    while let Some(edge) = stack.pop() {
        if let Some(link) = out.links.get_mut(&edge.link_id) {
            link.source_handle = Some(side.source_handle());
            link.target_handle = Some(side.opposite().target_handle());
        }
        stack.extend(tree.children_of(&edge.child));
    }
}
