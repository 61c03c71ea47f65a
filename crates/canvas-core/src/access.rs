use crate::block::Block;
use crate::error::CanvasError;
use crate::graph::GraphState;
use crate::mutation::Mutation;

/// Who is looking at a project, used to gate edits.
///
/// `is_locked` is an application-level flag: it only decides what the UI and API layers
/// allow, it does not stop a CRDT update that does arrive from merging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessContext<'a> {
    /// `None` for anonymous/public viewers
    pub user_id: Option<&'a str>,
    pub project_owner_id: &'a str,
}

impl<'a> AccessContext<'a> {
    pub fn new(user_id: Option<&'a str>, project_owner_id: &'a str) -> Self {
        Self {
            user_id,
            project_owner_id,
        }
    }

    pub fn is_project_owner(&self) -> bool {
        self.user_id == Some(self.project_owner_id)
    }

    fn owns(&self, block: &Block) -> bool {
        self.user_id.is_some() && self.user_id == block.owner_id()
    }

    /// Read-only predicate consumed by every block renderer
    pub fn is_read_only(&self, block: &Block) -> bool {
        if self.user_id.is_none() {
            return true;
        }
        if self.is_project_owner() || self.owns(block) {
            return false;
        }
        block.data.is_locked
    }

    pub fn can_toggle_lock(&self, block: &Block) -> bool {
        self.is_project_owner() || self.owns(block)
    }

    pub fn can_delete(&self, block: &Block) -> bool {
        !block.is_core() && !self.is_read_only(block)
    }

    /// Checking out a historical state rewrites the live graph for everybody
    pub fn can_apply_history(&self) -> bool {
        self.is_project_owner()
    }

    pub fn ensure_can_edit(&self, block: &Block) -> Result<(), CanvasError> {
        if self.is_read_only(block) {
            Err(CanvasError::ReadOnly(block.id.clone()))
        } else {
            Ok(())
        }
    }

    pub fn ensure_can_delete(&self, block: &Block) -> Result<(), CanvasError> {
        if block.is_core() {
            return Err(CanvasError::CoreBlockImmutable("deleted"));
        }
        self.ensure_can_edit(block)
    }

    /// Check a single mutation against the block it targets. Anonymous viewers may not
    /// mutate anything; mutations on blocks that do not exist are left to the reducer.
    pub fn ensure_can_apply(
        &self,
        graph: &GraphState,
        mutation: &Mutation,
    ) -> Result<(), CanvasError> {
        if self.user_id.is_none() {
            let target = mutation.block_id().unwrap_or("canvas");
            return Err(CanvasError::ReadOnly(target.to_string()));
        }
        let Some(block) = mutation.block_id().and_then(|id| graph.block(id)) else {
            return Ok(());
        };
        match mutation {
            Mutation::BlockDelete { .. } => self.ensure_can_delete(block),
            Mutation::BlockCreate { block: next } | Mutation::BlockUpdate { block: next } => {
                self.ensure_can_change(block, next)
            }
            _ => self.ensure_can_edit(block),
        }
    }

    /// Replacing a block's value: the lock flag follows `can_toggle_lock` and only the
    /// project owner may hand a block to someone else
    pub fn ensure_can_change(&self, before: &Block, after: &Block) -> Result<(), CanvasError> {
        self.ensure_can_edit(before)?;
        if after.data.is_locked != before.data.is_locked && !self.can_toggle_lock(before) {
            return Err(CanvasError::ReadOnly(before.id.clone()));
        }
        if after.data.owner_id != before.data.owner_id && !self.is_project_owner() {
            return Err(CanvasError::ReadOnly(before.id.clone()));
        }
        Ok(())
    }

    /// Check a wholesale graph write: every block it changes or drops must be writable
    pub fn ensure_can_replace(
        &self,
        before: &GraphState,
        after: &GraphState,
    ) -> Result<(), CanvasError> {
        for (id, block) in &before.blocks {
            match after.blocks.get(id) {
                None => self.ensure_can_delete(block)?,
                Some(next) if next != block => self.ensure_can_change(block, next)?,
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockType, Position};

    fn locked_by(owner: &str) -> Block {
        let mut block = Block::new("b", BlockType::Text, Position::default()).with_owner(owner);
        block.data.is_locked = true;
        block
    }

    #[test]
    fn test_locked_block_is_read_only_for_others() {
        let block = locked_by("alice");
        let bob = AccessContext::new(Some("bob"), "carol");
        assert!(bob.is_read_only(&block));
        assert!(!bob.can_toggle_lock(&block));
        assert_eq!(
            bob.ensure_can_edit(&block),
            Err(CanvasError::ReadOnly("b".into()))
        );

        let alice = AccessContext::new(Some("alice"), "carol");
        assert!(!alice.is_read_only(&block));
        assert!(alice.can_toggle_lock(&block));
    }

    #[test]
    fn test_project_owner_overrides_lock() {
        let block = locked_by("alice");
        let carol = AccessContext::new(Some("carol"), "carol");
        assert!(!carol.is_read_only(&block));
        assert!(carol.can_delete(&block));
        assert!(carol.can_apply_history());
    }

    #[test]
    fn test_unlocked_block_is_editable_by_collaborators() {
        let block = Block::new("b", BlockType::Text, Position::default()).with_owner("alice");
        let bob = AccessContext::new(Some("bob"), "carol");
        assert!(!bob.is_read_only(&block));
        assert!(!bob.can_apply_history());
    }

    #[test]
    fn test_anonymous_viewers_are_read_only() {
        let block = Block::new("b", BlockType::Text, Position::default());
        let anon = AccessContext::new(None, "carol");
        assert!(anon.is_read_only(&block));
        assert!(!anon.can_toggle_lock(&block));
    }

    #[test]
    fn test_replace_respects_locks() {
        let before = GraphState::from_parts(
            vec![Block::core("core"), locked_by("alice")],
            vec![],
        );
        let bob = AccessContext::new(Some("bob"), "carol");

        let mut moved = before.clone();
        moved.blocks.get_mut("b").unwrap().position = Position::new(5.0, 5.0);
        assert_eq!(
            bob.ensure_can_replace(&before, &moved),
            Err(CanvasError::ReadOnly("b".into()))
        );

        let mut added = before.clone();
        added.insert_block(Block::new("c", BlockType::Text, Position::default()));
        assert_eq!(bob.ensure_can_replace(&before, &added), Ok(()));

        let mut without_core = before.clone();
        without_core.remove_block("core");
        let carol = AccessContext::new(Some("carol"), "carol");
        assert_eq!(
            carol.ensure_can_replace(&before, &without_core),
            Err(CanvasError::CoreBlockImmutable("deleted"))
        );
    }

    #[test]
    fn test_core_cannot_be_deleted() {
        let core = Block::core("core").with_owner("carol");
        let carol = AccessContext::new(Some("carol"), "carol");
        assert!(!carol.can_delete(&core));
        assert_eq!(
            carol.ensure_can_delete(&core),
            Err(CanvasError::CoreBlockImmutable("deleted"))
        );
    }

    #[test]
    fn test_mutations_are_checked_against_their_target() {
        let graph = GraphState::from_parts([locked_by("alice"), Block::core("core")], []);
        let bob = AccessContext::new(Some("bob"), "carol");
        let drag = Mutation::BlockMove {
            id: "b".into(),
            position: Position::new(1.0, 2.0),
        };
        assert_eq!(
            bob.ensure_can_apply(&graph, &drag),
            Err(CanvasError::ReadOnly("b".into()))
        );
        assert!(AccessContext::new(Some("alice"), "carol")
            .ensure_can_apply(&graph, &drag)
            .is_ok());

        let missing = Mutation::BlockDelete { id: "gone".into() };
        assert!(bob.ensure_can_apply(&graph, &missing).is_ok());
        assert_eq!(
            AccessContext::new(None, "carol").ensure_can_apply(&graph, &missing),
            Err(CanvasError::ReadOnly("gone".into()))
        );
        assert_eq!(
            AccessContext::new(Some("carol"), "carol")
                .ensure_can_apply(&graph, &Mutation::BlockDelete { id: "core".into() }),
            Err(CanvasError::CoreBlockImmutable("deleted"))
        );
    }

    #[test]
    fn test_collaborators_cannot_take_over_a_block() {
        let block = Block::new("b", BlockType::Text, Position::default()).with_owner("alice");
        let graph = GraphState::from_parts([block.clone(), Block::core("core")], []);
        let bob = AccessContext::new(Some("bob"), "carol");

        let mut edited = block.clone();
        edited.data.content = "hi".into();
        assert!(bob
            .ensure_can_apply(&graph, &Mutation::BlockUpdate { block: edited })
            .is_ok());

        let mut locked = block.clone();
        locked.data.is_locked = true;
        assert_eq!(
            bob.ensure_can_apply(&graph, &Mutation::BlockUpdate { block: locked.clone() }),
            Err(CanvasError::ReadOnly("b".into()))
        );

        let mut taken = block.clone().with_owner("bob");
        assert_eq!(
            bob.ensure_can_apply(&graph, &Mutation::BlockCreate { block: taken.clone() }),
            Err(CanvasError::ReadOnly("b".into()))
        );
        taken.data.owner_id = None;
        assert_eq!(
            bob.ensure_can_apply(&graph, &Mutation::BlockUpdate { block: taken }),
            Err(CanvasError::ReadOnly("b".into()))
        );

        let alice = AccessContext::new(Some("alice"), "carol");
        assert!(alice
            .ensure_can_apply(&graph, &Mutation::BlockUpdate { block: locked.clone() })
            .is_ok());
        let reassigned = block.clone().with_owner("bob");
        assert_eq!(
            alice.ensure_can_apply(&graph, &Mutation::BlockUpdate { block: reassigned.clone() }),
            Err(CanvasError::ReadOnly("b".into()))
        );
        assert!(AccessContext::new(Some("carol"), "carol")
            .ensure_can_apply(&graph, &Mutation::BlockUpdate { block: reassigned })
            .is_ok());

        let mut replaced = graph.clone();
        replaced.insert_block(locked);
        assert_eq!(
            bob.ensure_can_replace(&graph, &replaced),
            Err(CanvasError::ReadOnly("b".into()))
        );
    }
}
