use canvas_core::{
    apply_graph_mutation, layout, validate_connection, AccessContext, Block, CanvasError,
    ConnectionProposal, GraphState, LinkId, Mutation, Side,
};
use canvas_history::{StateId, TemporalState, TemporalTree};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use uuid::Uuid;

use crate::debounce::Debouncer;
use crate::doc::CanvasDoc;
use crate::error::SyncError;
use crate::presence::{Presence, PresenceRegistry};
use crate::protocol::{ControlMessage, Frame};
use crate::replica::LocalReplica;
use crate::throttle::{Throttle, DEFAULT_AWARENESS_INTERVAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    /// Connected, waiting for the peer's answer to our state vector
    Syncing,
    Synced,
}

/// One client's view of a project: the live document, its local replica, collaborators'
/// presence and the project history.
///
/// Local edits apply synchronously to the document, are appended to the replica and are
/// sent over the transport, or queued while disconnected and flushed on reconnect.
pub struct CanvasSession {
    doc: CanvasDoc,
    replica: Option<LocalReplica>,
    history: TemporalTree,
    presence: PresenceRegistry,
    awareness_throttle: Throttle<String>,
    /// Newest presence held back by the throttle
    awareness_trailing: Debouncer,
    user_id: Option<String>,
    project_owner_id: String,
    status: ConnectionStatus,
    transport: Option<UnboundedSender<Frame>>,
    outbox: Vec<Vec<u8>>,
    preview: Option<(StateId, GraphState)>,
}

impl CanvasSession {
    pub fn new(
        project_id: impl Into<String>,
        user_id: Option<String>,
        project_owner_id: impl Into<String>,
    ) -> Self {
        Self {
            doc: CanvasDoc::new(),
            replica: None,
            history: TemporalTree::new(project_id),
            presence: PresenceRegistry::new(),
            awareness_throttle: Throttle::new(DEFAULT_AWARENESS_INTERVAL),
            awareness_trailing: Debouncer::new(DEFAULT_AWARENESS_INTERVAL),
            user_id,
            project_owner_id: project_owner_id.into(),
            status: ConnectionStatus::Disconnected,
            transport: None,
            outbox: Vec::new(),
            preview: None,
        }
    }

    pub fn with_replica(mut self, replica: LocalReplica) -> Self {
        self.replica = Some(replica);
        self
    }

    pub fn with_history(mut self, history: TemporalTree) -> Self {
        self.history = history;
        self
    }

    /// Load the local replica, if any. No network involved.
    pub async fn open(&mut self) -> Result<usize, SyncError> {
        match &self.replica {
            Some(replica) => replica.load_into(&self.doc).await,
            None => Ok(0),
        }
    }

    pub fn doc(&self) -> &CanvasDoc {
        &self.doc
    }

    pub fn history(&self) -> &TemporalTree {
        &self.history
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Updates produced while disconnected, waiting for the next connection
    pub fn pending_updates(&self) -> usize {
        self.outbox.len()
    }

    pub fn access(&self) -> AccessContext<'_> {
        AccessContext::new(self.user_id.as_deref(), &self.project_owner_id)
    }

    fn authorize(&self, graph: &GraphState, mutation: &Mutation) -> Result<(), CanvasError> {
        self.access().ensure_can_apply(graph, mutation)
    }

    /// What the canvas should render: the previewed state, or the live graph
    pub fn view(&self) -> GraphState {
        match &self.preview {
            Some((_, graph)) => graph.clone(),
            None => self.doc.graph(),
        }
    }

    pub fn previewing(&self) -> Option<&str> {
        self.preview.as_ref().map(|(id, _)| id.as_str())
    }

    pub async fn apply(&mut self, mutation: &Mutation) -> Result<(), SyncError> {
        self.authorize(&self.doc.graph(), mutation)?;
        let update = self.doc.apply_mutation(mutation);
        self.commit(update).await
    }

    pub async fn edit_text(
        &mut self,
        block_id: &str,
        index: u32,
        delete: u32,
        insert: &str,
    ) -> Result<(), SyncError> {
        let block = self
            .doc
            .block(block_id)
            .ok_or_else(|| SyncError::BlockNotFound(block_id.to_string()))?;
        self.access().ensure_can_edit(&block)?;
        let update = self.doc.edit_text(block_id, index, delete, insert)?;
        self.commit(update).await
    }

    /// Create `block` connected to `source` through the connector on `side`, then re-run
    /// the layout. Returns the new link's id.
    pub async fn add_connected_block(
        &mut self,
        source: &str,
        side: Side,
        block: Block,
    ) -> Result<LinkId, SyncError> {
        let live = self.doc.graph();
        let create = Mutation::BlockCreate { block };
        self.authorize(&live, &create)?;

        let target = create.block_id().unwrap_or_default().to_string();
        let staged = apply_graph_mutation(live, &create);
        let proposal = ConnectionProposal {
            source: source.to_string(),
            target,
            source_handle: Some(side.source_handle()),
            target_handle: Some(side.opposite().target_handle()),
        };
        let link_id = Uuid::new_v4().to_string();
        let edge = validate_connection(&staged, &proposal, link_id.clone())?;
        let arranged = layout(&apply_graph_mutation(staged, &edge));

        let update = self.doc.replace_graph(&arranged);
        self.commit(update).await?;
        Ok(link_id)
    }

    async fn commit(&mut self, update: Vec<u8>) -> Result<(), SyncError> {
        if let Some(replica) = &self.replica {
            replica.append(&update).await?;
        }
        if self.status == ConnectionStatus::Disconnected {
            self.outbox.push(update);
            return Ok(());
        }
        if let Err(update) = self.send(Frame::Update(update)) {
            if let Frame::Update(bytes) = update {
                self.outbox.push(bytes);
            }
        }
        Ok(())
    }

    fn send(&mut self, frame: Frame) -> Result<(), Frame> {
        let Some(transport) = &self.transport else {
            return Err(frame);
        };
        match transport.send(frame) {
            Ok(()) => Ok(()),
            Err(returned) => {
                tracing::debug!("transport closed, going offline");
                self.disconnect();
                Err(returned.0)
            }
        }
    }

    /// Attach a transport: announce our state vector and flush queued updates
    pub fn connect(&mut self, transport: UnboundedSender<Frame>) {
        self.transport = Some(transport);
        self.status = ConnectionStatus::Syncing;

        let request = Frame::Control(ControlMessage::SyncRequest {
            state_vector: self.doc.state_vector(),
        });
        if self.send(request).is_err() {
            return;
        }

        let queued = std::mem::take(&mut self.outbox);
        tracing::debug!(queued = queued.len(), "flushing offline updates");
        let mut queued = queued.into_iter();
        while let Some(update) = queued.next() {
            if let Err(Frame::Update(bytes)) = self.send(Frame::Update(update)) {
                self.outbox.push(bytes);
                self.outbox.extend(queued);
                break;
            }
        }
    }

    /// Drop the transport. Collaborators' presence goes with it.
    pub fn disconnect(&mut self) {
        self.transport = None;
        self.status = ConnectionStatus::Disconnected;
        self.awareness_trailing.cancel();
        self.presence.clear();
    }

    /// Handle a frame from the relay
    pub async fn receive(&mut self, frame: Frame) -> Result<(), SyncError> {
        match frame {
            Frame::Update(update) => {
                self.doc.apply_update(&update)?;
                if let Some(replica) = &self.replica {
                    replica.append(&update).await?;
                }
                if self.status == ConnectionStatus::Syncing {
                    self.status = ConnectionStatus::Synced;
                }
            }
            Frame::Control(ControlMessage::SyncRequest { state_vector }) => {
                let diff = self.doc.diff_since(&state_vector)?;
                let _ = self.send(Frame::Update(diff));
            }
            Frame::Control(ControlMessage::Awareness(presence)) => {
                self.presence.upsert(presence);
            }
            Frame::Control(ControlMessage::PresenceRemoved { id }) => {
                self.presence.remove(&id);
            }
        }
        Ok(())
    }

    /// Publish our own presence, at most once per throttle interval. A presence arriving
    /// inside the interval replaces any held one and goes out when the interval ends, so the
    /// last cursor position always reaches peers. Returns false while disconnected.
    pub fn set_presence(&mut self, presence: Presence) -> bool {
        if self.status == ConnectionStatus::Disconnected {
            return false;
        }
        if self.awareness_throttle.allow(presence.id.clone()) {
            self.awareness_trailing.cancel();
            return self
                .send(Frame::Control(ControlMessage::Awareness(presence)))
                .is_ok();
        }
        let Some(transport) = self.transport.clone() else {
            return false;
        };
        self.awareness_trailing.schedule(async move {
            let _ = transport.send(Frame::Control(ControlMessage::Awareness(presence)));
        });
        true
    }

    /// Record the live graph in history. `None` or a blank intent is an autosave.
    pub fn save(&mut self, intent: Option<&str>) -> Result<TemporalState, SyncError> {
        let live = self.doc.graph();
        Ok(self.history.save(&live, self.user_id.as_deref(), intent)?)
    }

    /// Show a past state without touching the live document
    pub fn preview(&mut self, id: &str) -> Result<&GraphState, SyncError> {
        let graph = self.history.preview(id)?;
        let (_, graph) = self.preview.insert((id.to_string(), graph));
        Ok(graph)
    }

    pub fn return_to_present(&mut self) -> GraphState {
        self.preview = None;
        self.doc.graph()
    }

    /// Make a past state the present for everyone. Needs the local replica loaded and the
    /// project owner's rights.
    pub async fn checkout(&mut self, id: &str) -> Result<GraphState, SyncError> {
        if let Some(replica) = &self.replica {
            if !replica.is_synced() {
                return Err(SyncError::NotSynced);
            }
        }
        let access = AccessContext::new(self.user_id.as_deref(), &self.project_owner_id);
        let graph = self.history.apply(id, &access)?;

        let update = self.doc.replace_graph(&graph);
        self.preview = None;
        self.commit(update).await?;
        Ok(graph)
    }
}

impl std::fmt::Debug for CanvasSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CanvasSession")
            .field("status", &self.status)
            .field("pending_updates", &self.outbox.len())
            .field("previewing", &self.previewing())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::{BlockType, Position};
    use canvas_history::HistoryError;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn owner_session() -> CanvasSession {
        CanvasSession::new("p1", Some("carol".into()), "carol")
    }

    async fn with_core(session: &mut CanvasSession) {
        session
            .apply(&Mutation::BlockCreate {
                block: Block::core("core").with_owner("carol"),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_preview_and_return_to_present() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            owner_session().with_replica(LocalReplica::new(dir.path().join("p1.log")));
        session.open().await.unwrap();
        with_core(&mut session).await;

        let x = Block::new("x", BlockType::Text, Position::default());
        session
            .add_connected_block("core", Side::Right, x)
            .await
            .unwrap();
        let placed = session.view().block("x").unwrap().position;
        assert!(placed.x > 0.0);

        let v1 = session.save(Some("v1")).unwrap();
        let dragged = Position::new(900.0, 900.0);
        session
            .apply(&Mutation::BlockMove {
                id: "x".into(),
                position: dragged,
            })
            .await
            .unwrap();
        let autosave = session.save(None).unwrap();
        assert_eq!(autosave.intent, "autosave");

        let preview = session.preview(&v1.id).unwrap();
        assert_eq!(preview.block("x").unwrap().position, placed);
        assert_eq!(session.view().block("x").unwrap().position, placed);
        assert_eq!(session.doc().block("x").unwrap().position, dragged);
        assert_eq!(session.history().current_state_id(), Some(autosave.id.as_str()));

        let present = session.return_to_present();
        assert_eq!(present.block("x").unwrap().position, dragged);
        assert_eq!(session.previewing(), None);
    }

    #[tokio::test]
    async fn test_offline_edits_flush_on_connect() {
        let mut session = owner_session();
        with_core(&mut session).await;
        session
            .apply(&Mutation::BlockCreate {
                block: Block::new("a", BlockType::Text, Position::default()),
            })
            .await
            .unwrap();
        assert_eq!(session.pending_updates(), 2);

        let relay = CanvasDoc::with_client_id(99);
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.connect(tx);
        assert_eq!(session.status(), ConnectionStatus::Syncing);
        assert_eq!(session.pending_updates(), 0);

        let mut client_vector = None;
        while let Ok(frame) = rx.try_recv() {
            match frame {
                Frame::Update(update) => relay.apply_update(&update).unwrap(),
                Frame::Control(ControlMessage::SyncRequest { state_vector }) => {
                    client_vector = Some(state_vector)
                }
                other => panic!("unexpected frame {:?}", other),
            }
        }
        assert_eq!(relay.graph(), session.doc().graph());

        let answer = relay.diff_since(&client_vector.unwrap()).unwrap();
        session.receive(Frame::Update(answer)).await.unwrap();
        assert_eq!(session.status(), ConnectionStatus::Synced);
    }

    #[tokio::test]
    async fn test_dropped_transport_requeues() {
        let mut session = owner_session();
        let (tx, rx) = mpsc::unbounded_channel();
        session.connect(tx);
        drop(rx);

        with_core(&mut session).await;
        assert_eq!(session.status(), ConnectionStatus::Disconnected);
        assert_eq!(session.pending_updates(), 1);
    }

    #[tokio::test]
    async fn test_presence_follows_connection() {
        let mut session = owner_session();
        assert!(!session.set_presence(Presence::new("me", "carol", "#000")));

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.connect(tx);
        assert!(session.set_presence(Presence::new("me", "carol", "#000")));
        assert!(session.set_presence(Presence::new("me", "carol", "#111")));

        session
            .receive(Frame::Control(ControlMessage::Awareness(Presence::new(
                "c2", "bob", "#0f0",
            ))))
            .await
            .unwrap();
        assert_eq!(session.presence().len(), 1);

        session
            .receive(Frame::Control(ControlMessage::PresenceRemoved { id: "c2".into() }))
            .await
            .unwrap();
        assert!(session.presence().is_empty());

        session
            .receive(Frame::Control(ControlMessage::Awareness(Presence::new(
                "c3", "eve", "#00f",
            ))))
            .await
            .unwrap();
        session.disconnect();
        assert!(session.presence().is_empty());

        let mut sent_awareness = 0;
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Control(ControlMessage::Awareness(_)) = frame {
                sent_awareness += 1;
            }
        }
        assert_eq!(sent_awareness, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_presence_is_delivered_after_throttle() {
        let mut session = owner_session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.connect(tx);

        let mut first = Presence::new("me", "carol", "#000");
        first.cursor = Some(Position::new(1.0, 1.0));
        let mut middle = first.clone();
        middle.cursor = Some(Position::new(250.0, 250.0));
        let mut last = first.clone();
        last.cursor = Some(Position::new(500.0, 500.0));

        assert!(session.set_presence(first));
        assert!(session.set_presence(middle));
        assert!(session.set_presence(last));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let mut cursors = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            if let Frame::Control(ControlMessage::Awareness(presence)) = frame {
                cursors.push(presence.cursor);
            }
        }
        assert_eq!(
            cursors,
            vec![
                Some(Position::new(1.0, 1.0)),
                Some(Position::new(500.0, 500.0))
            ]
        );
    }

    #[tokio::test]
    async fn test_access_is_enforced() {
        let mut anon = CanvasSession::new("p1", None, "carol");
        assert!(matches!(
            anon.apply(&Mutation::BlockCreate {
                block: Block::core("core")
            })
            .await,
            Err(SyncError::Canvas(CanvasError::ReadOnly(_)))
        ));

        let mut bob = CanvasSession::new("p1", Some("bob".into()), "carol");
        let mut locked = Block::new("n", BlockType::Text, Position::default()).with_owner("alice");
        locked.data.is_locked = true;
        bob.doc()
            .apply_mutation(&Mutation::BlockCreate { block: locked });
        assert!(matches!(
            bob.apply(&Mutation::BlockContent {
                id: "n".into(),
                content: "mine".into()
            })
            .await,
            Err(SyncError::Canvas(CanvasError::ReadOnly(_)))
        ));
        assert!(matches!(
            bob.edit_text("n", 0, 0, "!").await,
            Err(SyncError::Canvas(CanvasError::ReadOnly(_)))
        ));
    }

    #[tokio::test]
    async fn test_checkout_rules() {
        let dir = tempfile::tempdir().unwrap();
        let mut session =
            owner_session().with_replica(LocalReplica::new(dir.path().join("p1.log")));
        with_core(&mut session).await;
        let v1 = session.save(Some("v1")).unwrap();

        assert!(matches!(
            session.checkout(&v1.id).await,
            Err(SyncError::NotSynced)
        ));
        session.open().await.unwrap();

        session
            .apply(&Mutation::BlockCreate {
                block: Block::new("a", BlockType::Text, Position::default()),
            })
            .await
            .unwrap();
        session.save(None).unwrap();

        let restored = session.checkout(&v1.id).await.unwrap();
        assert!(restored.block("a").is_none());
        assert!(session.doc().block("a").is_none());
        assert_eq!(session.history().current_state_id(), Some(v1.id.as_str()));

        let history = session.history();
        let tree = TemporalTree::from_states("p1", history.states().cloned(), None);
        let mut viewer = CanvasSession::new("p1", Some("bob".into()), "carol").with_history(tree);
        assert!(matches!(
            viewer.checkout(&v1.id).await,
            Err(SyncError::History(HistoryError::Forbidden(_)))
        ));
    }
}
