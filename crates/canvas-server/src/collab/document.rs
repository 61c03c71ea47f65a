use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use canvas_core::{graph_from_rows, graph_to_rows, GraphState};
use canvas_sync::{CanvasDoc, ControlMessage, Debouncer, Frame, Presence, PresenceRegistry, SyncError};
use tokio::sync::{broadcast, Mutex, RwLock};

use crate::db::models::Project;
use crate::db::Database;
use crate::error::AppError;

/// Origin used for frames the server produces itself (history checkouts)
pub const SERVER_ORIGIN: &str = "server";

/// A frame fanned out to every connection of a project, tagged with the connection it
/// came from so that connection can skip it
#[derive(Debug, Clone)]
pub struct Outbound {
    pub origin: String,
    pub frame: Frame,
}

/// The live document of one project plus everything the relay tracks around it
pub struct ProjectDocument {
    pub project_id: String,
    pub owner_id: String,
    pub doc: CanvasDoc,
    updates: broadcast::Sender<Outbound>,
    presence: Mutex<PresenceRegistry>,
    checkpoint: Mutex<Debouncer>,
}

impl ProjectDocument {
    pub fn new(project_id: impl Into<String>, owner_id: impl Into<String>, checkpoint_delay: Duration) -> Self {
        let (updates, _) = broadcast::channel(256);
        Self {
            project_id: project_id.into(),
            owner_id: owner_id.into(),
            doc: CanvasDoc::new(),
            updates,
            presence: Mutex::new(PresenceRegistry::new()),
            checkpoint: Mutex::new(Debouncer::new(checkpoint_delay)),
        }
    }

    /// Rebuild from the stored update log, or seed from the relational rows when the
    /// project has never been opened live
    pub async fn load(
        project: &Project,
        db: &Database,
        checkpoint_delay: Duration,
    ) -> Result<Self, AppError> {
        let document = Self::new(project.id.clone(), project.owner_id.clone(), checkpoint_delay);

        let updates = db.get_crdt_updates(&project.id).await?;
        if updates.is_empty() {
            let (blocks, links) = db.load_graph_rows(&project.id).await?;
            let seed = document.doc.replace_graph(&graph_from_rows(&blocks, &links));
            db.store_crdt_update(&project.id, &seed).await?;
            tracing::info!(project = %project.id, blocks = blocks.len(), "seeded live document from rows");
        } else {
            let mut skipped = 0;
            for update in &updates {
                if let Err(e) = document.doc.apply_update(update) {
                    skipped += 1;
                    tracing::warn!(project = %project.id, error = %e, "skipping stored update");
                }
            }
            tracing::info!(project = %project.id, updates = updates.len(), skipped, "restored live document");
        }

        Ok(document)
    }

    pub fn graph(&self) -> GraphState {
        self.doc.graph()
    }

    /// Subscribe to updates
    pub fn subscribe(&self) -> broadcast::Receiver<Outbound> {
        self.updates.subscribe()
    }

    pub fn connections(&self) -> usize {
        self.updates.receiver_count()
    }

    fn broadcast(&self, origin: &str, frame: Frame) {
        // Ignore errors if no receivers
        let _ = self.updates.send(Outbound {
            origin: origin.to_string(),
            frame,
        });
    }

    /// Merge an update from a client and fan it out to the other connections
    pub fn apply_client_update(&self, origin: &str, update: Vec<u8>) -> Result<(), SyncError> {
        self.doc.apply_update(&update)?;
        self.broadcast(origin, Frame::Update(update));
        Ok(())
    }

    pub fn answer_sync_request(&self, state_vector: &[u8]) -> Result<Vec<u8>, SyncError> {
        self.doc.diff_since(state_vector)
    }

    /// Replace the live graph for everyone (history checkout). Returns the update.
    pub fn overwrite(&self, graph: &GraphState) -> Vec<u8> {
        let update = self.doc.replace_graph(graph);
        self.broadcast(SERVER_ORIGIN, Frame::Update(update.clone()));
        update
    }

    /// Record a connection's presence. The connection id always wins over the client's.
    pub async fn update_presence(&self, origin: &str, mut presence: Presence) {
        presence.id = origin.to_string();
        let changed = self.presence.lock().await.upsert(presence.clone());
        if changed {
            self.broadcast(origin, Frame::Control(ControlMessage::Awareness(presence)));
        }
    }

    pub async fn remove_presence(&self, origin: &str) {
        if self.presence.lock().await.remove(origin).is_some() {
            self.broadcast(
                origin,
                Frame::Control(ControlMessage::PresenceRemoved {
                    id: origin.to_string(),
                }),
            );
        }
    }

    /// Presence of everyone but `origin`, sent to a newly joined connection
    pub async fn presence_snapshot(&self, origin: &str) -> Vec<Presence> {
        self.presence
            .lock()
            .await
            .others(origin)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Write the live graph into relational rows and fold the stored update log into a
    /// single state row.
    ///
    /// Updates are applied to the document before they are stored, so every row up to the
    /// newest id read here is already part of the state encoded after it.
    pub async fn checkpoint(&self, db: &Database) -> Result<(), AppError> {
        let graph = self.graph();
        let (blocks, links) = graph_to_rows(&graph, &self.project_id, &self.owner_id)?;
        db.save_graph_rows(&self.project_id, &blocks, &links).await?;

        if let Some(upto) = db.latest_crdt_update_id(&self.project_id).await? {
            let state = self.doc.encode_state();
            let removed = db.compact_crdt_updates(&self.project_id, upto, &state).await?;
            tracing::debug!(project = %self.project_id, removed, "compacted update log");
        }
        tracing::debug!(project = %self.project_id, blocks = blocks.len(), links = links.len(), "checkpointed live document");
        Ok(())
    }

    /// Checkpoint now instead of waiting for the quiet window
    pub async fn flush(&self, db: &Database) -> Result<(), AppError> {
        self.checkpoint.lock().await.cancel();
        self.checkpoint(db).await
    }

    /// Checkpoint once edits have been quiet for the configured window
    pub async fn schedule_checkpoint(self: &Arc<Self>, db: Database) {
        let document = Arc::clone(self);
        self.checkpoint.lock().await.schedule(async move {
            if let Err(e) = document.checkpoint(&db).await {
                tracing::error!(project = %document.project_id, error = %e, "checkpoint failed");
            }
        });
    }
}

/// Store for managing multiple live project documents
pub struct DocumentStore {
    documents: RwLock<HashMap<String, Arc<ProjectDocument>>>,
    checkpoint_delay: Duration,
}

impl DocumentStore {
    pub fn new(checkpoint_delay: Duration) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            checkpoint_delay,
        }
    }

    /// The live document, if the project is open
    pub async fn get(&self, project_id: &str) -> Option<Arc<ProjectDocument>> {
        self.documents.read().await.get(project_id).cloned()
    }

    /// Get or load the live document for a project
    pub async fn get_or_load(
        &self,
        project: &Project,
        db: &Database,
    ) -> Result<Arc<ProjectDocument>, AppError> {
        if let Some(doc) = self.get(&project.id).await {
            return Ok(doc);
        }

        let mut docs = self.documents.write().await;
        // Double-check after acquiring write lock
        if let Some(doc) = docs.get(&project.id) {
            return Ok(Arc::clone(doc));
        }

        let doc = Arc::new(ProjectDocument::load(project, db, self.checkpoint_delay).await?);
        docs.insert(project.id.clone(), Arc::clone(&doc));
        Ok(doc)
    }

    /// Get or load a project's document and subscribe to it while the store is locked, so
    /// an idle document cannot be evicted between the two
    pub async fn join(
        &self,
        project: &Project,
        db: &Database,
    ) -> Result<(Arc<ProjectDocument>, broadcast::Receiver<Outbound>), AppError> {
        if let Some(doc) = self.documents.read().await.get(&project.id) {
            return Ok((Arc::clone(doc), doc.subscribe()));
        }

        let mut docs = self.documents.write().await;
        let doc = match docs.get(&project.id) {
            Some(doc) => Arc::clone(doc),
            None => {
                let doc = Arc::new(ProjectDocument::load(project, db, self.checkpoint_delay).await?);
                docs.insert(project.id.clone(), Arc::clone(&doc));
                doc
            }
        };
        let updates = doc.subscribe();
        Ok((doc, updates))
    }

    /// Checkpoint and drop a document nobody is connected to. A document whose checkpoint
    /// fails stays loaded. Returns true if it was evicted.
    pub async fn release(&self, project_id: &str, db: &Database) -> bool {
        let Some(doc) = self.get(project_id).await else {
            return false;
        };
        if doc.connections() > 0 {
            return false;
        }
        if let Err(e) = doc.flush(db).await {
            tracing::error!(project = %project_id, error = %e, "keeping idle document, checkpoint failed");
            return false;
        }
        let evicted = self.evict_if_idle(project_id).await.is_some();
        if evicted {
            tracing::debug!(project = %project_id, "evicted idle document");
        }
        evicted
    }

    /// Remove the document if it has no connections
    pub(crate) async fn evict_if_idle(&self, project_id: &str) -> Option<Arc<ProjectDocument>> {
        let mut docs = self.documents.write().await;
        match docs.get(project_id) {
            Some(doc) if doc.connections() == 0 => docs.remove(project_id),
            _ => None,
        }
    }

    pub async fn insert(&self, document: ProjectDocument) -> Arc<ProjectDocument> {
        let doc = Arc::new(document);
        self.documents
            .write()
            .await
            .insert(doc.project_id.clone(), Arc::clone(&doc));
        doc
    }

    /// Remove a document from the store
    pub async fn remove(&self, project_id: &str) -> Option<Arc<ProjectDocument>> {
        self.documents.write().await.remove(project_id)
    }

    /// Get document count
    pub async fn count(&self) -> usize {
        self.documents.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canvas_core::{Block, BlockType, Mutation, Position};

    fn document() -> ProjectDocument {
        ProjectDocument::new("p1", "carol", Duration::from_millis(1000))
    }

    #[tokio::test]
    async fn test_client_update_fans_out() {
        let hub = document();
        let mut rx = hub.subscribe();

        let client = CanvasDoc::with_client_id(7);
        let update = client.apply_mutation(&Mutation::BlockCreate {
            block: Block::core("core"),
        });
        hub.apply_client_update("conn-a", update.clone()).unwrap();

        let outbound = rx.recv().await.unwrap();
        assert_eq!(outbound.origin, "conn-a");
        assert_eq!(outbound.frame, Frame::Update(update));
        assert!(hub.graph().core_block().is_some());
    }

    #[tokio::test]
    async fn test_sync_request_returns_missing_state() {
        let hub = document();
        hub.overwrite(&GraphState::from_parts(
            vec![
                Block::core("core"),
                Block::new("a", BlockType::Text, Position::default()),
            ],
            vec![],
        ));

        let client = CanvasDoc::with_client_id(8);
        let diff = hub.answer_sync_request(&client.state_vector()).unwrap();
        client.apply_update(&diff).unwrap();
        assert_eq!(client.graph(), hub.graph());
        assert!(hub.answer_sync_request(&[0xff]).is_err());
    }

    #[tokio::test]
    async fn test_presence_lifecycle() {
        let hub = document();
        let mut rx = hub.subscribe();

        hub.update_presence("conn-a", Presence::new("spoofed", "alice", "#f00"))
            .await;
        hub.update_presence("conn-a", Presence::new("spoofed", "alice", "#f00"))
            .await;
        let snapshot = hub.presence_snapshot("conn-b").await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].id, "conn-a");
        assert!(hub.presence_snapshot("conn-a").await.is_empty());

        hub.remove_presence("conn-a").await;
        hub.remove_presence("conn-a").await;

        let first = rx.recv().await.unwrap();
        assert!(matches!(first.frame, Frame::Control(ControlMessage::Awareness(_))));
        let second = rx.recv().await.unwrap();
        assert_eq!(
            second.frame,
            Frame::Control(ControlMessage::PresenceRemoved {
                id: "conn-a".into()
            })
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_store_keeps_one_document_per_project() {
        let store = DocumentStore::new(Duration::from_millis(1000));
        assert!(store.get("p1").await.is_none());
        let inserted = store.insert(document()).await;
        let found = store.get("p1").await.unwrap();
        assert!(Arc::ptr_eq(&inserted, &found));
        assert_eq!(store.count().await, 1);
        store.remove("p1").await;
        assert_eq!(store.count().await, 0);
    }

    #[tokio::test]
    async fn test_only_idle_documents_are_evicted() {
        let store = DocumentStore::new(Duration::from_millis(1000));
        let doc = store.insert(document()).await;
        let connection = doc.subscribe();

        assert!(store.evict_if_idle("p1").await.is_none());
        assert_eq!(store.count().await, 1);

        drop(connection);
        let evicted = store.evict_if_idle("p1").await.unwrap();
        assert!(Arc::ptr_eq(&evicted, &doc));
        assert_eq!(store.count().await, 0);
        assert!(store.evict_if_idle("p1").await.is_none());
    }
}
