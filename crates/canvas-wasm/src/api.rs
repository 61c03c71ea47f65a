use canvas_core::{
    apply_all, apply_graph_mutation, graph_from_rows, graph_to_rows, layout,
    prepare_block_for_db, prepare_link_for_db, transform_block, transform_link,
    validate_connection, AccessContext, Block, BlockRow, CanvasError, ConnectionProposal,
    GraphState, Link, LinkRow, Mutation, Side,
};
use canvas_history::{diff_graphs, HistoryError, StateId, TemporalState, TemporalTree};
use serde::{Deserialize, Serialize};
use wasm_bindgen::prelude::*;

/// Canvas engine exposed to JavaScript: the local graph, its history tree and the viewer
#[wasm_bindgen]
pub struct CanvasEngine {
    graph: GraphState,
    history: TemporalTree,
    owner_id: String,
    user_id: Option<String>,
    /// Historical state shown instead of the live graph
    preview: Option<(StateId, GraphState)>,
}

/// Structured error object for JavaScript
#[derive(Debug, Serialize)]
pub struct JsCanvasError {
    code: String,
    message: String,
}

impl From<CanvasError> for JsCanvasError {
    fn from(err: CanvasError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<HistoryError> for JsCanvasError {
    fn from(err: HistoryError) -> Self {
        Self {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for JsCanvasError {
    fn from(err: serde_json::Error) -> Self {
        Self {
            code: "INVALID_JSON".to_string(),
            message: err.to_string(),
        }
    }
}

impl JsCanvasError {
    fn to_json(&self) -> String {
        serde_json::json!({ "error": self.code, "message": self.message }).to_string()
    }
}

fn to_js_error(err: impl Into<JsCanvasError>) -> JsValue {
    let js_error: JsCanvasError = err.into();
    serde_wasm_bindgen::to_value(&js_error).unwrap_or(JsValue::NULL)
}

/// Serialize a result for JavaScript: the value itself, or `{"error": code, "message": ...}`
fn respond<T: Serialize>(result: Result<T, JsCanvasError>) -> String {
    match result.and_then(|value| serde_json::to_string(&value).map_err(JsCanvasError::from)) {
        Ok(json) => json,
        Err(err) => err.to_json(),
    }
}

fn console_warn(message: &str) {
    #[cfg(target_arch = "wasm32")]
    web_sys::console::warn_1(&message.into());
    #[cfg(not(target_arch = "wasm32"))]
    let _ = message;
}

fn parse_mutation(mutation_json: &str) -> Result<Mutation, JsCanvasError> {
    let mutation: Mutation = serde_json::from_str(mutation_json)?;
    if let Mutation::Unknown { kind } = &mutation {
        console_warn(&format!("[Canvas] ignoring mutation of unknown type '{}'", kind));
    }
    Ok(mutation)
}

/// Rows in, rows out
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphRows {
    #[serde(default)]
    pub blocks: Vec<BlockRow>,
    #[serde(default)]
    pub links: Vec<LinkRow>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConnectedBlock {
    block_id: String,
    link_id: String,
}

#[wasm_bindgen]
impl CanvasEngine {
    /// Create an engine for one project. `user_id` is `None` for anonymous viewers.
    #[wasm_bindgen(constructor)]
    pub fn new(project_id: &str, owner_id: &str, user_id: Option<String>) -> Self {
        Self {
            graph: GraphState::new(),
            history: TemporalTree::new(project_id),
            owner_id: owner_id.to_string(),
            user_id,
            preview: None,
        }
    }

    fn access(&self) -> AccessContext<'_> {
        AccessContext::new(self.user_id.as_deref(), &self.owner_id)
    }

    /// What should be rendered: the previewed state, or the live graph
    fn view(&self) -> &GraphState {
        match &self.preview {
            Some((_, graph)) => graph,
            None => &self.graph,
        }
    }

    // --- Loading ---

    /// Replace the live graph with `{"blocks": [...], "links": [...]}`
    #[wasm_bindgen(js_name = loadGraph)]
    pub fn load_graph(&mut self, graph_json: &str) -> String {
        let graph: GraphState = match serde_json::from_str(graph_json) {
            Ok(graph) => graph,
            Err(e) => return JsCanvasError::from(e).to_json(),
        };
        // Re-pin the core block and drop dangling links
        self.graph = GraphState::from_parts(graph.blocks.into_values(), graph.links.into_values());
        respond(Ok(&self.graph))
    }

    /// Replace the live graph with persisted rows
    #[wasm_bindgen(js_name = loadRows)]
    pub fn load_rows(&mut self, rows_json: &str) -> String {
        let rows: GraphRows = match serde_json::from_str(rows_json) {
            Ok(rows) => rows,
            Err(e) => return JsCanvasError::from(e).to_json(),
        };
        let graph = graph_from_rows(&rows.blocks, &rows.links);
        let dropped = rows.links.len() - graph.links.len();
        if dropped > 0 {
            console_warn(&format!("[Canvas] dropped {} link(s) with missing endpoints", dropped));
        }
        self.graph = graph;
        respond(Ok(&self.graph))
    }

    /// Replace the history tree with persisted states
    #[wasm_bindgen(js_name = loadHistory)]
    pub fn load_history(&mut self, states_json: &str, current_state_id: Option<String>) -> String {
        let states: Vec<TemporalState> = match serde_json::from_str(states_json) {
            Ok(states) => states,
            Err(e) => return JsCanvasError::from(e).to_json(),
        };
        self.history = TemporalTree::from_states(
            self.history.project_id().to_string(),
            states,
            current_state_id,
        );
        self.preview = None;
        respond(Ok(self.history.history()))
    }

    // --- Graph ---

    /// The rendered graph as JSON
    #[wasm_bindgen(js_name = getGraph)]
    pub fn get_graph(&self) -> String {
        serde_json::to_string(self.view()).unwrap_or_else(|_| "{}".to_string())
    }

    /// Flatten the live graph into rows for a full project write
    #[wasm_bindgen(js_name = toRows)]
    pub fn to_rows(&self) -> String {
        let owner = self.user_id.as_deref().unwrap_or(&self.owner_id);
        respond(
            graph_to_rows(&self.graph, self.history.project_id(), owner)
                .map(|(blocks, links)| GraphRows { blocks, links })
                .map_err(JsCanvasError::from),
        )
    }

    /// Apply one `{type, payload}` mutation to the live graph
    #[wasm_bindgen(js_name = applyMutation)]
    pub fn apply_mutation(&mut self, mutation_json: &str) -> String {
        respond(self.try_apply(mutation_json))
    }

    fn try_apply(&mut self, mutation_json: &str) -> Result<&GraphState, JsCanvasError> {
        let mutation = parse_mutation(mutation_json)?;
        self.access().ensure_can_apply(&self.graph, &mutation)?;
        self.graph = apply_graph_mutation(std::mem::take(&mut self.graph), &mutation);
        Ok(&self.graph)
    }

    /// Validate a dragged connection and add it. Returns the created link.
    #[wasm_bindgen]
    pub fn connect(&mut self, proposal_json: &str, link_id: &str) -> String {
        respond(self.try_connect(proposal_json, link_id))
    }

    fn try_connect(&mut self, proposal_json: &str, link_id: &str) -> Result<Link, JsCanvasError> {
        if self.user_id.is_none() {
            return Err(CanvasError::ReadOnly("canvas".to_string()).into());
        }
        let proposal: ConnectionProposal = serde_json::from_str(proposal_json)?;
        let edge = validate_connection(&self.graph, &proposal, link_id)?;
        self.graph = apply_graph_mutation(std::mem::take(&mut self.graph), &edge);
        self.graph
            .link(link_id)
            .cloned()
            .ok_or_else(|| CanvasError::MissingEndpoint(link_id.to_string()).into())
    }

    /// Create a block beside `source` on `side`, link it and re-run the layout
    #[wasm_bindgen(js_name = addConnectedBlock)]
    pub fn add_connected_block(&mut self, source: &str, side: &str, block_json: &str) -> String {
        respond(self.try_add_connected(source, side, block_json))
    }

    fn try_add_connected(
        &mut self,
        source: &str,
        side: &str,
        block_json: &str,
    ) -> Result<ConnectedBlock, JsCanvasError> {
        let side = Side::from_handle(side).ok_or_else(|| JsCanvasError {
            code: "INVALID_SIDE".to_string(),
            message: format!("unknown connector side: {}", side),
        })?;
        let mut block: Block = serde_json::from_str(block_json)?;
        if block.id.trim().is_empty() {
            block.id = uuid::Uuid::new_v4().to_string();
        }
        if block.owner_id().is_none() {
            if let Some(user) = &self.user_id {
                block.data.owner_id = Some(user.clone());
            }
        }

        let create = Mutation::BlockCreate { block };
        self.access().ensure_can_apply(&self.graph, &create)?;
        let block_id = create.block_id().unwrap_or_default().to_string();
        let staged = apply_graph_mutation(self.graph.clone(), &create);

        let proposal = ConnectionProposal {
            source: source.to_string(),
            target: block_id.clone(),
            source_handle: Some(side.source_handle()),
            target_handle: Some(side.opposite().target_handle()),
        };
        let link_id = uuid::Uuid::new_v4().to_string();
        let edge = validate_connection(&staged, &proposal, link_id.clone())?;
        self.graph = layout(&apply_graph_mutation(staged, &edge));
        Ok(ConnectedBlock { block_id, link_id })
    }

    /// Re-run the mind-map layout over the live graph
    #[wasm_bindgen]
    pub fn arrange(&mut self) -> String {
        self.graph = layout(&self.graph);
        respond(Ok(&self.graph))
    }

    #[wasm_bindgen(js_name = isReadOnly)]
    pub fn is_read_only(&self, block_id: &str) -> bool {
        match self.view().block(block_id) {
            Some(block) => self.preview.is_some() || self.access().is_read_only(block),
            None => true,
        }
    }

    #[wasm_bindgen(js_name = canToggleLock)]
    pub fn can_toggle_lock(&self, block_id: &str) -> bool {
        self.graph
            .block(block_id)
            .is_some_and(|block| self.access().can_toggle_lock(block))
    }

    /// Ids of every block the viewer cannot edit
    #[wasm_bindgen(js_name = readOnlyBlocks)]
    pub fn read_only_blocks(&self) -> js_sys::Array {
        let ids = js_sys::Array::new();
        for id in self.view().blocks.keys() {
            if self.is_read_only(id) {
                ids.push(&JsValue::from_str(id));
            }
        }
        ids
    }

    // --- History ---

    #[wasm_bindgen(js_name = canApplyHistory)]
    pub fn can_apply_history(&self) -> bool {
        self.access().can_apply_history()
    }

    /// Record the live graph. A blank intent is an autosave. Returns the full state for
    /// persisting.
    #[wasm_bindgen]
    pub fn save(&mut self, intent: Option<String>) -> String {
        let author = self.user_id.clone();
        respond(
            self.history
                .save(&self.graph, author.as_deref(), intent.as_deref())
                .map_err(JsCanvasError::from),
        )
    }

    /// History summaries in insertion order
    #[wasm_bindgen]
    pub fn history(&self) -> String {
        serde_json::to_string(&self.history.history()).unwrap_or_else(|_| "[]".to_string())
    }

    #[wasm_bindgen(js_name = currentStateId)]
    pub fn current_state_id(&self) -> Option<String> {
        self.history.current_state_id().map(str::to_string)
    }

    /// Show a historical state without touching the live graph
    #[wasm_bindgen]
    pub fn preview(&mut self, state_id: &str) -> String {
        respond(match self.history.preview(state_id) {
            Ok(graph) => {
                self.preview = Some((state_id.to_string(), graph));
                Ok(self.view())
            }
            Err(e) => Err(e.into()),
        })
    }

    #[wasm_bindgen(js_name = previewingStateId)]
    pub fn previewing_state_id(&self) -> Option<String> {
        self.preview.as_ref().map(|(id, _)| id.clone())
    }

    #[wasm_bindgen(js_name = returnToPresent)]
    pub fn return_to_present(&mut self) -> String {
        self.preview = None;
        self.get_graph()
    }

    /// Check out a state: it replaces the live graph. Owner only.
    #[wasm_bindgen(js_name = applyState)]
    pub fn apply_state(&mut self, state_id: &str) -> String {
        let access = AccessContext::new(self.user_id.as_deref(), &self.owner_id);
        respond(match self.history.apply(state_id, &access) {
            Ok(graph) => {
                self.graph = graph;
                self.preview = None;
                Ok(&self.graph)
            }
            Err(e) => Err(e.into()),
        })
    }

    #[wasm_bindgen(js_name = renameState)]
    pub fn rename_state(&mut self, state_id: &str, intent: &str) -> String {
        let current = self.current_state_id();
        respond(
            self.history
                .rename(state_id, intent)
                .map(|state| state.summary(current.as_deref()))
                .map_err(JsCanvasError::from),
        )
    }

    #[wasm_bindgen(js_name = pinState)]
    pub fn pin_state(&mut self, state_id: &str) -> String {
        let current = self.current_state_id();
        respond(
            self.history
                .pin(state_id)
                .map(|state| state.summary(current.as_deref()))
                .map_err(JsCanvasError::from),
        )
    }

    #[wasm_bindgen(js_name = deleteState)]
    pub fn delete_state(&mut self, state_id: &str) -> String {
        if self.previewing_state_id().as_deref() == Some(state_id) {
            self.preview = None;
        }
        respond(
            self.history
                .delete(state_id)
                .map(|state| state.summary(self.history.current_state_id()))
                .map_err(JsCanvasError::from),
        )
    }
}

// --- Stateless surface ---

/// Row from the `blocks` table to a graph block
#[wasm_bindgen(js_name = transformBlock)]
pub fn transform_block_json(row_json: &str) -> String {
    respond(
        serde_json::from_str::<BlockRow>(row_json)
            .map(|row| transform_block(&row))
            .map_err(JsCanvasError::from),
    )
}

#[wasm_bindgen(js_name = prepareBlockForDb)]
pub fn prepare_block_for_db_json(block_json: &str, project_id: &str, owner_id: &str) -> String {
    respond(
        serde_json::from_str::<Block>(block_json)
            .map_err(JsCanvasError::from)
            .and_then(|block| {
                prepare_block_for_db(&block, project_id, owner_id).map_err(JsCanvasError::from)
            }),
    )
}

#[wasm_bindgen(js_name = transformLink)]
pub fn transform_link_json(row_json: &str) -> String {
    respond(
        serde_json::from_str::<LinkRow>(row_json)
            .map(|row| transform_link(&row))
            .map_err(JsCanvasError::from),
    )
}

#[wasm_bindgen(js_name = prepareLinkForDb)]
pub fn prepare_link_for_db_json(link_json: &str, project_id: &str) -> String {
    respond(
        serde_json::from_str::<Link>(link_json)
            .map_err(JsCanvasError::from)
            .and_then(|link| prepare_link_for_db(&link, project_id).map_err(JsCanvasError::from)),
    )
}

/// Pure reducer: `(graph, mutation) -> graph`
#[wasm_bindgen(js_name = applyGraphMutation)]
pub fn apply_graph_mutation_json(graph_json: &str, mutation_json: &str) -> String {
    respond(reduce(graph_json, mutation_json))
}

fn reduce(graph_json: &str, mutation_json: &str) -> Result<GraphState, JsCanvasError> {
    let graph: GraphState = serde_json::from_str(graph_json)?;
    let mutation = parse_mutation(mutation_json)?;
    Ok(apply_graph_mutation(graph, &mutation))
}

/// Fold an ordered list of mutations
#[wasm_bindgen(js_name = applyMutations)]
pub fn apply_mutations_json(graph_json: &str, mutations_json: &str) -> String {
    respond(reduce_all(graph_json, mutations_json))
}

fn reduce_all(graph_json: &str, mutations_json: &str) -> Result<GraphState, JsCanvasError> {
    let graph: GraphState = serde_json::from_str(graph_json)?;
    let mutations: Vec<Mutation> = serde_json::from_str(mutations_json)?;
    Ok(apply_all(graph, &mutations))
}

#[wasm_bindgen(js_name = layoutGraph)]
pub fn layout_graph_json(graph_json: &str) -> String {
    respond(
        serde_json::from_str::<GraphState>(graph_json)
            .map(|graph| layout(&graph))
            .map_err(JsCanvasError::from),
    )
}

/// Returns the `edgeCreate` mutation for a valid connection
#[wasm_bindgen(js_name = validateConnection)]
pub fn validate_connection_json(graph_json: &str, proposal_json: &str, link_id: &str) -> String {
    respond(propose(graph_json, proposal_json, link_id))
}

fn propose(graph_json: &str, proposal_json: &str, link_id: &str) -> Result<Mutation, JsCanvasError> {
    let graph: GraphState = serde_json::from_str(graph_json)?;
    let proposal: ConnectionProposal = serde_json::from_str(proposal_json)?;
    Ok(validate_connection(&graph, &proposal, link_id)?)
}

/// Mutations turning `prev` into `next`
#[wasm_bindgen(js_name = diffGraphs)]
pub fn diff_graphs_json(prev_json: &str, next_json: &str) -> String {
    respond(diff(prev_json, next_json))
}

fn diff(prev_json: &str, next_json: &str) -> Result<Vec<Mutation>, JsCanvasError> {
    let prev: GraphState = serde_json::from_str(prev_json)?;
    let next: GraphState = serde_json::from_str(next_json)?;
    Ok(diff_graphs(&prev, &next))
}

/// Reconstruct one state from a list of persisted states
#[wasm_bindgen(js_name = replayHistory)]
pub fn replay_history_json(states_json: &str, state_id: &str) -> String {
    respond(replay(states_json, state_id))
}

fn replay(states_json: &str, state_id: &str) -> Result<GraphState, JsCanvasError> {
    let states: Vec<TemporalState> = serde_json::from_str(states_json)?;
    let project_id = states
        .first()
        .map(|s| s.project_id.clone())
        .unwrap_or_default();
    let mut tree = TemporalTree::from_states(project_id, states, None);
    Ok(tree.reconstruct(state_id)?)
}

#[wasm_bindgen(js_name = isBlockReadOnly)]
pub fn is_block_read_only(block_json: &str, user_id: Option<String>, owner_id: &str) -> bool {
    match serde_json::from_str::<Block>(block_json) {
        Ok(block) => AccessContext::new(user_id.as_deref(), owner_id).is_read_only(&block),
        Err(_) => true,
    }
}

/// Typed payload view of a block's metadata
#[wasm_bindgen(js_name = blockPayload)]
pub fn block_payload(block_json: &str) -> Result<JsValue, JsValue> {
    let block: Block = serde_json::from_str(block_json).map_err(to_js_error)?;
    serde_wasm_bindgen::to_value(&block.payload()).map_err(|e| {
        to_js_error(JsCanvasError {
            code: "SERIALIZATION".to_string(),
            message: e.to_string(),
        })
    })
}
