use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    routing::{get, patch, post},
    Json, Router,
};
use canvas_core::{graph_to_rows, AccessContext, Block, GraphState, Link};
use canvas_history::TemporalSummary;
use serde::{Deserialize, Serialize};

use crate::api::{live_graph, load_history};
use crate::error::AppError;
use crate::identity::CurrentUser;
use crate::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporalQuery {
    pub action: Option<String>,
    pub state_id: Option<String>,
}

/// What a GET on the history endpoint asks for
#[derive(Debug, Clone, PartialEq)]
enum TemporalAction {
    History,
    Preview(String),
}

impl TemporalAction {
    fn parse(query: TemporalQuery) -> Result<Self, AppError> {
        match query.action.as_deref().unwrap_or("history") {
            "history" => Ok(TemporalAction::History),
            "preview" => query
                .state_id
                .filter(|id| !id.trim().is_empty())
                .map(TemporalAction::Preview)
                .ok_or_else(|| AppError::BadRequest("preview requires stateId".to_string())),
            other => Err(AppError::BadRequest(format!("Unknown action: {}", other))),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct SaveRequest {
    pub intent: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct UpdateStateRequest {
    pub intent: Option<String>,
    #[serde(default)]
    pub pinned: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub current_state_id: Option<String>,
    pub states: Vec<TemporalSummary>,
}

/// A reconstructed graph, either previewed or checked out
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StateGraphResponse {
    pub state_id: String,
    pub blocks: Vec<Block>,
    pub links: Vec<Link>,
}

impl StateGraphResponse {
    fn new(state_id: String, graph: GraphState) -> Self {
        Self {
            state_id,
            blocks: graph.blocks.into_values().collect(),
            links: graph.links.into_values().collect(),
        }
    }
}

/// `?action=history` lists summaries, `?action=preview&stateId=` reconstructs one state
/// without moving the present
async fn get_temporal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TemporalQuery>,
) -> Result<Json<serde_json::Value>, AppError> {
    let action = TemporalAction::parse(query)?;
    let project = state.db.require_project(&id).await?;
    let mut tree = load_history(&state, &project).await?;

    let body = match action {
        TemporalAction::History => serde_json::to_value(HistoryResponse {
            current_state_id: tree.current_state_id().map(str::to_string),
            states: tree.history(),
        })?,
        TemporalAction::Preview(state_id) => {
            let graph = tree.preview(&state_id)?;
            serde_json::to_value(StateGraphResponse::new(state_id, graph))?
        }
    };
    Ok(Json(body))
}

/// Record the live graph as a child of the present
async fn save_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SaveRequest>,
) -> Result<Json<TemporalSummary>, AppError> {
    let user = CurrentUser::require(&headers)?;
    let project = state.db.require_project(&id).await?;
    let live = live_graph(&state, &project).await?;

    let mut tree = load_history(&state, &project).await?;
    let saved = tree.save(&live, Some(&user.id), req.intent.as_deref())?;
    state.db.insert_temporal_state(&saved).await?;

    tracing::info!(project = %project.id, state = %saved.id, intent = %saved.intent, "saved history state");
    Ok(Json(saved.summary(tree.current_state_id())))
}

/// Check out a state: the live document is overwritten for every connected client
async fn apply_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, state_id)): Path<(String, String)>,
) -> Result<Json<StateGraphResponse>, AppError> {
    let user = CurrentUser::require(&headers)?;
    let project = state.db.require_project(&id).await?;

    let mut tree = load_history(&state, &project).await?;
    let access = AccessContext::new(Some(&user.id), &project.owner_id);
    let graph = tree.apply(&state_id, &access)?;

    let doc = state.docs.get_or_load(&project, &state.db).await?;
    let update = doc.overwrite(&graph);
    state.db.store_crdt_update(&project.id, &update).await?;

    let (blocks, links) = graph_to_rows(&graph, &project.id, &project.owner_id)?;
    state.db.save_graph_rows(&project.id, &blocks, &links).await?;
    state.db.set_current_state(&project.id, Some(&state_id)).await?;
    state.docs.release(&project.id, &state.db).await;

    Ok(Json(StateGraphResponse::new(state_id, graph)))
}

/// Rename and/or pin a state
async fn update_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, state_id)): Path<(String, String)>,
    Json(req): Json<UpdateStateRequest>,
) -> Result<Json<TemporalSummary>, AppError> {
    let user = CurrentUser::require(&headers)?;
    if req.intent.is_none() && !req.pinned {
        return Err(AppError::BadRequest("Nothing to update".to_string()));
    }
    let project = state.db.require_project(&id).await?;
    let mut tree = load_history(&state, &project).await?;

    let author = tree.get(&state_id).and_then(|s| s.author_id.clone());
    let access = AccessContext::new(Some(&user.id), &project.owner_id);
    if !access.is_project_owner() && author.as_deref() != Some(user.id.as_str()) {
        return Err(AppError::Forbidden(
            "Only the project owner or the author can change a history state".to_string(),
        ));
    }

    if let Some(intent) = &req.intent {
        tree.rename(&state_id, intent)?;
    }
    let updated = if req.pinned {
        tree.pin(&state_id)?.clone()
    } else {
        tree.get(&state_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("History state {} not found", state_id)))?
    };
    state.db.update_temporal_label(&updated).await?;

    Ok(Json(updated.summary(tree.current_state_id())))
}

/// Delete a leaf state; owner only
async fn delete_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((id, state_id)): Path<(String, String)>,
) -> Result<Json<HistoryResponse>, AppError> {
    let user = CurrentUser::require(&headers)?;
    let project = state.db.require_project(&id).await?;
    if !AccessContext::new(Some(&user.id), &project.owner_id).is_project_owner() {
        return Err(AppError::Forbidden(
            "Only the project owner can delete history".to_string(),
        ));
    }

    let mut tree = load_history(&state, &project).await?;
    let before = tree.current_state_id().map(str::to_string);
    tree.delete(&state_id)?;
    state.db.delete_temporal_state(&project.id, &state_id).await?;

    if tree.current_state_id() != before.as_deref() {
        state
            .db
            .set_current_state(&project.id, tree.current_state_id())
            .await?;
    }

    Ok(Json(HistoryResponse {
        current_state_id: tree.current_state_id().map(str::to_string),
        states: tree.history(),
    }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/api/projects/:id/temporal",
            get(get_temporal).post(save_state),
        )
        .route(
            "/api/projects/:id/temporal/:state_id",
            patch(update_state).delete(delete_state),
        )
        .route(
            "/api/projects/:id/temporal/:state_id/apply",
            post(apply_state),
        )
}
