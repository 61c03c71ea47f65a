use axum::{
    extract::{Path, State},
    http::HeaderMap,
    routing::get,
    Json, Router,
};
use canvas_core::{graph_to_rows, AccessContext, Block, GraphState, Link};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::api::live_graph;
use crate::db::models::Project;
use crate::error::AppError;
use crate::identity::CurrentUser;
use crate::AppState;

/// Request to create a new project
#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
}

/// Full write of a project's graph through the non-realtime path
#[derive(Debug, Deserialize)]
pub struct SaveGraphRequest {
    #[serde(default)]
    pub blocks: Vec<Block>,
    #[serde(default)]
    pub links: Vec<Link>,
}

/// A project with its graph
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectGraphResponse {
    pub project: Project,
    pub blocks: Vec<Block>,
    pub links: Vec<Link>,
    pub read_only: bool,
}

impl ProjectGraphResponse {
    fn new(project: Project, graph: GraphState, read_only: bool) -> Self {
        Self {
            project,
            blocks: graph.blocks.into_values().collect(),
            links: graph.links.into_values().collect(),
            read_only,
        }
    }
}

/// List the caller's projects
async fn list_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Project>>, AppError> {
    let user = CurrentUser::require(&headers)?;
    let projects = state.db.list_projects(&user.id).await?;
    Ok(Json(projects))
}

/// Create a project holding only its core block
async fn create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateProjectRequest>,
) -> Result<Json<ProjectGraphResponse>, AppError> {
    let user = CurrentUser::require(&headers)?;
    let name = req.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("Project name cannot be empty".to_string()));
    }

    let project = state
        .db
        .create_project(&Uuid::new_v4().to_string(), name, &user.id)
        .await?;

    let core = Block::core(Uuid::new_v4().to_string()).with_owner(&user.id);
    let graph = GraphState::from_parts([core], []);
    let (blocks, links) = graph_to_rows(&graph, &project.id, &user.id)?;
    state.db.save_graph_rows(&project.id, &blocks, &links).await?;

    tracing::info!(project = %project.id, owner = %user.id, "created project");
    Ok(Json(ProjectGraphResponse::new(project, graph, false)))
}

/// Get a project and its graph
async fn get_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<ProjectGraphResponse>, AppError> {
    let project = state.db.require_project(&id).await?;
    let graph = live_graph(&state, &project).await?;
    let read_only = CurrentUser::from_headers(&headers).is_none();
    Ok(Json(ProjectGraphResponse::new(project, graph, read_only)))
}

/// Replace a project's graph. An open live document is updated and broadcast instead of
/// writing rows directly; the checkpoint brings the rows along.
async fn save_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<SaveGraphRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = CurrentUser::require(&headers)?;
    let project = state.db.require_project(&id).await?;

    let graph = GraphState::from_parts(req.blocks, req.links);
    let before = live_graph(&state, &project).await?;
    AccessContext::new(Some(&user.id), &project.owner_id).ensure_can_replace(&before, &graph)?;
    let (blocks, links) = graph_to_rows(&graph, &project.id, &user.id)?;

    match state.docs.get(&project.id).await {
        Some(doc) => {
            let update = doc.overwrite(&graph);
            state.db.store_crdt_update(&project.id, &update).await?;
            doc.schedule_checkpoint(state.db.clone()).await;
        }
        None => {
            state
                .db
                .save_graph_rows(&project.id, &blocks, &links)
                .await?
        }
    }

    Ok(Json(serde_json::json!({
        "saved": true,
        "blocks": blocks.len(),
        "links": links.len(),
    })))
}

/// Delete a project; owner only
async fn delete_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    let user = CurrentUser::require(&headers)?;
    let project = state.db.require_project(&id).await?;
    if !AccessContext::new(Some(&user.id), &project.owner_id).is_project_owner() {
        return Err(AppError::Forbidden(
            "Only the project owner can delete it".to_string(),
        ));
    }

    state.db.delete_project(&project.id).await?;
    state.docs.remove(&project.id).await;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/projects", get(list_projects).post(create_project))
        .route(
            "/api/projects/:id",
            get(get_project).post(save_project).delete(delete_project),
        )
}
