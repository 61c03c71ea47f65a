mod health;
mod projects;
mod temporal;

use axum::Router;
use canvas_core::{graph_from_rows, GraphState};
use canvas_history::TemporalTree;

use crate::db::models::Project;
use crate::error::AppError;
use crate::AppState;

/// Create the API router
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .merge(projects::router())
        .merge(temporal::router())
}

/// The project's graph: the live document when it is open, the stored rows otherwise
pub(crate) async fn live_graph(state: &AppState, project: &Project) -> Result<GraphState, AppError> {
    if let Some(doc) = state.docs.get(&project.id).await {
        return Ok(doc.graph());
    }
    let (blocks, links) = state.db.load_graph_rows(&project.id).await?;
    Ok(graph_from_rows(&blocks, &links))
}

pub(crate) async fn load_history(
    state: &AppState,
    project: &Project,
) -> Result<TemporalTree, AppError> {
    let states = state.db.list_temporal_states(&project.id).await?;
    Ok(TemporalTree::from_states(
        project.id.clone(),
        states,
        project.current_state_id.clone(),
    ))
}
