pub mod api;
pub mod collab;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;

use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::collab::DocumentStore;
use crate::config::Config;
use crate::db::Database;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub docs: Arc<DocumentStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(db: Database, config: Config) -> Self {
        Self {
            db,
            docs: Arc::new(DocumentStore::new(config.checkpoint_debounce)),
            config: Arc::new(config),
        }
    }
}

/// Build the router with REST, WebSocket and middleware layers
pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(api::router())
        .merge(collab::router())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the server with the given configuration
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    // Initialize database
    let db = Database::connect(&config.database_url).await?;

    // Run migrations
    db.migrate().await?;

    let addr = format!("{}:{}", config.host, config.port);
    let app = app(AppState::new(db, config));

    // Start the server
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::*;
    use crate::identity::USER_ID_HEADER;

    /// State over a pool that never connects; handlers under test must fail before the database
    pub fn test_state() -> AppState {
        let config = Config::from_lookup(|_| None).expect("default config");
        let db = Database::connect_lazy(&config.database_url).expect("lazy pool");
        AppState::new(db, config)
    }

    pub async fn call(
        state: AppState,
        method: &str,
        uri: &str,
        user_id: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut request = Request::builder().method(method).uri(uri);
        if let Some(user_id) = user_id {
            request = request.header(USER_ID_HEADER, user_id);
        }
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app(state).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }
}
