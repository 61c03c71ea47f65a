pub mod models;

use canvas_core::{BlockRow, LinkRow};
use canvas_history::TemporalState;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::error::AppError;
use models::{Project, TemporalRow};

const BLOCK_COLUMNS: &str = "id, project_id, owner_id, block_type, position_x, position_y, width, height, content, data, metadata, is_locked, created_at, updated_at, author_name, author_color";
const LINK_COLUMNS: &str = "id, project_id, source_block_id, target_block_id, source_handle, target_handle, link_type, animated, data, label, created_at, updated_at";
const PROJECT_COLUMNS: &str = "id, name, owner_id, current_state_id, created_at, updated_at";
const TEMPORAL_COLUMNS: &str =
    "id, project_id, parent_id, author_id, intent, diff, is_snapshot, timestamp";

/// Deletes a history node only while it is still a leaf; the child check and the delete are
/// one statement, so a concurrent save cannot orphan a new child
const DELETE_LEAF_STATE: &str = "DELETE FROM temporal_states WHERE id = $1 AND project_id = $2 \
    AND NOT EXISTS (SELECT 1 FROM temporal_states WHERE parent_id = $1 AND project_id = $2)";

/// Database connection wrapper
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the database
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Pool that connects on first use
    pub fn connect_lazy(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_lazy(database_url)?;
        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    /// List projects owned by a user
    pub async fn list_projects(&self, owner_id: &str) -> Result<Vec<Project>, AppError> {
        let projects = sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE owner_id = $1 ORDER BY updated_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(projects)
    }

    pub async fn create_project(
        &self,
        id: &str,
        name: &str,
        owner_id: &str,
    ) -> Result<Project, AppError> {
        let project = sqlx::query_as::<_, Project>(&format!(
            "INSERT INTO projects (id, name, owner_id) VALUES ($1, $2, $3) RETURNING {PROJECT_COLUMNS}"
        ))
        .bind(id)
        .bind(name)
        .bind(owner_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Result<Option<Project>, AppError> {
        let project = sqlx::query_as::<_, Project>(&format!(
            "SELECT {PROJECT_COLUMNS} FROM projects WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(project)
    }

    /// Like `get_project`, but a missing project is an error
    pub async fn require_project(&self, id: &str) -> Result<Project, AppError> {
        self.get_project(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Project {} not found", id)))
    }

    /// Delete a project; blocks, links, history and updates cascade
    pub async fn delete_project(&self, id: &str) -> Result<(), AppError> {
        let result = sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Project {} not found", id)));
        }
        Ok(())
    }

    pub async fn set_current_state(
        &self,
        project_id: &str,
        state_id: Option<&str>,
    ) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE projects SET current_state_id = $1, updated_at = NOW() WHERE id = $2",
        )
        .bind(state_id)
        .bind(project_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load a project's block and link rows
    pub async fn load_graph_rows(
        &self,
        project_id: &str,
    ) -> Result<(Vec<BlockRow>, Vec<LinkRow>), AppError> {
        let blocks = sqlx::query_as::<_, BlockRow>(&format!(
            "SELECT {BLOCK_COLUMNS} FROM blocks WHERE project_id = $1 ORDER BY created_at, id"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let links = sqlx::query_as::<_, LinkRow>(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE project_id = $1 ORDER BY created_at, id"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok((blocks, links))
    }

    /// Replace a project's rows with `blocks` and `links` in one transaction
    pub async fn save_graph_rows(
        &self,
        project_id: &str,
        blocks: &[BlockRow],
        links: &[LinkRow],
    ) -> Result<(), AppError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("DELETE FROM links WHERE project_id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        let keep: Vec<String> = blocks.iter().map(|b| b.id.clone()).collect();
        sqlx::query("DELETE FROM blocks WHERE project_id = $1 AND NOT (id = ANY($2))")
            .bind(project_id)
            .bind(&keep)
            .execute(&mut *tx)
            .await?;

        for block in blocks {
            sqlx::query(
                r#"
                INSERT INTO blocks (id, project_id, owner_id, block_type, position_x, position_y,
                    width, height, content, data, metadata, is_locked, author_name, author_color,
                    updated_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, NOW())
                ON CONFLICT (project_id, id) DO UPDATE SET
                    owner_id = EXCLUDED.owner_id,
                    block_type = EXCLUDED.block_type,
                    position_x = EXCLUDED.position_x,
                    position_y = EXCLUDED.position_y,
                    width = EXCLUDED.width,
                    height = EXCLUDED.height,
                    content = EXCLUDED.content,
                    data = EXCLUDED.data,
                    metadata = EXCLUDED.metadata,
                    is_locked = EXCLUDED.is_locked,
                    author_name = EXCLUDED.author_name,
                    author_color = EXCLUDED.author_color,
                    updated_at = NOW()
                "#,
            )
            .bind(&block.id)
            .bind(project_id)
            .bind(&block.owner_id)
            .bind(&block.block_type)
            .bind(block.position_x)
            .bind(block.position_y)
            .bind(block.width)
            .bind(block.height)
            .bind(&block.content)
            .bind(&block.data)
            .bind(&block.metadata)
            .bind(block.is_locked)
            .bind(&block.author_name)
            .bind(&block.author_color)
            .execute(&mut *tx)
            .await?;
        }

        for link in links {
            sqlx::query(
                r#"
                INSERT INTO links (id, project_id, source_block_id, target_block_id, source_handle,
                    target_handle, link_type, animated, data, label)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(&link.id)
            .bind(project_id)
            .bind(&link.source_block_id)
            .bind(&link.target_block_id)
            .bind(&link.source_handle)
            .bind(&link.target_handle)
            .bind(&link.link_type)
            .bind(link.animated)
            .bind(&link.data)
            .bind(&link.label)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("UPDATE projects SET updated_at = NOW() WHERE id = $1")
            .bind(project_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_temporal_states(
        &self,
        project_id: &str,
    ) -> Result<Vec<TemporalState>, AppError> {
        let rows = sqlx::query_as::<_, TemporalRow>(&format!(
            "SELECT {TEMPORAL_COLUMNS} FROM temporal_states WHERE project_id = $1 ORDER BY timestamp"
        ))
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(TemporalState::from).collect())
    }

    /// Insert a new history node and make it the project's present
    pub async fn insert_temporal_state(&self, state: &TemporalState) -> Result<(), AppError> {
        let row = TemporalRow::from(state);
        let mut tx = self.pool.begin().await?;

        sqlx::query(&format!(
            "INSERT INTO temporal_states ({TEMPORAL_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(&row.id)
        .bind(&row.project_id)
        .bind(&row.parent_id)
        .bind(&row.author_id)
        .bind(&row.intent)
        .bind(&row.diff)
        .bind(row.is_snapshot)
        .bind(row.timestamp)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE projects SET current_state_id = $1, updated_at = NOW() WHERE id = $2")
            .bind(&row.id)
            .bind(&row.project_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Persist the mutable fields of a history node (label and pin flag)
    pub async fn update_temporal_label(&self, state: &TemporalState) -> Result<(), AppError> {
        let result = sqlx::query(
            "UPDATE temporal_states SET intent = $1, is_snapshot = $2 WHERE id = $3 AND project_id = $4",
        )
        .bind(&state.intent)
        .bind(state.is_snapshot)
        .bind(&state.id)
        .bind(&state.project_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("History state {} not found", state.id)));
        }
        Ok(())
    }

    /// Delete a leaf history node of a project
    pub async fn delete_temporal_state(&self, project_id: &str, id: &str) -> Result<(), AppError> {
        let result = sqlx::query(DELETE_LEAF_STATE)
            .bind(id)
            .bind(project_id)
            .execute(&self.pool)
            .await?;

        ensure_leaf_deleted(id, result.rows_affected())
    }

    /// Store a CRDT update
    pub async fn store_crdt_update(&self, project_id: &str, update: &[u8]) -> Result<(), AppError> {
        sqlx::query("INSERT INTO crdt_updates (project_id, update_data) VALUES ($1, $2)")
            .bind(project_id)
            .bind(update)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Id of the newest stored update, if any
    pub async fn latest_crdt_update_id(&self, project_id: &str) -> Result<Option<i64>, AppError> {
        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(id) FROM crdt_updates WHERE project_id = $1")
                .bind(project_id)
                .fetch_one(&self.pool)
                .await?;

        Ok(latest)
    }

    /// Replace every update up to `upto` with one encoded document state. Rows stored after
    /// `upto` are kept; applying them again on load is harmless.
    pub async fn compact_crdt_updates(
        &self,
        project_id: &str,
        upto: i64,
        state: &[u8],
    ) -> Result<u64, AppError> {
        let mut tx = self.pool.begin().await?;

        let removed = sqlx::query("DELETE FROM crdt_updates WHERE project_id = $1 AND id <= $2")
            .bind(project_id)
            .bind(upto)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        sqlx::query("INSERT INTO crdt_updates (project_id, update_data) VALUES ($1, $2)")
            .bind(project_id)
            .bind(state)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(removed)
    }

    /// Get all CRDT updates for a project, oldest first
    pub async fn get_crdt_updates(&self, project_id: &str) -> Result<Vec<Vec<u8>>, AppError> {
        let rows: Vec<(Vec<u8>,)> = sqlx::query_as(
            "SELECT update_data FROM crdt_updates WHERE project_id = $1 ORDER BY id",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|r| r.0).collect())
    }
}

/// A leaf delete that touched nothing lost a race: the node gained a child or went away
fn ensure_leaf_deleted(id: &str, rows_affected: u64) -> Result<(), AppError> {
    if rows_affected == 0 {
        return Err(AppError::Conflict(format!(
            "History state {} has children or no longer exists",
            id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;

    #[test]
    fn test_leaf_delete_checks_children_in_the_same_statement() {
        assert!(DELETE_LEAF_STATE.contains("project_id = $2"));
        assert!(DELETE_LEAF_STATE.contains("NOT EXISTS (SELECT 1 FROM temporal_states WHERE parent_id = $1"));
    }

    #[test]
    fn test_lost_leaf_delete_is_a_conflict() {
        assert!(ensure_leaf_deleted("s1", 1).is_ok());
        let err = ensure_leaf_deleted("s1", 0).unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
        assert_eq!(err.into_response().status(), StatusCode::CONFLICT);
    }
}
