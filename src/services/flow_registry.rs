//! Registration and lookup of sources and flows.
//!
//! Sources are created once and never change; flows only
//! toggle `read_only`. Deletion lives in [`crate::services::deletion_orchestrator`].

use crate::{
    models::flow::{Flow, FlowFormat, Source},
    services::error::{CoreError, CoreResult},
};
use chrono::Utc;
use serde::Deserialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct NewSource {
    pub id: Option<Uuid>,
    pub format: FlowFormat,
    pub label: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewFlow {
    pub id: Option<Uuid>,
    pub source_id: Uuid,
    pub format: FlowFormat,
    pub label: Option<String>,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Clone)]
pub struct FlowRegistry {
    pub db: Arc<SqlitePool>,
}

impl FlowRegistry {
    pub fn new(db: Arc<SqlitePool>) -> Self {
        Self { db }
    }

    pub async fn create_source(&self, new: NewSource) -> CoreResult<Source> {
        let source = Source {
            id: new.id.unwrap_or_else(Uuid::new_v4),
            format: new.format,
            label: new.label,
            created: Utc::now(),
        };

        sqlx::query("INSERT INTO sources (id, format, label, created) VALUES (?, ?, ?, ?)")
            .bind(source.id)
            .bind(source.format)
            .bind(&source.label)
            .bind(source.created)
            .execute(&*self.db)
            .await?;

        info!(source_id = %source.id, "registered source");
        Ok(source)
    }

    pub async fn get_source(&self, id: Uuid) -> CoreResult<Source> {
        sqlx::query_as::<_, Source>("SELECT id, format, label, created FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&*self.db)
            .await?
            .ok_or_else(|| CoreError::not_found("source", id))
    }

    /// Register a flow under an existing source.
    pub async fn create_flow(&self, new: NewFlow) -> CoreResult<Flow> {
        self.get_source(new.source_id).await?;

        let flow = Flow {
            id: new.id.unwrap_or_else(Uuid::new_v4),
            source_id: new.source_id,
            format: new.format,
            label: new.label,
            read_only: new.read_only,
            created: Utc::now(),
        };

        sqlx::query(
            "INSERT INTO flows (id, source_id, format, label, read_only, created)
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(flow.id)
        .bind(flow.source_id)
        .bind(flow.format)
        .bind(&flow.label)
        .bind(flow.read_only)
        .bind(flow.created)
        .execute(&*self.db)
        .await?;

        info!(flow_id = %flow.id, source_id = %flow.source_id, "registered flow");
        Ok(flow)
    }

    pub async fn get_flow(&self, id: Uuid) -> CoreResult<Flow> {
        sqlx::query_as::<_, Flow>(
            "SELECT id, source_id, format, label, read_only, created FROM flows WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&*self.db)
        .await?
        .ok_or_else(|| CoreError::not_found("flow", id))
    }

    /// Fetch a flow that is about to be mutated; read-only flows are refused.
    pub async fn writable_flow(&self, id: Uuid) -> CoreResult<Flow> {
        let flow = self.get_flow(id).await?;
        if flow.read_only {
            return Err(CoreError::ReadOnly(id));
        }
        Ok(flow)
    }

    pub async fn set_read_only(&self, id: Uuid, read_only: bool) -> CoreResult<Flow> {
        let result = sqlx::query("UPDATE flows SET read_only = ? WHERE id = ?")
            .bind(read_only)
            .bind(id)
            .execute(&*self.db)
            .await?;
        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("flow", id));
        }

        info!(flow_id = %id, read_only, "updated flow read_only flag");
        self.get_flow(id).await
    }

    /// Remove the flow row, but only while it has no segments.
    ///
    /// Segments registered after the caller emptied the flow make this fail
    /// with `DependentsExist` and leave the flow in place.
    pub(crate) async fn remove_flow_row(&self, id: Uuid) -> CoreResult<bool> {
        let result = sqlx::query(
            "DELETE FROM flows WHERE id = ?
             AND NOT EXISTS (SELECT 1 FROM segments WHERE flow_id = ?)",
        )
        .bind(id)
        .bind(id)
        .execute(&*self.db)
        .await?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM segments WHERE flow_id = ?")
                .bind(id)
                .fetch_one(&*self.db)
                .await?;
        if count > 0 {
            warn!(flow_id = %id, count, "flow gained segments before removal");
            return Err(CoreError::DependentsExist {
                kind: "flow",
                id,
                count,
            });
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::memory_pool;

    async fn registry() -> FlowRegistry {
        FlowRegistry::new(Arc::new(memory_pool().await))
    }

    #[tokio::test]
    async fn flow_requires_existing_source() {
        let registry = registry().await;
        let result = registry
            .create_flow(NewFlow {
                id: None,
                source_id: Uuid::new_v4(),
                format: FlowFormat::Video,
                label: None,
                read_only: false,
            })
            .await;
        assert!(matches!(
            result,
            Err(CoreError::NotFound { kind: "source", .. })
        ));
    }

    #[tokio::test]
    async fn read_only_flows_are_not_writable() {
        let registry = registry().await;
        let source = registry
            .create_source(NewSource {
                id: None,
                format: FlowFormat::Audio,
                label: Some("mic".into()),
            })
            .await
            .unwrap();
        let flow = registry
            .create_flow(NewFlow {
                id: None,
                source_id: source.id,
                format: FlowFormat::Audio,
                label: None,
                read_only: false,
            })
            .await
            .unwrap();

        registry.writable_flow(flow.id).await.unwrap();

        let updated = registry.set_read_only(flow.id, true).await.unwrap();
        assert!(updated.read_only);
        assert_eq!(updated.format, FlowFormat::Audio);
        assert!(matches!(
            registry.writable_flow(flow.id).await,
            Err(CoreError::ReadOnly(id)) if id == flow.id
        ));
    }

    #[tokio::test]
    async fn toggling_unknown_flow_is_not_found() {
        let registry = registry().await;
        assert!(matches!(
            registry.set_read_only(Uuid::new_v4(), true).await,
            Err(CoreError::NotFound { kind: "flow", .. })
        ));
    }
}
