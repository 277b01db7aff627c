//! Container and port mapping persistence.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};

use super::models::{Container, ContainerStatus};
use crate::ports::PortMapping;
use crate::resources::{DeclaredPort, Protocol, ResourceSpec};

/// Storage for container and mapping metadata.
///
/// Terminal sessions are never persisted.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Insert or replace a container row.
    async fn save_container(&self, container: &Container) -> Result<()>;
    async fn update_status(
        &self,
        id: &str,
        status: ContainerStatus,
        error_message: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<()>;
    /// Delete a container and its mappings.
    async fn delete_container(&self, id: &str) -> Result<()>;
    async fn load_containers(&self) -> Result<Vec<Container>>;

    async fn save_mapping(&self, mapping: &PortMapping) -> Result<()>;
    async fn delete_mapping(&self, id: &str) -> Result<()>;
    async fn load_mappings(&self) -> Result<Vec<PortMapping>>;
}

const CONTAINER_COLUMNS: &str = r#"
    id, name, image, owner_id, cpu_millis, memory_bytes, declared_ports,
    status, error_message, created_at, updated_at
"#;

#[derive(Debug, FromRow)]
struct ContainerRow {
    id: String,
    name: String,
    image: String,
    owner_id: String,
    cpu_millis: i64,
    memory_bytes: i64,
    declared_ports: String,
    #[sqlx(try_from = "String")]
    status: ContainerStatus,
    error_message: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ContainerRow {
    fn into_container(self) -> Result<Container> {
        let declared_ports: Vec<DeclaredPort> = serde_json::from_str(&self.declared_ports)
            .with_context(|| format!("parsing declared ports of container {}", self.id))?;
        Ok(Container {
            resources: ResourceSpec {
                cpu_millis: u32::try_from(self.cpu_millis)
                    .with_context(|| format!("cpu_millis of container {}", self.id))?,
                memory_bytes: u64::try_from(self.memory_bytes)
                    .with_context(|| format!("memory_bytes of container {}", self.id))?,
            },
            declared_ports,
            port_mappings: Vec::new(),
            created_at: parse_timestamp(&self.created_at)?,
            updated_at: parse_timestamp(&self.updated_at)?,
            id: self.id,
            name: self.name,
            image: self.image,
            owner_id: self.owner_id,
            status: self.status,
            error_message: self.error_message,
        })
    }
}

#[derive(Debug, FromRow)]
struct MappingRow {
    id: String,
    container_id: String,
    container_port: i64,
    host_port: i64,
    #[sqlx(try_from = "String")]
    protocol: Protocol,
    created_at: String,
}

impl MappingRow {
    fn into_mapping(self) -> Result<PortMapping> {
        Ok(PortMapping {
            container_port: u16::try_from(self.container_port)
                .with_context(|| format!("container_port of mapping {}", self.id))?,
            host_port: u16::try_from(self.host_port)
                .with_context(|| format!("host_port of mapping {}", self.id))?,
            created_at: parse_timestamp(&self.created_at)?,
            id: self.id,
            container_id: self.container_id,
            protocol: self.protocol,
        })
    }
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)
        .with_context(|| format!("parsing timestamp {value}"))?
        .with_timezone(&Utc))
}

/// SQLite-backed [`ContainerStore`].
#[derive(Debug, Clone)]
pub struct SqliteContainerStore {
    pool: SqlitePool,
}

impl SqliteContainerStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ContainerStore for SqliteContainerStore {
    async fn save_container(&self, container: &Container) -> Result<()> {
        let declared_ports = serde_json::to_string(&container.declared_ports)
            .context("serializing declared ports")?;
        sqlx::query(
            r#"
            INSERT INTO containers (
                id, name, image, owner_id, cpu_millis, memory_bytes, declared_ports,
                status, error_message, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                error_message = excluded.error_message,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&container.id)
        .bind(&container.name)
        .bind(&container.image)
        .bind(&container.owner_id)
        .bind(i64::from(container.resources.cpu_millis))
        .bind(container.resources.memory_bytes as i64)
        .bind(declared_ports)
        .bind(container.status.to_string())
        .bind(&container.error_message)
        .bind(container.created_at.to_rfc3339())
        .bind(container.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("saving container")?;

        Ok(())
    }

    async fn update_status(
        &self,
        id: &str,
        status: ContainerStatus,
        error_message: Option<&str>,
        updated_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE containers
            SET status = ?, error_message = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(status.to_string())
        .bind(error_message)
        .bind(updated_at.to_rfc3339())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("updating container status")?;

        Ok(())
    }

    async fn delete_container(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.context("starting transaction")?;
        sqlx::query("DELETE FROM port_mappings WHERE container_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("deleting container mappings")?;
        sqlx::query("DELETE FROM containers WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await
            .context("deleting container")?;
        tx.commit().await.context("committing container delete")?;

        Ok(())
    }

    async fn load_containers(&self) -> Result<Vec<Container>> {
        let query = format!(
            "SELECT {} FROM containers ORDER BY created_at ASC",
            CONTAINER_COLUMNS
        );
        let rows = sqlx::query_as::<_, ContainerRow>(&query)
            .fetch_all(&self.pool)
            .await
            .context("listing containers")?;

        rows.into_iter().map(ContainerRow::into_container).collect()
    }

    async fn save_mapping(&self, mapping: &PortMapping) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO port_mappings (id, container_id, container_port, host_port, protocol, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET host_port = excluded.host_port
            "#,
        )
        .bind(&mapping.id)
        .bind(&mapping.container_id)
        .bind(i64::from(mapping.container_port))
        .bind(i64::from(mapping.host_port))
        .bind(mapping.protocol.to_string())
        .bind(mapping.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("saving port mapping")?;

        Ok(())
    }

    async fn delete_mapping(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM port_mappings WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting port mapping")?;

        Ok(())
    }

    async fn load_mappings(&self) -> Result<Vec<PortMapping>> {
        let rows = sqlx::query_as::<_, MappingRow>(
            r#"
            SELECT id, container_id, container_port, host_port, protocol, created_at
            FROM port_mappings
            ORDER BY host_port ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("listing port mappings")?;

        rows.into_iter().map(MappingRow::into_mapping).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn sample_container(id: &str, name: &str) -> Container {
        let now = Utc::now();
        Container {
            id: id.to_string(),
            name: name.to_string(),
            image: "alpine:3".to_string(),
            owner_id: "alice".to_string(),
            status: ContainerStatus::Running,
            resources: ResourceSpec {
                cpu_millis: 1500,
                memory_bytes: 512 * 1024 * 1024,
            },
            declared_ports: vec![DeclaredPort {
                container_port: 8080,
                protocol: Protocol::Tcp,
            }],
            port_mappings: Vec::new(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    async fn store() -> SqliteContainerStore {
        let db = Database::in_memory().await.unwrap();
        SqliteContainerStore::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_container_save_and_load() {
        let store = store().await;
        store.save_container(&sample_container("c1", "dev")).await.unwrap();
        store
            .update_status("c1", ContainerStatus::Error, Some("start failed"), Utc::now())
            .await
            .unwrap();

        let loaded = store.load_containers().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].status, ContainerStatus::Error);
        assert_eq!(loaded[0].error_message.as_deref(), Some("start failed"));
        assert_eq!(loaded[0].resources.cpu_millis, 1500);
        assert_eq!(loaded[0].declared_ports.len(), 1);
    }

    #[tokio::test]
    async fn test_names_are_unique() {
        let store = store().await;
        store.save_container(&sample_container("c1", "dev")).await.unwrap();
        assert!(
            store
                .save_container(&sample_container("c2", "dev"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_delete_container_removes_mappings() {
        let store = store().await;
        store.save_container(&sample_container("c1", "dev")).await.unwrap();
        store
            .save_mapping(&PortMapping {
                id: "m1".to_string(),
                container_id: "c1".to_string(),
                container_port: 8080,
                host_port: 42000,
                protocol: Protocol::Tcp,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(store.load_mappings().await.unwrap().len(), 1);

        store.delete_container("c1").await.unwrap();
        assert!(store.load_containers().await.unwrap().is_empty());
        assert!(store.load_mappings().await.unwrap().is_empty());
    }
}
