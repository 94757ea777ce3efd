//! Relational-DB sink: MySQL or Postgres, selected by `SyncConfig::sink_type`.
//!
//! Documents have no inherent relational primary key, so the core injects a
//! `document_key` surrogate column (the source document's hex object id)
//! before every write; all mutating statements key off it.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use fc_common::{ChangeEvent, Operation, SyncConfig, SinkType};
use fc_sink::Sink;
use sqlx::{MySqlPool, PgPool};
use tokio::sync::RwLock;

const OP_TIMEOUT: Duration = Duration::from_secs(3);

enum Pool {
    MySql(MySqlPool),
    Postgres(PgPool),
}

pub struct RelationalDbSink {
    cfg: SyncConfig,
    pool: RwLock<Option<Pool>>,
    bootstrapped: RwLock<HashSet<String>>,
}

impl RelationalDbSink {
    pub fn new(cfg: SyncConfig) -> Self {
        Self {
            cfg,
            pool: RwLock::new(None),
            bootstrapped: RwLock::new(HashSet::new()),
        }
    }

    async fn ensure_table(&self, table: &str) -> anyhow::Result<()> {
        if self.bootstrapped.read().await.contains(table) {
            return Ok(());
        }
        let exists = self.table_exists(table).await?;
        if !exists {
            let ddl_path = PathBuf::from(format!(
                "./config/mysql/{}/{}.sql",
                self.cfg.destination_db, table
            ));
            if let Ok(ddl) = tokio::fs::read_to_string(&ddl_path).await {
                self.execute_ddl(&ddl).await?;
            }
        }
        self.bootstrapped.write().await.insert(table.to_string());
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> anyhow::Result<bool> {
        let guard = self.pool.read().await;
        match guard.as_ref() {
            Some(Pool::MySql(pool)) => {
                let row: Option<(i64,)> = tokio::time::timeout(
                    OP_TIMEOUT,
                    sqlx::query_as(
                        "SELECT 1 FROM information_schema.tables WHERE table_schema = DATABASE() AND table_name = ? LIMIT 1",
                    )
                    .bind(table)
                    .fetch_optional(pool),
                )
                .await??;
                Ok(row.is_some())
            }
            Some(Pool::Postgres(pool)) => {
                let row: Option<(i64,)> = tokio::time::timeout(
                    OP_TIMEOUT,
                    sqlx::query_as(
                        "SELECT 1 FROM information_schema.tables WHERE table_name = $1 LIMIT 1",
                    )
                    .bind(table)
                    .fetch_optional(pool),
                )
                .await??;
                Ok(row.is_some())
            }
            None => anyhow::bail!("relational-db sink not initialized"),
        }
    }

    async fn execute_ddl(&self, ddl: &str) -> anyhow::Result<()> {
        let guard = self.pool.read().await;
        match guard.as_ref() {
            Some(Pool::MySql(pool)) => {
                tokio::time::timeout(OP_TIMEOUT, sqlx::raw_sql(ddl).execute(pool)).await??;
            }
            Some(Pool::Postgres(pool)) => {
                tokio::time::timeout(OP_TIMEOUT, sqlx::raw_sql(ddl).execute(pool)).await??;
            }
            None => anyhow::bail!("relational-db sink not initialized"),
        }
        Ok(())
    }

    async fn insert(&self, table: &str, columns: &[(String, Option<String>)]) -> anyhow::Result<()> {
        let guard = self.pool.read().await;
        let col_names: Vec<&str> = columns.iter().map(|(c, _)| c.as_str()).collect();
        match guard.as_ref() {
            Some(Pool::MySql(pool)) => {
                let placeholders = vec!["?"; columns.len()].join(", ");
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    col_names.join(", "),
                    placeholders
                );
                let mut q = sqlx::query(&sql);
                for (_, v) in columns {
                    q = q.bind(v.clone());
                }
                tokio::time::timeout(OP_TIMEOUT, q.execute(pool)).await??;
            }
            Some(Pool::Postgres(pool)) => {
                let placeholders: Vec<String> =
                    (1..=columns.len()).map(|i| format!("${i}")).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    table,
                    col_names.join(", "),
                    placeholders.join(", ")
                );
                let mut q = sqlx::query(&sql);
                for (_, v) in columns {
                    q = q.bind(v.clone());
                }
                tokio::time::timeout(OP_TIMEOUT, q.execute(pool)).await??;
            }
            None => anyhow::bail!("relational-db sink not initialized"),
        }
        Ok(())
    }

    async fn update(
        &self,
        table: &str,
        columns: &[(String, Option<String>)],
        document_key: &str,
    ) -> anyhow::Result<()> {
        let guard = self.pool.read().await;
        match guard.as_ref() {
            Some(Pool::MySql(pool)) => {
                let assignments: Vec<String> =
                    columns.iter().map(|(c, _)| format!("{c} = ?")).collect();
                let sql = format!(
                    "UPDATE {} SET {} WHERE document_key = ?",
                    table,
                    assignments.join(", ")
                );
                let mut q = sqlx::query(&sql);
                for (_, v) in columns {
                    q = q.bind(v.clone());
                }
                q = q.bind(document_key);
                tokio::time::timeout(OP_TIMEOUT, q.execute(pool)).await??;
            }
            Some(Pool::Postgres(pool)) => {
                let assignments: Vec<String> = columns
                    .iter()
                    .enumerate()
                    .map(|(i, (c, _))| format!("{c} = ${}", i + 1))
                    .collect();
                let sql = format!(
                    "UPDATE {} SET {} WHERE document_key = ${}",
                    table,
                    assignments.join(", "),
                    columns.len() + 1
                );
                let mut q = sqlx::query(&sql);
                for (_, v) in columns {
                    q = q.bind(v.clone());
                }
                q = q.bind(document_key);
                tokio::time::timeout(OP_TIMEOUT, q.execute(pool)).await??;
            }
            None => anyhow::bail!("relational-db sink not initialized"),
        }
        Ok(())
    }

    async fn delete(&self, table: &str, document_key: &str) -> anyhow::Result<()> {
        let guard = self.pool.read().await;
        match guard.as_ref() {
            Some(Pool::MySql(pool)) => {
                tokio::time::timeout(
                    OP_TIMEOUT,
                    sqlx::query(&format!("DELETE FROM {} WHERE document_key = ?", table))
                        .bind(document_key)
                        .execute(pool),
                )
                .await??;
            }
            Some(Pool::Postgres(pool)) => {
                tokio::time::timeout(
                    OP_TIMEOUT,
                    sqlx::query(&format!("DELETE FROM {} WHERE document_key = $1", table))
                        .bind(document_key)
                        .execute(pool),
                )
                .await??;
            }
            None => anyhow::bail!("relational-db sink not initialized"),
        }
        Ok(())
    }
}

/// Converts a JSON value to its text representation for a text-typed bind,
/// `None` meaning SQL `NULL`.
fn scalar_text(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}

fn columns_with_document_key(
    document: &serde_json::Map<String, serde_json::Value>,
    document_key: &str,
) -> Vec<(String, Option<String>)> {
    let mut columns: Vec<(String, Option<String>)> = document
        .iter()
        .map(|(k, v)| (k.clone(), scalar_text(v)))
        .collect();
    columns.push(("document_key".to_string(), Some(document_key.to_string())));
    columns
}

#[async_trait]
impl Sink for RelationalDbSink {
    fn sync_config(&self) -> &SyncConfig {
        &self.cfg
    }

    async fn init_client(&self) -> anyhow::Result<()> {
        let uri = self
            .cfg
            .destination_uri
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("relational-db sink requires destination_uri"))?;
        let pool = match self.cfg.sink_type {
            SinkType::Mysql => Pool::MySql(MySqlPool::connect(uri).await?),
            SinkType::Postgres => Pool::Postgres(PgPool::connect(uri).await?),
            other => anyhow::bail!("unsupported relational sink type: {other}"),
        };
        *self.pool.write().await = Some(pool);
        Ok(())
    }

    async fn disconnect(&self) -> anyhow::Result<()> {
        let mut guard = self.pool.write().await;
        match guard.take() {
            Some(Pool::MySql(pool)) => pool.close().await,
            Some(Pool::Postgres(pool)) => pool.close().await,
            None => {}
        }
        Ok(())
    }

    async fn handle_data(&self, event: &ChangeEvent) -> anyhow::Result<()> {
        let table = event.destination_collection(&self.cfg).to_string();
        self.ensure_table(&table).await?;
        let document_key = event.require_document_key()?.hex();
        let columns = columns_with_document_key(&event.document, &document_key);

        match event.parsed_operation()? {
            Operation::Insert => self.insert(&table, &columns).await,
            Operation::Update => self.update(&table, &columns, &document_key).await,
            Operation::Delete => self.delete(&table, &document_key).await,
            Operation::Replace => {
                self.delete(&table, &document_key).await?;
                self.insert(&table, &columns).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_text_maps_json_kinds() {
        assert_eq!(scalar_text(&serde_json::Value::Null), None);
        assert_eq!(
            scalar_text(&serde_json::json!("alice")),
            Some("alice".to_string())
        );
        assert_eq!(scalar_text(&serde_json::json!(30)), Some("30".to_string()));
        assert_eq!(
            scalar_text(&serde_json::json!(true)),
            Some("true".to_string())
        );
    }

    #[test]
    fn columns_with_document_key_appends_surrogate() {
        let mut doc = serde_json::Map::new();
        doc.insert("name".to_string(), serde_json::json!("alice"));
        let columns = columns_with_document_key(&doc, "64ef00000000000000000000");
        assert!(columns
            .iter()
            .any(|(c, v)| c == "document_key" && v.as_deref() == Some("64ef00000000000000000000")));
    }
}
