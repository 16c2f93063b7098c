//! Turso Embedded / libSQL storage for collaborator responses.
//!
//! The [`Storage`] struct wraps a local libSQL database holding the
//! collaborator response cache. The pipeline itself never persists records;
//! only collaborator round-trips are cached so reruns of the same case are
//! cheap.
//!
//! **Access rules:**
//! - Pipeline runs: read-write via [`Storage::open`]
//! - Inspection tooling: read-only via [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use appraisal_shared::{AppraisalError, Result};
use chrono::Utc;
use libsql::{Connection, Database, params};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Key identifying one cached collaborator response.
#[derive(Debug, Clone, Copy)]
pub struct CacheKey<'a> {
    pub task: &'a str,
    /// Hex sha256 of the serialized request context.
    pub context_hash: &'a str,
    pub model_id: &'a str,
}

fn storage_err(e: impl std::fmt::Display) -> AppraisalError {
    AppraisalError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppraisalError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(AppraisalError::Storage(format!(
                "cache database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(storage_err)?;
        let conn = db.connect().map_err(storage_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn.execute_batch(migration.sql).await.map_err(|e| {
                    AppraisalError::Storage(format!(
                        "migration v{} failed: {e}",
                        migration.version
                    ))
                })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    pub async fn schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            // Table doesn't exist yet
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(AppraisalError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Collaborator cache
    // -----------------------------------------------------------------------

    /// Look up a cached response. Returns the raw JSON text.
    pub async fn get_cached_response(&self, key: CacheKey<'_>) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT response_json FROM collaborator_cache
                 WHERE task = ?1 AND context_hash = ?2 AND model_id = ?3",
                params![key.task, key.context_hash, key.model_id],
            )
            .await
            .map_err(storage_err)?;

        match rows.next().await.map_err(storage_err)? {
            Some(row) => Ok(Some(row.get::<String>(0).map_err(storage_err)?)),
            None => Ok(None),
        }
    }

    /// Store a response (upserts on the cache key).
    pub async fn set_cached_response(&self, key: CacheKey<'_>, response_json: &str) -> Result<()> {
        self.check_writable()?;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO collaborator_cache (id, task, context_hash, model_id, response_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(task, context_hash, model_id) DO UPDATE SET
                   response_json = excluded.response_json,
                   created_at = excluded.created_at",
                params![
                    id.as_str(),
                    key.task,
                    key.context_hash,
                    key.model_id,
                    response_json,
                    now.as_str()
                ],
            )
            .await
            .map_err(storage_err)?;
        Ok(())
    }

    /// Drop cached responses for one task, or all of them when `task` is `None`.
    /// Returns the number of rows removed.
    pub async fn invalidate(&self, task: Option<&str>) -> Result<u64> {
        self.check_writable()?;
        let removed = match task {
            Some(task) => self
                .conn
                .execute("DELETE FROM collaborator_cache WHERE task = ?1", params![task])
                .await
                .map_err(storage_err)?,
            None => self
                .conn
                .execute("DELETE FROM collaborator_cache", params![])
                .await
                .map_err(storage_err)?,
        };
        Ok(removed)
    }

    /// Number of cached responses per task, sorted by task name.
    pub async fn cache_stats(&self) -> Result<Vec<(String, u64)>> {
        let mut rows = self
            .conn
            .query(
                "SELECT task, COUNT(*) FROM collaborator_cache GROUP BY task ORDER BY task",
                params![],
            )
            .await
            .map_err(storage_err)?;

        let mut stats = Vec::new();
        while let Some(row) = rows.next().await.map_err(storage_err)? {
            stats.push((
                row.get::<String>(0).map_err(storage_err)?,
                row.get::<u64>(1).map_err(storage_err)?,
            ));
        }
        Ok(stats)
    }
}
