//! PostgreSQL-backed run store (diesel-async over a deadpool pool).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::pooled_connection::deadpool::{Object, Pool};
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::{AsyncPgConnection, RunQueryDsl, SimpleAsyncConnection};

use super::{RunStore, SettingsStore, StoreError, StoreResult};
use crate::models::{RunRecord, TriggerSettings};
use crate::schema::{iac_ci_runs, iac_ci_settings};

/// SQL migration for the run store tables.
pub const MIGRATION_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS iac_ci_runs (
    id              TEXT PRIMARY KEY,
    trigger_id      TEXT NOT NULL,
    build_id        TEXT,
    build_status    VARCHAR(32) NOT NULL DEFAULT 'pending',
    doc             JSONB NOT NULL,
    write_date      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_iac_ci_runs_build_id ON iac_ci_runs (build_id);
CREATE INDEX IF NOT EXISTS idx_iac_ci_runs_trigger ON iac_ci_runs (trigger_id);

CREATE TABLE IF NOT EXISTS iac_ci_settings (
    id              TEXT PRIMARY KEY,
    repo_name       TEXT NOT NULL,
    doc             JSONB NOT NULL,
    write_date      TIMESTAMPTZ NOT NULL DEFAULT NOW()
);

CREATE INDEX IF NOT EXISTS idx_iac_ci_settings_repo ON iac_ci_settings (repo_name);
"#;

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = iac_ci_runs)]
struct RunRow {
    id: String,
    trigger_id: String,
    build_id: Option<String>,
    build_status: String,
    doc: serde_json::Value,
    write_date: DateTime<Utc>,
}

impl RunRow {
    fn from_record(run: &RunRecord) -> StoreResult<Self> {
        Ok(Self {
            id: run.run_id.clone(),
            trigger_id: run.trigger_id.clone(),
            build_id: run.build_id.clone(),
            build_status: run.build_status.as_str().to_string(),
            doc: serde_json::to_value(run)?,
            write_date: Utc::now(),
        })
    }

    fn into_record(self) -> StoreResult<RunRecord> {
        Ok(serde_json::from_value(self.doc)?)
    }
}

#[derive(Debug, Clone, Queryable, Selectable, Insertable, AsChangeset)]
#[diesel(table_name = iac_ci_settings)]
struct SettingsRow {
    id: String,
    repo_name: String,
    doc: serde_json::Value,
    write_date: DateTime<Utc>,
}

/// Run and settings store over PostgreSQL.
#[derive(Clone)]
pub struct PgStore {
    pool: Pool<AsyncPgConnection>,
}

impl PgStore {
    pub fn connect(database_url: &str, max_connections: usize) -> StoreResult<Self> {
        let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);
        let pool = Pool::builder(manager)
            .max_size(max_connections)
            .build()
            .map_err(|e| StoreError::Pool(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn conn(&self) -> StoreResult<Object<AsyncPgConnection>> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Creates the store tables if they are missing.
    pub async fn run_migration(&self) -> StoreResult<()> {
        let mut conn = self.conn().await?;
        conn.batch_execute(MIGRATION_SQL).await?;
        tracing::info!("Run store migration completed");
        Ok(())
    }
}

#[async_trait]
impl RunStore for PgStore {
    async fn get_run(&self, run_id: &str) -> StoreResult<Option<RunRecord>> {
        let mut conn = self.conn().await?;
        let row = iac_ci_runs::table
            .find(run_id)
            .select(RunRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(RunRow::into_record).transpose()
    }

    async fn query_runs_by_build_id(&self, build_id: &str) -> StoreResult<Vec<RunRecord>> {
        let mut conn = self.conn().await?;
        let rows: Vec<RunRow> = iac_ci_runs::table
            .filter(iac_ci_runs::build_id.eq(build_id))
            .select(RunRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter().map(RunRow::into_record).collect()
    }

    async fn put_run(&self, run: &RunRecord) -> StoreResult<()> {
        let row = RunRow::from_record(run)?;
        let mut conn = self.conn().await?;
        diesel::insert_into(iac_ci_runs::table)
            .values(&row)
            .on_conflict(iac_ci_runs::id)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .await?;

        tracing::debug!(run_id = %run.run_id, status = %run.build_status, "Run saved");
        Ok(())
    }
}

#[async_trait]
impl SettingsStore for PgStore {
    async fn get_trigger(&self, trigger_id: &str) -> StoreResult<Option<TriggerSettings>> {
        let mut conn = self.conn().await?;
        let row = iac_ci_settings::table
            .find(trigger_id)
            .select(SettingsRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;
        row.map(|r| serde_json::from_value(r.doc).map_err(StoreError::from))
            .transpose()
    }

    async fn query_triggers_by_repo(&self, repo_name: &str) -> StoreResult<Vec<TriggerSettings>> {
        let mut conn = self.conn().await?;
        let rows: Vec<SettingsRow> = iac_ci_settings::table
            .filter(iac_ci_settings::repo_name.eq(repo_name))
            .select(SettingsRow::as_select())
            .load(&mut conn)
            .await?;
        rows.into_iter()
            .map(|r| serde_json::from_value(r.doc).map_err(StoreError::from))
            .collect()
    }

    async fn put_trigger(&self, trigger: &TriggerSettings) -> StoreResult<()> {
        let row = SettingsRow {
            id: trigger.trigger_id.clone(),
            repo_name: trigger.repo_name.clone(),
            doc: serde_json::to_value(trigger)?,
            write_date: Utc::now(),
        };
        let mut conn = self.conn().await?;
        diesel::insert_into(iac_ci_settings::table)
            .values(&row)
            .on_conflict(iac_ci_settings::id)
            .do_update()
            .set(&row)
            .execute(&mut conn)
            .await?;
        Ok(())
    }
}
