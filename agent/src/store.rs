//! # Frame Store (§4.2)
//!
//! Persistent repository of frame records, their optional config blob, and
//! an append-only lifecycle event log, backed by `sqlx`'s SQLite runtime —
//! adapted from `acton-service`'s Postgres-backed repository pattern
//! (`acton-service/src/repository/mod.rs`) to the local, single-writer
//! store needed here (§5 "Shared resources"). Schema creation runs
//! `CREATE TABLE IF NOT EXISTS` on open, so it is idempotent by
//! construction (§8 "Schema initialization: running it twice is a no-op").
//!
//! All frame-plus-config writes go through a single `sqlx` transaction so a
//! partial failure never leaves an orphaned config row or half-created
//! frame (§4.2).

use std::collections::HashSet;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqlitePool};

use crate::error::AgentError;

/// §3 "Frame" status domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameStatus {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl FrameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameStatus::Created => "created",
            FrameStatus::Starting => "starting",
            FrameStatus::Running => "running",
            FrameStatus::Stopping => "stopping",
            FrameStatus::Stopped => "stopped",
            FrameStatus::Error => "error",
        }
    }
}

impl FromStr for FrameStatus {
    type Err = AgentError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "created" => FrameStatus::Created,
            "starting" => FrameStatus::Starting,
            "running" => FrameStatus::Running,
            "stopping" => FrameStatus::Stopping,
            "stopped" => FrameStatus::Stopped,
            "error" => FrameStatus::Error,
            other => return Err(AgentError::External(format!("unknown frame status {other}"))),
        })
    }
}

/// §3 "Frame".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub id: String,
    pub name: String,
    pub description: String,
    pub workspace_path: String,
    pub container_id: Option<String>,
    pub status: FrameStatus,
    pub host_port: Option<u16>,
    pub template_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_active: Option<DateTime<Utc>>,
}

impl Frame {
    fn from_row(row: &SqliteRow) -> Result<Self, AgentError> {
        let status: String = row.try_get("status")?;
        let host_port: Option<i64> = row.try_get("host_port")?;
        Ok(Frame {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            workspace_path: row.try_get("workspace_path")?,
            container_id: row.try_get("container_id")?,
            status: FrameStatus::from_str(&status)?,
            host_port: host_port.map(|p| p as u16),
            template_name: row.try_get("template_name")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
            last_active: row.try_get("last_active")?,
        })
    }
}

/// Fields the supervisor may mutate on an existing frame (§4.2
/// `updateFrame(id, partial)`). `None` leaves the column untouched; only
/// `container_id`/`last_active` support clearing, via their own `Some(None)`.
#[derive(Debug, Default)]
pub struct FrameUpdate {
    pub status: Option<FrameStatus>,
    pub container_id: Option<Option<String>>,
    pub host_port: Option<Option<u16>>,
    pub last_active: Option<Option<DateTime<Utc>>>,
}

/// §3 "Frame configuration".
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FrameConfig {
    pub provider: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub temperature: Option<f64>,
    pub api_key: Option<String>,
    pub service_port: Option<u16>,
    pub additional_ports: Vec<u16>,
    pub flags: serde_json::Value,
}

/// §3 "Frame lifecycle event" kind domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Started,
    Stopped,
    Error,
    ConfigChanged,
    Destroyed,
}

impl EventKind {
    fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Started => "started",
            EventKind::Stopped => "stopped",
            EventKind::Error => "error",
            EventKind::ConfigChanged => "config_changed",
            EventKind::Destroyed => "destroyed",
        }
    }

    fn from_str(s: &str) -> Self {
        match s {
            "started" => EventKind::Started,
            "stopped" => EventKind::Stopped,
            "error" => EventKind::Error,
            "config_changed" => EventKind::ConfigChanged,
            "destroyed" => EventKind::Destroyed,
            _ => EventKind::Created,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameEvent {
    pub id: i64,
    pub frame_id: String,
    pub kind: EventKind,
    pub detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Input to `createFrame` (§4.7).
pub struct NewFrame {
    pub name: String,
    pub description: String,
    pub workspace_path: String,
}

pub struct FrameStore {
    pool: SqlitePool,
}

impl FrameStore {
    /// Connects using an arbitrary `sqlx` SQLite URL, e.g. `sqlite::memory:`
    /// in tests, a plain `sqlite://<path>?mode=rwc`, or a `DATABASE_URL`
    /// override (§6 "Environment (home side)") — [`crate::config::AgentConfig::db_url`]
    /// builds the production value.
    pub async fn connect(url: &str) -> Result<Self, AgentError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1) // single-writer discipline (§5)
            .connect(url)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), AgentError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS frames (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                description TEXT NOT NULL DEFAULT '',
                workspace_path TEXT NOT NULL,
                container_id TEXT,
                status TEXT NOT NULL,
                host_port INTEGER UNIQUE,
                template_name TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                last_active TEXT
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS frame_configs (
                frame_id TEXT PRIMARY KEY REFERENCES frames(id),
                provider TEXT,
                model TEXT,
                base_url TEXT,
                temperature REAL,
                api_key TEXT,
                service_port INTEGER,
                additional_ports TEXT NOT NULL DEFAULT '[]',
                flags TEXT NOT NULL DEFAULT '{}'
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS frame_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                frame_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                detail TEXT,
                created_at TEXT NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Frames ───────────────────────────────────────────────────

    /// Creates the frame row in `created` status and appends its `created`
    /// event in one transaction (§4.2 "transactional").
    pub async fn create_frame(
        &self,
        input: NewFrame,
        host_port: Option<u16>,
        template_name: Option<String>,
    ) -> Result<Frame, AgentError> {
        if self.get_frame_by_name(&input.name).await?.is_some() {
            return Err(AgentError::Validation(format!("frame name '{}' already exists", input.name)));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO frames (id, name, description, workspace_path, container_id, status, host_port, template_name, created_at, updated_at, last_active) \
             VALUES (?, ?, ?, ?, NULL, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(&id)
        .bind(&input.name)
        .bind(&input.description)
        .bind(&input.workspace_path)
        .bind(FrameStatus::Created.as_str())
        .bind(host_port.map(|p| p as i64))
        .bind(&template_name)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let detail = serde_json::json!({ "workspacePath": input.workspace_path, "hostPort": host_port });
        sqlx::query("INSERT INTO frame_events (frame_id, kind, detail, created_at) VALUES (?, ?, ?, ?)")
            .bind(&id)
            .bind(EventKind::Created.as_str())
            .bind(detail.to_string())
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        self.get_frame(&id).await?.ok_or_else(|| AgentError::External("frame vanished after insert".into()))
    }

    pub async fn get_frame(&self, id: &str) -> Result<Option<Frame>, AgentError> {
        let row = sqlx::query("SELECT * FROM frames WHERE id = ?").bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Frame::from_row).transpose()
    }

    pub async fn get_frame_by_name(&self, name: &str) -> Result<Option<Frame>, AgentError> {
        let row = sqlx::query("SELECT * FROM frames WHERE name = ?").bind(name).fetch_optional(&self.pool).await?;
        row.as_ref().map(Frame::from_row).transpose()
    }

    /// Newest-first (§4.2 "Listing is ordered by creation time, newest
    /// first"), optionally filtered to one status.
    pub async fn list_frames(&self, status: Option<FrameStatus>) -> Result<Vec<Frame>, AgentError> {
        let rows = match status {
            Some(s) => {
                sqlx::query("SELECT * FROM frames WHERE status = ? ORDER BY created_at DESC")
                    .bind(s.as_str())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => sqlx::query("SELECT * FROM frames ORDER BY created_at DESC").fetch_all(&self.pool).await?,
        };
        rows.iter().map(Frame::from_row).collect()
    }

    pub async fn update_frame(&self, id: &str, update: FrameUpdate) -> Result<(), AgentError> {
        let Some(frame) = self.get_frame(id).await? else {
            return Err(AgentError::Validation(format!("no frame {id}")));
        };

        let status = update.status.unwrap_or(frame.status);
        let container_id = update.container_id.unwrap_or(frame.container_id);
        let host_port = update.host_port.unwrap_or(frame.host_port);
        let last_active = update.last_active.unwrap_or(frame.last_active);

        sqlx::query(
            "UPDATE frames SET status = ?, container_id = ?, host_port = ?, last_active = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(&container_id)
        .bind(host_port.map(|p| p as i64))
        .bind(last_active)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Deletes a frame, cascading to its config and events (§4.2, §4.7
    /// `destroyFrame`: the `destroyed` event is appended by the caller
    /// before this runs, so it is visible in history after the row is gone).
    pub async fn delete_frame(&self, id: &str) -> Result<(), AgentError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM frame_configs WHERE frame_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM frame_events WHERE frame_id = ?").bind(id).execute(&mut *tx).await?;
        sqlx::query("DELETE FROM frames WHERE id = ?").bind(id).execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn all_allocated_ports(&self) -> Result<HashSet<u16>, AgentError> {
        let rows = sqlx::query("SELECT host_port FROM frames WHERE host_port IS NOT NULL").fetch_all(&self.pool).await?;
        rows.iter().map(|r| r.try_get::<i64, _>("host_port").map(|p| p as u16).map_err(Into::into)).collect()
    }

    // ── Config ───────────────────────────────────────────────────

    pub async fn get_frame_config(&self, frame_id: &str) -> Result<Option<FrameConfig>, AgentError> {
        let row = sqlx::query("SELECT * FROM frame_configs WHERE frame_id = ?")
            .bind(frame_id)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };

        let additional_ports_text: String = row.try_get("additional_ports")?;
        let flags_text: String = row.try_get("flags")?;
        let service_port: Option<i64> = row.try_get("service_port")?;

        Ok(Some(FrameConfig {
            provider: row.try_get("provider")?,
            model: row.try_get("model")?,
            base_url: row.try_get("base_url")?,
            temperature: row.try_get("temperature")?,
            api_key: row.try_get("api_key")?,
            service_port: service_port.map(|p| p as u16),
            additional_ports: serde_json::from_str(&additional_ports_text).unwrap_or_default(),
            flags: serde_json::from_str(&flags_text).unwrap_or(serde_json::json!({})),
        }))
    }

    /// Upserts the frame's config and appends a `config_changed` event
    /// (§4.7 `updateFrameConfig`).
    pub async fn set_frame_config(&self, frame_id: &str, config: &FrameConfig) -> Result<(), AgentError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO frame_configs (frame_id, provider, model, base_url, temperature, api_key, service_port, additional_ports, flags) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(frame_id) DO UPDATE SET provider=excluded.provider, model=excluded.model, base_url=excluded.base_url, \
             temperature=excluded.temperature, api_key=excluded.api_key, service_port=excluded.service_port, \
             additional_ports=excluded.additional_ports, flags=excluded.flags",
        )
        .bind(frame_id)
        .bind(&config.provider)
        .bind(&config.model)
        .bind(&config.base_url)
        .bind(config.temperature)
        .bind(&config.api_key)
        .bind(config.service_port.map(|p| p as i64))
        .bind(serde_json::to_string(&config.additional_ports).unwrap_or_else(|_| "[]".into()))
        .bind(config.flags.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO frame_events (frame_id, kind, detail, created_at) VALUES (?, ?, NULL, ?)")
            .bind(frame_id)
            .bind(EventKind::ConfigChanged.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    // ── Events ───────────────────────────────────────────────────

    pub async fn append_event(
        &self,
        frame_id: &str,
        kind: EventKind,
        detail: Option<serde_json::Value>,
    ) -> Result<(), AgentError> {
        sqlx::query("INSERT INTO frame_events (frame_id, kind, detail, created_at) VALUES (?, ?, ?, ?)")
            .bind(frame_id)
            .bind(kind.as_str())
            .bind(detail.map(|d| d.to_string()))
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Newest-first with a caller-supplied limit (§4.2).
    pub async fn get_frame_events(&self, frame_id: &str, limit: u32) -> Result<Vec<FrameEvent>, AgentError> {
        let rows = sqlx::query("SELECT * FROM frame_events WHERE frame_id = ? ORDER BY id DESC LIMIT ?")
            .bind(frame_id)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        rows.iter()
            .map(|row| {
                let kind: String = row.try_get("kind")?;
                let detail_text: Option<String> = row.try_get("detail")?;
                Ok(FrameEvent {
                    id: row.try_get("id")?,
                    frame_id: row.try_get("frame_id")?,
                    kind: EventKind::from_str(&kind),
                    detail: detail_text.and_then(|t| serde_json::from_str(&t).ok()),
                    created_at: row.try_get("created_at")?,
                })
            })
            .collect::<Result<Vec<_>, AgentError>>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> FrameStore {
        FrameStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn schema_init_twice_is_a_noop() {
        let store = test_store().await;
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();
    }

    #[tokio::test]
    async fn create_frame_rejects_duplicate_name() {
        let store = test_store().await;
        store
            .create_frame(
                NewFrame { name: "alpha".into(), description: "".into(), workspace_path: "/tmp/ws".into() },
                Some(33000),
                None,
            )
            .await
            .unwrap();

        let err = store
            .create_frame(
                NewFrame { name: "alpha".into(), description: "".into(), workspace_path: "/tmp/ws2".into() },
                Some(33001),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Validation(_)));
    }

    #[tokio::test]
    async fn create_frame_emits_single_created_event() {
        let store = test_store().await;
        let frame = store
            .create_frame(
                NewFrame { name: "alpha".into(), description: "".into(), workspace_path: "/tmp/ws-alpha".into() },
                Some(33000),
                None,
            )
            .await
            .unwrap();

        assert_eq!(frame.status, FrameStatus::Created);
        let events = store.get_frame_events(&frame.id, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Created);
    }

    #[tokio::test]
    async fn delete_frame_cascades() {
        let store = test_store().await;
        let frame = store
            .create_frame(
                NewFrame { name: "alpha".into(), description: "".into(), workspace_path: "/tmp/ws".into() },
                Some(33000),
                None,
            )
            .await
            .unwrap();
        store.set_frame_config(&frame.id, &FrameConfig::default()).await.unwrap();

        store.delete_frame(&frame.id).await.unwrap();
        assert!(store.get_frame(&frame.id).await.unwrap().is_none());
        assert!(store.get_frame_config(&frame.id).await.unwrap().is_none());
        assert!(store.get_frame_events(&frame.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_frames_orders_newest_first() {
        let store = test_store().await;
        store
            .create_frame(NewFrame { name: "a".into(), description: "".into(), workspace_path: "/tmp/a".into() }, Some(33000), None)
            .await
            .unwrap();
        store
            .create_frame(NewFrame { name: "b".into(), description: "".into(), workspace_path: "/tmp/b".into() }, Some(33001), None)
            .await
            .unwrap();

        let frames = store.list_frames(None).await.unwrap();
        assert_eq!(frames[0].name, "b");
        assert_eq!(frames[1].name, "a");
    }

    #[tokio::test]
    async fn allocated_ports_reflect_store_state() {
        let store = test_store().await;
        store
            .create_frame(NewFrame { name: "a".into(), description: "".into(), workspace_path: "/tmp/a".into() }, Some(33000), None)
            .await
            .unwrap();
        store
            .create_frame(NewFrame { name: "b".into(), description: "".into(), workspace_path: "/tmp/b".into() }, Some(33002), None)
            .await
            .unwrap();

        let ports = store.all_allocated_ports().await.unwrap();
        assert_eq!(ports, [33000, 33002].into_iter().collect());
    }
}
