//! Persistent state, SQLite via rusqlite (bundled).
//!
//! Storage: `<panbot_home>/panbot.db` by default.
//!
//! Three tables: `scheduled_jobs` (soft-deleted in place so
//! `last_fired_at` history survives removal and misfire detection keeps
//! working), `channel_state` (one row per bound channel, upserted after
//! every handled inbound event), and `channel_projects` (dynamic
//! channel↔project mappings created when a channel is auto-created for
//! a project).
//!
//! The design assumes a single writer process; two processes sharing
//! one database file must not run concurrently.

use std::path::Path;
use std::sync::Mutex;

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::router::ChannelState;
use crate::scheduler::ScheduledJob;

/// SQLite-backed store for jobs and channel state.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the database at `db_path`.
    pub fn open_path(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS scheduled_jobs (
                job_id             TEXT PRIMARY KEY,
                job_name           TEXT NOT NULL,
                cron_expression    TEXT NOT NULL,
                prompt             TEXT NOT NULL,
                target_channel_ids TEXT NOT NULL DEFAULT '',
                working_directory  TEXT NOT NULL,
                skill_name         TEXT,
                created_by         TEXT NOT NULL DEFAULT '',
                is_active          INTEGER NOT NULL DEFAULT 1,
                last_fired_at      TEXT,
                created_at         TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS channel_state (
                channel_id           TEXT PRIMARY KEY,
                project_slug         TEXT NOT NULL,
                current_directory    TEXT NOT NULL,
                agent_session_id     TEXT,
                last_response_marker TEXT,
                updated_at           TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS channel_projects (
                channel_id   TEXT PRIMARY KEY,
                project_slug TEXT NOT NULL,
                is_active    INTEGER NOT NULL DEFAULT 1,
                created_at   TEXT NOT NULL
            );",
        )?;

        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Open the database in a directory, using the default file name.
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        Self::open_path(&dir.join("panbot.db"))
    }

    // -- scheduled jobs --------------------------------------------------

    /// Insert or replace a job row.  Stores the *raw* crontab string.
    pub fn upsert_job(&self, job: &ScheduledJob) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("db poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO scheduled_jobs
             (job_id, job_name, cron_expression, prompt, target_channel_ids,
              working_directory, skill_name, created_by, is_active,
              last_fired_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, ?9, ?10)",
            params![
                job.job_id,
                job.job_name,
                job.cron_expression,
                job.prompt,
                job.target_channel_ids.join(","),
                job.working_directory.to_string_lossy(),
                job.skill_name,
                job.created_by,
                job.last_fired_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Soft-delete a job.  Returns true if a row was deactivated.
    pub fn deactivate_job(&self, job_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().expect("db poisoned");
        let n = conn.execute(
            "UPDATE scheduled_jobs SET is_active = 0 WHERE job_id = ?1 AND is_active = 1",
            params![job_id],
        )?;
        Ok(n > 0)
    }

    /// All active jobs, oldest first.
    pub fn active_jobs(&self) -> anyhow::Result<Vec<ScheduledJob>> {
        let conn = self.conn.lock().expect("db poisoned");
        let mut stmt = conn.prepare(
            "SELECT job_id, job_name, cron_expression, prompt, target_channel_ids,
                    working_directory, skill_name, created_by, last_fired_at
             FROM scheduled_jobs WHERE is_active = 1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map([], |row| {
            let targets: String = row.get(4)?;
            let wd: String = row.get(5)?;
            let last_fired: Option<String> = row.get(8)?;
            Ok(ScheduledJob {
                job_id: row.get(0)?,
                job_name: row.get(1)?,
                cron_expression: row.get(2)?,
                prompt: row.get(3)?,
                target_channel_ids: targets
                    .split(',')
                    .filter(|s| !s.trim().is_empty())
                    .map(|s| s.trim().to_string())
                    .collect(),
                working_directory: wd.into(),
                skill_name: row.get(6)?,
                created_by: row.get(7)?,
                last_fired_at: last_fired.and_then(parse_rfc3339),
            })
        })?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    /// Durably record a fire time for `job_id`.
    pub fn set_last_fired(&self, job_id: &str, at: DateTime<Utc>) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("db poisoned");
        conn.execute(
            "UPDATE scheduled_jobs SET last_fired_at = ?1 WHERE job_id = ?2 AND is_active = 1",
            params![at.to_rfc3339(), job_id],
        )?;
        Ok(())
    }

    // -- channel state ---------------------------------------------------

    /// Load persisted state for a channel, if any.
    pub fn load_channel_state(&self, channel_id: &str) -> anyhow::Result<Option<ChannelState>> {
        let conn = self.conn.lock().expect("db poisoned");
        let state = conn
            .query_row(
                "SELECT channel_id, project_slug, current_directory,
                        agent_session_id, last_response_marker
                 FROM channel_state WHERE channel_id = ?1",
                params![channel_id],
                |row| {
                    let dir: String = row.get(2)?;
                    Ok(ChannelState {
                        channel_id: row.get(0)?,
                        project_slug: row.get(1)?,
                        current_directory: dir.into(),
                        agent_session_id: row.get(3)?,
                        last_response_marker: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    /// Upsert the state row for a channel.
    pub fn save_channel_state(&self, state: &ChannelState) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("db poisoned");
        conn.execute(
            "INSERT INTO channel_state
             (channel_id, project_slug, current_directory, agent_session_id,
              last_response_marker, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(channel_id) DO UPDATE SET
               project_slug=?2, current_directory=?3, agent_session_id=?4,
               last_response_marker=?5, updated_at=?6",
            params![
                state.channel_id,
                state.project_slug,
                state.current_directory.to_string_lossy(),
                state.agent_session_id,
                state.last_response_marker,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Null out the agent session for a channel, keeping the rest of
    /// its state.  Returns true if a row was touched.
    pub fn clear_session(&self, channel_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().expect("db poisoned");
        let n = conn.execute(
            "UPDATE channel_state SET agent_session_id = NULL, updated_at = ?1
             WHERE channel_id = ?2",
            params![Utc::now().to_rfc3339(), channel_id],
        )?;
        Ok(n > 0)
    }

    /// Delete the state row for a channel (explicit session reset only).
    pub fn delete_channel_state(&self, channel_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().expect("db poisoned");
        let n = conn.execute(
            "DELETE FROM channel_state WHERE channel_id = ?1",
            params![channel_id],
        )?;
        Ok(n > 0)
    }

    // -- dynamic channel↔project mappings --------------------------------

    /// Record that `channel_id` was bound to `project_slug`.
    pub fn map_channel(&self, channel_id: &str, project_slug: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("db poisoned");
        conn.execute(
            "INSERT INTO channel_projects (channel_id, project_slug, is_active, created_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(channel_id) DO UPDATE SET project_slug=?2, is_active=1",
            params![channel_id, project_slug, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Project slug dynamically mapped to a channel, if any.
    pub fn project_for_channel(&self, channel_id: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().expect("db poisoned");
        let slug = conn
            .query_row(
                "SELECT project_slug FROM channel_projects
                 WHERE channel_id = ?1 AND is_active = 1",
                params![channel_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(slug)
    }

    /// Channel dynamically mapped to a project, if any.
    pub fn channel_for_project(&self, project_slug: &str) -> anyhow::Result<Option<String>> {
        let conn = self.conn.lock().expect("db poisoned");
        let id = conn
            .query_row(
                "SELECT channel_id FROM channel_projects
                 WHERE project_slug = ?1 AND is_active = 1",
                params![project_slug],
                |row| row.get(0),
            )
            .optional()?;
        Ok(id)
    }
}

fn parse_rfc3339(s: String) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
