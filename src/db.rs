use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::models::{AgentRecord, AgentStatus, HookEventRecord};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    pid INTEGER,
    cwd TEXT NOT NULL DEFAULT '',
    parent_id TEXT,
    template_id TEXT,
    status TEXT NOT NULL DEFAULT 'spawning',
    session_path TEXT,
    initial_prompt TEXT,
    spawned_at TEXT NOT NULL,
    last_activity TEXT NOT NULL,
    completed_at TEXT,
    exit_code INTEGER,
    error_message TEXT
);

CREATE TABLE IF NOT EXISTS hook_events (
    id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    session_id TEXT NOT NULL DEFAULT '',
    project_path TEXT NOT NULL DEFAULT '',
    tool_name TEXT,
    tool_input TEXT,
    tool_result TEXT,
    blocked INTEGER NOT NULL DEFAULT 0,
    block_reason TEXT,
    duration_ms INTEGER,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_agents_status ON agents(status);
CREATE INDEX IF NOT EXISTS idx_agents_parent_id ON agents(parent_id);
CREATE INDEX IF NOT EXISTS idx_agents_session_path ON agents(session_path);
CREATE INDEX IF NOT EXISTS idx_hook_events_session_id ON hook_events(session_id);
"#;

// No foreign key from agents.parent_id back to agents.id: children keep their
// parent reference after the parent record is terminated or deleted.

pub async fn init_db(pool: &SqlitePool) -> Result<()> {
    // sqlx::query does not support multiple statements; split and execute each.
    for statement in SCHEMA.split(';') {
        let trimmed = statement.trim();
        if trimmed.is_empty() {
            continue;
        }
        sqlx::query(trimmed).execute(pool).await?;
    }
    Ok(())
}

/// Append one audit row. Never updated afterwards.
pub async fn record_hook_event(pool: &SqlitePool, record: &HookEventRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO hook_events
            (id, event_type, session_id, project_path, tool_name, tool_input,
             tool_result, blocked, block_reason, duration_ms, timestamp)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.id)
    .bind(&record.event_type)
    .bind(&record.session_id)
    .bind(&record.project_path)
    .bind(&record.tool_name)
    .bind(&record.tool_input)
    .bind(&record.tool_result)
    .bind(record.blocked)
    .bind(&record.block_reason)
    .bind(record.duration_ms)
    .bind(record.timestamp.to_rfc3339())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn count_hook_events(pool: &SqlitePool, session_id: &str) -> Result<i64> {
    let row = sqlx::query("SELECT COUNT(*) AS n FROM hook_events WHERE session_id = ?")
        .bind(session_id)
        .fetch_one(pool)
        .await?;
    Ok(row.get("n"))
}

pub async fn register_agent(pool: &SqlitePool, agent: &AgentRecord) -> Result<()> {
    save_agent(pool, agent).await
}

/// Insert-or-update by id. All mutable fields are written; the registry's
/// in-memory record is the source of truth for what goes in.
pub async fn save_agent(pool: &SqlitePool, agent: &AgentRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO agents
            (id, name, pid, cwd, parent_id, template_id, status, session_path,
             initial_prompt, spawned_at, last_activity, completed_at, exit_code, error_message)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            pid = excluded.pid,
            cwd = excluded.cwd,
            parent_id = excluded.parent_id,
            template_id = excluded.template_id,
            status = excluded.status,
            session_path = excluded.session_path,
            initial_prompt = excluded.initial_prompt,
            last_activity = excluded.last_activity,
            completed_at = excluded.completed_at,
            exit_code = excluded.exit_code,
            error_message = excluded.error_message
        "#,
    )
    .bind(&agent.id)
    .bind(&agent.name)
    .bind(agent.pid)
    .bind(&agent.cwd)
    .bind(&agent.parent_id)
    .bind(&agent.template_id)
    .bind(agent.status.as_str())
    .bind(&agent.session_path)
    .bind(&agent.initial_prompt)
    .bind(agent.spawned_at.to_rfc3339())
    .bind(agent.last_activity.to_rfc3339())
    .bind(agent.completed_at.map(|t| t.to_rfc3339()))
    .bind(agent.exit_code)
    .bind(&agent.error_message)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_agent(pool: &SqlitePool, id: &str) -> Result<Option<AgentRecord>> {
    let row = sqlx::query("SELECT * FROM agents WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| agent_from_row(&r)).transpose()
}

pub async fn get_agents_by_parent(pool: &SqlitePool, parent_id: &str) -> Result<Vec<AgentRecord>> {
    let rows = sqlx::query("SELECT * FROM agents WHERE parent_id = ? ORDER BY spawned_at ASC")
        .bind(parent_id)
        .fetch_all(pool)
        .await?;
    rows.iter().map(agent_from_row).collect()
}

pub async fn get_active_agents(pool: &SqlitePool) -> Result<Vec<AgentRecord>> {
    let rows = sqlx::query(
        r#"
        SELECT * FROM agents
        WHERE status IN ('spawning', 'ready', 'active', 'idle')
        ORDER BY spawned_at ASC
        "#,
    )
    .fetch_all(pool)
    .await?;
    rows.iter().map(agent_from_row).collect()
}

pub async fn get_all_agents(pool: &SqlitePool) -> Result<Vec<AgentRecord>> {
    let rows = sqlx::query("SELECT * FROM agents ORDER BY spawned_at ASC")
        .fetch_all(pool)
        .await?;
    rows.iter().map(agent_from_row).collect()
}

pub async fn update_agent_status(pool: &SqlitePool, id: &str, status: AgentStatus) -> Result<()> {
    sqlx::query("UPDATE agents SET status = ?, last_activity = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_agent_activity(pool: &SqlitePool, id: &str) -> Result<()> {
    sqlx::query("UPDATE agents SET last_activity = ? WHERE id = ?")
        .bind(Utc::now().to_rfc3339())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn complete_agent(
    pool: &SqlitePool,
    id: &str,
    status: AgentStatus,
    exit_code: Option<i64>,
    error_message: Option<&str>,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    sqlx::query(
        r#"
        UPDATE agents
        SET status = ?, exit_code = ?, error_message = ?, completed_at = ?, last_activity = ?
        WHERE id = ?
        "#,
    )
    .bind(status.as_str())
    .bind(exit_code)
    .bind(error_message)
    .bind(&now)
    .bind(&now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn delete_all_agents(pool: &SqlitePool) -> Result<u64> {
    let result = sqlx::query("DELETE FROM agents").execute(pool).await?;
    Ok(result.rows_affected())
}

/// Lookup by transcript correlation. The session id is embedded in the
/// transcript path, so a containment match covers lookups by bare session id.
/// `%` and `_` in the id are escaped so they match literally.
pub async fn find_agent_by_session(pool: &SqlitePool, session: &str) -> Result<Option<AgentRecord>> {
    let escaped = session
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    let row = sqlx::query(
        r#"
        SELECT * FROM agents
        WHERE (session_path = ? OR session_path LIKE '%' || ? || '%' ESCAPE '\')
          AND status NOT IN ('completed', 'error', 'terminated')
        ORDER BY spawned_at DESC
        LIMIT 1
        "#,
    )
    .bind(session)
    .bind(&escaped)
    .fetch_optional(pool)
    .await?;
    row.map(|r| agent_from_row(&r)).transpose()
}

/// Delete terminal-state rows older than the cutoff.
pub async fn cleanup_stale_agents(pool: &SqlitePool, cutoff: DateTime<Utc>) -> Result<u64> {
    let result = sqlx::query(
        r#"
        DELETE FROM agents
        WHERE status IN ('completed', 'error', 'terminated')
          AND datetime(last_activity) <= datetime(?)
        "#,
    )
    .bind(cutoff.to_rfc3339())
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// Delete the rows the registry flagged as garbage (tool invocations recorded
/// as agents, or aged orphans). Selection happens in memory; this applies it.
pub async fn cleanup_garbage_agents(pool: &SqlitePool, ids: &[String]) -> Result<u64> {
    let mut removed = 0;
    for id in ids {
        let result = sqlx::query("DELETE FROM agents WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await?;
        removed += result.rows_affected();
    }
    Ok(removed)
}

fn agent_from_row(row: &SqliteRow) -> Result<AgentRecord> {
    let status: String = row.get("status");
    let spawned_at: String = row.get("spawned_at");
    let last_activity: String = row.get("last_activity");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(AgentRecord {
        id: row.get("id"),
        name: row.get("name"),
        pid: row.get("pid"),
        cwd: row.get("cwd"),
        parent_id: row.get("parent_id"),
        template_id: row.get("template_id"),
        status: status.parse()?,
        session_path: row.get("session_path"),
        initial_prompt: row.get("initial_prompt"),
        spawned_at: parse_timestamp(&spawned_at),
        last_activity: parse_timestamp(&last_activity),
        completed_at: completed_at.as_deref().map(parse_timestamp),
        exit_code: row.get("exit_code"),
        error_message: row.get("error_message"),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    raw.parse().unwrap_or_else(|_| Utc::now())
}

/// In-memory pool for tests.
pub async fn memory_pool() -> SqlitePool {
    use sqlx::sqlite::SqlitePoolOptions;

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    init_db(&pool).await.expect("schema init");
    pool
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn record(name: &str, session_path: Option<&str>) -> AgentRecord {
        let now = Utc::now();
        AgentRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            pid: None,
            cwd: "/work".to_string(),
            parent_id: None,
            template_id: None,
            status: AgentStatus::Spawning,
            session_path: session_path.map(str::to_string),
            initial_prompt: None,
            spawned_at: now,
            last_activity: now,
            completed_at: None,
            exit_code: None,
            error_message: None,
        }
    }

    #[tokio::test]
    async fn round_trips_an_agent() {
        let pool = memory_pool().await;
        let agent = record("worker", Some("/tmp/abc.jsonl"));
        register_agent(&pool, &agent).await.unwrap();

        let loaded = get_agent(&pool, &agent.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "worker");
        assert_eq!(loaded.status, AgentStatus::Spawning);
        assert_eq!(loaded.session_path.as_deref(), Some("/tmp/abc.jsonl"));
    }

    #[tokio::test]
    async fn finds_agent_by_embedded_session_id() {
        let pool = memory_pool().await;
        let agent = record("worker", Some("/tmp/sess-42.jsonl"));
        register_agent(&pool, &agent).await.unwrap();

        let found = find_agent_by_session(&pool, "sess-42").await.unwrap();
        assert_eq!(found.map(|a| a.id), Some(agent.id.clone()));

        complete_agent(&pool, &agent.id, AgentStatus::Completed, Some(0), None)
            .await
            .unwrap();
        assert!(find_agent_by_session(&pool, "sess-42")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn session_lookup_treats_wildcards_literally() {
        let pool = memory_pool().await;
        let agent = record("worker", Some("/tmp/sess-42.jsonl"));
        register_agent(&pool, &agent).await.unwrap();

        // `%` and `_` in the id must not match everything.
        assert!(find_agent_by_session(&pool, "%").await.unwrap().is_none());
        assert!(find_agent_by_session(&pool, "sess-4_")
            .await
            .unwrap()
            .is_none());

        let literal = record("underscore", Some("/tmp/sess_7.jsonl"));
        register_agent(&pool, &literal).await.unwrap();
        let found = find_agent_by_session(&pool, "sess_7").await.unwrap();
        assert_eq!(found.map(|a| a.id), Some(literal.id));
    }

    #[tokio::test]
    async fn stale_cleanup_only_touches_terminal_rows() {
        let pool = memory_pool().await;
        let mut done = record("done", None);
        done.status = AgentStatus::Completed;
        let live = record("live", None);
        register_agent(&pool, &done).await.unwrap();
        register_agent(&pool, &live).await.unwrap();

        let removed = cleanup_stale_agents(&pool, Utc::now() + chrono::Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(get_agent(&pool, &live.id).await.unwrap().is_some());
    }
}
