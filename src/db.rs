use crate::models::*;
use anyhow::Result;
use chrono::{Duration, Utc};
use sqlx::{Pool, Postgres, Row};
use std::collections::HashMap;
use uuid::Uuid;

/// Initialize database schema
pub async fn init_schema(pool: &Pool<Postgres>) -> Result<()> {
    // ============================================================
    // Users table
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id UUID PRIMARY KEY,
            email TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            profile JSONB NOT NULL DEFAULT '{}',
            emotional_log JSONB NOT NULL DEFAULT '[]',
            subscribed BOOLEAN NOT NULL DEFAULT FALSE,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Memory messages table (24h working memory)
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS memory_messages (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_memory_user_time ON memory_messages(user_id, created_at DESC)",
    )
    .execute(pool)
    .await?;

    // ============================================================
    // Tasks table
    // ============================================================
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tasks (
            id UUID PRIMARY KEY,
            user_id UUID NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            task_type TEXT NOT NULL,
            parameters JSONB NOT NULL DEFAULT '{}',
            status TEXT NOT NULL DEFAULT 'queued',
            priority INT NOT NULL DEFAULT 0,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            result TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_tasks_runnable ON tasks(status, run_at, priority DESC, created_at)",
    )
    .execute(pool)
    .await?;

    tracing::info!("Database schema initialized");
    Ok(())
}

// ============================================================
// User CRUD
// ============================================================

fn map_user(row: &sqlx::postgres::PgRow) -> User {
    User {
        id: row.get("id"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        profile: serde_json::from_value(row.get("profile")).unwrap_or_default(),
        emotional_log: serde_json::from_value(row.get("emotional_log")).unwrap_or_default(),
        subscribed: row.get("subscribed"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const USER_COLUMNS: &str =
    "id, email, password_hash, profile, emotional_log, subscribed, created_at, updated_at";

/// Create a user. Email is case-folded here so uniqueness holds at write.
pub async fn create_user(pool: &Pool<Postgres>, email: &str, password_hash: &str) -> Result<User> {
    let user = User {
        id: Uuid::new_v4(),
        email: email.trim().to_lowercase(),
        password_hash: password_hash.to_string(),
        profile: HashMap::new(),
        emotional_log: vec![],
        subscribed: false,
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };

    sqlx::query(
        r#"
        INSERT INTO users (id, email, password_hash, profile, emotional_log, subscribed, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(user.id)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(serde_json::to_value(&user.profile)?)
    .bind(serde_json::to_value(&user.emotional_log)?)
    .bind(user.subscribed)
    .bind(user.created_at)
    .bind(user.updated_at)
    .execute(pool)
    .await?;

    Ok(user)
}

pub async fn get_user(pool: &Pool<Postgres>, id: Uuid) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE id = $1", USER_COLUMNS))
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(map_user))
}

pub async fn get_user_by_email(pool: &Pool<Postgres>, email: &str) -> Result<Option<User>> {
    let row = sqlx::query(&format!("SELECT {} FROM users WHERE email = $1", USER_COLUMNS))
        .bind(email.trim().to_lowercase())
        .fetch_optional(pool)
        .await?;
    Ok(row.as_ref().map(map_user))
}

/// Merge entries into the profile mapping (jsonb concatenation).
pub async fn merge_profile(
    pool: &Pool<Postgres>,
    id: Uuid,
    entries: &HashMap<String, String>,
) -> Result<()> {
    sqlx::query("UPDATE users SET profile = profile || $2, updated_at = NOW() WHERE id = $1")
        .bind(id)
        .bind(serde_json::to_value(entries)?)
        .execute(pool)
        .await?;
    Ok(())
}

/// Append one entry to the emotional log. Append-only; never edited.
pub async fn append_emotion(pool: &Pool<Postgres>, id: Uuid, entry: &EmotionEntry) -> Result<()> {
    sqlx::query(
        "UPDATE users SET emotional_log = emotional_log || $2, updated_at = NOW() WHERE id = $1",
    )
    .bind(id)
    .bind(serde_json::to_value(vec![entry])?)
    .execute(pool)
    .await?;
    Ok(())
}

// ============================================================
// Memory
// ============================================================

/// Append the user/assistant pair for one completion in a single batch.
/// The assistant row gets a strictly later timestamp so timestamp-ordered
/// reads always see the pair in issue order.
pub async fn append_memory_pair(
    pool: &Pool<Postgres>,
    user_id: Uuid,
    user_content: &str,
    assistant_content: &str,
) -> Result<()> {
    let user_at = Utc::now();
    let assistant_at = user_at + Duration::milliseconds(1);

    sqlx::query(
        r#"
        INSERT INTO memory_messages (id, user_id, role, content, created_at)
        VALUES ($1, $2, 'user', $3, $4), ($5, $2, 'assistant', $6, $7)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(user_content)
    .bind(user_at)
    .bind(Uuid::new_v4())
    .bind(assistant_content)
    .bind(assistant_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Most recent memory first; callers reverse to chronological for use.
pub async fn recent_memory(
    pool: &Pool<Postgres>,
    user_id: Uuid,
    limit: i64,
) -> Result<Vec<MemoryMessage>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, role, content, created_at
        FROM memory_messages
        WHERE user_id = $1
        ORDER BY created_at DESC
        LIMIT $2
        "#,
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .iter()
        .map(|r| MemoryMessage {
            id: r.get("id"),
            user_id: r.get("user_id"),
            role: r.get("role"),
            content: r.get("content"),
            created_at: r.get("created_at"),
        })
        .collect())
}

/// Drop memory past the retention window. Returns rows removed.
pub async fn purge_expired_memory(pool: &Pool<Postgres>, retention_hours: i64) -> Result<u64> {
    let cutoff = Utc::now() - Duration::hours(retention_hours);
    let result = sqlx::query("DELETE FROM memory_messages WHERE created_at < $1")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

// ============================================================
// Tasks
// ============================================================

pub async fn create_task(pool: &Pool<Postgres>, task: &Task) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO tasks (id, user_id, task_type, parameters, status, priority, created_at, run_at, result)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        "#,
    )
    .bind(task.id)
    .bind(task.user_id)
    .bind(&task.task_type)
    .bind(serde_json::to_value(&task.parameters)?)
    .bind(task.status.as_str())
    .bind(task.priority)
    .bind(task.created_at)
    .bind(task.run_at)
    .bind(&task.result)
    .execute(pool)
    .await?;
    Ok(())
}

fn map_task(row: &sqlx::postgres::PgRow) -> Task {
    Task {
        id: row.get("id"),
        user_id: row.get("user_id"),
        task_type: row.get("task_type"),
        parameters: serde_json::from_value(row.get("parameters")).unwrap_or_default(),
        status: TaskStatus::parse(row.get::<String, _>("status").as_str())
            .unwrap_or(TaskStatus::Failed),
        priority: row.get("priority"),
        created_at: row.get("created_at"),
        run_at: row.get("run_at"),
        result: row.get("result"),
    }
}

/// Queued tasks that are due, highest priority first then oldest first.
pub async fn due_tasks(pool: &Pool<Postgres>, limit: i64) -> Result<Vec<Task>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, task_type, parameters, status, priority, created_at, run_at, result
        FROM tasks
        WHERE status = 'queued' AND run_at <= NOW()
        ORDER BY priority DESC, created_at ASC
        LIMIT $1
        "#,
    )
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(rows.iter().map(map_task).collect())
}

/// Compare-and-set claim: queued → processing. False when another
/// worker already owns the task.
pub async fn claim_task(pool: &Pool<Postgres>, id: Uuid) -> Result<bool> {
    let result =
        sqlx::query("UPDATE tasks SET status = 'processing' WHERE id = $1 AND status = 'queued'")
            .bind(id)
            .execute(pool)
            .await?;
    Ok(result.rows_affected() == 1)
}

/// Terminal transition out of `processing` with a result string.
pub async fn finish_task(
    pool: &Pool<Postgres>,
    id: Uuid,
    status: TaskStatus,
    result: &str,
) -> Result<()> {
    sqlx::query("UPDATE tasks SET status = $2, result = $3 WHERE id = $1")
        .bind(id)
        .bind(status.as_str())
        .bind(result)
        .execute(pool)
        .await?;
    Ok(())
}
