use crate::db;
use crate::models::{Task, TaskStatus};
use serde::Serialize;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tokio::time::sleep;

// ============================================================
// Task Runner
// ============================================================
//
// Drains queued tasks in small batches. A task is claimed with a
// compare-and-set on its status so concurrent drains never execute
// the same task twice.
// ============================================================

/// Batch size is fixed server-side.
pub const TASK_BATCH_SIZE: i64 = 10;

#[derive(Debug, Default, Clone, Serialize)]
pub struct TaskRunSummary {
    pub claimed: u32,
    pub completed: u32,
    pub failed: u32,
}

/// Run one drain pass: claim up to `TASK_BATCH_SIZE` due tasks and
/// execute them to a terminal status.
pub async fn drain_due_tasks(pool: &Pool<Postgres>) -> anyhow::Result<TaskRunSummary> {
    let mut summary = TaskRunSummary::default();

    for task in db::due_tasks(pool, TASK_BATCH_SIZE).await? {
        if !db::claim_task(pool, task.id).await? {
            // Another worker got there first.
            continue;
        }
        summary.claimed += 1;

        let (status, result) = execute(pool, &task).await;
        match status {
            TaskStatus::Completed => summary.completed += 1,
            _ => summary.failed += 1,
        }
        if let Err(e) = db::finish_task(pool, task.id, status, &result).await {
            tracing::error!(task_id = %task.id, "failed to record task result: {}", e);
        }
    }

    if summary.claimed > 0 {
        tracing::info!(
            claimed = summary.claimed,
            completed = summary.completed,
            failed = summary.failed,
            "task drain pass finished"
        );
    }
    Ok(summary)
}

/// Execute one claimed task. Unknown types fail with a descriptive message.
async fn execute(pool: &Pool<Postgres>, task: &Task) -> (TaskStatus, String) {
    match task.task_type.as_str() {
        "plan_day" => {
            let focus = task
                .parameters
                .get("priority")
                .and_then(|v| v.as_str())
                .unwrap_or("the essentials");
            (
                TaskStatus::Completed,
                format!("Drafted a day plan centered on {}.", focus),
            )
        }
        "reminder" => {
            let note = task
                .parameters
                .get("message")
                .and_then(|v| v.as_str())
                .unwrap_or("(no message)");
            (TaskStatus::Completed, format!("Reminder noted: {}", note))
        }
        "summarize_day" => match db::recent_memory(pool, task.user_id, 50).await {
            Ok(memory) => (
                TaskStatus::Completed,
                format!("Summarized {} recent memory entries.", memory.len()),
            ),
            Err(e) => (TaskStatus::Failed, format!("memory read failed: {}", e)),
        },
        other => (
            TaskStatus::Failed,
            format!("unknown task type \"{}\"", other),
        ),
    }
}

/// Background drain loop, companion to the `/run-tasks` manual drain.
pub async fn run_task_loop(pool: Pool<Postgres>) {
    tracing::info!("task runner loop starting");
    loop {
        if let Err(e) = drain_due_tasks(&pool).await {
            tracing::error!("task drain pass failed: {}", e);
        }
        sleep(Duration::from_secs(30)).await;
    }
}
