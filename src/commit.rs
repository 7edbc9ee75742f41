use crate::db;
use crate::models::{EmotionEntry, InferredEmotion, InferredTask, Task, TaskStatus};
use chrono::Utc;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

// ============================================================
// Side-Effect Committer
// ============================================================
//
// Runs after the client already has its `[DONE]`: the memory pair, the
// inferred emotion, and the inferred task are applied in parallel,
// best-effort. One failing write must not block the others; failures
// are logged and counted, never surfaced to the client.
// ============================================================

#[derive(Debug, Clone)]
pub struct SideEffects {
    pub user_id: Uuid,
    pub user_prompt: String,
    pub assistant_content: String,
    pub emotion: Option<InferredEmotion>,
    pub task: Option<InferredTask>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommitOutcome {
    pub memory_ok: bool,
    pub emotion_ok: bool,
    pub task_ok: bool,
}

impl CommitOutcome {
    pub fn all_ok(&self) -> bool {
        self.memory_ok && self.emotion_ok && self.task_ok
    }
}

pub async fn commit(pool: &Pool<Postgres>, effects: SideEffects) -> CommitOutcome {
    let memory = async {
        match db::append_memory_pair(
            pool,
            effects.user_id,
            &effects.user_prompt,
            &effects.assistant_content,
        )
        .await
        {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id = %effects.user_id, "memory commit failed: {}", e);
                false
            }
        }
    };

    let emotion = async {
        let Some(ref inferred) = effects.emotion else {
            return true;
        };
        let entry = EmotionEntry {
            emotion: inferred.emotion.clone(),
            intensity: inferred.intensity,
            context: inferred.context.clone(),
            timestamp: Utc::now(),
        };
        match db::append_emotion(pool, effects.user_id, &entry).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id = %effects.user_id, "emotion commit failed: {}", e);
                false
            }
        }
    };

    let task = async {
        let Some(ref inferred) = effects.task else {
            return true;
        };
        if inferred.task_type.is_empty() {
            return true;
        }
        let row = Task {
            id: Uuid::new_v4(),
            user_id: effects.user_id,
            task_type: inferred.task_type.clone(),
            parameters: inferred.parameters.clone(),
            status: TaskStatus::Queued,
            priority: 0,
            created_at: Utc::now(),
            run_at: Utc::now(),
            result: None,
        };
        match db::create_task(pool, &row).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(user_id = %effects.user_id, "task commit failed: {}", e);
                false
            }
        }
    };

    let (memory_ok, emotion_ok, task_ok) = tokio::join!(memory, emotion, task);
    let outcome = CommitOutcome { memory_ok, emotion_ok, task_ok };

    if !outcome.all_ok() {
        tracing::warn!(
            user_id = %effects.user_id,
            memory_ok, emotion_ok, task_ok,
            "completion commit was partial"
        );
    }
    outcome
}
