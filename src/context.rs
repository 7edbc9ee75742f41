use crate::compressor::{estimate_tokens, CompressedContext};
use crate::extract::{EMOTION_MARKER, TASK_MARKER};
use crate::llm::UpstreamMessage;
use crate::models::{MemoryMessage, User};

// ============================================================
// Context Assembler
// ============================================================
//
// Builds the ordered message list for one completion:
//
//   [system, ...history (oldest first), current user turn]
//
// The system message carries the product persona, the user's profile,
// the compressed intelligence section when available, a short emotional
// summary, and the marker grammar the model uses for side-effects.
// ============================================================

/// How many memory messages feed the prompt by default.
pub const DEFAULT_HISTORY_WINDOW: usize = 6;

const IDENTITY_PREAMBLE: &str = "You are Solace, a warm and attentive AI companion. \
You know the person you are talking to and you carry the thread of past \
conversations. Speak naturally, with empathy and substance. Never mention \
an underlying model, engine, or AI provider; you are simply Solace.";

/// Assemble the full message list. `memory` arrives most-recent-first
/// (store order) and is reversed to chronological here; entries with a
/// role other than user/assistant are dropped. History is trimmed
/// oldest-first until the whole list fits `token_budget`.
pub fn assemble(
    user: &User,
    memory: &[MemoryMessage],
    prompt: &str,
    intelligence: Option<&CompressedContext>,
    token_budget: u32,
) -> Vec<UpstreamMessage> {
    let mut history: Vec<&MemoryMessage> = memory
        .iter()
        .filter(|m| m.role == "user" || m.role == "assistant")
        .collect();
    history.reverse();

    let system = system_message(user, intelligence, !history.is_empty());

    loop {
        let mut messages = Vec::with_capacity(history.len() + 2);
        messages.push(UpstreamMessage {
            role: "system".to_string(),
            content: system.clone(),
        });
        for entry in &history {
            messages.push(UpstreamMessage {
                role: entry.role.clone(),
                content: entry.content.clone(),
            });
        }
        messages.push(UpstreamMessage {
            role: "user".to_string(),
            content: prompt.to_string(),
        });

        let total: u32 = messages.iter().map(|m| estimate_tokens(&m.content)).sum();
        if total <= token_budget || history.is_empty() {
            return messages;
        }
        // Oldest history entries go first.
        history.remove(0);
    }
}

fn system_message(
    user: &User,
    intelligence: Option<&CompressedContext>,
    has_history: bool,
) -> String {
    let mut sections = vec![IDENTITY_PREAMBLE.to_string()];

    if let Some(compressed) = intelligence {
        if !compressed.text.is_empty() {
            sections.push(format!("[User context: {}]", compressed.text));
        }
    }

    if !user.profile.is_empty() {
        let mut keys: Vec<&String> = user.profile.keys().collect();
        keys.sort();
        let lines: Vec<String> = keys
            .iter()
            .map(|k| format!("{}: {}", k, user.profile[*k]))
            .collect();
        sections.push(format!("[About them:]\n{}", lines.join("\n")));
    }

    if !user.emotional_log.is_empty() {
        sections.push(format!(
            "[Recent emotional notes: {}]",
            emotion_summary(user)
        ));
    }

    if has_history {
        sections.push("[The recent conversation continues below.]".to_string());
    }

    sections.push(marker_grammar());

    sections.join("\n\n")
}

/// The three most recent emotional log entries, newest first.
fn emotion_summary(user: &User) -> String {
    user.emotional_log
        .iter()
        .rev()
        .take(3)
        .map(|entry| match entry.intensity {
            Some(intensity) => format!("{}({})", entry.emotion, intensity),
            None => entry.emotion.clone(),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Instruction grammar for the in-band side-effect markers the server
/// consumes. These never reach the user.
fn marker_grammar() -> String {
    format!(
        "When you notice a clear emotional state, append exactly one line:\n\
         {emo}: {{\"emotion\":\"<label>\",\"intensity\":<1-10>,\"context\":\"<short note>\"}}\n\
         When the person asks for something actionable later, append exactly one line:\n\
         {task}: {{\"taskType\":\"<name>\",\"parameters\":{{}}}}\n\
         These lines are consumed by the server and are never shown to the user. \
         Do not mention them.",
        emo = EMOTION_MARKER,
        task = TASK_MARKER,
    )
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::{CompressionMetadata, Strategy};
    use chrono::Utc;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn test_user() -> User {
        User {
            id: Uuid::new_v4(),
            email: "t@example.com".to_string(),
            password_hash: "x".to_string(),
            profile: HashMap::new(),
            emotional_log: vec![],
            subscribed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn memory(role: &str, content: &str, age_secs: i64) -> MemoryMessage {
        MemoryMessage {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            role: role.to_string(),
            content: content.to_string(),
            created_at: Utc::now() - chrono::Duration::seconds(age_secs),
        }
    }

    #[test]
    fn shape_is_system_history_user() {
        let user = test_user();
        // Store order: most recent first.
        let mem = vec![memory("assistant", "second", 10), memory("user", "first", 20)];
        let messages = assemble(&user, &mem, "now", None, 4096);

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].content, "first");
        assert_eq!(messages[2].content, "second");
        assert_eq!(messages[3].role, "user");
        assert_eq!(messages[3].content, "now");
    }

    #[test]
    fn foreign_roles_are_dropped() {
        let user = test_user();
        let mem = vec![memory("system", "sneaky", 5), memory("user", "hello", 10)];
        let messages = assemble(&user, &mem, "hi", None, 4096);
        assert!(messages.iter().all(|m| m.content != "sneaky"));
    }

    #[test]
    fn system_message_carries_persona_and_grammar() {
        let user = test_user();
        let messages = assemble(&user, &[], "hi", None, 4096);
        let system = &messages[0].content;
        assert!(system.contains("Solace"));
        assert!(system.contains("Never mention"));
        assert!(system.contains("EMOTION_LOG"));
        assert!(system.contains("TASK_INFERENCE"));
        // No history, so no continuation marker.
        assert!(!system.contains("continues below"));
    }

    #[test]
    fn profile_and_emotions_included_when_present() {
        let mut user = test_user();
        user.profile.insert("name".to_string(), "Ada".to_string());
        user.emotional_log = vec![
            crate::models::EmotionEntry {
                emotion: "calm".to_string(),
                intensity: None,
                context: None,
                timestamp: Utc::now(),
            },
            crate::models::EmotionEntry {
                emotion: "joy".to_string(),
                intensity: Some(7),
                context: None,
                timestamp: Utc::now(),
            },
        ];
        let messages = assemble(&user, &[], "hi", None, 4096);
        let system = &messages[0].content;
        assert!(system.contains("name: Ada"));
        // Newest first in the summary.
        assert!(system.contains("joy(7), calm"));
    }

    #[test]
    fn intelligence_section_sits_between_preamble_and_profile() {
        let mut user = test_user();
        user.profile.insert("city".to_string(), "Oslo".to_string());
        let compressed = CompressedContext {
            text: "MICRO{e:joy}".to_string(),
            metadata: CompressionMetadata {
                strategy: Strategy::Balanced,
                budget: 100,
                estimated_tokens: 3,
                ratio: 0.1,
                fallback: false,
                version: "v1".to_string(),
            },
        };
        let messages = assemble(&user, &[], "hi", Some(&compressed), 4096);
        let system = &messages[0].content;
        let ctx_pos = system.find("[User context: MICRO{e:joy}]").unwrap();
        let profile_pos = system.find("[About them:]").unwrap();
        assert!(ctx_pos < profile_pos);
        assert!(ctx_pos > system.find("Solace").unwrap());
    }

    #[test]
    fn history_trimmed_oldest_first_to_fit_budget() {
        let user = test_user();
        let long = "x".repeat(400); // ~100 tokens each
        let mem = vec![
            memory("assistant", &long, 10),
            memory("user", "keep me", 20),
            memory("user", &long, 30),
        ];
        // Budget fits system + prompt + roughly one long message.
        let messages = assemble(&user, &mem, "hi", None, 260);
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        // The oldest long message was dropped first.
        assert!(contents.len() < 5);
        assert_eq!(messages.first().unwrap().role, "system");
        assert_eq!(messages.last().unwrap().content, "hi");
    }
}
