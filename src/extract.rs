use crate::models::{InferredEmotion, InferredTask};
use std::collections::HashMap;

// ============================================================
// In-band Marker Extraction
// ============================================================
//
// The model emits side-effect markers inside the response text:
//
//   EMOTION_LOG: {"emotion":"sad","intensity":6,"context":"..."}
//   TASK_INFERENCE: {"taskType":"plan_day","parameters":{...}}
//
// The colon is optional, the JSON object is the first balanced-brace
// region after the head. Markers are consumed server-side and must
// never reach the client.
// ============================================================

pub const EMOTION_MARKER: &str = "EMOTION_LOG";
pub const TASK_MARKER: &str = "TASK_INFERENCE";

const MARKERS: [&str; 2] = [EMOTION_MARKER, TASK_MARKER];

/// Shown to the user when sanitation leaves nothing presentable.
pub const EMPTY_RESPONSE_FALLBACK: &str =
    "I'm sorry, I wasn't able to put together a response just now. Please try again.";

/// Result of scanning a full response buffer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Extraction {
    pub emotion: Option<InferredEmotion>,
    pub task: Option<InferredTask>,
    pub cleaned: String,
}

/// Scan the accumulated response for marker regions, parse the first
/// well-formed occurrence of each kind, and strip every marker region
/// (well-formed or not) from the text. Runs on the full buffer at
/// end-of-stream and is idempotent.
pub fn extract_markers(text: &str) -> Extraction {
    let mut emotion: Option<InferredEmotion> = None;
    let mut task: Option<InferredTask> = None;
    let mut cleaned = String::with_capacity(text.len());
    let mut rest = text;

    while let Some((pos, marker)) = find_marker(rest) {
        cleaned.push_str(&rest[..pos]);
        let after_head = &rest[pos + marker.len()..];
        let (region, remainder) = split_marker_region(after_head);

        if let Some(json) = region {
            match marker {
                EMOTION_MARKER => {
                    let parsed = parse_emotion(json);
                    if emotion.is_none() {
                        emotion = parsed;
                    }
                }
                _ => {
                    let parsed = parse_task(json);
                    if task.is_none() {
                        task = parsed;
                    }
                }
            }
        }
        rest = remainder;
    }
    cleaned.push_str(rest);

    Extraction {
        emotion,
        task,
        cleaned: tidy_whitespace(&cleaned),
    }
}

/// Earliest marker head in `text`, if any.
fn find_marker(text: &str) -> Option<(usize, &'static str)> {
    MARKERS
        .iter()
        .filter_map(|m| text.find(m).map(|pos| (pos, *m)))
        .min_by_key(|(pos, _)| *pos)
}

/// Given the text immediately after a marker head, return the JSON region
/// (if a complete balanced one exists) and the remainder to keep scanning.
/// Malformed or missing regions yield no JSON; the head is dropped either way.
fn split_marker_region(after_head: &str) -> (Option<&str>, &str) {
    let mut idx = 0;
    let bytes = after_head.as_bytes();
    if idx < bytes.len() && bytes[idx] == b':' {
        idx += 1;
    }
    while idx < bytes.len() && (bytes[idx] as char).is_whitespace() {
        idx += 1;
    }
    if idx >= bytes.len() || bytes[idx] != b'{' {
        // Stray head with no JSON region: strip the head (and colon), keep the rest.
        return (None, &after_head[idx..]);
    }
    match balanced_region_end(after_head, idx) {
        Some(end) => (Some(&after_head[idx..end]), &after_head[end..]),
        // Unterminated region runs to end-of-buffer; nothing left to keep.
        None => (None, ""),
    }
}

/// End (exclusive) of the balanced-brace region starting at `start`,
/// string- and escape-aware. None when the region never closes.
fn balanced_region_end(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_string => escaped = true,
            '"' => in_string = !in_string,
            '{' if !in_string => depth += 1,
            '}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(start + offset + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_emotion(json: &str) -> Option<InferredEmotion> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let emotion = value.get("emotion")?.as_str()?.trim().to_string();
    if emotion.is_empty() {
        return None;
    }
    let intensity = value
        .get("intensity")
        .and_then(|v| v.as_f64())
        .map(|n| (n.round() as i64).clamp(1, 10) as i32);
    let context = value
        .get("context")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());
    Some(InferredEmotion { emotion, intensity, context })
}

fn parse_task(json: &str) -> Option<InferredTask> {
    let value: serde_json::Value = serde_json::from_str(json).ok()?;
    let task_type = value.get("taskType")?.as_str()?.trim().to_string();
    if task_type.is_empty() {
        return None;
    }
    let parameters: HashMap<String, serde_json::Value> = value
        .get("parameters")
        .and_then(|v| v.as_object())
        .map(|obj| obj.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
        .unwrap_or_default();
    Some(InferredTask { task_type, parameters })
}

/// Collapse runs of two or more blank lines to a single newline, then trim.
fn tidy_whitespace(text: &str) -> String {
    let re = regex::Regex::new(r"\n(?:[ \t]*\n){2,}").unwrap();
    re.replace_all(text, "\n").trim().to_string()
}

// ============================================================
// Sanitizer
// ============================================================

/// Strip model chrome from extractor output before it is persisted:
/// instruction delimiters, leading role prefixes, fenced blocks that carry
/// a marker, and any residual marker literal (case-insensitive). Falls
/// back to a fixed apology when nothing presentable remains.
pub fn sanitize(text: &str) -> String {
    let mut out = text.to_string();

    // Fenced code blocks that smuggle a marker are dropped whole.
    let fence = regex::Regex::new(r"(?is)```[^`]*?(?:emotion_log|task_inference)[^`]*?```").unwrap();
    out = fence.replace_all(&out, "").to_string();

    for token in ["[INST]", "[/INST]", "<s>", "</s>", "<<SYS>>", "<</SYS>>"] {
        out = out.replace(token, "");
    }

    let role_prefix = regex::Regex::new(r"(?im)^\s*(?:USER|Human|Assistant)\s*:\s*").unwrap();
    out = role_prefix.replace_all(&out, "").to_string();

    let residual = regex::Regex::new(r"(?i)(?:emotion_log|task_inference)\s*:?").unwrap();
    out = residual.replace_all(&out, "").to_string();

    let out = tidy_whitespace(&out);
    if out.is_empty() {
        EMPTY_RESPONSE_FALLBACK.to_string()
    } else {
        out
    }
}

// ============================================================
// Streaming Marker Filter
// ============================================================

/// Incremental filter between the upstream deltas and the SSE wire.
///
/// Text is only released once it provably cannot be part of a marker:
/// the tail of the held buffer is retained whenever it is a prefix of a
/// marker head, so a marker split across arbitrarily small chunks never
/// leaks. Complete marker regions are swallowed; the orchestrator keeps
/// the raw buffer separately for end-of-stream extraction.
#[derive(Debug, Default)]
pub struct MarkerFilter {
    held: String,
}

impl MarkerFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream delta; returns the text now safe to forward.
    pub fn push(&mut self, delta: &str) -> String {
        self.held.push_str(delta);
        let mut out = String::new();

        loop {
            match find_marker(&self.held) {
                Some((pos, marker)) => {
                    out.push_str(&self.held[..pos]);
                    let after_head = self.held[pos + marker.len()..].to_string();

                    if let Some(rel_end) = complete_region_len(&after_head) {
                        // Whole marker region present: swallow it, keep scanning.
                        self.held = after_head[rel_end..].to_string();
                    } else if region_may_grow(&after_head) {
                        // Marker present but its JSON has not fully arrived.
                        self.held = format!("{}{}", marker, after_head);
                        return out;
                    } else {
                        // Stray head with no region following: drop the head only.
                        self.held = after_head;
                    }
                }
                None => {
                    let hold = marker_prefix_holdback(&self.held);
                    let release = self.held.len() - hold;
                    out.push_str(&self.held[..release]);
                    self.held.drain(..release);
                    return out;
                }
            }
        }
    }

    /// End-of-stream flush. Held text is safe unless a marker head is
    /// present, in which case everything from the head onward is dropped
    /// (the extractor sees it via the raw buffer).
    pub fn finish(self) -> String {
        match find_marker(&self.held) {
            Some((pos, _)) => self.held[..pos].to_string(),
            None => self.held,
        }
    }

    #[cfg(test)]
    fn held_len(&self) -> usize {
        self.held.len()
    }
}

/// Length of the complete marker region (colon, whitespace, balanced JSON)
/// at the start of `after_head`, or None if it is absent or unfinished.
fn complete_region_len(after_head: &str) -> Option<usize> {
    let bytes = after_head.as_bytes();
    let mut idx = 0;
    if idx < bytes.len() && bytes[idx] == b':' {
        idx += 1;
    }
    while idx < bytes.len() && (bytes[idx] as char).is_whitespace() {
        idx += 1;
    }
    if idx >= bytes.len() || bytes[idx] != b'{' {
        return None;
    }
    balanced_region_end(after_head, idx)
}

/// Whether the text after a head could still become a marker region as
/// more bytes arrive: we are mid-JSON, or still inside optional colon
/// and whitespace.
fn region_may_grow(after_head: &str) -> bool {
    let bytes = after_head.as_bytes();
    let mut idx = 0;
    if idx < bytes.len() && bytes[idx] == b':' {
        idx += 1;
    }
    while idx < bytes.len() && (bytes[idx] as char).is_whitespace() {
        idx += 1;
    }
    // Ran out of bytes before seeing the object: might still arrive.
    if idx >= bytes.len() {
        return true;
    }
    // An open brace with no balanced close yet is a region in flight.
    bytes[idx] == b'{'
}

/// Longest suffix of `held` that is a proper prefix of a marker head.
fn marker_prefix_holdback(held: &str) -> usize {
    let mut hold = 0;
    for marker in MARKERS {
        let max = marker.len().saturating_sub(1).min(held.len());
        for len in (1..=max).rev() {
            if held.is_char_boundary(held.len() - len) && marker.starts_with(&held[held.len() - len..]) {
                hold = hold.max(len);
                break;
            }
        }
    }
    hold
}

// ============================================================
// Tests
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    mod extraction_tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn plain_text_passes_through() {
            let result = extract_markers("Hello there.");
            assert_eq!(result.cleaned, "Hello there.");
            assert!(result.emotion.is_none());
            assert!(result.task.is_none());
        }

        #[test]
        fn emotion_marker_extracted_and_stripped() {
            let result =
                extract_markers(r#"I hear you. EMOTION_LOG: {"emotion":"sad","intensity":6}"#);
            assert_eq!(result.cleaned, "I hear you.");
            let emotion = result.emotion.unwrap();
            assert_eq!(emotion.emotion, "sad");
            assert_eq!(emotion.intensity, Some(6));
            assert!(emotion.context.is_none());
        }

        #[test]
        fn task_marker_extracted_with_parameters() {
            let result = extract_markers(
                r#"Sure. TASK_INFERENCE: {"taskType":"plan_day","parameters":{"priority":"focus"}}"#,
            );
            assert_eq!(result.cleaned, "Sure.");
            let task = result.task.unwrap();
            assert_eq!(task.task_type, "plan_day");
            assert_eq!(task.parameters.get("priority").unwrap(), "focus");
        }

        #[test]
        fn first_well_formed_marker_wins() {
            let result = extract_markers(concat!(
                r#"EMOTION_LOG: {"emotion":"joy","intensity":3} and later "#,
                r#"EMOTION_LOG: {"emotion":"sad","intensity":9}"#,
            ));
            assert_eq!(result.emotion.unwrap().emotion, "joy");
            // Both regions are stripped regardless.
            assert_eq!(result.cleaned, "and later");
        }

        #[test]
        fn malformed_json_stripped_without_value() {
            let result = extract_markers(r#"Okay. EMOTION_LOG: {"emotion": nope} done."#);
            assert!(result.emotion.is_none());
            assert_eq!(result.cleaned, "Okay.  done.".trim());
        }

        #[test]
        fn malformed_then_valid_uses_the_valid_one() {
            let result = extract_markers(concat!(
                r#"EMOTION_LOG: {"broken": } "#,
                r#"EMOTION_LOG: {"emotion":"calm"}"#,
            ));
            assert_eq!(result.emotion.unwrap().emotion, "calm");
        }

        #[test]
        fn intensity_clamped_into_range() {
            let high = extract_markers(r#"EMOTION_LOG: {"emotion":"rage","intensity":99}"#);
            assert_eq!(high.emotion.unwrap().intensity, Some(10));

            let low = extract_markers(r#"EMOTION_LOG: {"emotion":"meh","intensity":0}"#);
            assert_eq!(low.emotion.unwrap().intensity, Some(1));
        }

        #[test]
        fn non_numeric_intensity_dropped() {
            let result = extract_markers(r#"EMOTION_LOG: {"emotion":"joy","intensity":"high"}"#);
            assert_eq!(result.emotion.unwrap().intensity, None);
        }

        #[test]
        fn empty_emotion_label_rejected() {
            let result = extract_markers(r#"EMOTION_LOG: {"emotion":"  "}"#);
            assert!(result.emotion.is_none());
        }

        #[test]
        fn missing_parameters_default_to_empty() {
            let result = extract_markers(r#"TASK_INFERENCE: {"taskType":"reminder"}"#);
            assert!(result.task.unwrap().parameters.is_empty());
        }

        #[test]
        fn non_object_parameters_default_to_empty() {
            let result =
                extract_markers(r#"TASK_INFERENCE: {"taskType":"reminder","parameters":[1,2]}"#);
            assert!(result.task.unwrap().parameters.is_empty());
        }

        #[test]
        fn braces_inside_strings_do_not_break_region() {
            let result =
                extract_markers(r#"EMOTION_LOG: {"emotion":"joy","context":"set {goals} today"}"#);
            let emotion = result.emotion.unwrap();
            assert_eq!(emotion.context.unwrap(), "set {goals} today");
            assert_eq!(result.cleaned, "");
        }

        #[test]
        fn unterminated_region_stripped_to_end() {
            let result = extract_markers(r#"Partial. EMOTION_LOG: {"emotion":"jo"#);
            assert!(result.emotion.is_none());
            assert_eq!(result.cleaned, "Partial.");
        }

        #[test]
        fn marker_without_colon_still_parses() {
            let result = extract_markers(r#"EMOTION_LOG {"emotion":"calm"}"#);
            assert_eq!(result.emotion.unwrap().emotion, "calm");
        }

        #[test]
        fn both_markers_in_one_buffer() {
            let result = extract_markers(concat!(
                r#"Done! EMOTION_LOG: {"emotion":"proud","intensity":7} "#,
                r#"TASK_INFERENCE: {"taskType":"summarize_day"}"#,
            ));
            assert_eq!(result.emotion.unwrap().emotion, "proud");
            assert_eq!(result.task.unwrap().task_type, "summarize_day");
            assert_eq!(result.cleaned, "Done!");
        }

        #[test]
        fn blank_line_runs_collapse() {
            let result = extract_markers("a\n\n\n\nb");
            assert_eq!(result.cleaned, "a\nb");
        }

        #[test]
        fn extraction_is_idempotent() {
            let input = r#"Hi there. EMOTION_LOG: {"emotion":"warm","intensity":4}"#;
            let first = extract_markers(input);
            let second = extract_markers(&first.cleaned);
            assert_eq!(second.cleaned, first.cleaned);
            assert!(second.emotion.is_none());
            assert!(second.task.is_none());
        }
    }

    mod sanitizer_tests {
        use super::*;
        use pretty_assertions::assert_eq;

        #[test]
        fn strips_instruction_delimiters() {
            assert_eq!(sanitize("[INST]hello[/INST] <s>world</s>"), "hello world");
        }

        #[test]
        fn strips_leading_role_prefixes() {
            assert_eq!(sanitize("Assistant: Sure thing."), "Sure thing.");
        }

        #[test]
        fn strips_residual_markers_case_insensitively() {
            assert_eq!(sanitize("fine emotion_log: leftover"), "fine  leftover".trim());
        }

        #[test]
        fn drops_fenced_blocks_containing_markers() {
            let text = "Before\n```\nEMOTION_LOG: {\"emotion\":\"x\"}\n```\nAfter";
            let out = sanitize(text);
            assert!(out.contains("Before"));
            assert!(out.contains("After"));
            assert!(!out.to_lowercase().contains("emotion_log"));
        }

        #[test]
        fn empty_result_becomes_fallback() {
            assert_eq!(sanitize("   \n\n  "), EMPTY_RESPONSE_FALLBACK);
            assert_eq!(sanitize("EMOTION_LOG:"), EMPTY_RESPONSE_FALLBACK);
        }

        #[test]
        fn extract_then_sanitize_then_extract_is_stable() {
            let input = r#"I hear you. EMOTION_LOG: {"emotion":"sad","intensity":6}"#;
            let first = extract_markers(input);
            let sanitized = sanitize(&first.cleaned);
            let second = extract_markers(&sanitized);
            assert!(second.emotion.is_none());
            assert!(second.task.is_none());
            assert_eq!(second.cleaned, sanitized);
        }
    }

    mod marker_filter_tests {
        use super::*;
        use pretty_assertions::assert_eq;

        fn run_chunks(chunks: &[&str]) -> String {
            let mut filter = MarkerFilter::new();
            let mut out = String::new();
            for chunk in chunks {
                out.push_str(&filter.push(chunk));
            }
            out.push_str(&filter.finish());
            out
        }

        #[test]
        fn plain_chunks_forwarded_verbatim() {
            assert_eq!(run_chunks(&["Hi", " there"]), "Hi there");
        }

        #[test]
        fn whole_marker_in_one_chunk_suppressed() {
            let out = run_chunks(&["I hear you. ", r#"EMOTION_LOG: {"emotion":"sad","intensity":6}"#]);
            assert_eq!(out, "I hear you. ");
        }

        #[test]
        fn marker_split_across_chunks_never_leaks() {
            let out = run_chunks(&["EMOTIO", r#"N_LOG: {"emotion":"joy"}"#]);
            assert_eq!(out, "");
        }

        #[test]
        fn every_split_point_is_leak_free() {
            let full = r#"Sure. TASK_INFERENCE: {"taskType":"plan_day","parameters":{"priority":"focus"}} Bye."#;
            for cut in 0..full.len() {
                if !full.is_char_boundary(cut) {
                    continue;
                }
                let out = run_chunks(&[&full[..cut], &full[cut..]]);
                assert!(!out.contains(EMOTION_MARKER), "leak at cut {}", cut);
                assert!(!out.contains(TASK_MARKER), "leak at cut {}", cut);
                assert_eq!(out, "Sure.  Bye.", "wrong text at cut {}", cut);
            }
        }

        #[test]
        fn text_after_marker_resumes_forwarding() {
            let out = run_chunks(&[r#"A EMOTION_LOG: {"emotion":"x"} B"#]);
            assert_eq!(out, "A  B");
        }

        #[test]
        fn incomplete_marker_at_end_dropped() {
            let out = run_chunks(&["Answer. ", r#"EMOTION_LOG: {"emotio"#]);
            assert_eq!(out, "Answer. ");
        }

        #[test]
        fn false_prefix_released_at_finish() {
            // "EMOTIO" never completes into a marker; it is plain text.
            assert_eq!(run_chunks(&["feeling EMOTIO"]), "feeling EMOTIO");
        }

        #[test]
        fn false_prefix_released_when_disproven() {
            let mut filter = MarkerFilter::new();
            let first = filter.push("EMOTION_");
            assert_eq!(first, "");
            // Next chunk proves this is not a marker head.
            let second = filter.push("X rest");
            assert_eq!(second, "EMOTION_X rest");
            assert_eq!(filter.held_len(), 0);
        }

        #[test]
        fn stray_head_without_region_is_stripped() {
            let out = run_chunks(&["see EMOTION_LOG for details, ok"]);
            assert_eq!(out, "see  for details, ok");
        }

        #[test]
        fn single_byte_chunks_suppress_marker() {
            let full = r#"Hi EMOTION_LOG: {"emotion":"joy","intensity":2} there"#;
            let chunks: Vec<String> = full.chars().map(|c| c.to_string()).collect();
            let mut filter = MarkerFilter::new();
            let mut out = String::new();
            for chunk in &chunks {
                out.push_str(&filter.push(chunk));
            }
            out.push_str(&filter.finish());
            assert_eq!(out, "Hi  there");
        }
    }
}
