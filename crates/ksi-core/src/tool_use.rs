//! Extraction of event blocks embedded in completion responses.
//!
//! Completion output is free-form text that may contain JSON objects the
//! agent intends as further events. Two shapes are recognised:
//!
//! - Legacy: `{"event": "<name>", "data": {...}}`
//! - Tool use: `{"type": "ksi_tool_use", "id": "ksiu_...", "name": "<name>",
//!   "input": {...}}`, converted to legacy shape with the id preserved.
//!
//! Candidate objects are found by brace balancing (string- and escape-aware,
//! so braces inside JSON strings do not confuse the scan); a regex prefilter
//! cheaply answers "does this text contain tool-use blocks at all".

use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// How an extracted event was spelled in the response text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionFormat {
    Legacy,
    ToolUse,
}

/// One event recovered from response text.
#[derive(Debug, Clone)]
pub struct ExtractedEvent {
    pub event: String,
    pub data: Value,
    /// The `ksiu_…` id of a tool-use block; absent for legacy blocks.
    pub tool_use_id: Option<String>,
    pub format: ExtractionFormat,
}

fn tool_use_prefilter() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"\{\s*"type"\s*:\s*"ksi_tool_use""#).expect("static regex"))
}

/// Whether the text contains any tool-use blocks, without a full scan.
pub fn has_tool_use_blocks(text: &str) -> bool {
    tool_use_prefilter().is_match(text)
}

fn is_tool_use_block(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("ksi_tool_use")
        && value.get("id").is_some_and(Value::is_string)
        && value.get("name").is_some_and(Value::is_string)
        && value.get("input").is_some()
}

/// Extract every recognisable event block from the text, in order of
/// appearance. Malformed candidates are skipped silently.
pub fn extract_event_blocks(text: &str) -> Vec<ExtractedEvent> {
    let mut events = Vec::new();
    for span in balanced_object_spans(text) {
        let Ok(value) = serde_json::from_str::<Value>(span) else {
            continue;
        };
        if is_tool_use_block(&value) {
            events.push(ExtractedEvent {
                event: value["name"].as_str().unwrap_or_default().to_string(),
                data: value.get("input").cloned().unwrap_or(Value::Null),
                tool_use_id: value["id"].as_str().map(str::to_string),
                format: ExtractionFormat::ToolUse,
            });
        } else if let (Some(event), Some(data)) = (
            value.get("event").and_then(Value::as_str),
            value.get("data"),
        ) {
            events.push(ExtractedEvent {
                event: event.to_string(),
                data: data.clone(),
                tool_use_id: None,
                format: ExtractionFormat::Legacy,
            });
        }
    }
    events
}

/// Top-level `{...}` spans found by brace balancing.
///
/// Braces inside string literals (including escaped quotes) are ignored.
/// Nested objects are covered by their outermost span only.
fn balanced_object_spans(text: &str) -> Vec<&str> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let start = i;
        let mut depth = 0usize;
        let mut in_string = false;
        let mut escaped = false;
        let mut end = None;
        while i < bytes.len() {
            let b = bytes[i];
            if in_string {
                if escaped {
                    escaped = false;
                } else if b == b'\\' {
                    escaped = true;
                } else if b == b'"' {
                    in_string = false;
                }
            } else {
                match b {
                    b'"' => in_string = true,
                    b'{' => depth += 1,
                    b'}' => {
                        depth -= 1;
                        if depth == 0 {
                            end = Some(i);
                            break;
                        }
                    }
                    _ => {}
                }
            }
            i += 1;
        }
        match end {
            Some(e) => {
                spans.push(&text[start..=e]);
                i = e + 1;
            }
            // Unbalanced tail; nothing further can close.
            None => break,
        }
    }
    spans
}

/// Required data fields for the handful of events agents emit most; anything
/// not listed passes through unvalidated.
pub fn validate_event_data(event: &str, data: &Value) -> Result<(), String> {
    let required: &[&str] = match event {
        "state:entity:create" => &["type"],
        "state:relationship:create" => &["from", "to", "type"],
        "agent:send_message" => &["agent_id"],
        "completion:async" => &["prompt"],
        _ => return Ok(()),
    };
    let missing: Vec<&str> = required
        .iter()
        .filter(|f| data.get(**f).is_none())
        .copied()
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(format!("missing required fields: {}", missing.join(", ")))
    }
}

/// Render a tool-use block for an event, as agents are instructed to emit it.
pub fn format_tool_use_block(event: &str, data: &Value, id_suffix: &str) -> String {
    serde_json::to_string_pretty(&serde_json::json!({
        "type": "ksi_tool_use",
        "id": format!("ksiu_{id_suffix}"),
        "name": event,
        "input": data,
    }))
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_block_extracted() {
        let text = r#"Doing the thing now: {"event": "state:entity:create", "data": {"type": "note", "id": "n1"}} done."#;
        let events = extract_event_blocks(text);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "state:entity:create");
        assert_eq!(events[0].data["id"], "n1");
        assert_eq!(events[0].format, ExtractionFormat::Legacy);
        assert!(events[0].tool_use_id.is_none());
    }

    #[test]
    fn test_tool_use_block_round_trip() {
        let input = json!({"x": 42, "nested": {"y": [1, 2]}});
        let text = format!(
            "preface\n{}\ntrailer",
            format_tool_use_block("test:dst", &input, "000001")
        );
        assert!(has_tool_use_blocks(&text));
        let events = extract_event_blocks(&text);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "test:dst");
        assert_eq!(events[0].data, input);
        assert_eq!(events[0].tool_use_id.as_deref(), Some("ksiu_000001"));
        assert_eq!(events[0].format, ExtractionFormat::ToolUse);
    }

    #[test]
    fn test_braces_inside_strings_do_not_break_balance() {
        let text = r#"{"event": "log:note", "data": {"text": "a } brace and a \" quote {"}}"#;
        let events = extract_event_blocks(text);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data["text"], "a } brace and a \" quote {");
    }

    #[test]
    fn test_multiple_blocks_in_order() {
        let text = r#"
            {"event": "a:one", "data": {}}
            noise {not json}
            {"type":"ksi_tool_use","id":"ksiu_2","name":"b:two","input":{"k":1}}
        "#;
        let events = extract_event_blocks(text);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event, "a:one");
        assert_eq!(events[1].event, "b:two");
    }

    #[test]
    fn test_malformed_and_irrelevant_objects_skipped() {
        let text = r#"{"foo": 1} {"event": "x"} {"type":"ksi_tool_use","id":"k","name":"n"} {broken"#;
        // First has no event/data, second lacks data, third lacks input,
        // fourth never closes.
        assert!(extract_event_blocks(text).is_empty());
    }

    #[test]
    fn test_prefilter_negative() {
        assert!(!has_tool_use_blocks("plain text with {\"event\": \"x\"}"));
    }

    #[test]
    fn test_validation_table() {
        assert!(validate_event_data("unknown:event", &json!({})).is_ok());
        assert!(validate_event_data("state:entity:create", &json!({"type": "t"})).is_ok());
        let err = validate_event_data("state:relationship:create", &json!({"from": "a"}))
            .unwrap_err();
        assert!(err.contains("to"));
        assert!(err.contains("type"));
    }
}
