// Claude messages SSE parser.
//
// Claude uses event-typed SSE (`event:` + `data:` line pairs). Only
// `content_block_delta` events carry assistant text (`delta.text`); every
// other event type (`message_start`, `ping`, `content_block_start`, ...)
// passes through and contributes no text.

use bytes::Bytes;
use serde_json::Value;

use super::StreamParser;

pub struct ClaudeParser;

impl StreamParser for ClaudeParser {
    fn extract_text(&self, frame: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(frame).ok()?;
        let (event, data) = split_event_data(text);
        if event != Some("content_block_delta") {
            return None;
        }
        let json: Value = serde_json::from_str(data?.1).ok()?;
        json.get("delta")
            .and_then(|d| d.get("text"))
            .and_then(|t| t.as_str())
            .filter(|t| !t.is_empty())
            .map(|t| t.to_string())
    }

    fn strip_marker(&self, frame: &[u8], needle: &str) -> Bytes {
        let unchanged = || Bytes::copy_from_slice(frame);
        let Ok(text) = std::str::from_utf8(frame) else {
            return unchanged();
        };
        if !text.contains(needle) {
            return unchanged();
        }
        let (event, data) = split_event_data(text);
        if event != Some("content_block_delta") {
            return unchanged();
        }
        let Some((data_idx, payload)) = data else {
            return unchanged();
        };
        let Ok(mut json) = serde_json::from_str::<Value>(payload) else {
            return unchanged();
        };

        let Some(Value::String(delta_text)) =
            json.get_mut("delta").and_then(|d| d.get_mut("text"))
        else {
            return unchanged();
        };
        if !delta_text.contains(needle) {
            return unchanged();
        }
        *delta_text = delta_text.replace(needle, "");

        let mut lines: Vec<&str> = text.trim_end().split('\n').collect();
        let rewritten = format!("data: {json}");
        lines[data_idx] = &rewritten;
        Bytes::from(format!("{}\n\n", lines.join("\n")))
    }
}

/// Whether this frame terminates a Claude message: a `message_stop` event, or
/// a `message_delta` event carrying a `stop_reason`.
pub fn is_terminal_event(frame: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(frame) else {
        return false;
    };
    let (event, data) = split_event_data(text);
    match event {
        Some("message_stop") => true,
        Some("message_delta") => data
            .and_then(|(_, payload)| serde_json::from_str::<Value>(payload).ok())
            .and_then(|json| json.get("delta").and_then(|d| d.get("stop_reason")).cloned())
            .map(|reason| !reason.is_null())
            .unwrap_or(false),
        _ => false,
    }
}

/// Split a frame into its event type and first data line (line index +
/// payload). Returns string slices into the frame text.
fn split_event_data(text: &str) -> (Option<&str>, Option<(usize, &str)>) {
    let mut event = None;
    let mut data = None;
    for (idx, line) in text.trim_end().split('\n').enumerate() {
        let line = line.trim_end_matches('\r');
        if let Some(value) = line.strip_prefix("event:") {
            event = Some(value.trim());
        } else if data.is_none() {
            if let Some(value) = line.strip_prefix("data:") {
                data = Some((idx, value.trim()));
            }
        }
    }
    (event, data)
}
