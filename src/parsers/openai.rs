// OpenAI chat completions SSE parser.
//
// Frame shape: `data: {"choices":[{"delta":{"content":"..."}}]}`.
// `data: [DONE]`, comments, and unparseable payloads carry no text.

use bytes::Bytes;
use serde_json::Value;

use super::{data_payload, StreamParser};

pub struct OpenAiParser;

impl StreamParser for OpenAiParser {
    fn extract_text(&self, frame: &[u8]) -> Option<String> {
        let text = std::str::from_utf8(frame).ok()?;
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') {
            return None;
        }
        let payload = data_payload(text)?;
        if payload == "[DONE]" {
            return None;
        }
        let json: Value = serde_json::from_str(payload).ok()?;
        let mut out = String::new();
        for choice in json.get("choices")?.as_array()? {
            if let Some(content) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|c| c.as_str())
            {
                out.push_str(content);
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    fn strip_marker(&self, frame: &[u8], needle: &str) -> Bytes {
        let unchanged = || Bytes::copy_from_slice(frame);
        let Ok(text) = std::str::from_utf8(frame) else {
            return unchanged();
        };
        if !text.contains(needle) {
            return unchanged();
        }
        let Some(payload) = data_payload(text) else {
            return unchanged();
        };
        let Ok(mut json) = serde_json::from_str::<Value>(payload) else {
            return unchanged();
        };

        let mut modified = false;
        if let Some(choices) = json.get_mut("choices").and_then(|c| c.as_array_mut()) {
            for choice in choices {
                if let Some(Value::String(content)) =
                    choice.get_mut("delta").and_then(|d| d.get_mut("content"))
                {
                    if content.contains(needle) {
                        *content = content.replace(needle, "");
                        modified = true;
                    }
                }
            }
        }
        if !modified {
            return unchanged();
        }
        Bytes::from(format!("data: {json}\n\n"))
    }
}
