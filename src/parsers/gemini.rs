// Gemini streamGenerateContent SSE parser.
//
// Frame shape: `data: {"candidates":[{"content":{"parts":[{"text":"..."}]}}]}`.
// Extracted text is the concatenation of the first candidate's part texts.

use bytes::Bytes;
use serde_json::Value;

use super::{data_payload, StreamParser};

pub struct GeminiParser;

impl StreamParser for GeminiParser {
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
        let parts = json
            .get("candidates")?
            .get(0)?
            .get("content")?
            .get("parts")?
            .as_array()?;
        let mut out = String::new();
        for part in parts {
            if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                out.push_str(text);
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

        // Same scope as extract_text: only the first candidate is read, so
        // only the first candidate is rewritten.
        let mut modified = false;
        let parts = json
            .get_mut("candidates")
            .and_then(|c| c.get_mut(0))
            .and_then(|candidate| candidate.get_mut("content"))
            .and_then(|c| c.get_mut("parts"))
            .and_then(|p| p.as_array_mut());
        if let Some(parts) = parts {
            for part in parts {
                if let Some(Value::String(part_text)) = part.get_mut("text") {
                    if part_text.contains(needle) {
                        *part_text = part_text.replace(needle, "");
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
