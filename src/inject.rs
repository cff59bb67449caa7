// Request mutation: done-marker instruction injection and continuation
// request construction.
//
// All mutation happens on serde_json::Value so that unknown fields survive
// untouched. The only changes ever made are the documented ones: the system
// instruction for attempt 1, and the appended assistant/user turns for
// continuation attempts.

use serde_json::{json, Value};

use crate::parsers::Protocol;

/// System instruction telling the model to end its answer with the marker.
pub fn marker_instruction(marker: &str) -> String {
    format!(
        "Important: when you have finished your entire answer, output the literal string \
         {marker} on its own line as the very last thing, with no other characters. \
         This is a completion marker confirming your answer is complete."
    )
}

/// Directive for continuation attempts. Quotes the tail of the collected
/// text so the model can anchor where it stopped.
pub fn continuation_directive(marker: &str, collected: &str) -> String {
    let total = collected.chars().count();
    let tail: String = collected
        .chars()
        .skip(total.saturating_sub(100))
        .collect();
    format!(
        "Continue exactly where your previous output stopped. Do not repeat anything \
         already written and do not apologize. You have produced {total} characters so far, \
         ending with:\n{tail}\n\nWhen your answer is complete, output {marker} on its own \
         line with no other characters."
    )
}

/// Inject the marker instruction into a request body, in place.
pub fn inject_done_marker(protocol: Protocol, body: &mut Value, instruction: &str) {
    match protocol {
        Protocol::OpenAi => inject_openai(body, instruction),
        Protocol::Gemini => inject_gemini(body, instruction),
        Protocol::Claude => inject_claude(body, instruction),
    }
}

/// Build the body for continuation attempt k >= 2 from the original mutated
/// body: the already-observed assistant text followed by the continuation
/// directive, appended to the conversation history. Every other field is
/// preserved verbatim.
pub fn continuation_body(
    protocol: Protocol,
    original: &Value,
    collected: &str,
    directive: &str,
) -> Value {
    let mut body = original.clone();
    match protocol {
        Protocol::OpenAi | Protocol::Claude => {
            if let Some(messages) = array_entry(&mut body, "messages") {
                messages.push(json!({"role": "assistant", "content": collected}));
                messages.push(json!({"role": "user", "content": directive}));
            }
        }
        Protocol::Gemini => {
            if let Some(contents) = array_entry(&mut body, "contents") {
                contents.push(json!({"role": "model", "parts": [{"text": collected}]}));
                contents.push(json!({"role": "user", "parts": [{"text": directive}]}));
            }
        }
    }
    body
}

// ---------------------------------------------------------------------------
// Per-protocol instruction placement
// ---------------------------------------------------------------------------

fn inject_openai(body: &mut Value, instruction: &str) {
    let Some(messages) = array_entry(body, "messages") else {
        return;
    };
    let first_is_system = messages
        .first()
        .and_then(|m| m.get("role"))
        .and_then(|r| r.as_str())
        == Some("system");

    if first_is_system {
        let Some(first) = messages[0].as_object_mut() else {
            return;
        };
        let content = first.entry("content").or_insert(Value::Null);
        match content {
            Value::String(existing) => {
                if existing.is_empty() {
                    *existing = instruction.to_string();
                } else {
                    existing.push_str("\n\n");
                    existing.push_str(instruction);
                }
            }
            Value::Array(parts) => {
                parts.push(json!({"type": "text", "text": instruction}));
            }
            other => {
                *other = Value::String(instruction.to_string());
            }
        }
    } else {
        messages.insert(0, json!({"role": "system", "content": instruction}));
    }
}

fn inject_gemini(body: &mut Value, instruction: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let existing = obj
        .entry("systemInstruction")
        .or_insert_with(|| json!({"parts": []}));
    let parts = existing
        .as_object_mut()
        .map(|si| si.entry("parts").or_insert_with(|| json!([])));
    if let Some(parts) = parts.and_then(|p| p.as_array_mut()) {
        parts.push(json!({"text": instruction}));
    }
}

fn inject_claude(body: &mut Value, instruction: &str) {
    let Some(obj) = body.as_object_mut() else {
        return;
    };
    let system = obj.entry("system").or_insert(Value::Null);
    match system {
        Value::String(existing) => {
            if existing.is_empty() {
                *existing = instruction.to_string();
            } else {
                existing.push_str("\n\n");
                existing.push_str(instruction);
            }
        }
        Value::Array(blocks) => {
            blocks.push(json!({"type": "text", "text": instruction}));
        }
        other => {
            *other = Value::String(instruction.to_string());
        }
    }
}

/// Mutable access to an array field, creating it when missing. Returns None
/// when the body is not an object or the field is some other type.
fn array_entry<'a>(body: &'a mut Value, key: &str) -> Option<&'a mut Vec<Value>> {
    body.as_object_mut()?
        .entry(key)
        .or_insert_with(|| json!([]))
        .as_array_mut()
}
