// Per-protocol SSE stream parsers.
//
// Each parser is stateless and operates on whole SSE frames (the engine owns
// frame assembly, see `sse::FrameBuffer`). Tolerance is a correctness
// requirement here: a frame that cannot be parsed is passed through
// unchanged, never rejected.

pub mod claude;
pub mod gemini;
pub mod openai;

use bytes::Bytes;

/// Wire format handled by a relay endpoint.
///
/// This identifies the API wire format, not a vendor: `OpenAi` covers any
/// provider speaking the OpenAI-compatible chat completions API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    OpenAi,
    Gemini,
    Claude,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::OpenAi => "openai",
            Protocol::Gemini => "gemini",
            Protocol::Claude => "claude",
        }
    }
}

/// Extracts incremental text from SSE frames and redacts marker text.
pub trait StreamParser: Send + Sync {
    /// Incremental assistant text carried by this frame, if any.
    fn extract_text(&self, frame: &[u8]) -> Option<String>;

    /// Rewrite the frame with `needle` removed from its text fields.
    ///
    /// `needle` is an arbitrary substring: the engine passes the full done
    /// marker when it sits inside one frame, or a partial piece when the
    /// marker spans a frame boundary. Malformed frames and frames that do
    /// not contain the needle come back byte-for-byte unchanged.
    fn strip_marker(&self, frame: &[u8], needle: &str) -> Bytes;
}

/// The parser for a protocol. Parsers are stateless unit structs.
pub fn parser_for(protocol: Protocol) -> &'static dyn StreamParser {
    match protocol {
        Protocol::OpenAi => &openai::OpenAiParser,
        Protocol::Gemini => &gemini::GeminiParser,
        Protocol::Claude => &claude::ClaudeParser,
    }
}

/// Payload of the first `data:` line in a frame, with the optional single
/// leading space and any trailing CR trimmed.
pub(crate) fn data_payload(frame: &str) -> Option<&str> {
    frame.lines().find_map(|line| {
        line.strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
            .map(|p| p.trim())
    })
}
