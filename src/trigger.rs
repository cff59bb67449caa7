// Anti-truncation activation decision.
//
// The engine only ever runs on streaming requests. A request opts in through
// the model-name prefix, the X-Anti-Truncation header, or the
// anti_truncation query parameter; the process-wide default can also turn it
// on for all streaming traffic.

use axum::http::HeaderMap;

use crate::config::RelayConfig;

/// Outcome of trigger evaluation for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    /// Streaming request with anti-truncation on: run the engine.
    Enabled,
    /// A trigger was present but the request is not streaming: pass through
    /// and answer with `X-Anti-Truncation-Ignored: non-streaming`.
    IgnoredNonStreaming,
    /// Plain pass-through.
    Off,
}

pub fn evaluate(
    cfg: &RelayConfig,
    headers: &HeaderMap,
    query: Option<&str>,
    model: Option<&str>,
    is_streaming: bool,
) -> Activation {
    let triggered = model_triggered(cfg, model)
        || header_triggered(headers)
        || query_triggered(query);

    if triggered {
        if is_streaming {
            Activation::Enabled
        } else {
            Activation::IgnoredNonStreaming
        }
    } else if cfg.anti_truncation_default && is_streaming {
        Activation::Enabled
    } else {
        Activation::Off
    }
}

fn model_triggered(cfg: &RelayConfig, model: Option<&str>) -> bool {
    model.is_some_and(|m| m.starts_with(&cfg.model_prefix))
}

fn header_triggered(headers: &HeaderMap) -> bool {
    headers
        .get("x-anti-truncation")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

fn query_triggered(query: Option<&str>) -> bool {
    query_param(query, "anti_truncation")
        .is_some_and(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

/// First value of a query parameter, without percent-decoding (the accepted
/// trigger values never need it).
pub fn query_param<'a>(query: Option<&'a str>, name: &str) -> Option<&'a str> {
    query?.split('&').find_map(|pair| {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        (key == name).then_some(value)
    })
}

/// Strip the anti-truncation prefix from a model name for upstream
/// forwarding. The original name is retained by the caller for logging.
pub fn strip_model_prefix<'a>(cfg: &RelayConfig, model: &'a str) -> &'a str {
    model.strip_prefix(&cfg.model_prefix).unwrap_or(model)
}
