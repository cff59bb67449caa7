// Anti-truncation streaming engine.
//
// Supervises up to max_attempts sequential upstream requests and splices
// their SSE streams into one client-visible stream. Bytes are forwarded as
// they arrive; extracted text is accumulated for sentinel detection. When an
// attempt ends without the done marker, a continuation request carrying the
// collected text is issued and its frames are appended to the same stream.
//
// The downstream side is an mpsc channel drained by the response body. When
// the client disconnects the receiver is dropped, every send fails, and the
// run loop returns, dropping the in-flight upstream response and cancelling
// it. No attempt is ever issued after a disconnect.

use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::RelayConfig;
use crate::inject;
use crate::parsers::{self, claude, Protocol, StreamParser};
use crate::sse::FrameBuffer;
use crate::upstream::{UpstreamClient, UpstreamError, UpstreamRequest, UpstreamResponse};

/// Upstream statuses on continuation attempts that are worth retrying while
/// attempts remain (transient errors and rate limits).
const RETRYABLE_STATUSES: &[u16] = &[408, 425, 429, 500, 502, 503, 504];

/// In-band signal that the attempt bound was exhausted without observing the
/// marker. Emitted as an SSE comment because the response headers are already
/// committed when the condition becomes known.
const MAX_ATTEMPTS_COMMENT: &[u8] = b": X-Anti-Truncation-Max-Attempts-Reached\n\n";

/// Everything the engine needs to drive one anti-truncation run. `body` is
/// the original request body with the marker instruction already injected.
pub struct EngineContext {
    pub protocol: Protocol,
    pub request_id: String,
    pub url: String,
    pub headers: axum::http::HeaderMap,
    pub body: Value,
}

/// Outcome of the first upstream attempt.
#[derive(Debug)]
pub enum EngineStart {
    /// Streaming 2xx: relay this receiver as the response body. The run loop
    /// keeps feeding it across attempts.
    Stream(mpsc::Receiver<Bytes>),
    /// Non-2xx before any body byte: relay the upstream response verbatim.
    /// The engine is never active on non-2xx streams.
    Passthrough(UpstreamResponse),
}

pub struct AntiTruncationEngine {
    config: Arc<RelayConfig>,
    upstream: Arc<dyn UpstreamClient>,
}

// ---------------------------------------------------------------------------
// Run-loop state
// ---------------------------------------------------------------------------

struct RunState {
    /// Assistant text observed so far, across attempts, in arrival order.
    collected: String,
    /// Frames withheld because the tail of their extracted text could be the
    /// start of the marker. At most marker_len - 1 bytes of text are held.
    held: Vec<HeldFrame>,
    /// Claude terminal events of the current attempt. Dropped when a
    /// continuation follows, forwarded when the run ends on the last attempt.
    pending_stop: Vec<Bytes>,
    /// Last downstream write, for keepalive pacing.
    last_write: Instant,
}

struct HeldFrame {
    bytes: Bytes,
    /// Extracted text of the frame; empty for control frames queued behind a
    /// hold to preserve ordering.
    text: String,
}

impl RunState {
    fn new() -> Self {
        Self {
            collected: String::new(),
            held: Vec::new(),
            pending_stop: Vec::new(),
            last_write: Instant::now(),
        }
    }
}

enum Step {
    Continue,
    MarkerFound,
    ClientGone,
}

enum AttemptEnd {
    MarkerFound,
    Ended,
    ClientGone,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

impl AntiTruncationEngine {
    pub fn new(config: Arc<RelayConfig>, upstream: Arc<dyn UpstreamClient>) -> Self {
        Self { config, upstream }
    }

    /// Issue attempt 1. A transport failure surfaces as an error (the handler
    /// answers 502); a non-2xx response is handed back for verbatim
    /// pass-through; a 2xx response moves the run loop onto its own task.
    pub async fn start(self, ctx: EngineContext) -> Result<EngineStart, UpstreamError> {
        let first = self.send_attempt(&ctx, &ctx.body).await?;
        if !first.status.is_success() {
            tracing::warn!(
                request_id = %ctx.request_id,
                status = %first.status,
                "upstream non-2xx on first attempt; passing through"
            );
            return Ok(EngineStart::Passthrough(first));
        }
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            self.run(ctx, first, tx).await;
        });
        Ok(EngineStart::Stream(rx))
    }

    async fn send_attempt(
        &self,
        ctx: &EngineContext,
        body: &Value,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let body = serde_json::to_vec(body)
            .map_err(|e| UpstreamError::Transport(format!("request serialization: {e}")))?;
        self.upstream
            .send(UpstreamRequest {
                url: ctx.url.clone(),
                headers: ctx.headers.clone(),
                body: Bytes::from(body),
                stream: true,
            })
            .await
    }

    async fn run(self, ctx: EngineContext, first: UpstreamResponse, tx: mpsc::Sender<Bytes>) {
        let parser = parsers::parser_for(ctx.protocol);
        let mut state = RunState::new();
        let mut attempt: u32 = 1;
        let mut response = Some(first);

        loop {
            let resp = match response.take() {
                Some(r) => r,
                None => {
                    let directive = inject::continuation_directive(
                        &self.config.done_marker,
                        &state.collected,
                    );
                    let body = inject::continuation_body(
                        ctx.protocol,
                        &ctx.body,
                        &state.collected,
                        &directive,
                    );
                    tracing::info!(
                        request_id = %ctx.request_id,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        collected_chars = state.collected.chars().count(),
                        "issuing continuation attempt"
                    );
                    match self.send_attempt(&ctx, &body).await {
                        Ok(r) if r.status.is_success() => r,
                        Ok(r) => {
                            if is_retryable_status(r.status.as_u16())
                                && attempt < self.config.max_attempts
                            {
                                tracing::warn!(
                                    request_id = %ctx.request_id,
                                    status = %r.status,
                                    attempt,
                                    "retryable upstream status on continuation; retrying"
                                );
                                attempt += 1;
                                continue;
                            }
                            tracing::error!(
                                request_id = %ctx.request_id,
                                status = %r.status,
                                attempt,
                                "upstream error on continuation; ending stream"
                            );
                            let _ = send_upstream_error_event(
                                &tx,
                                &mut state,
                                &ctx.request_id,
                                attempt,
                                r.status,
                            )
                            .await;
                            return;
                        }
                        Err(e) => {
                            if attempt < self.config.max_attempts {
                                tracing::warn!(
                                    request_id = %ctx.request_id,
                                    error = %e,
                                    attempt,
                                    "continuation request failed; retrying"
                                );
                                attempt += 1;
                                continue;
                            }
                            tracing::error!(
                                request_id = %ctx.request_id,
                                error = %e,
                                attempt,
                                "continuation request failed; ending stream"
                            );
                            let _ = send_streaming_error_event(
                                &tx,
                                &mut state,
                                &ctx.request_id,
                                attempt,
                                &e.to_string(),
                            )
                            .await;
                            return;
                        }
                    }
                }
            };

            match self.relay_attempt(&ctx, parser, resp, &mut state, &tx).await {
                AttemptEnd::MarkerFound => {
                    tracing::info!(
                        request_id = %ctx.request_id,
                        attempt,
                        collected_chars = state.collected.chars().count(),
                        "done marker observed; stream complete"
                    );
                    return;
                }
                AttemptEnd::ClientGone => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        attempt,
                        "client disconnected; cancelling upstream"
                    );
                    return;
                }
                AttemptEnd::Ended => {
                    if attempt >= self.config.max_attempts {
                        // Final attempt: its terminating events are real.
                        let stops: Vec<Bytes> = state.pending_stop.drain(..).collect();
                        for frame in stops {
                            if forward(&tx, &mut state, frame).await.is_err() {
                                return;
                            }
                        }
                        let _ = tx.send(Bytes::from_static(MAX_ATTEMPTS_COMMENT)).await;
                        tracing::warn!(
                            request_id = %ctx.request_id,
                            attempt,
                            "max attempts reached without done marker"
                        );
                        return;
                    }
                    // A continuation follows: the intermediate attempt's stop
                    // events must not reach the client.
                    state.pending_stop.clear();
                    attempt += 1;
                }
            }
        }
    }

    /// Relay one upstream response, multiplexing frames against the keepalive
    /// and idle timers.
    async fn relay_attempt(
        &self,
        ctx: &EngineContext,
        parser: &'static dyn StreamParser,
        response: UpstreamResponse,
        state: &mut RunState,
        tx: &mpsc::Sender<Bytes>,
    ) -> AttemptEnd {
        let mut body = response.body.into_stream();
        let mut frames = FrameBuffer::new();
        let keepalive = self.config.keepalive_interval;
        let idle = self.config.idle_timeout;
        let marker = self.config.done_marker.as_str();
        let mut saw_byte = false;
        let mut last_upstream = Instant::now();
        state.last_write = Instant::now();

        loop {
            tokio::select! {
                chunk = body.next() => match chunk {
                    Some(Ok(bytes)) => {
                        saw_byte = true;
                        last_upstream = Instant::now();
                        let mut batch = frames.push(&bytes);
                        let mut i = 0;
                        while i < batch.len() {
                            let frame = batch[i].clone();
                            i += 1;
                            match process_frame(parser, ctx.protocol, marker, frame, state, tx).await {
                                Step::Continue => {}
                                Step::ClientGone => return AttemptEnd::ClientGone,
                                Step::MarkerFound => {
                                    // Frames already on the wire behind the
                                    // marker (e.g. [DONE]) are still relayed;
                                    // only the upstream read is cancelled.
                                    for rest in batch.drain(i..) {
                                        if forward(tx, state, rest).await.is_err() {
                                            return AttemptEnd::ClientGone;
                                        }
                                    }
                                    return AttemptEnd::MarkerFound;
                                }
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::warn!(
                            request_id = %ctx.request_id,
                            error = %e,
                            "upstream stream error mid-attempt; treating as premature close"
                        );
                        return self.end_attempt(state, tx).await;
                    }
                    None => {
                        if let Some(rest) = frames.finish() {
                            match process_frame(parser, ctx.protocol, marker, rest, state, tx).await {
                                Step::Continue => {}
                                Step::ClientGone => return AttemptEnd::ClientGone,
                                Step::MarkerFound => return AttemptEnd::MarkerFound,
                            }
                        }
                        return self.end_attempt(state, tx).await;
                    }
                },
                _ = tokio::time::sleep_until(state.last_write + keepalive), if !keepalive.is_zero() => {
                    let comment: &'static [u8] = match ctx.protocol {
                        Protocol::Claude => b": ping\n\n",
                        _ => b": keepalive\n\n",
                    };
                    if forward(tx, state, Bytes::from_static(comment)).await.is_err() {
                        return AttemptEnd::ClientGone;
                    }
                }
                _ = tokio::time::sleep_until(last_upstream + idle), if saw_byte && !idle.is_zero() => {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        idle_secs = idle.as_secs(),
                        "upstream idle timeout; treating as premature close"
                    );
                    return self.end_attempt(state, tx).await;
                }
            }
        }
    }

    /// Attempt over without a marker: the hold cannot complete into a marker
    /// within this stream, so release it.
    async fn end_attempt(&self, state: &mut RunState, tx: &mpsc::Sender<Bytes>) -> AttemptEnd {
        let held: Vec<HeldFrame> = state.held.drain(..).collect();
        for h in held {
            if forward(tx, state, h.bytes).await.is_err() {
                return AttemptEnd::ClientGone;
            }
        }
        AttemptEnd::Ended
    }
}

// ---------------------------------------------------------------------------
// Frame processing
// ---------------------------------------------------------------------------

async fn process_frame(
    parser: &dyn StreamParser,
    protocol: Protocol,
    marker: &str,
    frame: Bytes,
    state: &mut RunState,
    tx: &mpsc::Sender<Bytes>,
) -> Step {
    // Claude terminal events are withheld until the run knows whether a
    // continuation follows (splicing rule).
    if protocol == Protocol::Claude && claude::is_terminal_event(&frame) {
        state.pending_stop.push(frame);
        return Step::Continue;
    }

    let text = parser.extract_text(&frame).unwrap_or_default();
    if text.is_empty() {
        if state.held.is_empty() {
            return match forward(tx, state, frame).await {
                Ok(()) => Step::Continue,
                Err(()) => Step::ClientGone,
            };
        }
        // Queue behind the hold so ordering is preserved.
        state.held.push(HeldFrame {
            bytes: frame,
            text: String::new(),
        });
        return Step::Continue;
    }

    state.collected.push_str(&text);

    let mut combined: String = state.held.iter().map(|h| h.text.as_str()).collect();
    combined.push_str(&text);

    let mut all: Vec<HeldFrame> = state.held.drain(..).collect();
    all.push(HeldFrame { bytes: frame, text });

    if let Some(pos) = combined.find(marker) {
        // Redact the piece of the marker each frame carries, then release
        // everything in order.
        let end = pos + marker.len();
        let mut offset = 0usize;
        for h in all {
            let start = offset;
            let stop = offset + h.text.len();
            offset = stop;
            let out = if start.max(pos) < stop.min(end) {
                let piece = &marker[start.max(pos) - pos..stop.min(end) - pos];
                parser.strip_marker(&h.bytes, piece)
            } else {
                h.bytes
            };
            if forward(tx, state, out).await.is_err() {
                return Step::ClientGone;
            }
        }
        return Step::MarkerFound;
    }

    // No marker yet: hold the minimal frame tail whose text is the longest
    // marker prefix ending the combined text.
    let overlap = marker_tail_overlap(&combined, marker);
    let release_before = combined.len() - overlap;
    let mut offset = 0usize;
    let mut keep = Vec::new();
    for h in all {
        let stop = offset + h.text.len();
        if keep.is_empty() && stop <= release_before {
            if forward(tx, state, h.bytes).await.is_err() {
                return Step::ClientGone;
            }
        } else {
            keep.push(h);
        }
        offset = stop;
    }
    state.held = keep;
    Step::Continue
}

async fn forward(tx: &mpsc::Sender<Bytes>, state: &mut RunState, bytes: Bytes) -> Result<(), ()> {
    tx.send(bytes).await.map_err(|_| ())?;
    state.last_write = Instant::now();
    Ok(())
}

/// Error frame for an upstream HTTP error status that exhausted its retries.
async fn send_upstream_error_event(
    tx: &mpsc::Sender<Bytes>,
    state: &mut RunState,
    request_id: &str,
    attempt: u32,
    status: axum::http::StatusCode,
) -> Result<(), ()> {
    let payload = serde_json::json!({
        "error": "upstream_error",
        "status_code": status.as_u16(),
        "message": format!("upstream returned {status}"),
        "attempt": attempt,
        "request_id": request_id,
    });
    forward(tx, state, Bytes::from(format!("data: {payload}\n\n"))).await
}

/// Error frame for a transport-level streaming failure. No status code: the
/// request never produced one.
async fn send_streaming_error_event(
    tx: &mpsc::Sender<Bytes>,
    state: &mut RunState,
    request_id: &str,
    attempt: u32,
    message: &str,
) -> Result<(), ()> {
    let payload = serde_json::json!({
        "error": "streaming_error",
        "message": message,
        "attempt": attempt,
        "request_id": request_id,
    });
    forward(tx, state, Bytes::from(format!("data: {payload}\n\n"))).await
}

fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

/// Length in bytes of the longest proper marker prefix that ends `combined`.
/// Prefix boundaries follow the marker's char boundaries.
fn marker_tail_overlap(combined: &str, marker: &str) -> usize {
    let mut best = 0;
    for (idx, _) in marker.char_indices().skip(1) {
        if combined.ends_with(&marker[..idx]) {
            best = idx;
        }
    }
    best
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
