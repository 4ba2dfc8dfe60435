//! Completion proxying with credential rotation
//!
//! One inbound request runs a bounded retry loop: select a credential,
//! ensure a fresh access token, forward the translated body, classify the
//! outcome. A 429 marks the credential rate limited and rotates; a token
//! exchange failure burns the credential's attempt without marking it;
//! any other non-2xx is relayed verbatim. The attempt budget equals the
//! pool size, and a tried-set guarantees each credential is used at most
//! once per inbound request.
//!
//! Streaming responses are relayed chunk by chunk through a channel task.
//! If the upstream drops mid-stream the client receives an explicit
//! `stream_interrupted` error event, never a silent truncation. If the
//! client disconnects, the channel closes and the upstream read is dropped
//! with it.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use copilot_pool::CredentialPool;
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::metrics;
use crate::translate;

/// Headers to strip before relaying upstream responses (hop-by-hop per
/// RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Shared state for the completion handler.
#[derive(Clone)]
pub struct ProxyState {
    pub client: reqwest::Client,
    pub pool: Arc<CredentialPool>,
    pub completions_url: String,
    /// Upper bound on time-to-first-byte for the upstream call. Applied to
    /// `send()` only, so streamed bodies are never cut off by a total
    /// duration limit.
    pub timeout: Duration,
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
pub(crate) fn error_response(
    status: StatusCode,
    error_type: &str,
    message: &str,
    request_id: &str,
) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// 503 for a fully exhausted pool, with Retry-After derived from the
/// soonest backoff deadline when one exists.
fn exhausted_response(retry_after: Option<Duration>, request_id: &str) -> Response {
    let secs = retry_after.map(|d| d.as_secs().max(1));
    let body = serde_json::json!({
        "error": {
            "type": "credentials_exhausted",
            "message": "all credentials are rate limited, please try again later",
            "retry_after_seconds": secs,
            "request_id": request_id,
        }
    });
    let mut builder = Response::builder()
        .status(StatusCode::SERVICE_UNAVAILABLE)
        .header(axum::http::header::CONTENT_TYPE, "application/json");
    if let Some(secs) = secs {
        builder = builder.header(axum::http::header::RETRY_AFTER, secs);
    }
    builder
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| StatusCode::SERVICE_UNAVAILABLE.into_response())
}

/// Proxy one chat-completions request with rotation and bounded retry.
pub async fn chat_completions(state: &ProxyState, body: &[u8], request_id: &str) -> Response {
    let mut request = match translate::translate(body) {
        Ok(request) => request,
        Err(e) => {
            debug!(request_id, error = %e, "rejecting malformed request");
            return error_response(
                StatusCode::BAD_REQUEST,
                "malformed_request",
                &e.to_string(),
                request_id,
            );
        }
    };

    let is_o1 = request.model.starts_with("o1");
    let client_streaming = request.stream;
    // o1 never streams upstream; ask for a buffered completion and
    // synthesize SSE from it below when the client wanted a stream
    if is_o1 {
        request.stream = false;
    }

    let payload = match serde_json::to_vec(&request) {
        Ok(payload) => payload,
        Err(e) => {
            error!(request_id, error = %e, "failed to serialize translated request");
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                "failed to serialize translated request",
                request_id,
            );
        }
    };

    let mut tried: HashSet<usize> = HashSet::new();
    let attempt_budget = state.pool.len();

    for attempt in 0..attempt_budget {
        let selected = match state.pool.select_skipping(&tried) {
            Ok(selected) => selected,
            Err(copilot_pool::Error::Exhausted { retry_after }) => {
                return exhausted_response(retry_after, request_id);
            }
            Err(e) => {
                error!(request_id, error = %e, "credential selection failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal_error",
                    &e.to_string(),
                    request_id,
                );
            }
        };

        let token = match state.pool.ensure_access_token(selected.index).await {
            Ok(token) => token,
            Err(e) => {
                // Unusable for this attempt, but not a rate-limit event
                warn!(
                    request_id,
                    credential = selected.index,
                    attempt,
                    error = %e,
                    "token exchange failed, trying next credential"
                );
                metrics::record_upstream_error("token_exchange");
                tried.insert(selected.index);
                continue;
            }
        };

        let send = state
            .client
            .post(&state.completions_url)
            .header(axum::http::header::CONTENT_TYPE.as_str(), "application/json")
            .header(axum::http::header::ACCEPT.as_str(), "text/event-stream")
            .header("editor-version", copilot_auth::EDITOR_VERSION)
            .bearer_auth(&token)
            .body(payload.clone())
            .send();

        let upstream = match tokio::time::timeout(state.timeout, send).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                warn!(
                    request_id,
                    credential = selected.index,
                    error = %e,
                    "upstream request failed, trying next credential"
                );
                metrics::record_upstream_error("connection");
                tried.insert(selected.index);
                continue;
            }
            Err(_) => {
                warn!(
                    request_id,
                    credential = selected.index,
                    timeout_secs = state.timeout.as_secs(),
                    "time to first byte exceeded, trying next credential"
                );
                metrics::record_upstream_error("timeout");
                tried.insert(selected.index);
                continue;
            }
        };

        let status = upstream.status();
        if status.as_u16() == 429 {
            let body = upstream.text().await.unwrap_or_default();
            info!(
                request_id,
                credential = selected.index,
                attempt,
                body = %body,
                "upstream rate limited, rotating credential"
            );
            metrics::record_upstream_error("rate_limited");
            state.pool.mark_rate_limited(selected.index);
            tried.insert(selected.index);
            continue;
        }

        if !status.is_success() {
            // Client or upstream error outside the rotation policy: relay as-is
            debug!(request_id, status = status.as_u16(), "relaying upstream error verbatim");
            return relay_buffered(upstream).await;
        }

        if is_o1 && client_streaming {
            return relay_o1_as_sse(upstream, request_id).await;
        }
        if client_streaming {
            return relay_stream(upstream, request_id.to_string());
        }
        return relay_buffered(upstream).await;
    }

    // Attempt budget spent without a relayable response
    let retry_after = match state.pool.select_skipping(&tried) {
        Err(copilot_pool::Error::Exhausted { retry_after }) => retry_after,
        _ => None,
    };
    exhausted_response(retry_after, request_id)
}

/// Relay a fully-buffered upstream response, preserving status, body, and
/// end-to-end headers.
async fn relay_buffered(upstream: reqwest::Response) -> Response {
    let status = upstream.status();
    let headers = upstream.headers().clone();
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to read upstream response body");
            return (
                StatusCode::BAD_GATEWAY,
                format!("upstream response read error: {e}"),
            )
                .into_response();
        }
    };

    let mut builder = Response::builder().status(status.as_u16());
    for (name, value) in &headers {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Relay a streaming upstream response chunk by chunk.
///
/// A spawned task pumps upstream chunks into a channel; the response body
/// drains the channel. Chunk boundaries are preserved. When the upstream
/// errors mid-stream, the task emits a terminal `stream_interrupted` event.
/// When the client goes away, the receiver drops, `send` fails, and the
/// task returns — dropping the upstream response and canceling the read.
fn relay_stream(upstream: reqwest::Response, request_id: String) -> Response {
    let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(32);

    tokio::spawn(async move {
        let mut chunks = upstream.bytes_stream();
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(bytes) => {
                    if tx.send(bytes).await.is_err() {
                        debug!(request_id, "client disconnected, canceling upstream stream");
                        return;
                    }
                }
                Err(e) => {
                    warn!(request_id, error = %e, "upstream disconnected mid-stream");
                    metrics::record_upstream_error("stream_interrupted");
                    let _ = tx.send(Bytes::from(stream_interrupted_event(&e))).await;
                    return;
                }
            }
        }
        debug!(request_id, "upstream stream complete");
    });

    let body = Body::from_stream(
        ReceiverStream::new(rx).map(Ok::<_, std::convert::Infallible>),
    );
    sse_response(body)
}

/// o1 never streams; synthesize the SSE shape streaming clients expect
/// from the buffered response.
async fn relay_o1_as_sse(upstream: reqwest::Response, request_id: &str) -> Response {
    let body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            error!(request_id, error = %e, "failed to read o1 response body");
            return (
                StatusCode::BAD_GATEWAY,
                format!("upstream response read error: {e}"),
            )
                .into_response();
        }
    };
    let data: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(data) => data,
        Err(e) => {
            error!(request_id, error = %e, "o1 response was not valid JSON");
            return (StatusCode::BAD_GATEWAY, "invalid upstream response body").into_response();
        }
    };

    let events = translate::to_sse_events(&translate::o1_choices_to_deltas(&data));
    sse_response(Body::from(events.concat()))
}

fn sse_response(body: Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header(axum::http::header::CACHE_CONTROL, "no-cache")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Terminal SSE event for a stream that died before completion.
fn stream_interrupted_event(error: &reqwest::Error) -> String {
    let event = serde_json::json!({
        "error": {
            "type": "stream_interrupted",
            "message": format!("upstream disconnected mid-stream: {error}"),
        }
    });
    format!("data: {event}\n\n")
}

/// Check if a header is hop-by-hop (never relayed end to end)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
