//! The request/response interception state machine.
//!
//! Every inbound call runs request -> classify -> (stall) -> commit ->
//! forward; the upstream reply runs response -> correlate -> commit. The
//! policy decision happens before anything is sent upstream, so a denied
//! or unrecordable call is rejected without ever reaching the tool.
//!
//! Fail-closed rules: an unhealthy ledger or a full queue turns the call
//! away with 503; a stall that ends in rejection, timeout, or client
//! cancellation commits a terminal `rejection` event and never forwards.

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use vouch_core::event::{random_event_id, Event, EventType, MAX_TASK_ID_LEN};
use vouch_core::gateway::StallOutcome;
use vouch_core::policy::{redact_params, Action, PolicyRule};
use vouch_core::worker::WorkerError;
use vouch_core::TaskState;

use crate::state::SharedState;

/// Maximum accepted request body size (5 MiB).
pub const MAX_BODY_BYTES: usize = 5 * 1024 * 1024;

/// Builds the proxy router: every path and method funnels into the
/// interceptor.
pub fn router(state: SharedState) -> Router {
    Router::new().fallback(intercept).with_state(state)
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
}

/// The request-path hook point.
async fn intercept(State(state): State<SharedState>, req: Request) -> Response {
    if req.method() != Method::POST {
        return rpc_error(
            StatusCode::BAD_REQUEST,
            -32000,
            "only POST is accepted",
            None,
        );
    }

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(body) if !body.is_empty() => body,
        Ok(_) => {
            return rpc_error(StatusCode::BAD_REQUEST, -32000, "request body is empty", None);
        },
        Err(_) => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                -32000,
                "request body too large",
                None,
            );
        },
    };

    let rpc: RpcRequest = match serde_json::from_slice(&body) {
        Ok(rpc) => rpc,
        Err(e) => {
            debug!(error = %e, "rejecting unparseable JSON-RPC request");
            return rpc_error(StatusCode::BAD_REQUEST, -32700, "parse error", None);
        },
    };
    let rpc_id = rpc.id.clone();

    let method = match rpc.method.as_deref() {
        Some(m) if !m.is_empty() => m.to_string(),
        _ => {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                -32600,
                "method must not be empty",
                rpc_id,
            );
        },
    };
    let params = rpc.params.unwrap_or(Value::Null);

    let task_id = params
        .get("task_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    if task_id.len() > MAX_TASK_ID_LEN {
        return rpc_error(StatusCode::BAD_REQUEST, -32000, "task_id too long", rpc_id);
    }

    if !state.worker.is_healthy() {
        warn!(method = %method, "blocking agent request: ledger unhealthy");
        return rpc_error(
            StatusCode::SERVICE_UNAVAILABLE,
            -32000,
            "Ledger Storage Failure",
            rpc_id,
        );
    }

    let rule = state.policy.load().decide(&method, &params).cloned();

    if rule.as_ref().map(|r| r.action) == Some(Action::Stall) {
        let rule = rule.as_ref().expect("stall implies a matched rule");
        if let Err(response) =
            stall(&state, &method, &params, &task_id, rule, rpc_id.clone()).await
        {
            return response;
        }
    }

    if let Err(response) =
        commit_tool_call(&state, &method, &params, &task_id, rule.as_ref(), rpc_id.clone())
    {
        return response;
    }

    forward(&state, body, rpc_id).await
}

/// Runs the stall workflow. `Ok(())` means an approver allowed the call.
async fn stall(
    state: &SharedState,
    method: &str,
    params: &Value,
    task_id: &str,
    rule: &PolicyRule,
    rpc_id: Option<Value>,
) -> Result<(), Response> {
    let event_id = random_event_id();
    info!(
        method = %method,
        policy_id = %rule.id,
        risk_level = %rule.risk_level,
        event_id = %event_id,
        "stalling call pending approval"
    );

    let mut blocked = Event::new(EventType::Blocked)
        .with_method(method)
        .with_params(params.clone())
        .with_task(task_id, TaskState::Stalled);
    blocked.id = event_id.clone();
    blocked.policy_id = rule.id.clone();
    blocked.risk_level = rule.risk_level.clone();
    blocked.was_blocked = true;
    submit_or_reject(state, blocked, rpc_id.clone())?;

    let handle = match state.gateway.register(&event_id) {
        Ok(handle) => handle,
        Err(e) => {
            // The blocked event needs its terminal record even on this
            // internal failure.
            error!(error = %e, "failed to register stall");
            submit_terminal_rejection(state, &event_id, method, task_id, "internal_error");
            return Err(rpc_error(
                StatusCode::SERVICE_UNAVAILABLE,
                -32000,
                "stall registration failed",
                rpc_id,
            ));
        },
    };

    if !task_id.is_empty() {
        state
            .active_tasks
            .insert(task_id.to_string(), TaskState::Stalled);
        match state.store.get_task_failure_count(task_id) {
            Ok(count) if count > 0 => {
                warn!(task_id = %task_id, failures = count, "stall warning: task has prior failures");
            },
            Ok(_) => {},
            Err(e) => warn!(error = %e, "could not read task failure count"),
        }
    }

    info!(event_id = %event_id, "waiting for approval");
    let mut guard = CancelGuard {
        state,
        event_id: &event_id,
        method,
        task_id,
        armed: true,
    };
    let outcome = state.gateway.wait(handle, state.stall_timeout).await;
    guard.armed = false;
    drop(guard);

    match outcome {
        StallOutcome::Approved => {
            info!(event_id = %event_id, "stall approved");
            let mut approval = Event::new(EventType::Approval)
                .with_method(method)
                .with_task(task_id, TaskState::Working);
            approval.parent_id = event_id.clone();
            approval.policy_id = rule.id.clone();
            approval.risk_level = rule.risk_level.clone();
            submit_or_reject(state, approval, rpc_id)?;
            Ok(())
        },
        StallOutcome::Rejected => {
            info!(event_id = %event_id, "stall rejected");
            submit_terminal_rejection(state, &event_id, method, task_id, "rejected");
            record_stall_failure(state, task_id);
            Err(rpc_error(
                StatusCode::FORBIDDEN,
                -32000,
                "stall rejected",
                rpc_id,
            ))
        },
        StallOutcome::TimedOut => {
            warn!(event_id = %event_id, "stall timed out");
            submit_terminal_rejection(state, &event_id, method, task_id, "stall_timeout");
            record_stall_failure(state, task_id);
            Err(rpc_error(
                StatusCode::FORBIDDEN,
                -32000,
                "stall timed out",
                rpc_id,
            ))
        },
    }
}

/// Commits the `tool_call` event with redacted params and the task
/// hierarchy link.
fn commit_tool_call(
    state: &SharedState,
    method: &str,
    params: &Value,
    task_id: &str,
    rule: Option<&PolicyRule>,
    rpc_id: Option<Value>,
) -> Result<(), Response> {
    let committed_params = match rule {
        Some(rule) if !rule.redact.is_empty() => redact_params(params, &rule.redact),
        _ => params.clone(),
    };

    let mut event = Event::new(EventType::ToolCall)
        .with_method(method)
        .with_params(committed_params)
        .with_task(task_id, TaskState::Working);
    if let Some(rule) = rule {
        event.policy_id = rule.id.clone();
        event.risk_level = rule.risk_level.clone();
    }

    if !task_id.is_empty() {
        if let Some(parent) = state.last_event_by_task.get(task_id) {
            event.parent_id = parent.value().clone();
        }
        state
            .last_event_by_task
            .insert(task_id.to_string(), event.id.clone());
        state
            .active_tasks
            .insert(task_id.to_string(), TaskState::Working);
    }

    submit_or_reject(state, event, rpc_id)
}

/// Forwards the original, unredacted body upstream and intercepts the
/// response.
async fn forward(state: &SharedState, body: Bytes, rpc_id: Option<Value>) -> Response {
    let result = state
        .upstream
        .post(&state.upstream_url)
        .header(header::CONTENT_TYPE, "application/json")
        .body(body)
        .send()
        .await;

    let upstream_response = match result {
        Ok(response) => response,
        Err(e) => {
            error!(error = %e, "upstream request failed");
            return rpc_error(StatusCode::BAD_GATEWAY, -32000, "upstream unreachable", rpc_id);
        },
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let content_type = upstream_response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("application/json")
        .to_string();
    let body = match upstream_response.bytes().await {
        Ok(body) => body,
        Err(e) => {
            error!(error = %e, "failed to read upstream response body");
            return rpc_error(
                StatusCode::BAD_GATEWAY,
                -32000,
                "upstream response unreadable",
                rpc_id,
            );
        },
    };

    intercept_response(state, &body);

    let mut headers = HeaderMap::new();
    if let Ok(value) = content_type.parse() {
        headers.insert(header::CONTENT_TYPE, value);
    }
    (status, headers, body).into_response()
}

/// The response-path hook point. Never alters the response; a response
/// event that cannot be recorded is dropped with a loud log.
fn intercept_response(state: &SharedState, body: &[u8]) {
    let Ok(rpc) = serde_json::from_slice::<RpcResponse>(body) else {
        // Not a JSON-RPC response; pass through silently.
        return;
    };
    let result = rpc.result.unwrap_or(Value::Null);

    let mut task_id = String::new();
    let mut task_state = TaskState::Working;
    if let Some(tid) = result.get("task_id").and_then(Value::as_str) {
        task_id = tid.to_string();
        if let Some(s) = result.get("state").and_then(Value::as_str) {
            task_state = TaskState::parse(s);
        }
        state.active_tasks.insert(task_id.clone(), task_state);
    }

    if !state.worker.is_healthy() {
        error!("CRITICAL: dropping tool_response event: ledger unhealthy");
        return;
    }

    let mut event = Event::new(EventType::ToolResponse).with_task(task_id, task_state);
    event.response = result;
    if let Err(e) = state.worker.submit(event) {
        error!(error = %e, "CRITICAL: dropping tool_response event");
    }
}

/// Submits an event, mapping backpressure and shutdown to a fail-closed
/// 503.
fn submit_or_reject(
    state: &SharedState,
    event: Event,
    rpc_id: Option<Value>,
) -> Result<(), Response> {
    state.worker.submit(event).map_err(|e| {
        let message = match e {
            WorkerError::QueueFull => "ledger queue full",
            _ => "ledger unavailable",
        };
        warn!(error = %message, "rejecting request: cannot record event");
        rpc_error(StatusCode::SERVICE_UNAVAILABLE, -32000, message, rpc_id)
    })
}

/// Commits the terminal `rejection` event for a resolved stall.
fn submit_terminal_rejection(
    state: &SharedState,
    blocked_event_id: &str,
    method: &str,
    task_id: &str,
    reason: &str,
) {
    let mut rejection = Event::new(EventType::Rejection)
        .with_method(method)
        .with_params(json!({ "reason": reason }))
        .with_task(task_id, TaskState::Failed);
    rejection.parent_id = blocked_event_id.to_string();
    if let Err(e) = state.worker.submit(rejection) {
        error!(error = %e, "failed to record rejection event");
    }
    if !task_id.is_empty() {
        state
            .active_tasks
            .insert(task_id.to_string(), TaskState::Failed);
    }
}

fn record_stall_failure(state: &SharedState, task_id: &str) {
    if task_id.is_empty() {
        return;
    }
    if let Err(e) = state.store.record_task_failure(task_id) {
        warn!(error = %e, task_id = %task_id, "could not record task failure");
    }
}

/// Commits `rejection(reason=client_canceled)` and releases the approval
/// slot when the client drops the request mid-stall.
struct CancelGuard<'a> {
    state: &'a SharedState,
    event_id: &'a str,
    method: &'a str,
    task_id: &'a str,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!(event_id = %self.event_id, "client canceled a stalled request");
        self.state.gateway.release(self.event_id);
        submit_terminal_rejection(
            self.state,
            self.event_id,
            self.method,
            self.task_id,
            "client_canceled",
        );
    }
}

/// Builds a JSON-RPC error response with a matching HTTP status.
fn rpc_error(status: StatusCode, code: i64, message: &str, id: Option<Value>) -> Response {
    let body = json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": { "code": code, "message": message },
    });
    (status, Json(body)).into_response()
}
