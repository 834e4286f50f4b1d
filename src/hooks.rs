use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::api::AppState;
use crate::bus::{BusEvent, EventBus};
use crate::db;
use crate::models::{Decision, HookEvent, HookEventRecord, HookPayload, HookResponse};
use crate::sessions::SessionStacks;
use crate::ws::UiNotifier;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<HookResponse>> + Send>>;
pub type HookHandler = Arc<dyn Fn(HookEvent) -> HandlerFuture + Send + Sync>;

/// Sole network entry point for lifecycle notifications from running CLI
/// processes. Parses, audits, runs the per-event-type handler chain, and
/// emits `hook:processed` for in-process subscribers.
pub struct HookServer {
    pool: SqlitePool,
    bus: EventBus,
    notifier: UiNotifier,
    stacks: Arc<SessionStacks>,
    handlers: RwLock<HashMap<String, Vec<(String, HookHandler)>>>,
}

impl HookServer {
    pub fn new(pool: SqlitePool, bus: EventBus, notifier: UiNotifier) -> Self {
        Self {
            pool,
            bus,
            notifier,
            stacks: Arc::new(SessionStacks::new()),
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub fn stacks(&self) -> &SessionStacks {
        &self.stacks
    }

    pub fn register_handler(&self, event_type: &str, name: &str, handler: HookHandler) {
        let mut handlers = self.handlers.write().expect("handler table poisoned");
        handlers
            .entry(event_type.to_string())
            .or_default()
            .push((name.to_string(), handler));
    }

    /// Wire up the built-in handlers: session-stack bookkeeping on
    /// SessionStart/SessionEnd and sub-agent detection on PreToolUse and
    /// SubagentStop.
    pub fn install_default_handlers(&self) {
        let stacks = self.stacks.clone();
        let bus = self.bus.clone();
        self.register_handler(
            "SessionStart",
            "session-stack-push",
            Arc::new(move |event: HookEvent| {
                let stacks = stacks.clone();
                let bus = bus.clone();
                Box::pin(async move {
                    if event.session_id.is_empty() {
                        return Ok(HookResponse::allow());
                    }
                    // Resolve the parent before pushing, so a session is never
                    // its own parent.
                    let parent = stacks.current_parent_session(&event.cwd);
                    stacks.push_session(&event.cwd, &event.session_id);
                    bus.publish(BusEvent::SessionStart {
                        session_id: event.session_id,
                        cwd: event.cwd,
                        parent_session_id: parent,
                        transcript_path: event.transcript_path,
                    });
                    Ok(HookResponse::allow())
                })
            }),
        );

        let stacks = self.stacks.clone();
        let bus = self.bus.clone();
        self.register_handler(
            "SessionEnd",
            "session-stack-pop",
            Arc::new(move |event: HookEvent| {
                let stacks = stacks.clone();
                let bus = bus.clone();
                Box::pin(async move {
                    if !event.session_id.is_empty() {
                        stacks.pop_session(&event.cwd, &event.session_id);
                        bus.publish(BusEvent::SessionEnd {
                            session_id: event.session_id,
                            cwd: event.cwd,
                        });
                    }
                    Ok(HookResponse::allow())
                })
            }),
        );

        let bus = self.bus.clone();
        self.register_handler(
            "PreToolUse",
            "subagent-detect",
            Arc::new(move |event: HookEvent| {
                let bus = bus.clone();
                Box::pin(async move {
                    if event.tool_name.as_deref() == Some("Task") {
                        let input = event.tool_input.as_ref();
                        let name = input
                            .and_then(|i| i.get("subagent_type"))
                            .and_then(Value::as_str)
                            .or_else(|| {
                                input.and_then(|i| i.get("description")).and_then(Value::as_str)
                            })
                            .unwrap_or("subagent")
                            .to_string();
                        let prompt = input
                            .and_then(|i| i.get("prompt"))
                            .and_then(Value::as_str)
                            .map(str::to_string);
                        debug!(session_id = %event.session_id, name, "sub-agent detected");
                        bus.publish(BusEvent::AgentStart {
                            session_id: event.session_id,
                            cwd: event.cwd,
                            name,
                            prompt,
                        });
                    }
                    Ok(HookResponse::allow())
                })
            }),
        );

        let bus = self.bus.clone();
        self.register_handler(
            "SubagentStop",
            "subagent-stop",
            Arc::new(move |event: HookEvent| {
                let bus = bus.clone();
                Box::pin(async move {
                    let name = HookPayload(event.raw.clone())
                        .str_field("subagent_type")
                        .map(str::to_string);
                    bus.publish(BusEvent::AgentStop {
                        session_id: event.session_id,
                        name,
                    });
                    Ok(HookResponse::allow())
                })
            }),
        );
    }

    /// Run one hook payload through the full pipeline. The audit record is
    /// persisted before any handler runs and is never rolled back.
    pub async fn process(&self, payload: Value) -> Result<HookResponse> {
        let started = Instant::now();
        let event = HookPayload(payload).normalize();

        info!(
            event_type = %event.event_type,
            session_id = %event.session_id,
            "received hook event"
        );

        let record = HookEventRecord {
            id: Uuid::new_v4().to_string(),
            event_type: event.event_type.clone(),
            session_id: event.session_id.clone(),
            project_path: event.cwd.clone(),
            tool_name: event.tool_name.clone(),
            tool_input: event.tool_input.as_ref().map(Value::to_string),
            tool_result: event.tool_response.as_ref().map(Value::to_string),
            blocked: event.blocked,
            block_reason: event.block_reason.clone(),
            duration_ms: event.duration_ms,
            timestamp: Utc::now(),
        };
        db::record_hook_event(&self.pool, &record)
            .await
            .context("failed to persist hook event")?;

        self.notifier.push("hook:event", event.raw.clone());

        let chain: Vec<(String, HookHandler)> = {
            let handlers = self.handlers.read().expect("handler table poisoned");
            handlers.get(&event.event_type).cloned().unwrap_or_default()
        };

        let mut response = HookResponse::allow();
        for (name, handler) in chain {
            match handler(event.clone()).await {
                Ok(reply) => {
                    let stop = merge_reply(&mut response, reply);
                    if stop {
                        debug!(handler = %name, "handler blocked; chain short-circuited");
                        break;
                    }
                }
                // A failing handler never aborts the chain.
                Err(e) => warn!(handler = %name, "hook handler failed: {e:#}"),
            }
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        self.bus.publish(BusEvent::HookProcessed {
            event,
            response: response.clone(),
            duration_ms,
        });

        Ok(response)
    }
}

/// Fold one handler reply into the accumulated response. Returns true when
/// the chain must short-circuit (block/deny).
fn merge_reply(acc: &mut HookResponse, reply: HookResponse) -> bool {
    if let Some(extra) = reply.inject_context {
        match &mut acc.inject_context {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(&extra);
            }
            slot => *slot = Some(extra),
        }
    }

    if let Some(modified) = reply.modified_input {
        match (&mut acc.modified_input, modified) {
            (Some(Value::Object(base)), Value::Object(add)) => {
                for (k, v) in add {
                    base.insert(k, v);
                }
            }
            (slot, modified) => *slot = Some(modified),
        }
    }

    if reply.message.is_some() {
        acc.message = reply.message;
    }

    if reply.decision != Decision::Allow {
        acc.decision = reply.decision;
        return true;
    }
    false
}

/// Catch-all HTTP entry point. Only POST carries hook traffic; OPTIONS is a
/// CORS preflight answered 200; everything else is 405. Failures still answer
/// with the permissive decision so the caller's tool loop never wedges.
pub async fn ingest(State(state): State<AppState>, method: Method, body: Bytes) -> Response {
    match method {
        Method::OPTIONS => StatusCode::OK.into_response(),
        Method::POST => {
            let payload: Value = match serde_json::from_slice(&body) {
                Ok(v) => v,
                Err(e) => {
                    warn!("malformed hook payload: {e}");
                    return Json(HookResponse::allow()).into_response();
                }
            };
            match state.hooks.process(payload).await {
                Ok(response) => Json(response).into_response(),
                Err(e) => {
                    error!("hook processing failed: {e:#}");
                    Json(HookResponse::allow()).into_response()
                }
            }
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}
