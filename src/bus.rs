use tokio::sync::broadcast;
use tracing::trace;

use crate::models::{AgentRecord, HookEvent, HookResponse};

/// Size of the in-process event channel.
const BUS_BUFFER_SIZE: usize = 256;

/// Registry-facing lifecycle events, one per `agent:*` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEventKind {
    Spawned,
    Ready,
    Active,
    Idle,
    Completed,
    Error,
    Terminated,
    Activity,
}

impl AgentEventKind {
    pub fn topic(self) -> &'static str {
        match self {
            Self::Spawned => "agent:spawned",
            Self::Ready => "agent:ready",
            Self::Active => "agent:active",
            Self::Idle => "agent:idle",
            Self::Completed => "agent:completed",
            Self::Error => "agent:error",
            Self::Terminated => "agent:terminated",
            Self::Activity => "agent:activity",
        }
    }
}

/// Everything published in-process. The hook server produces the session and
/// detection events; the registry produces `Agent` events and consumes the rest.
#[derive(Debug, Clone)]
pub enum BusEvent {
    SessionStart {
        session_id: String,
        cwd: String,
        parent_session_id: Option<String>,
        transcript_path: Option<String>,
    },
    SessionEnd {
        session_id: String,
        cwd: String,
    },
    AgentStart {
        session_id: String,
        cwd: String,
        name: String,
        prompt: Option<String>,
    },
    AgentStop {
        session_id: String,
        name: Option<String>,
    },
    HookProcessed {
        event: HookEvent,
        response: HookResponse,
        duration_ms: u64,
    },
    Agent {
        kind: AgentEventKind,
        agent: AgentRecord,
    },
}

impl BusEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            Self::SessionStart { .. } => "session:start",
            Self::SessionEnd { .. } => "session:end",
            Self::AgentStart { .. } => "agent:start",
            Self::AgentStop { .. } => "agent:stop",
            Self::HookProcessed { .. } => "hook:processed",
            Self::Agent { kind, .. } => kind.topic(),
        }
    }
}

/// In-process publish/subscribe fan-out. Subscribers get a receiver handle;
/// dropping it (or aborting the task draining it) is the teardown.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_BUFFER_SIZE);
        Self { tx }
    }

    /// Fire-and-forget: a send error only means nobody is subscribed.
    pub fn publish(&self, event: BusEvent) {
        trace!(topic = event.topic(), "bus publish");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
