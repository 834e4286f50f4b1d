//! Backend for a desktop tool that orchestrates autonomous coding agents.
//!
//! CLI hook scripts POST lifecycle notifications to the hook ingestion server
//! ([`hooks::HookServer`]); per-directory session stacks infer who spawned
//! whom; the agent registry ([`registry::AgentRegistry`]) owns the lifecycle
//! state machine and agent tree; a WebSocket channel pushes named events to
//! the front-end.

pub mod api;
pub mod bus;
pub mod db;
pub mod hooks;
pub mod models;
pub mod registry;
pub mod sessions;
pub mod ws;
