//! Agent lifecycle management, priority task queue, and event-driven dispatch.
//!
//! The orchestrator routes free-text task descriptions to one of a fixed set
//! of agent types, queues them by priority and dependency, and hands them to
//! agents over the [`conductor_core::MessageBus`]. Replies arriving on the bus
//! complete or fail tasks and trigger the next dispatch.
//!
//! # Main types
//!
//! - [`AgentOrchestrator`]: Owns the agent table and queue; reacts to bus traffic.
//! - [`TaskQueue`]: Priority queue with dependency gating and bounded result history.
//! - [`AgentMonitor`]: Per-agent lifecycle state and counters.
//! - [`Agent`]: Capability contract; [`AgentWorker`] binds one to the bus.
//! - [`ConductorConfig`]: TOML configuration for every component.

/// Agent capability trait and bus worker.
pub mod agent;
/// Configuration file.
pub mod config;
/// Orchestration engine.
pub mod engine;
/// Agent state tracking.
pub mod monitor;
/// Keyword routing of task descriptions.
pub mod routing;
/// Priority task queue.
pub mod task_queue;
/// Shared orchestration types (Task, AgentType, TaskResult, etc.).
pub mod types;

pub use agent::{Agent, AgentWorker, EchoAgent, TaskRequest};
pub use config::{ConductorConfig, OrchestratorConfig};
pub use engine::{AgentOrchestrator, OrchestratorStatus, ORCHESTRATOR_ID};
pub use monitor::AgentMonitor;
pub use routing::{infer_agent, infer_priority, route, Route};
pub use task_queue::{QueueConfig, QueueStats, TaskQueue};
pub use types::{
    AgentInfo, AgentStatus, AgentType, Task, TaskPriority, TaskResult, TaskSpec, TaskStatus,
};
