use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, Payload};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// The closed set of agent kinds the orchestrator manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentType {
    /// Fallback for requests no specialist claims.
    Coordinator,
    /// Writes new code.
    Codegen,
    /// Reviews changes.
    Review,
    /// Triages issues and bugs.
    Issue,
    /// Manages pull requests.
    Pr,
    /// Ships releases.
    Deployment,
    /// Writes and runs tests.
    Test,
}

impl AgentType {
    /// Every agent type, in table order.
    pub const ALL: [AgentType; 7] = [
        AgentType::Coordinator,
        AgentType::Codegen,
        AgentType::Review,
        AgentType::Issue,
        AgentType::Pr,
        AgentType::Deployment,
        AgentType::Test,
    ];

    /// Bus subscriber id and wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Coordinator => "coordinator",
            AgentType::Codegen => "codegen",
            AgentType::Review => "review",
            AgentType::Issue => "issue",
            AgentType::Pr => "pr",
            AgentType::Deployment => "deployment",
            AgentType::Test => "test",
        }
    }
}

impl fmt::Display for AgentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentType {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim();
        AgentType::ALL
            .into_iter()
            .find(|agent| agent.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| ConductorError::UnknownAgent(s.to_string()))
    }
}

/// Lifecycle state of an agent.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    /// Not started, or stopped cleanly.
    #[default]
    Stopped,
    /// Startup in progress.
    Starting,
    /// Accepting tasks.
    Running,
    /// Shutdown in progress.
    Stopping,
    /// Failed to start or reported a fault.
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AgentStatus::Stopped => "stopped",
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Per-agent record kept by the [`AgentMonitor`](crate::monitor::AgentMonitor).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    /// Which agent this record describes.
    pub agent_type: AgentType,
    /// Lifecycle state.
    pub status: AgentStatus,
    /// When the agent last entered `running`.
    pub started_at: Option<DateTime<Utc>>,
    /// Last state change or task assignment.
    pub last_activity: Option<DateTime<Utc>>,
    /// Task currently dispatched to the agent.
    pub current_task: Option<String>,
    /// Tasks the agent completed.
    pub completed_tasks: u64,
    /// Errors the agent reported.
    pub failed_tasks: u64,
}

impl AgentInfo {
    /// Stopped record with zeroed counters.
    pub fn new(agent_type: AgentType) -> Self {
        Self {
            agent_type,
            status: AgentStatus::Stopped,
            started_at: None,
            last_activity: None,
            current_task: None,
            completed_tasks: 0,
            failed_tasks: 0,
        }
    }
}

/// Task urgency. Variant order matches [`TaskPriority::rank`].
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Rank 1.
    Low,
    /// Rank 2, the default.
    #[default]
    Normal,
    /// Rank 3.
    High,
    /// Rank 4, dispatched first.
    Critical,
}

impl TaskPriority {
    /// Numeric rank used for queue ordering: critical=4 down to low=1.
    pub fn rank(self) -> u8 {
        match self {
            TaskPriority::Critical => 4,
            TaskPriority::High => 3,
            TaskPriority::Normal => 2,
            TaskPriority::Low => 1,
        }
    }

    /// Every priority, highest first.
    pub const ALL: [TaskPriority; 4] = [
        TaskPriority::Critical,
        TaskPriority::High,
        TaskPriority::Normal,
        TaskPriority::Low,
    ];
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskPriority::Critical => "critical",
            TaskPriority::High => "high",
            TaskPriority::Normal => "normal",
            TaskPriority::Low => "low",
        };
        f.write_str(s)
    }
}

/// Status of a task in the execution queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting for dispatch.
    #[default]
    Pending,
    /// Sent to an agent.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error; stays in the queue until retried.
    Failed,
    /// Withdrawn before dispatch.
    Cancelled,
}

impl TaskStatus {
    /// Whether the task can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// A unit of work in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id, a UUID unless set explicitly.
    pub id: String,
    /// Free-text description of the work.
    pub description: String,
    /// Dispatch urgency.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Ids of tasks that must complete successfully first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Agent the task is routed to; the coordinator when unset.
    #[serde(default)]
    pub assigned_agent: Option<AgentType>,
    /// Current state.
    #[serde(default)]
    pub status: TaskStatus,
    /// Set by the queue on enqueue when absent.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    /// Set on dispatch.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    /// Set when completed.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Value returned by the agent.
    #[serde(default)]
    pub result: Option<Value>,
    /// Failure reason.
    #[serde(default)]
    pub error: Option<String>,
    /// Times the task went back to pending because its agent was not running.
    #[serde(default)]
    pub requeue_count: u32,
    /// Free-form caller data.
    #[serde(default)]
    pub metadata: Payload,
}

impl Task {
    /// A pending, normal-priority task with a fresh UUID id.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            description: description.into(),
            priority: TaskPriority::Normal,
            dependencies: Vec::new(),
            assigned_agent: None,
            status: TaskStatus::Pending,
            created_at: None,
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            requeue_count: 0,
            metadata: Payload::new(),
        }
    }

    /// Override the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the priority.
    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the dependency ids.
    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = deps.into_iter().map(Into::into).collect();
        self
    }

    /// Route to `agent`.
    pub fn assigned_to(mut self, agent: AgentType) -> Self {
        self.assigned_agent = Some(agent);
        self
    }

    /// Fix the creation time instead of stamping it on enqueue.
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Attach a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

/// Terminal outcome of a task, kept in the queue's bounded history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// Id of the finished task.
    pub task_id: String,
    /// Whether the task completed.
    pub success: bool,
    /// Value returned on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Time from dispatch (or creation) to finish.
    pub duration_ms: u64,
}

/// Caller-facing description of a task, before ids and routing are applied.
///
/// Fields left `None` are inferred from the description.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    /// Free-text description of the work.
    pub description: String,
    /// Overrides the inferred priority.
    #[serde(default)]
    pub priority: Option<TaskPriority>,
    /// Overrides the inferred agent.
    #[serde(default)]
    pub agent: Option<AgentType>,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Free-form caller data.
    #[serde(default)]
    pub metadata: Payload,
}

impl TaskSpec {
    /// Spec with everything inferred from `description`.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    /// Set an explicit priority.
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Set an explicit agent.
    pub fn agent(mut self, agent: AgentType) -> Self {
        self.agent = Some(agent);
        self
    }

    /// Add a dependency.
    pub fn depends_on(mut self, task_id: impl Into<String>) -> Self {
        self.dependencies.push(task_id.into());
        self
    }

    /// Attach a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
