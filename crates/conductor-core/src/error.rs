use thiserror::Error;

/// A convenience `Result` alias using [`ConductorError`].
pub type ConductorResult<T> = Result<T, ConductorError>;

/// Top-level error type for the Conductor workspace.
///
/// Failures local to one subscriber or one task are logged and absorbed by the
/// event loop; only calls against an uninitialized or invalid target surface
/// these variants at the call site.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// An operation referenced an agent type outside the fixed set.
    #[error("Unknown agent type: {0}")]
    UnknownAgent(String),

    /// A task was dispatched to an agent that is not running.
    #[error("Agent not running: {0}")]
    NotRunning(String),

    /// A message was published after the bus was stopped.
    #[error("Message bus is stopped")]
    BusStopped,

    /// A subscriber callback failed while handling a message.
    #[error("Handler error: {0}")]
    Handler(String),

    /// An agent reported that a task failed.
    #[error("Task {task_id} failed: {reason}")]
    TaskFailure {
        /// The task that failed.
        task_id: String,
        /// The error reported by the agent.
        reason: String,
    },

    /// A task id is already live in the queue or recorded in history.
    #[error("Duplicate task id: {0}")]
    DuplicateTask(String),

    /// No task with the given id is known.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// The orchestrator was used before `initialize` bound a bus.
    #[error("Orchestrator is not initialized")]
    NotInitialized,

    /// A dispatched task was not answered in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// An error raised by an agent implementation.
    #[error("Agent error: {0}")]
    Agent(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
