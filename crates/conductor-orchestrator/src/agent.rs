use crate::types::{AgentType, TaskPriority};
use async_trait::async_trait;
use conductor_core::{
    into_payload, BusMessage, ConductorError, ConductorResult, MessageBus, MessageType, Payload,
    Subscription, WeakMessageBus,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, warn};

/// Payload of a `TASK_REQUEST` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRequest {
    /// Id the reply must carry back.
    pub task_id: String,
    /// Free-text description of the work.
    pub description: String,
    /// Priority the task was queued with.
    #[serde(default)]
    pub priority: TaskPriority,
    /// Latest workspace context known to the orchestrator.
    #[serde(default)]
    pub context: Option<Value>,
}

impl TaskRequest {
    /// Decode a `TASK_REQUEST` payload.
    pub fn from_payload(payload: &Payload) -> ConductorResult<Self> {
        Ok(serde_json::from_value(Value::Object(payload.clone()))?)
    }

    /// Encode as a `TASK_REQUEST` payload.
    pub fn to_payload(&self) -> ConductorResult<Payload> {
        Ok(into_payload(serde_json::to_value(self)?))
    }
}

/// Capability contract implemented by every agent.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Bus id and routing target this implementation serves.
    fn agent_type(&self) -> AgentType;

    /// Called while the agent is starting. An error leaves it in `error`.
    async fn initialize(&self) -> ConductorResult<()> {
        Ok(())
    }

    /// Run one task. `Ok` is reported as `TASK_COMPLETE`, `Err` as `ERROR`.
    async fn execute(&self, request: TaskRequest) -> ConductorResult<Value>;

    /// Called while the agent is stopping.
    async fn shutdown(&self) -> ConductorResult<()> {
        Ok(())
    }

    /// Liveness check behind the orchestrator's health check.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Binds an [`Agent`] to the bus under its type's id.
///
/// Every directed `TASK_REQUEST` runs on its own tokio task; the outcome is
/// broadcast as `TASK_COMPLETE` (`{taskId, result}`) or `ERROR`
/// (`{taskId, error}`).
pub struct AgentWorker {
    agent_type: AgentType,
    subscription: Subscription,
}

impl AgentWorker {
    /// Subscribe `agent` under its agent id and serve directed task requests.
    pub fn attach(bus: &MessageBus, agent: Arc<dyn Agent>) -> Self {
        let agent_type = agent.agent_type();
        let reply_bus = bus.downgrade();
        let subscription = bus.subscribe(agent_type.as_str(), move |msg: &BusMessage| {
            if msg.kind != MessageType::TaskRequest || msg.is_broadcast() {
                return Ok(());
            }
            let request = TaskRequest::from_payload(&msg.payload)?;
            tokio::spawn(run_request(
                Arc::clone(&agent),
                reply_bus.clone(),
                request,
            ));
            Ok(())
        });
        debug!(agent = %agent_type, "Agent worker attached");
        Self {
            agent_type,
            subscription,
        }
    }

    /// Agent type this worker serves.
    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    /// Leave the bus.
    pub fn detach(self) {
        debug!(agent = %self.agent_type, "Agent worker detached");
        self.subscription.unsubscribe();
    }
}

async fn run_request(agent: Arc<dyn Agent>, bus: WeakMessageBus, request: TaskRequest) {
    let agent_type = agent.agent_type();
    let task_id = request.task_id.clone();
    debug!(task_id = %task_id, agent = %agent_type, "Executing task");

    let reply = match agent.execute(request).await {
        Ok(result) => BusMessage::broadcast(
            agent_type.as_str(),
            MessageType::TaskComplete,
            into_payload(json!({ "taskId": task_id, "result": result })),
        ),
        Err(e) => {
            warn!(task_id = %task_id, agent = %agent_type, error = %e, "Task execution failed");
            BusMessage::broadcast(
                agent_type.as_str(),
                MessageType::Error,
                into_payload(json!({ "taskId": task_id, "error": e.to_string() })),
            )
        }
    };

    let Some(bus) = bus.upgrade() else {
        return;
    };
    if let Err(e) = bus.publish(reply) {
        debug!(task_id = %task_id, error = %e, "Reply dropped");
    }
}

/// Agent that answers every request with its own description.
pub struct EchoAgent {
    agent_type: AgentType,
}

impl EchoAgent {
    /// Agent answering as `agent_type`.
    pub fn new(agent_type: AgentType) -> Self {
        Self { agent_type }
    }

    /// One echo agent per agent type.
    pub fn all() -> Vec<Arc<dyn Agent>> {
        AgentType::ALL
            .into_iter()
            .map(|agent| Arc::new(EchoAgent::new(agent)) as Arc<dyn Agent>)
            .collect()
    }
}

#[async_trait]
impl Agent for EchoAgent {
    fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    async fn execute(&self, request: TaskRequest) -> ConductorResult<Value> {
        if request.description.trim().is_empty() {
            return Err(ConductorError::Agent(format!(
                "{}: empty task description",
                self.agent_type
            )));
        }
        Ok(json!({
            "agent": self.agent_type,
            "echo": request.description,
        }))
    }
}
