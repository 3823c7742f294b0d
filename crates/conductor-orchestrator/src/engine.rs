use crate::agent::{Agent, AgentWorker, TaskRequest};
use crate::config::{ConductorConfig, OrchestratorConfig};
use crate::monitor::AgentMonitor;
use crate::routing;
use crate::task_queue::{QueueStats, TaskQueue};
use crate::types::{AgentInfo, AgentStatus, AgentType, Task, TaskResult, TaskSpec, TaskStatus};
use conductor_core::{
    into_payload, BusMessage, ConductorError, ConductorResult, MessageBus, MessageType,
    Subscription,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Bus id the orchestrator publishes from and listens on for directed replies.
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Read-only projection returned by [`AgentOrchestrator::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorStatus {
    /// Whether [`AgentOrchestrator::initialize`] has run since the last shutdown.
    pub initialized: bool,
    /// Every agent type, in declaration order.
    pub agents: Vec<AgentInfo>,
    /// Queue counters.
    pub task_queue: QueueStats,
}

/// Owns the agent table and the task queue, and drives dispatch from bus
/// traffic.
///
/// Cloning is cheap; every clone refers to the same orchestrator.
#[derive(Clone)]
pub struct AgentOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    this: Weak<Inner>,
    config: OrchestratorConfig,
    monitor: AgentMonitor,
    queue: Mutex<TaskQueue>,
    bus: RwLock<Option<MessageBus>>,
    context: RwLock<Option<Value>>,
    initialized: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    implementations: RwLock<BTreeMap<AgentType, Arc<dyn Agent>>>,
    workers: Mutex<Vec<AgentWorker>>,
}

impl AgentOrchestrator {
    /// Create an orchestrator with an empty default queue.
    pub fn new(config: OrchestratorConfig) -> Self {
        Self::with_queue(config, TaskQueue::new())
    }

    /// Create an orchestrator around an existing queue.
    pub fn with_queue(config: OrchestratorConfig, queue: TaskQueue) -> Self {
        let inner = Arc::new_cyclic(|this| Inner {
            this: this.clone(),
            config,
            monitor: AgentMonitor::new(),
            queue: Mutex::new(queue),
            bus: RwLock::new(None),
            context: RwLock::new(None),
            initialized: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            implementations: RwLock::new(BTreeMap::new()),
            workers: Mutex::new(Vec::new()),
        });
        Self { inner }
    }

    /// Build from the `[orchestrator]` and `[queue]` sections.
    pub fn from_config(config: &ConductorConfig) -> Self {
        Self::with_queue(
            config.orchestrator.clone(),
            TaskQueue::with_config(config.queue.clone()),
        )
    }

    /// Orchestrator settings.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// Whether `initialize` has run since the last shutdown.
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Register the implementation backing `agent.agent_type()`, replacing any
    /// previous one. It is attached to the bus now if already initialized,
    /// otherwise during [`initialize`](Self::initialize).
    pub fn register_agent(&self, agent: Arc<dyn Agent>) {
        let agent_type = agent.agent_type();
        if let Some(bus) = self.inner.bus() {
            self.inner.detach_worker(agent_type);
            self.inner
                .workers
                .lock()
                .push(AgentWorker::attach(&bus, Arc::clone(&agent)));
        }
        self.inner
            .implementations
            .write()
            .insert(agent_type, agent);
        debug!(agent = %agent_type, "Agent implementation registered");
    }

    /// Bind to `bus`, subscribe to agent traffic and auto-start the default
    /// agents. A second call only logs a warning.
    pub async fn initialize(&self, bus: &MessageBus) -> ConductorResult<()> {
        if self.inner.initialized.swap(true, Ordering::SeqCst) {
            warn!("Orchestrator already initialized");
            return Ok(());
        }
        *self.inner.bus.write() = Some(bus.clone());

        let weak = self.inner.this.clone();
        let on_broadcast = bus.subscribe_to_broadcast(move |msg: &BusMessage| {
            match weak.upgrade() {
                Some(inner) => inner.handle_message(msg),
                None => Ok(()),
            }
        });
        // Broadcasts also reach this id; the broadcast handler already has them.
        let weak = self.inner.this.clone();
        let on_direct = bus.subscribe(ORCHESTRATOR_ID, move |msg: &BusMessage| {
            if msg.is_broadcast() {
                return Ok(());
            }
            match weak.upgrade() {
                Some(inner) => inner.handle_message(msg),
                None => Ok(()),
            }
        });
        self.inner
            .subscriptions
            .lock()
            .extend([on_broadcast, on_direct]);

        let implementations: Vec<Arc<dyn Agent>> =
            self.inner.implementations.read().values().cloned().collect();
        self.inner.workers.lock().extend(
            implementations
                .into_iter()
                .map(|agent| AgentWorker::attach(bus, agent)),
        );

        info!(
            auto_start = self.inner.config.auto_start,
            default_agents = ?self.inner.config.default_agents,
            "Orchestrator initialized"
        );

        if self.inner.config.auto_start {
            for agent in self.inner.config.default_agents.clone() {
                if let Err(e) = self.start_agent(agent).await {
                    error!(agent = %agent, error = %e, "Failed to auto-start agent");
                }
            }
        }
        Ok(())
    }

    /// Start an agent. No-op if it is already running or starting.
    ///
    /// An error from the implementation's `initialize` hook leaves the agent
    /// in `error` and is returned.
    pub async fn start_agent(&self, agent: AgentType) -> ConductorResult<()> {
        let inner = &self.inner;
        if !inner.monitor.begin_start(agent) {
            debug!(agent = %agent, "Agent already running");
            return Ok(());
        }
        info!(agent = %agent, "Starting agent");

        sleep_unless_zero(inner.config.startup_delay()).await;

        if let Some(implementation) = inner.implementation(agent) {
            if let Err(e) = implementation.initialize().await {
                inner.monitor.mark_error(agent);
                error!(agent = %agent, error = %e, "Agent failed to start");
                inner.publish(BusMessage::broadcast(
                    ORCHESTRATOR_ID,
                    MessageType::Error,
                    into_payload(json!({ "agentType": agent, "error": e.to_string() })),
                ));
                return Err(e);
            }
        }

        if !inner.monitor.finish_start(agent) {
            warn!(agent = %agent, "Agent start interrupted");
            return Ok(());
        }
        inner.publish(BusMessage::broadcast(
            ORCHESTRATOR_ID,
            MessageType::AgentStarted,
            into_payload(json!({ "agentType": agent })),
        ));
        info!(agent = %agent, "Agent started");

        inner.dispatch_next();
        Ok(())
    }

    /// Stop an agent. No-op if it is already stopped or stopping.
    ///
    /// The agent ends up `stopped` even when its `shutdown` hook fails; the
    /// hook's error is returned afterwards. A start that lands during the
    /// shutdown delay wins: the agent stays up and no `AGENT_STOPPED` is sent.
    pub async fn stop_agent(&self, agent: AgentType) -> ConductorResult<()> {
        let inner = &self.inner;
        if !inner.monitor.begin_stop(agent) {
            debug!(agent = %agent, "Agent already stopped");
            return Ok(());
        }
        info!(agent = %agent, "Stopping agent");

        sleep_unless_zero(inner.config.shutdown_delay()).await;

        let hook = match inner.implementation(agent) {
            Some(implementation) => implementation.shutdown().await,
            None => Ok(()),
        };

        if inner.monitor.finish_stop(agent) {
            inner.publish(BusMessage::broadcast(
                ORCHESTRATOR_ID,
                MessageType::AgentStopped,
                into_payload(json!({ "agentType": agent })),
            ));
            info!(agent = %agent, "Agent stopped");
        } else {
            warn!(agent = %agent, "Agent stop interrupted");
        }

        if let Err(e) = &hook {
            warn!(agent = %agent, error = %e, "Agent shutdown hook failed");
        }
        hook
    }

    /// Queue a task, inferring priority (and the agent when not given) from
    /// the description. Returns the new task id.
    pub async fn execute_task(
        &self,
        description: impl Into<String>,
        agent: Option<AgentType>,
    ) -> ConductorResult<String> {
        let mut spec = TaskSpec::new(description);
        spec.agent = agent;
        self.execute_task_with(spec).await
    }

    /// Queue a task with explicit settings; unset fields are inferred.
    pub async fn execute_task_with(&self, spec: TaskSpec) -> ConductorResult<String> {
        if !self.is_initialized() {
            return Err(ConductorError::NotInitialized);
        }

        let route = routing::route(&spec.description);
        let priority = spec.priority.unwrap_or(route.priority);
        let agent = spec.agent.unwrap_or(route.agent);

        let mut task = Task::new(spec.description)
            .with_priority(priority)
            .assigned_to(agent)
            .with_dependencies(spec.dependencies);
        task.metadata = spec.metadata;
        let task_id = task.id.clone();

        if !self.inner.monitor.is_running(agent) {
            self.start_agent(agent).await?;
        }

        self.inner.queue.lock().enqueue(task)?;
        info!(task_id = %task_id, agent = %agent, priority = %priority, "Task queued");

        self.inner.dispatch_next();
        Ok(task_id)
    }

    /// Store the latest workspace context and broadcast it to every agent.
    /// Later task requests carry the stored snapshot.
    pub fn update_context(&self, context: Value) {
        *self.inner.context.write() = Some(context.clone());
        self.inner.publish(BusMessage::broadcast(
            ORCHESTRATOR_ID,
            MessageType::ContextUpdate,
            into_payload(json!({ "context": context })),
        ));
        debug!("Workspace context updated");
    }

    /// Snapshot of agents and queue counters.
    pub fn status(&self) -> OrchestratorStatus {
        OrchestratorStatus {
            initialized: self.is_initialized(),
            agents: self.inner.monitor.snapshot(),
            task_queue: self.inner.queue.lock().stats(),
        }
    }

    /// Current record for one agent.
    pub fn agent_info(&self, agent: AgentType) -> AgentInfo {
        self.inner.monitor.get(agent)
    }

    /// Agents currently in `running` state.
    pub fn running_agents(&self) -> Vec<AgentInfo> {
        self.inner.monitor.running()
    }

    /// Health of a running agent: delegates to its implementation when one is
    /// registered. Agents that are not running are unhealthy.
    pub async fn health_check(&self, agent: AgentType) -> bool {
        if !self.inner.monitor.is_running(agent) {
            return false;
        }
        match self.inner.implementation(agent) {
            Some(implementation) => implementation.health_check().await,
            None => true,
        }
    }

    /// Cancel a pending task.
    pub fn cancel_task(&self, task_id: &str) -> bool {
        let cancelled = self.inner.queue.lock().cancel(task_id);
        if cancelled {
            info!(task_id = %task_id, "Task cancelled");
        }
        cancelled
    }

    /// Send a failed task back to pending and try to dispatch it.
    pub fn retry_task(&self, task_id: &str) -> bool {
        let retried = self.inner.queue.lock().retry(task_id);
        if retried {
            info!(task_id = %task_id, "Task retried");
            self.inner.dispatch_next();
        }
        retried
    }

    /// A task still in the active queue.
    pub fn task(&self, task_id: &str) -> Option<Task> {
        self.inner.queue.lock().get(task_id).cloned()
    }

    /// Every task still in the active queue, in dispatch order.
    pub fn tasks(&self) -> Vec<Task> {
        self.inner.queue.lock().all_tasks().to_vec()
    }

    /// The recorded outcome of a finished task.
    pub fn task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.inner.queue.lock().completed_result(task_id).cloned()
    }

    /// The result value of a finished task, or why there is none.
    pub fn task_outcome(&self, task_id: &str) -> ConductorResult<Value> {
        match self.task_result(task_id) {
            Some(result) if result.success => Ok(result.result.unwrap_or(Value::Null)),
            Some(result) => Err(ConductorError::TaskFailure {
                task_id: result.task_id,
                reason: result.error.unwrap_or_default(),
            }),
            None => Err(ConductorError::TaskNotFound(task_id.to_string())),
        }
    }

    /// Tasks still pending or in progress.
    pub fn outstanding_tasks(&self) -> usize {
        let queue = self.inner.queue.lock();
        queue.pending_count() + queue.in_progress_count()
    }

    /// Stop every running agent, leave the bus and mark uninitialized.
    pub async fn shutdown(&self) {
        info!("Shutting down orchestrator");
        for agent in AgentType::ALL {
            if self.inner.monitor.status(agent) == AgentStatus::Running {
                if let Err(e) = self.stop_agent(agent).await {
                    warn!(agent = %agent, error = %e, "Error while stopping agent");
                }
            }
        }
        self.inner.monitor.reset();

        let subscriptions = std::mem::take(&mut *self.inner.subscriptions.lock());
        for subscription in subscriptions {
            subscription.unsubscribe();
        }
        let workers = std::mem::take(&mut *self.inner.workers.lock());
        for worker in workers {
            worker.detach();
        }

        *self.inner.bus.write() = None;
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("Orchestrator shut down");
    }
}

impl Default for AgentOrchestrator {
    fn default() -> Self {
        Self::new(OrchestratorConfig::default())
    }
}

impl Inner {
    fn bus(&self) -> Option<MessageBus> {
        self.bus.read().clone()
    }

    fn implementation(&self, agent: AgentType) -> Option<Arc<dyn Agent>> {
        self.implementations.read().get(&agent).cloned()
    }

    fn detach_worker(&self, agent: AgentType) {
        let mut workers = self.workers.lock();
        let (old, keep): (Vec<_>, Vec<_>) = std::mem::take(&mut *workers)
            .into_iter()
            .partition(|worker| worker.agent_type() == agent);
        *workers = keep;
        drop(workers);
        for worker in old {
            worker.detach();
        }
    }

    /// Publish if bound. Drops on a stopped bus are already logged by the bus.
    fn publish(&self, message: BusMessage) {
        if let Some(bus) = self.bus() {
            if let Err(e) = bus.publish(message) {
                debug!(error = %e, "Message not published");
            }
        }
    }

    /// One dispatch step: hand the next eligible task to its agent.
    fn dispatch_next(&self) {
        let Some(bus) = self.bus() else {
            return;
        };
        let Some((task, agent)) = self.next_dispatchable() else {
            return;
        };

        self.monitor.assign_task(agent, &task.id);
        let request = TaskRequest {
            task_id: task.id.clone(),
            description: task.description.clone(),
            priority: task.priority,
            context: self.context.read().clone(),
        };
        let message = request.to_payload().map(|payload| {
            BusMessage::directed(
                ORCHESTRATOR_ID,
                agent.as_str(),
                MessageType::TaskRequest,
                payload,
            )
        });

        match message.and_then(|message| bus.publish(message)) {
            Ok(()) => {
                info!(task_id = %task.id, agent = %agent, priority = %task.priority, "Task dispatched");
                self.arm_watchdog(&task, agent);
            }
            Err(e) => {
                self.queue.lock().requeue(&task.id);
                self.monitor.release_task(agent, &task.id);
                warn!(task_id = %task.id, agent = %agent, error = %e, "Task request not sent, requeued");
            }
        }
    }

    /// Dequeue the first eligible task whose agent is running. Tasks passed
    /// over because their agent is down go back to pending in place, or fail
    /// with `NotRunning` once they reach `max_requeues`.
    fn next_dispatchable(&self) -> Option<(Task, AgentType)> {
        let mut queue = self.queue.lock();
        let mut passed_over = Vec::new();

        let found = loop {
            let Some(task) = queue.dequeue() else {
                break None;
            };
            let agent = task.assigned_agent.unwrap_or(AgentType::Coordinator);
            if self.monitor.is_running(agent) {
                break Some((task, agent));
            }
            if task.requeue_count >= self.config.max_requeues {
                let error = ConductorError::NotRunning(agent.to_string());
                queue.fail(&task.id, error.to_string());
                warn!(
                    task_id = %task.id,
                    agent = %agent,
                    requeues = task.requeue_count,
                    "Agent never became ready, task failed"
                );
            } else {
                debug!(task_id = %task.id, agent = %agent, "Agent not running, task requeued");
                passed_over.push(task.id);
            }
        };

        for task_id in &passed_over {
            queue.requeue(task_id);
        }
        found
    }

    fn arm_watchdog(&self, task: &Task, agent: AgentType) {
        let Some(timeout) = self.config.task_timeout() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let this = self.this.clone();
        let task_id = task.id.clone();
        let started_at = task.started_at;
        runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = this.upgrade() {
                inner.expire(&task_id, started_at, agent, timeout);
            }
        });
    }

    /// Fail a task that is still in progress from the same dispatch.
    fn expire(
        &self,
        task_id: &str,
        started_at: Option<chrono::DateTime<chrono::Utc>>,
        agent: AgentType,
        timeout: Duration,
    ) {
        let expired = {
            let mut queue = self.queue.lock();
            let same_dispatch = queue
                .get(task_id)
                .is_some_and(|t| t.status == TaskStatus::InProgress && t.started_at == started_at);
            let error = ConductorError::Timeout(format!(
                "no reply from {agent} within {}ms",
                timeout.as_millis()
            ));
            same_dispatch && queue.fail(task_id, error.to_string())
        };
        if !expired {
            return;
        }
        self.monitor.release_task(agent, task_id);
        warn!(
            task_id = %task_id,
            agent = %agent,
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "Task timed out"
        );
        self.dispatch_next();
    }

    fn handle_message(&self, msg: &BusMessage) -> ConductorResult<()> {
        if msg.from == ORCHESTRATOR_ID {
            return Ok(());
        }
        match msg.kind {
            MessageType::TaskComplete => self.on_task_complete(msg),
            MessageType::Error => {
                self.on_agent_error(msg);
                Ok(())
            }
            MessageType::StatusUpdate => self.on_status_update(msg),
            MessageType::Log => {
                on_log(msg);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn on_task_complete(&self, msg: &BusMessage) -> ConductorResult<()> {
        let task_id = msg.payload_str("taskId").ok_or_else(|| {
            ConductorError::Handler(format!("{} from {} without taskId", msg.kind, msg.from))
        })?;
        let result = msg.payload.get("result").cloned();

        let completed = self.queue.lock().complete(task_id, result);
        if !completed {
            debug!(task_id = %task_id, from = %msg.from, "Completion for unknown task ignored");
            return Ok(());
        }
        if let Ok(agent) = msg.from.parse::<AgentType>() {
            self.monitor.record_completion(agent, task_id);
        }
        info!(task_id = %task_id, agent = %msg.from, "Task completed");

        self.dispatch_next();
        Ok(())
    }

    fn on_agent_error(&self, msg: &BusMessage) {
        let error = msg.payload_str("error").unwrap_or("unknown error").to_string();
        let task_id = msg.payload_str("taskId");

        let failed = task_id.is_some_and(|id| self.queue.lock().fail(id, error.clone()));
        if let Ok(agent) = msg.from.parse::<AgentType>() {
            self.monitor.record_failure(agent, task_id);
        }
        error!(
            agent = %msg.from,
            task_id = task_id.unwrap_or("-"),
            error = %error,
            "Agent reported error"
        );

        if failed {
            self.dispatch_next();
        }
    }

    fn on_status_update(&self, msg: &BusMessage) -> ConductorResult<()> {
        let agent: AgentType = msg.from.parse()?;
        let status = msg.payload.get("status").cloned().ok_or_else(|| {
            ConductorError::Handler(format!("{} from {} without status", msg.kind, msg.from))
        })?;
        let status: AgentStatus = serde_json::from_value(status)?;

        self.monitor.set_status(agent, status);
        info!(agent = %agent, status = %status, "Agent status updated");

        if status == AgentStatus::Running {
            self.dispatch_next();
        }
        Ok(())
    }
}

fn on_log(msg: &BusMessage) {
    let message = msg.payload_str("message").unwrap_or_default();
    match msg.payload_str("level") {
        Some("error") => error!(agent = %msg.from, "{message}"),
        Some("warn") => warn!(agent = %msg.from, "{message}"),
        Some("debug") => debug!(agent = %msg.from, "{message}"),
        _ => info!(agent = %msg.from, "{message}"),
    }
}

async fn sleep_unless_zero(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::agent::EchoAgent;
    use crate::types::TaskPriority;
    use async_trait::async_trait;
    use conductor_core::{HistoryFilter, Recipient};
    use std::sync::atomic::AtomicUsize;

    fn quick_config() -> OrchestratorConfig {
        OrchestratorConfig {
            startup_delay_ms: 0,
            shutdown_delay_ms: 0,
            ..OrchestratorConfig::default()
        }
    }

    fn manual_config() -> OrchestratorConfig {
        OrchestratorConfig {
            auto_start: false,
            ..quick_config()
        }
    }

    async fn settle(bus: &MessageBus) {
        for _ in 0..20 {
            bus.flush().await;
            tokio::task::yield_now().await;
        }
    }

    fn started_bus() -> MessageBus {
        let bus = MessageBus::default();
        bus.start();
        bus
    }

    struct BrokenAgent;

    #[async_trait]
    impl Agent for BrokenAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Deployment
        }

        async fn initialize(&self) -> ConductorResult<()> {
            Err(ConductorError::Agent("no credentials".to_string()))
        }

        async fn execute(&self, _request: TaskRequest) -> ConductorResult<Value> {
            Ok(Value::Null)
        }
    }

    struct CountingAgent {
        shutdowns: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Agent for CountingAgent {
        fn agent_type(&self) -> AgentType {
            AgentType::Review
        }

        async fn execute(&self, _request: TaskRequest) -> ConductorResult<Value> {
            Ok(json!("ok"))
        }

        async fn shutdown(&self) -> ConductorResult<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn health_check(&self) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_execute_requires_initialize() {
        let orchestrator = AgentOrchestrator::new(quick_config());
        let err = orchestrator.execute_task("anything", None).await.unwrap_err();
        assert!(matches!(err, ConductorError::NotInitialized));
    }

    #[tokio::test]
    async fn test_initialize_auto_starts_defaults() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(quick_config());
        orchestrator.initialize(&bus).await.unwrap();

        assert!(orchestrator.is_initialized());
        let running = orchestrator.running_agents();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].agent_type, AgentType::Coordinator);

        settle(&bus).await;
        let started = bus.history(&HistoryFilter::all().kind(MessageType::AgentStarted));
        assert_eq!(started.len(), 1);
        assert_eq!(started[0].payload["agentType"], "coordinator");
        assert!(started[0].is_broadcast());
    }

    #[tokio::test]
    async fn test_initialize_twice_is_harmless() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();
        orchestrator.initialize(&bus).await.unwrap();
        assert!(orchestrator.is_initialized());
        // One broadcast handler, one directed handler.
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_start_agent_is_idempotent() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        orchestrator.start_agent(AgentType::Codegen).await.unwrap();
        let first = orchestrator.agent_info(AgentType::Codegen);
        assert_eq!(first.status, AgentStatus::Running);

        orchestrator.start_agent(AgentType::Codegen).await.unwrap();
        let second = orchestrator.agent_info(AgentType::Codegen);
        assert_eq!(second.started_at, first.started_at);

        settle(&bus).await;
        assert_eq!(
            bus.history(&HistoryFilter::all().kind(MessageType::AgentStarted))
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stop_agent() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        orchestrator.stop_agent(AgentType::Review).await.unwrap();
        settle(&bus).await;
        assert!(bus
            .history(&HistoryFilter::all().kind(MessageType::AgentStopped))
            .is_empty());

        orchestrator.start_agent(AgentType::Review).await.unwrap();
        orchestrator.stop_agent(AgentType::Review).await.unwrap();
        settle(&bus).await;
        assert_eq!(
            orchestrator.agent_info(AgentType::Review).status,
            AgentStatus::Stopped
        );
        let stopped = bus.history(&HistoryFilter::all().kind(MessageType::AgentStopped));
        assert_eq!(stopped.len(), 1);
        assert_eq!(stopped[0].payload["agentType"], "review");
    }

    #[tokio::test]
    async fn test_start_during_stop_delay_keeps_agent_running() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(OrchestratorConfig {
            shutdown_delay_ms: 50,
            ..manual_config()
        });
        orchestrator.initialize(&bus).await.unwrap();
        orchestrator.start_agent(AgentType::Review).await.unwrap();

        let stopping = orchestrator.clone();
        let stop = tokio::spawn(async move { stopping.stop_agent(AgentType::Review).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(
            orchestrator.agent_info(AgentType::Review).status,
            AgentStatus::Stopping
        );

        orchestrator.start_agent(AgentType::Review).await.unwrap();
        stop.await.unwrap().unwrap();
        settle(&bus).await;

        assert_eq!(
            orchestrator.agent_info(AgentType::Review).status,
            AgentStatus::Running
        );
        assert!(bus
            .history(&HistoryFilter::all().kind(MessageType::AgentStopped))
            .is_empty());
    }

    #[tokio::test]
    async fn test_failed_initialize_marks_error() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.register_agent(Arc::new(BrokenAgent));
        orchestrator.initialize(&bus).await.unwrap();

        let err = orchestrator
            .start_agent(AgentType::Deployment)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Agent(_)));
        assert_eq!(
            orchestrator.agent_info(AgentType::Deployment).status,
            AgentStatus::Error
        );

        let err = orchestrator
            .execute_task("deploy to production", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConductorError::Agent(_)));
        assert!(orchestrator.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_execute_routes_and_dispatches() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        let task_id = orchestrator
            .execute_task("URGENT: fix critical security vulnerability", None)
            .await
            .unwrap();

        let task = orchestrator.task(&task_id).unwrap();
        assert_eq!(task.priority, TaskPriority::Critical);
        assert_eq!(task.assigned_agent, Some(AgentType::Issue));
        assert_eq!(task.status, TaskStatus::InProgress);

        let info = orchestrator.agent_info(AgentType::Issue);
        assert_eq!(info.status, AgentStatus::Running);
        assert_eq!(info.current_task.as_deref(), Some(task_id.as_str()));

        settle(&bus).await;
        let requests = bus.history(&HistoryFilter::all().kind(MessageType::TaskRequest));
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].to, Recipient::agent("issue"));
        assert_eq!(requests[0].from, ORCHESTRATOR_ID);
        assert_eq!(requests[0].payload_str("taskId"), Some(task_id.as_str()));
        assert_eq!(requests[0].payload_str("priority"), Some("critical"));
    }

    #[tokio::test]
    async fn test_explicit_agent_overrides_routing() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        let task_id = orchestrator
            .execute_task("review the release notes", Some(AgentType::Test))
            .await
            .unwrap();
        assert_eq!(
            orchestrator.task(&task_id).unwrap().assigned_agent,
            Some(AgentType::Test)
        );
    }

    #[tokio::test]
    async fn test_completion_updates_counters() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        let task_id = orchestrator
            .execute_task("review the auth module", None)
            .await
            .unwrap();
        let reply = BusMessage::broadcast(
            "review",
            MessageType::TaskComplete,
            into_payload(json!({ "taskId": task_id, "result": "lgtm" })),
        );
        bus.publish(reply.clone()).unwrap();
        bus.publish(reply).unwrap();
        settle(&bus).await;

        let info = orchestrator.agent_info(AgentType::Review);
        assert_eq!(info.completed_tasks, 1);
        assert!(info.current_task.is_none());
        assert_eq!(orchestrator.task_outcome(&task_id).unwrap(), json!("lgtm"));
        assert_eq!(orchestrator.status().task_queue.completed, 1);
    }

    #[tokio::test]
    async fn test_directed_reply_handled_once() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        let task_id = orchestrator
            .execute_task("check the lockfile", None)
            .await
            .unwrap();
        bus.publish(BusMessage::directed(
            "review",
            ORCHESTRATOR_ID,
            MessageType::Error,
            into_payload(json!({ "taskId": task_id, "error": "lockfile missing" })),
        ))
        .unwrap();
        settle(&bus).await;

        assert_eq!(orchestrator.agent_info(AgentType::Review).failed_tasks, 1);
        let err = orchestrator.task_outcome(&task_id).unwrap_err();
        assert!(err.to_string().contains("lockfile missing"));
    }

    #[tokio::test]
    async fn test_error_without_task_id() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        bus.publish(BusMessage::broadcast(
            "pr",
            MessageType::Error,
            into_payload(json!({ "error": "token expired" })),
        ))
        .unwrap();
        settle(&bus).await;
        assert_eq!(orchestrator.agent_info(AgentType::Pr).failed_tasks, 1);
    }

    #[tokio::test]
    async fn test_status_update_overwrites_status() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();
        orchestrator.start_agent(AgentType::Test).await.unwrap();

        bus.publish(BusMessage::broadcast(
            "test",
            MessageType::StatusUpdate,
            into_payload(json!({ "status": "error" })),
        ))
        .unwrap();
        // Unknown senders and malformed payloads are logged and skipped.
        bus.publish(BusMessage::broadcast(
            "designer",
            MessageType::StatusUpdate,
            into_payload(json!({ "status": "running" })),
        ))
        .unwrap();
        bus.publish(BusMessage::broadcast(
            "codegen",
            MessageType::StatusUpdate,
            into_payload(json!({ "status": "sleeping" })),
        ))
        .unwrap();
        settle(&bus).await;

        assert_eq!(
            orchestrator.agent_info(AgentType::Test).status,
            AgentStatus::Error
        );
        assert_eq!(
            orchestrator.agent_info(AgentType::Codegen).status,
            AgentStatus::Stopped
        );
    }

    #[tokio::test]
    async fn test_update_context_reaches_requests() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        orchestrator.update_context(json!({ "branch": "main", "dirty": false }));
        orchestrator
            .execute_task("generate a changelog", None)
            .await
            .unwrap();
        settle(&bus).await;

        let updates = bus.history(&HistoryFilter::all().kind(MessageType::ContextUpdate));
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].payload["context"]["branch"], "main");

        let requests = bus.history(&HistoryFilter::all().kind(MessageType::TaskRequest));
        assert_eq!(requests[0].payload["context"]["branch"], "main");
    }

    #[tokio::test]
    async fn test_health_check() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.register_agent(Arc::new(CountingAgent {
            shutdowns: Arc::new(AtomicUsize::new(0)),
        }));
        orchestrator.initialize(&bus).await.unwrap();

        assert!(!orchestrator.health_check(AgentType::Coordinator).await);
        orchestrator.start_agent(AgentType::Coordinator).await.unwrap();
        assert!(orchestrator.health_check(AgentType::Coordinator).await);

        orchestrator.start_agent(AgentType::Review).await.unwrap();
        assert!(!orchestrator.health_check(AgentType::Review).await);
    }

    #[tokio::test]
    async fn test_shutdown() {
        let bus = started_bus();
        let shutdowns = Arc::new(AtomicUsize::new(0));
        let orchestrator = AgentOrchestrator::new(quick_config());
        orchestrator.register_agent(Arc::new(CountingAgent {
            shutdowns: Arc::clone(&shutdowns),
        }));
        orchestrator.initialize(&bus).await.unwrap();
        orchestrator.start_agent(AgentType::Review).await.unwrap();
        assert!(bus.is_subscribed("review"));

        orchestrator.shutdown().await;

        assert!(!orchestrator.is_initialized());
        assert!(orchestrator.running_agents().is_empty());
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert!(!bus.is_subscribed(ORCHESTRATOR_ID));
        assert!(!bus.is_subscribed("review"));
        assert_eq!(bus.subscriber_count(), 0);

        settle(&bus).await;
        assert_eq!(
            bus.history(&HistoryFilter::all().kind(MessageType::AgentStopped))
                .len(),
            2
        );
        assert!(matches!(
            orchestrator.execute_task("x", None).await.unwrap_err(),
            ConductorError::NotInitialized
        ));
    }

    #[tokio::test]
    async fn test_register_after_initialize_attaches() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        orchestrator.register_agent(Arc::new(EchoAgent::new(AgentType::Codegen)));
        orchestrator.register_agent(Arc::new(EchoAgent::new(AgentType::Codegen)));
        assert!(bus.is_subscribed("codegen"));
        // Replacing an implementation swaps the worker instead of adding one.
        assert_eq!(bus.subscriber_count(), 3);
    }

    #[tokio::test]
    async fn test_cancel_and_retry() {
        let bus = started_bus();
        let orchestrator = AgentOrchestrator::new(manual_config());
        orchestrator.initialize(&bus).await.unwrap();

        let first = orchestrator
            .execute_task("implement the parser", None)
            .await
            .unwrap();
        let second = orchestrator
            .execute_task_with(TaskSpec::new("implement the printer").depends_on(first.clone()))
            .await
            .unwrap();

        assert!(!orchestrator.cancel_task(&first));
        assert!(orchestrator.cancel_task(&second));
        assert!(orchestrator.task(&second).is_none());

        bus.publish(BusMessage::broadcast(
            "codegen",
            MessageType::Error,
            into_payload(json!({ "taskId": first, "error": "flaky" })),
        ))
        .unwrap();
        settle(&bus).await;
        assert_eq!(orchestrator.task(&first).unwrap().status, TaskStatus::Failed);

        assert!(orchestrator.retry_task(&first));
        assert_eq!(
            orchestrator.task(&first).unwrap().status,
            TaskStatus::InProgress
        );
        assert!(!orchestrator.retry_task("ghost"));
    }
}
