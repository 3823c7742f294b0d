use crate::types::{AgentType, Task, TaskPriority, TaskResult, TaskStatus};
use chrono::{DateTime, Utc};
use conductor_core::{ConductorError, ConductorResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, warn};

/// Queue settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Terminal results retained before the oldest is evicted.
    #[serde(default = "default_max_completed_history")]
    pub max_completed_history: usize,
    /// Fail pending dependents (transitively) when a task fails.
    /// When off, dependents stay pending until the failed task is retried.
    #[serde(default = "default_cascade_failures")]
    pub cascade_failures: bool,
}

fn default_max_completed_history() -> usize {
    100
}

fn default_cascade_failures() -> bool {
    true
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_completed_history: default_max_completed_history(),
            cascade_failures: default_cascade_failures(),
        }
    }
}

/// Snapshot of queue counters.
///
/// `completed` counts successful results still in history; the other status
/// counts cover the active queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Tasks in the active queue.
    pub total: usize,
    /// Pending tasks.
    pub pending: usize,
    /// In-progress tasks.
    pub in_progress: usize,
    /// Successful results in history.
    pub completed: usize,
    /// Failed tasks still in the active queue.
    pub failed: usize,
    /// Active tasks per priority; every level is present.
    pub by_priority: BTreeMap<TaskPriority, usize>,
    /// Active tasks per assigned agent.
    pub by_agent: BTreeMap<AgentType, usize>,
}

/// Priority-ordered task queue with dependency gating and a bounded result
/// history.
pub struct TaskQueue {
    config: QueueConfig,
    /// Sorted by priority descending, then creation time.
    tasks: Vec<Task>,
    results: HashMap<String, TaskResult>,
    result_order: VecDeque<String>,
}

impl TaskQueue {
    /// Empty queue with default settings.
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Empty queue with `config`.
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            results: HashMap::new(),
            result_order: VecDeque::new(),
        }
    }

    /// Queue settings.
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Add a task, stamping its creation time if absent.
    pub fn enqueue(&mut self, mut task: Task) -> ConductorResult<()> {
        if self.position(&task.id).is_some() || self.results.contains_key(&task.id) {
            return Err(ConductorError::DuplicateTask(task.id));
        }
        task.created_at.get_or_insert_with(Utc::now);
        let failed_dep = self.failed_dependency(&task).map(str::to_string);
        let id = task.id.clone();
        debug!(task_id = %id, priority = %task.priority, "Task enqueued");
        self.tasks.push(task);
        // Stable: equal keys keep insertion order.
        self.tasks
            .sort_by(|a, b| b.priority.cmp(&a.priority).then(a.created_at.cmp(&b.created_at)));

        if let Some(dep) = failed_dep.filter(|_| self.config.cascade_failures) {
            self.fail(&id, format!("dependency {dep} failed"));
        }
        Ok(())
    }

    fn failed_dependency<'a>(&self, task: &'a Task) -> Option<&'a str> {
        task.dependencies
            .iter()
            .find(|dep| self.results.get(dep.as_str()).is_some_and(|r| !r.success))
            .map(String::as_str)
    }

    /// Take the highest-priority pending task whose dependencies all succeeded.
    pub fn dequeue(&mut self) -> Option<Task> {
        self.take_next(|_| true)
    }

    /// Like [`dequeue`](Self::dequeue), restricted to tasks assigned to `agent`.
    pub fn dequeue_for_agent(&mut self, agent: AgentType) -> Option<Task> {
        self.take_next(|task| task.assigned_agent == Some(agent))
    }

    fn take_next(&mut self, filter: impl Fn(&Task) -> bool) -> Option<Task> {
        let idx = self.tasks.iter().position(|task| {
            task.status == TaskStatus::Pending && filter(task) && self.dependencies_met(task)
        })?;
        let task = &mut self.tasks[idx];
        task.status = TaskStatus::InProgress;
        task.started_at = Some(Utc::now());
        Some(task.clone())
    }

    fn dependencies_met(&self, task: &Task) -> bool {
        task.dependencies
            .iter()
            .all(|dep| self.results.get(dep).is_some_and(|r| r.success))
    }

    /// Mark a task completed, record its result and drop it from the queue.
    ///
    /// Returns false when the task is not in the queue, so a repeated
    /// completion is a no-op.
    pub fn complete(&mut self, id: &str, result: Option<Value>) -> bool {
        let Some(idx) = self.position(id) else {
            return false;
        };
        let mut task = self.tasks.remove(idx);
        let now = Utc::now();
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.result = result.clone();
        self.record(TaskResult {
            task_id: task.id,
            success: true,
            result,
            error: None,
            duration_ms: elapsed_ms(task.started_at.or(task.created_at), now),
        });
        true
    }

    /// Mark a task failed and record the failure. The task stays in the queue
    /// so it can be inspected or retried.
    ///
    /// With `cascade_failures` on, pending tasks depending on it are failed too.
    /// Returns false when the task is unknown or already terminal.
    pub fn fail(&mut self, id: &str, error: impl Into<String>) -> bool {
        if !self.mark_failed(id, error.into()) {
            return false;
        }
        if self.config.cascade_failures {
            let cascaded = self.cascade_failure(id);
            if cascaded > 0 {
                warn!(task_id = %id, dependents = cascaded, "Failed dependent tasks");
            }
        }
        true
    }

    fn mark_failed(&mut self, id: &str, error: String) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        if task.status.is_terminal() {
            return false;
        }
        let now = Utc::now();
        task.status = TaskStatus::Failed;
        task.completed_at = Some(now);
        task.error = Some(error.clone());
        let result = TaskResult {
            task_id: task.id.clone(),
            success: false,
            result: None,
            error: Some(error),
            duration_ms: elapsed_ms(task.started_at.or(task.created_at), now),
        };
        self.record(result);
        true
    }

    fn cascade_failure(&mut self, root: &str) -> usize {
        let mut failed = vec![root.to_string()];
        let mut count = 0;
        while let Some(dep) = failed.pop() {
            let dependents: Vec<String> = self
                .tasks
                .iter()
                .filter(|t| t.status == TaskStatus::Pending && t.dependencies.contains(&dep))
                .map(|t| t.id.clone())
                .collect();
            for id in dependents {
                if self.mark_failed(&id, format!("dependency {dep} failed")) {
                    count += 1;
                    failed.push(id);
                }
            }
        }
        count
    }

    /// Cancel a pending task and remove it. Other states are left alone.
    pub fn cancel(&mut self, id: &str) -> bool {
        match self.position(id) {
            Some(idx) if self.tasks[idx].status == TaskStatus::Pending => {
                self.tasks.remove(idx);
                debug!(task_id = %id, "Task cancelled");
                true
            }
            _ => false,
        }
    }

    /// Put an in-progress task back to pending, keeping its queue position.
    pub fn requeue(&mut self, id: &str) -> bool {
        match self.tasks.iter_mut().find(|t| t.id == id) {
            Some(task) if task.status == TaskStatus::InProgress => {
                task.status = TaskStatus::Pending;
                task.started_at = None;
                task.requeue_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Reset a failed task to pending and forget its failed result.
    pub fn retry(&mut self, id: &str) -> bool {
        let Some(task) = self.tasks.iter_mut().find(|t| t.id == id) else {
            return false;
        };
        if task.status != TaskStatus::Failed {
            return false;
        }
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.completed_at = None;
        task.error = None;
        self.results.remove(id);
        self.result_order.retain(|r| r != id);
        true
    }

    /// Append to history, or update in place if the id is already there.
    fn record(&mut self, result: TaskResult) {
        if let Some(existing) = self.results.get_mut(&result.task_id) {
            *existing = result;
            return;
        }
        self.result_order.push_back(result.task_id.clone());
        self.results.insert(result.task_id.clone(), result);
        while self.result_order.len() > self.config.max_completed_history {
            if let Some(evicted) = self.result_order.pop_front() {
                self.results.remove(&evicted);
            }
        }
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == id)
    }

    /// Get a task in the active queue.
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    /// All active tasks in queue order.
    pub fn all_tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Active tasks in `status`.
    pub fn tasks_by_status(&self, status: TaskStatus) -> Vec<&Task> {
        self.tasks.iter().filter(|t| t.status == status).collect()
    }

    /// Active tasks assigned to `agent`.
    pub fn tasks_by_agent(&self, agent: AgentType) -> Vec<&Task> {
        self.tasks
            .iter()
            .filter(|t| t.assigned_agent == Some(agent))
            .collect()
    }

    /// Tasks waiting to be dispatched.
    pub fn pending_count(&self) -> usize {
        self.count(TaskStatus::Pending)
    }

    /// Tasks handed to an agent and not yet finished.
    pub fn in_progress_count(&self) -> usize {
        self.count(TaskStatus::InProgress)
    }

    fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    /// Total number of tasks in the active queue.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether the active queue is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// The recorded outcome of a task, if still in history.
    pub fn completed_result(&self, id: &str) -> Option<&TaskResult> {
        self.results.get(id)
    }

    /// Result history, oldest first.
    pub fn history(&self) -> Vec<&TaskResult> {
        self.result_order
            .iter()
            .filter_map(|id| self.results.get(id))
            .collect()
    }

    /// Drop every active task. History is kept.
    pub fn clear(&mut self) {
        self.tasks.clear();
    }

    /// Counters over the active queue and result history.
    pub fn stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.tasks.len(),
            pending: self.pending_count(),
            in_progress: self.in_progress_count(),
            completed: self.results.values().filter(|r| r.success).count(),
            failed: self.count(TaskStatus::Failed),
            by_priority: TaskPriority::ALL.into_iter().map(|p| (p, 0)).collect(),
            by_agent: BTreeMap::new(),
        };
        for task in &self.tasks {
            *stats.by_priority.entry(task.priority).or_insert(0) += 1;
            if let Some(agent) = task.assigned_agent {
                *stats.by_agent.entry(agent).or_insert(0) += 1;
            }
        }
        stats
    }

    /// Check for cycles in the dependency graph of the active queue.
    /// Returns true if a cycle is detected.
    pub fn has_cycle(&self) -> bool {
        let mut visited = HashMap::new();
        self.tasks
            .iter()
            .any(|task| self.dfs_cycle(&task.id, &mut visited))
    }

    fn dfs_cycle<'a>(&'a self, id: &'a str, visited: &mut HashMap<&'a str, u8>) -> bool {
        match visited.get(id) {
            Some(1) => return true,  // back edge = cycle
            Some(2) => return false, // already processed
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(task) = self.get(id) {
            for dep in &task.dependencies {
                if self.dfs_cycle(dep, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn elapsed_ms(start: Option<DateTime<Utc>>, end: DateTime<Utc>) -> u64 {
    start
        .map(|start| u64::try_from((end - start).num_milliseconds()).unwrap_or(0))
        .unwrap_or(0)
}
