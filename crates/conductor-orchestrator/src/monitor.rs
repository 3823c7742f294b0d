use crate::types::{AgentInfo, AgentStatus, AgentType};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Tracks lifecycle state and counters for every agent type.
///
/// One record per [`AgentType`] exists from construction on; records are
/// never removed.
pub struct AgentMonitor {
    states: RwLock<BTreeMap<AgentType, AgentInfo>>,
}

impl AgentMonitor {
    /// All agents stopped with zeroed counters.
    pub fn new() -> Self {
        let states = AgentType::ALL
            .into_iter()
            .map(|agent| (agent, AgentInfo::new(agent)))
            .collect();
        Self {
            states: RwLock::new(states),
        }
    }

    fn update<R>(&self, agent: AgentType, f: impl FnOnce(&mut AgentInfo) -> R) -> R {
        let mut states = self.states.write();
        let info = states
            .entry(agent)
            .or_insert_with(|| AgentInfo::new(agent));
        f(info)
    }

    /// Move to `starting` unless the agent is already running or starting.
    pub fn begin_start(&self, agent: AgentType) -> bool {
        self.update(agent, |info| match info.status {
            AgentStatus::Running | AgentStatus::Starting => false,
            _ => {
                info.status = AgentStatus::Starting;
                info.last_activity = Some(Utc::now());
                true
            }
        })
    }

    /// Complete a start begun with [`begin_start`](Self::begin_start).
    /// Returns false if something else changed the state in between.
    pub fn finish_start(&self, agent: AgentType) -> bool {
        self.update(agent, |info| {
            if info.status != AgentStatus::Starting {
                return false;
            }
            let now = Utc::now();
            info.status = AgentStatus::Running;
            info.started_at = Some(now);
            info.last_activity = Some(now);
            true
        })
    }

    /// Move to `stopping` unless the agent is already stopped or stopping.
    pub fn begin_stop(&self, agent: AgentType) -> bool {
        self.update(agent, |info| match info.status {
            AgentStatus::Stopped | AgentStatus::Stopping => false,
            _ => {
                info.status = AgentStatus::Stopping;
                info.last_activity = Some(Utc::now());
                true
            }
        })
    }

    /// Complete a stop begun with [`begin_stop`](Self::begin_stop).
    pub fn finish_stop(&self, agent: AgentType) -> bool {
        self.update(agent, |info| {
            if info.status != AgentStatus::Stopping {
                return false;
            }
            info.status = AgentStatus::Stopped;
            info.current_task = None;
            info.last_activity = Some(Utc::now());
            true
        })
    }

    /// Move `agent` to `error`, keeping its counters.
    pub fn mark_error(&self, agent: AgentType) {
        self.set_status(agent, AgentStatus::Error);
    }

    /// Overwrite the status, as reported by the agent itself.
    pub fn set_status(&self, agent: AgentType, status: AgentStatus) {
        self.update(agent, |info| {
            let now = Utc::now();
            if status == AgentStatus::Running && info.status != AgentStatus::Running {
                info.started_at = Some(now);
            }
            info.status = status;
            info.last_activity = Some(now);
        });
    }

    /// Mark an agent as working on a task.
    pub fn assign_task(&self, agent: AgentType, task_id: &str) {
        self.update(agent, |info| {
            info.current_task = Some(task_id.to_string());
            info.last_activity = Some(Utc::now());
        });
    }

    /// Count a success and free the slot if it held `task_id`.
    pub fn record_completion(&self, agent: AgentType, task_id: &str) {
        self.update(agent, |info| {
            info.completed_tasks += 1;
            release(info, Some(task_id));
        });
    }

    /// Count a failure. Without a task id the slot is always freed.
    pub fn record_failure(&self, agent: AgentType, task_id: Option<&str>) {
        self.update(agent, |info| {
            info.failed_tasks += 1;
            release(info, task_id);
        });
    }

    /// Free the slot without touching counters.
    pub fn release_task(&self, agent: AgentType, task_id: &str) {
        self.update(agent, |info| release(info, Some(task_id)));
    }

    /// Current status of `agent`.
    pub fn status(&self, agent: AgentType) -> AgentStatus {
        self.states
            .read()
            .get(&agent)
            .map(|info| info.status)
            .unwrap_or_default()
    }

    /// Whether `agent` can take tasks.
    pub fn is_running(&self, agent: AgentType) -> bool {
        self.status(agent) == AgentStatus::Running
    }

    /// Get the record of a specific agent.
    pub fn get(&self, agent: AgentType) -> AgentInfo {
        self.states
            .read()
            .get(&agent)
            .cloned()
            .unwrap_or_else(|| AgentInfo::new(agent))
    }

    /// Get a snapshot of all agent records, in [`AgentType::ALL`] order.
    pub fn snapshot(&self) -> Vec<AgentInfo> {
        self.states.read().values().cloned().collect()
    }

    /// Records of agents in `running` state.
    pub fn running(&self) -> Vec<AgentInfo> {
        self.states
            .read()
            .values()
            .filter(|info| info.status == AgentStatus::Running)
            .cloned()
            .collect()
    }

    /// Force every agent back to `stopped`. Counters are kept.
    pub fn reset(&self) {
        for info in self.states.write().values_mut() {
            info.status = AgentStatus::Stopped;
            info.current_task = None;
        }
    }

    /// Serialize the current state as JSON.
    pub fn to_json(&self) -> serde_json::Value {
        let agents = self.snapshot();
        let completed: u64 = agents.iter().map(|a| a.completed_tasks).sum();
        let failed: u64 = agents.iter().map(|a| a.failed_tasks).sum();
        serde_json::json!({
            "agents": agents,
            "totals": {
                "completed_tasks": completed,
                "failed_tasks": failed,
            },
        })
    }
}

impl Default for AgentMonitor {
    fn default() -> Self {
        Self::new()
    }
}

fn release(info: &mut AgentInfo, task_id: Option<&str>) {
    if task_id.is_none() || info.current_task.as_deref() == task_id {
        info.current_task = None;
    }
    info.last_activity = Some(Utc::now());
}
