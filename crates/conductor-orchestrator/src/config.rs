use crate::task_queue::QueueConfig;
use crate::types::AgentType;
use conductor_core::{BusConfig, ConductorError, ConductorResult, LogConfig};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Orchestrator settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Start `default_agents` during `initialize`.
    #[serde(default = "default_auto_start")]
    pub auto_start: bool,
    /// Agents started by `initialize` when `auto_start` is set.
    #[serde(default = "default_agents")]
    pub default_agents: Vec<AgentType>,
    /// Simulated startup latency per agent.
    #[serde(default = "default_delay_ms")]
    pub startup_delay_ms: u64,
    /// Simulated shutdown latency per agent.
    #[serde(default = "default_delay_ms")]
    pub shutdown_delay_ms: u64,
    /// Dispatch attempts that may find the target agent not running before
    /// the task is failed.
    #[serde(default = "default_max_requeues")]
    pub max_requeues: u32,
    /// Fail dispatched tasks that are still in progress after this long.
    /// Zero disables the watchdog.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
}

fn default_auto_start() -> bool {
    true
}

fn default_agents() -> Vec<AgentType> {
    vec![AgentType::Coordinator]
}

fn default_delay_ms() -> u64 {
    100
}

fn default_max_requeues() -> u32 {
    3
}

fn default_task_timeout_ms() -> u64 {
    300_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            auto_start: default_auto_start(),
            default_agents: default_agents(),
            startup_delay_ms: default_delay_ms(),
            shutdown_delay_ms: default_delay_ms(),
            max_requeues: default_max_requeues(),
            task_timeout_ms: default_task_timeout_ms(),
        }
    }
}

impl OrchestratorConfig {
    /// `startup_delay_ms` as a [`Duration`].
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }

    /// `shutdown_delay_ms` as a [`Duration`].
    pub fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.shutdown_delay_ms)
    }

    /// Watchdog timeout, `None` when disabled.
    pub fn task_timeout(&self) -> Option<Duration> {
        (self.task_timeout_ms > 0).then(|| Duration::from_millis(self.task_timeout_ms))
    }
}

/// Top-level configuration file (`conductor.toml`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// `[bus]` section.
    #[serde(default)]
    pub bus: BusConfig,
    /// `[queue]` section.
    #[serde(default)]
    pub queue: QueueConfig,
    /// `[orchestrator]` section.
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// `[logging]` section.
    #[serde(default)]
    pub logging: LogConfig,
}

impl ConductorConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> ConductorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
            .map_err(|e| ConductorError::Config(format!("{}: {e}", path.display())))
    }

    /// Parse and validate TOML text.
    pub fn from_toml_str(content: &str) -> ConductorResult<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConductorError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the components cannot run with.
    pub fn validate(&self) -> ConductorResult<()> {
        if self.bus.max_history == 0 {
            return Err(ConductorError::Config(
                "bus.max_history must be greater than zero".to_string(),
            ));
        }
        if self.queue.max_completed_history == 0 {
            return Err(ConductorError::Config(
                "queue.max_completed_history must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = ConductorConfig::from_toml_str("").unwrap();
        assert_eq!(config, ConductorConfig::default());
        assert_eq!(config.bus.max_history, 1000);
        assert_eq!(config.queue.max_completed_history, 100);
        assert!(config.queue.cascade_failures);
        assert!(config.orchestrator.auto_start);
        assert_eq!(config.orchestrator.default_agents, vec![AgentType::Coordinator]);
        assert_eq!(config.orchestrator.max_requeues, 3);
        assert_eq!(
            config.orchestrator.task_timeout(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_full_file() {
        let config = ConductorConfig::from_toml_str(
            r#"
[bus]
max_history = 50

[queue]
max_completed_history = 10
cascade_failures = false

[orchestrator]
auto_start = false
default_agents = ["codegen", "review"]
startup_delay_ms = 0
shutdown_delay_ms = 5
max_requeues = 1
task_timeout_ms = 0

[logging]
level = "debug"
json = true
"#,
        )
        .unwrap();

        assert_eq!(config.bus.max_history, 50);
        assert!(!config.queue.cascade_failures);
        assert_eq!(
            config.orchestrator.default_agents,
            vec![AgentType::Codegen, AgentType::Review]
        );
        assert_eq!(config.orchestrator.startup_delay(), Duration::ZERO);
        assert_eq!(config.orchestrator.task_timeout(), None);
        assert!(config.logging.json);
    }

    #[test]
    fn test_rejects_unknown_agent() {
        let err = ConductorConfig::from_toml_str(
            r#"
[orchestrator]
default_agents = ["designer"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConductorError::Config(_)));
    }

    #[test]
    fn test_rejects_zero_capacity() {
        let err = ConductorConfig::from_toml_str("[bus]\nmax_history = 0\n").unwrap_err();
        assert!(err.to_string().contains("bus.max_history"));

        let err =
            ConductorConfig::from_toml_str("[queue]\nmax_completed_history = 0\n").unwrap_err();
        assert!(err.to_string().contains("queue.max_completed_history"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[orchestrator]\nmax_requeues = 7").unwrap();

        let config = ConductorConfig::load(file.path()).unwrap();
        assert_eq!(config.orchestrator.max_requeues, 7);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConductorConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConductorError::Io(_)));
    }
}
