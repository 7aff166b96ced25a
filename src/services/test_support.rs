//! 服务层测试公用的脚本化替身

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::settings::{EnvironmentPaths, Settings};
use crate::domain::service::{HealthStatus, ServiceSpec};
use crate::error::{OrchestratorError, Result};
use crate::infra::docker::{ContainerRuntime, ContainerState};
use crate::services::context::OrchestrateContext;
use crate::services::health::HealthProbe;

/// 脚本化容器运行时：记录调用顺序，可注入启动失败
pub struct ScriptedRuntime {
    pub started: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
    /// 服务容器名 → 接下来还要失败的启动次数
    pub start_failures: Mutex<HashMap<String, u32>>,
    states: Mutex<HashMap<String, ContainerState>>,
}

impl ScriptedRuntime {
    /// 所有启动都成功、启动后即 running+healthy 的运行时
    pub fn healthy() -> Self {
        Self {
            started: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
            start_failures: Mutex::new(HashMap::new()),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// 指定容器名前 `count` 次启动失败
    pub fn failing_first(name: &str, count: u32) -> Self {
        let runtime = Self::healthy();
        runtime
            .start_failures
            .lock()
            .unwrap()
            .insert(name.to_string(), count);
        runtime
    }

    pub fn start_order(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    /// 预置一个已在运行的容器
    pub fn preset_running(&self, name: &str) {
        self.states.lock().unwrap().insert(
            name.to_string(),
            ContainerState::Running {
                health: Some("healthy".to_string()),
            },
        );
    }
}

#[async_trait]
impl ContainerRuntime for ScriptedRuntime {
    async fn container_state(&self, name: &str) -> Result<ContainerState> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .unwrap_or(ContainerState::Missing))
    }

    async fn remove_container(&self, name: &str) -> Result<()> {
        self.removed.lock().unwrap().push(name.to_string());
        self.states.lock().unwrap().remove(name);
        Ok(())
    }

    async fn start_service(
        &self,
        name: &str,
        _spec: &ServiceSpec,
        _env: &HashMap<String, String>,
        _data_root: &Path,
    ) -> Result<()> {
        {
            let mut failures = self.start_failures.lock().unwrap();
            if let Some(remaining) = failures.get_mut(name) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(OrchestratorError::CommandFailed {
                        command: "docker run".to_string(),
                        reason: "injected start failure".to_string(),
                    });
                }
            }
        }
        self.started.lock().unwrap().push(name.to_string());
        self.states.lock().unwrap().insert(
            name.to_string(),
            ContainerState::Running {
                health: Some("healthy".to_string()),
            },
        );
        Ok(())
    }
}

/// 脚本化健康探测：恒定返回同一状态
pub struct ScriptedProbe {
    status: HealthStatus,
}

impl ScriptedProbe {
    pub fn always(status: HealthStatus) -> Self {
        Self { status }
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, _environment: &str, _spec: &ServiceSpec) -> HealthStatus {
        self.status
    }
}

/// 构造指向临时目录的测试上下文，时间参数取小值
pub fn test_context(
    root: &Path,
    runtime: Arc<dyn ContainerRuntime>,
    probe: Arc<dyn HealthProbe>,
) -> OrchestrateContext {
    let settings = Settings {
        root: root.join("envs"),
        legacy_root: root.join("legacy"),
        max_start_attempts: 3,
        backoff_base: Duration::from_millis(10),
        backoff_cap: Duration::from_millis(50),
        health_timeout: Duration::from_secs(2),
        health_interval: Duration::from_millis(10),
        transient_grace_attempts: 3,
        snapshot_retention: 2,
        command_timeout: Duration::from_secs(5),
        start_timeout: Duration::from_secs(5),
        max_parallel_starts: 4,
    };
    let paths = EnvironmentPaths::new(&settings, "dev");
    OrchestrateContext {
        environment: "dev".to_string(),
        settings,
        paths,
        cancel: CancellationToken::new(),
        runtime,
        probe,
    }
}
