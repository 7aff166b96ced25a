//! 健康验证器
//!
//! 按服务声明的健康检查契约轮询。失败分三类：
//! - 无响应（连接被拒、尝试超时）：前几次按瞬态对待，超出宽限
//!   次数后升级为失败，不再等完整个超时预算
//! - 端点报告启动中：持续轮询直至总超时，间隔在反复失败后翻倍
//! - 端点明确报告不健康：终态，立即失败

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::settings::Settings;
use crate::domain::service::{HealthCheck, HealthStatus, ServiceSpec};
use crate::error::{OrchestratorError, Result};
use crate::infra::docker::{ContainerRuntime, ContainerState};

/// 健康探测接口
///
/// 生产实现组合 HTTP 客户端与容器运行时；测试用脚本化实现
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// 发出一次健康检查，返回观测到的状态
    async fn probe(&self, environment: &str, spec: &ServiceSpec) -> HealthStatus;
}

/// HTTP 健康端点的响应体
#[derive(Debug, Deserialize)]
struct HealthBody {
    status: String,
}

/// 生产探测实现
pub struct RuntimeProbe {
    http: reqwest::Client,
    runtime: Arc<dyn ContainerRuntime>,
}

impl RuntimeProbe {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, attempt_timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(attempt_timeout)
            .build()
            .unwrap_or_default();
        Self { http, runtime }
    }

    async fn probe_http(&self, port: u16, path: &str) -> HealthStatus {
        let url = format!("http://127.0.0.1:{}{}", port, path);
        let response = match self.http.get(&url).send().await {
            Ok(r) => r,
            // 连接被拒/超时：没有任何响应
            Err(_) => return HealthStatus::Unreachable,
        };

        let status = response.status();
        if status.is_server_error() {
            return HealthStatus::Starting;
        }

        match response.json::<HealthBody>().await {
            Ok(body) => match body.status.as_str() {
                "healthy" => HealthStatus::Healthy,
                "starting" => HealthStatus::Starting,
                _ => HealthStatus::Unhealthy,
            },
            // 2xx 但无结构化内容：按健康处理
            Err(_) if status.is_success() => HealthStatus::Healthy,
            Err(_) => HealthStatus::Starting,
        }
    }

    async fn probe_docker(&self, container_name: &str) -> HealthStatus {
        match self.runtime.container_state(container_name).await {
            Ok(ContainerState::Running { health }) => match health.as_deref() {
                Some("healthy") | None => HealthStatus::Healthy,
                Some("starting") => HealthStatus::Starting,
                Some(_) => HealthStatus::Unhealthy,
            },
            // 容器不在运行：已退出或被移除，重试无意义
            Ok(ContainerState::Stopped) | Ok(ContainerState::Missing) => HealthStatus::Unhealthy,
            Err(e) => {
                warn!(container = %container_name, error = %e, "Runtime query failed during probe");
                HealthStatus::Unreachable
            }
        }
    }
}

#[async_trait]
impl HealthProbe for RuntimeProbe {
    async fn probe(&self, environment: &str, spec: &ServiceSpec) -> HealthStatus {
        match &spec.health_check {
            HealthCheck::Http { port, path } => self.probe_http(*port, path).await,
            HealthCheck::Docker => self.probe_docker(&spec.container_name(environment)).await,
        }
    }
}

/// 健康验证器
pub struct HealthVerifier {
    probe: Arc<dyn HealthProbe>,
    timeout: Duration,
    interval: Duration,
    backoff_cap: Duration,
    transient_grace_attempts: u32,
}

impl HealthVerifier {
    pub fn new(probe: Arc<dyn HealthProbe>, settings: &Settings) -> Self {
        Self {
            probe,
            timeout: settings.health_timeout,
            interval: settings.health_interval,
            backoff_cap: settings.backoff_cap,
            transient_grace_attempts: settings.transient_grace_attempts,
        }
    }

    /// 单次非阻塞探测（StateInspector 与 status 命令使用）
    pub async fn probe_once(&self, environment: &str, spec: &ServiceSpec) -> HealthStatus {
        self.probe.probe(environment, spec).await
    }

    /// 阻塞等待服务健康
    ///
    /// - `Healthy` → Ok
    /// - `Unhealthy` → 立即返回错误（终态，不消耗超时预算）
    /// - `Starting` → 按间隔重试直至总超时，间隔在反复失败后
    ///   翻倍直至上限
    /// - `Unreachable` → 连续超过宽限次数即升级为失败，不再等完
    ///   整个超时预算；任何一次有响应的探测重置计数
    /// - 总超时耗尽 → `HealthTimeout`
    pub async fn wait_healthy(
        &self,
        environment: &str,
        spec: &ServiceSpec,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<()> {
        let start = Instant::now();
        let deadline = start + self.timeout;
        let mut interval = self.interval;
        let mut failures = 0u32;
        let mut unreachable_streak = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }

            match self.probe.probe(environment, spec).await {
                HealthStatus::Healthy => {
                    debug!(service = %spec.name, "Service healthy");
                    return Ok(());
                }
                HealthStatus::Unhealthy => {
                    return Err(OrchestratorError::ServiceUnhealthy {
                        service: spec.name.clone(),
                    });
                }
                HealthStatus::Starting => {
                    failures += 1;
                    unreachable_streak = 0;
                }
                HealthStatus::Unreachable => {
                    failures += 1;
                    unreachable_streak += 1;
                    if unreachable_streak > self.transient_grace_attempts {
                        warn!(
                            service = %spec.name,
                            attempts = unreachable_streak,
                            "No response within transient grace, escalating"
                        );
                        return Err(OrchestratorError::HealthTimeout {
                            service: spec.name.clone(),
                            timeout_secs: start.elapsed().as_secs(),
                        });
                    }
                }
            }

            if Instant::now() + interval > deadline {
                return Err(OrchestratorError::HealthTimeout {
                    service: spec.name.clone(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                _ = tokio::time::sleep(interval) => {}
            }

            // 反复失败后退避：间隔翻倍直至上限
            if failures > self.transient_grace_attempts {
                interval = (interval * 2).min(self.backoff_cap);
            }
        }
    }
}
