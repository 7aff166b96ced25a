//! 状态检查器
//!
//! 将环境当前的可观测状态归类为 `DeploymentState`。
//! 纯读操作：检查过程绝不修改任何状态；检查自身的 I/O 错误
//! 以 `InspectionFailed` 上报，不得静默当作 Absent。

use tracing::debug;

use crate::domain::service::{HealthStatus, ServiceSpec};
use crate::domain::state::DeploymentState;
use crate::error::{OrchestratorError, Result};
use crate::infra::fsutil;
use crate::services::context::OrchestrateContext;
use crate::services::health::HealthVerifier;

/// 单个服务的健康概览（status 命令输出用）
#[derive(Debug)]
pub struct ServiceReport {
    pub name: String,
    pub status: HealthStatus,
}

/// 状态检查器
pub struct StateInspector;

impl StateInspector {
    /// 归类环境当前状态
    ///
    /// 1. 目标布局根不含有效服务清单：旧版根有数据 → `LegacyOnly`，
    ///    否则 → `Absent`
    /// 2. 目标布局存在：逐服务探测，全部健康 → `TargetHealthy`，
    ///    否则 → `TargetPartial`
    pub async fn inspect(
        ctx: &OrchestrateContext,
        specs: &[ServiceSpec],
    ) -> Result<DeploymentState> {
        let (state, _) = Self::inspect_with_report(ctx, specs).await?;
        Ok(state)
    }

    /// 同 `inspect`，附带逐服务健康报告
    pub async fn inspect_with_report(
        ctx: &OrchestrateContext,
        specs: &[ServiceSpec],
    ) -> Result<(DeploymentState, Vec<ServiceReport>)> {
        let target_valid =
            Self::target_layout_valid(ctx)
                .await
                .map_err(|source| OrchestratorError::InspectionFailed {
                    environment: ctx.environment.clone(),
                    source,
                })?;

        if !target_valid {
            let legacy_has_data = fsutil::dir_has_content(&ctx.settings.legacy_root)
                .await
                .map_err(|e| match e {
                    OrchestratorError::Io(source) => OrchestratorError::InspectionFailed {
                        environment: ctx.environment.clone(),
                        source,
                    },
                    other => other,
                })?;
            let state = if legacy_has_data {
                DeploymentState::LegacyOnly
            } else {
                DeploymentState::Absent
            };
            debug!(environment = %ctx.environment, state = %state, "Target layout not present");
            return Ok((state, Vec::new()));
        }

        let verifier = HealthVerifier::new(ctx.probe.clone(), &ctx.settings);
        let mut reports = Vec::with_capacity(specs.len());
        let mut all_healthy = true;
        for spec in specs {
            let status = verifier.probe_once(&ctx.environment, spec).await;
            if status != HealthStatus::Healthy {
                all_healthy = false;
            }
            reports.push(ServiceReport {
                name: spec.name.clone(),
                status,
            });
        }

        let state = if all_healthy {
            DeploymentState::TargetHealthy
        } else {
            DeploymentState::TargetPartial
        };
        debug!(environment = %ctx.environment, state = %state, "Inspection complete");
        Ok((state, reports))
    }

    /// 目标布局是否存在且包含有效服务清单
    async fn target_layout_valid(ctx: &OrchestrateContext) -> std::io::Result<bool> {
        match tokio::fs::read(&ctx.paths.services_manifest).await {
            Ok(bytes) => {
                // 清单必须能解析，半写文件不算有效布局
                Ok(serde_json::from_slice::<Vec<ServiceSpec>>(&bytes).is_ok())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::{test_context, ScriptedProbe, ScriptedRuntime};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_absent_when_nothing_exists() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            dir.path(),
            Arc::new(ScriptedRuntime::healthy()),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );
        let specs = crate::domain::service::default_services("dev");
        let state = StateInspector::inspect(&ctx, &specs).await.unwrap();
        assert_eq!(state, DeploymentState::Absent);
    }

    #[tokio::test]
    async fn test_legacy_only_when_legacy_has_data() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            dir.path(),
            Arc::new(ScriptedRuntime::healthy()),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );
        tokio::fs::create_dir_all(&ctx.settings.legacy_root)
            .await
            .unwrap();
        tokio::fs::write(ctx.settings.legacy_root.join("dump.sql"), b"data")
            .await
            .unwrap();

        let specs = crate::domain::service::default_services("dev");
        let state = StateInspector::inspect(&ctx, &specs).await.unwrap();
        assert_eq!(state, DeploymentState::LegacyOnly);
    }

    #[tokio::test]
    async fn test_partial_vs_healthy_with_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let specs = crate::domain::service::default_services("dev");

        let healthy_ctx = test_context(
            dir.path(),
            Arc::new(ScriptedRuntime::healthy()),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );
        tokio::fs::create_dir_all(&healthy_ctx.paths.root)
            .await
            .unwrap();
        tokio::fs::write(
            &healthy_ctx.paths.services_manifest,
            serde_json::to_vec(&specs).unwrap(),
        )
        .await
        .unwrap();

        let state = StateInspector::inspect(&healthy_ctx, &specs).await.unwrap();
        assert_eq!(state, DeploymentState::TargetHealthy);

        let partial_ctx = test_context(
            dir.path(),
            Arc::new(ScriptedRuntime::healthy()),
            Arc::new(ScriptedProbe::always(HealthStatus::Starting)),
        );
        let (state, reports) = StateInspector::inspect_with_report(&partial_ctx, &specs)
            .await
            .unwrap();
        assert_eq!(state, DeploymentState::TargetPartial);
        assert_eq!(reports.len(), specs.len());
    }

    #[tokio::test]
    async fn test_corrupt_manifest_is_not_a_valid_layout() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            dir.path(),
            Arc::new(ScriptedRuntime::healthy()),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );
        tokio::fs::create_dir_all(&ctx.paths.root).await.unwrap();
        tokio::fs::write(&ctx.paths.services_manifest, b"{half writ")
            .await
            .unwrap();

        let specs = crate::domain::service::default_services("dev");
        let state = StateInspector::inspect(&ctx, &specs).await.unwrap();
        assert_eq!(state, DeploymentState::Absent);
    }

    #[tokio::test]
    async fn test_inspect_twice_is_deterministic() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = test_context(
            dir.path(),
            Arc::new(ScriptedRuntime::healthy()),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );
        let specs = crate::domain::service::default_services("dev");
        let first = StateInspector::inspect(&ctx, &specs).await.unwrap();
        let second = StateInspector::inspect(&ctx, &specs).await.unwrap();
        assert_eq!(first, second);
    }
}
