//! Service orchestrator
//!
//! Brings services up in dependency order. Services without a mutual
//! dependency start concurrently inside a bounded worker pool; a dependent
//! never starts before every one of its dependencies is verified healthy.
//! Each start is an idempotent replace (stop and remove the old instance
//! under the same logical name first) with bounded retry and exponential
//! backoff between attempts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::domain::service::{validate_registry, ServiceSpec};
use crate::error::{OrchestratorError, Result};
use crate::services::context::OrchestrateContext;
use crate::services::health::HealthVerifier;

/// 服务编排器
pub struct ServiceOrchestrator;

/// Kahn layering: layer N holds the services whose dependencies all live in
/// layers < N. A non-empty remainder means a cycle.
pub fn topological_layers(specs: &[ServiceSpec]) -> Result<Vec<Vec<ServiceSpec>>> {
    validate_registry(specs).map_err(|reason| OrchestratorError::InvalidServiceRegistry { reason })?;

    let mut remaining: HashMap<&str, &ServiceSpec> =
        specs.iter().map(|s| (s.name.as_str(), s)).collect();
    let mut placed: HashSet<String> = HashSet::new();
    let mut layers: Vec<Vec<ServiceSpec>> = Vec::new();

    while !remaining.is_empty() {
        let ready: Vec<String> = remaining
            .values()
            .filter(|s| s.depends_on.iter().all(|d| placed.contains(d)))
            .map(|s| s.name.clone())
            .collect();

        if ready.is_empty() {
            let mut stuck: Vec<String> = remaining.keys().map(|s| s.to_string()).collect();
            stuck.sort();
            return Err(OrchestratorError::DependencyCycle { services: stuck });
        }

        let mut layer = Vec::with_capacity(ready.len());
        for name in ready {
            if let Some(spec) = remaining.remove(name.as_str()) {
                layer.push(spec.clone());
            }
            placed.insert(name);
        }
        // Stable order inside a layer keeps logs and tests deterministic
        layer.sort_by(|a, b| a.name.cmp(&b.name));
        layers.push(layer);
    }

    Ok(layers)
}

impl ServiceOrchestrator {
    /// Start every service in dependency order.
    ///
    /// The layer barrier is the ordering guarantee: layer N+1 is not
    /// entered until every service in layer N passed health verification.
    pub async fn start(
        ctx: &OrchestrateContext,
        specs: &[ServiceSpec],
        env: &HashMap<String, String>,
    ) -> Result<()> {
        let layers = topological_layers(specs)?;
        let env = Arc::new(env.clone());
        let semaphore = Arc::new(Semaphore::new(ctx.settings.max_parallel_starts.max(1)));

        for (index, layer) in layers.into_iter().enumerate() {
            ctx.check_cancelled()?;
            info!(
                layer = index,
                services = ?layer.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
                "Starting service layer"
            );

            let mut tasks: JoinSet<Result<()>> = JoinSet::new();
            for spec in layer {
                let ctx = ctx.clone();
                let env = env.clone();
                let semaphore = semaphore.clone();
                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire()
                        .await
                        .map_err(|_| OrchestratorError::Cancelled)?;
                    Self::start_one(&ctx, &spec, &env).await
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let result = joined.map_err(|e| OrchestratorError::CommandFailed {
                    command: "service start task".to_string(),
                    reason: e.to_string(),
                })?;
                if let Err(e) = result {
                    // One failure fails the layer; nothing beyond this
                    // layer has started yet
                    tasks.abort_all();
                    return Err(e);
                }
            }
        }

        Ok(())
    }

    /// Idempotent replace + bounded retry for a single service
    async fn start_one(
        ctx: &OrchestrateContext,
        spec: &ServiceSpec,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        let container = spec.container_name(&ctx.environment);
        let verifier = HealthVerifier::new(ctx.probe.clone(), &ctx.settings);
        let max_attempts = ctx.settings.max_start_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            ctx.check_cancelled()?;
            info!(service = %spec.name, attempt, "Starting service");

            let outcome = async {
                ctx.runtime.remove_container(&container).await?;
                ctx.runtime
                    .start_service(&container, spec, env, &ctx.paths.data_dir)
                    .await?;
                verifier
                    .wait_healthy(&ctx.environment, spec, &ctx.cancel)
                    .await
            }
            .await;

            match outcome {
                Ok(()) => {
                    info!(service = %spec.name, attempt, "Service healthy");
                    return Ok(());
                }
                Err(OrchestratorError::Cancelled) => return Err(OrchestratorError::Cancelled),
                Err(e) => {
                    last_error = e.to_string();
                    warn!(
                        service = %spec.name,
                        attempt,
                        error = %last_error,
                        "Service start attempt failed"
                    );
                    if attempt < max_attempts {
                        let backoff = ctx.settings.backoff_after(attempt);
                        tokio::select! {
                            _ = ctx.cancel.cancelled() => return Err(OrchestratorError::Cancelled),
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
        }

        Err(OrchestratorError::ServiceStartFailed {
            service: spec.name.clone(),
            attempts: max_attempts,
            reason: last_error,
        })
    }

    /// Stop and remove every service container of the environment,
    /// dependents first (reverse layer order)
    pub async fn stop_all(ctx: &OrchestrateContext, specs: &[ServiceSpec]) -> Result<()> {
        let mut layers = topological_layers(specs)?;
        layers.reverse();
        for layer in layers {
            for spec in layer {
                let container = spec.container_name(&ctx.environment);
                info!(service = %spec.name, "Removing service container");
                ctx.runtime.remove_container(&container).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::service::{default_services, HealthCheck, HealthStatus};
    use crate::services::test_support::{test_context, ScriptedProbe, ScriptedRuntime};
    use tempfile::tempdir;

    fn chain_specs() -> Vec<ServiceSpec> {
        // a <- b <- c
        ["a", "b", "c"]
            .iter()
            .enumerate()
            .map(|(i, name)| ServiceSpec {
                name: name.to_string(),
                image: format!("app/{}:latest", name),
                depends_on: if i == 0 {
                    vec![]
                } else {
                    vec![["a", "b"][i - 1].to_string()]
                },
                health_check: HealthCheck::Docker,
                exposed_ports: vec![],
                required_env_keys: vec![],
                data_volume: None,
            })
            .collect()
    }

    #[test]
    fn test_layering_of_default_registry() {
        let layers = topological_layers(&default_services("production")).unwrap();
        let names: Vec<Vec<&str>> = layers
            .iter()
            .map(|l| l.iter().map(|s| s.name.as_str()).collect())
            .collect();
        assert_eq!(names, vec![vec!["cache", "db"], vec!["api"], vec!["web"]]);
    }

    #[test]
    fn test_cycle_detected() {
        let mut specs = chain_specs();
        specs[0].depends_on = vec!["c".to_string()];
        let err = topological_layers(&specs).unwrap_err();
        match err {
            OrchestratorError::DependencyCycle { services } => {
                assert_eq!(services, vec!["a", "b", "c"]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_dependency_order_is_respected() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::healthy());
        let ctx = test_context(
            dir.path(),
            runtime.clone(),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );

        ServiceOrchestrator::start(&ctx, &chain_specs(), &HashMap::new())
            .await
            .unwrap();

        let order = runtime.start_order();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        // C 不得先于 B，B 不得先于 A
        assert!(pos("dev-a") < pos("dev-b"));
        assert!(pos("dev-b") < pos("dev-c"));
    }

    #[tokio::test]
    async fn test_independent_services_all_start_before_dependent() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::healthy());
        let ctx = test_context(
            dir.path(),
            runtime.clone(),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );

        ServiceOrchestrator::start(&ctx, &default_services("dev"), &HashMap::new())
            .await
            .unwrap();

        let order = runtime.start_order();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos("dev-db") < pos("dev-api"));
        assert!(pos("dev-cache") < pos("dev-api"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_transient_failure() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::failing_first("dev-a", 1));
        let ctx = test_context(
            dir.path(),
            runtime.clone(),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );

        let specs = vec![chain_specs().remove(0)];
        ServiceOrchestrator::start(&ctx, &specs, &HashMap::new())
            .await
            .unwrap();

        // 第一次失败、第二次成功：替换（remove）发生两次
        assert_eq!(runtime.start_order(), vec!["dev-a"]);
        assert_eq!(runtime.removed.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_surface_start_failed() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::failing_first("dev-a", 99));
        let ctx = test_context(
            dir.path(),
            runtime.clone(),
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );

        let specs = vec![chain_specs().remove(0)];
        let err = ServiceOrchestrator::start(&ctx, &specs, &HashMap::new())
            .await
            .unwrap_err();
        match err {
            OrchestratorError::ServiceStartFailed { service, attempts, .. } => {
                assert_eq!(service, "a");
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_reports_cancelled() {
        let dir = tempdir().unwrap();
        let runtime = Arc::new(ScriptedRuntime::healthy());
        let ctx = test_context(
            dir.path(),
            runtime,
            Arc::new(ScriptedProbe::always(HealthStatus::Healthy)),
        );
        ctx.cancel.cancel();

        let err = ServiceOrchestrator::start(&ctx, &chain_specs(), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
    }
}
