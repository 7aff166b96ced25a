//! 编排运行上下文
//!
//! 单次编排运行所需的全部状态：环境标识、路径、设置、
//! 取消令牌以及运行时/探测句柄

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::config::settings::{EnvironmentPaths, Settings};
use crate::infra::docker::ContainerRuntime;
use crate::services::health::HealthProbe;

/// 编排执行上下文
#[derive(Clone)]
pub struct OrchestrateContext {
    /// 环境标识（dev / staging / production）
    pub environment: String,
    /// 进程设置
    pub settings: Settings,
    /// 环境内路径
    pub paths: EnvironmentPaths,
    /// 取消令牌（SIGINT 或操作员中止时触发）
    pub cancel: CancellationToken,
    /// 容器运行时
    pub runtime: Arc<dyn ContainerRuntime>,
    /// 健康探测
    pub probe: Arc<dyn HealthProbe>,
}

impl OrchestrateContext {
    /// 检查是否被取消
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// 被取消时返回 `Cancelled` 错误
    pub fn check_cancelled(&self) -> crate::error::Result<()> {
        if self.is_cancelled() {
            Err(crate::error::OrchestratorError::Cancelled)
        } else {
            Ok(())
        }
    }
}
