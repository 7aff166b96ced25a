//! 部署状态模型
//!
//! `DeploymentState` 在每次运行时重新计算，绝不持久化为权威状态 ——
//! 文件系统和容器运行时才是事实来源

use serde::Serialize;

/// 环境的当前部署状态
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    /// 未部署任何内容
    Absent,
    /// 仅存在旧版布局的安装
    LegacyOnly,
    /// 目标布局存在但并非所有服务健康
    TargetPartial,
    /// 全部服务健康运行
    TargetHealthy,
}

impl DeploymentState {
    /// 转换为字符串
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Absent => "absent",
            DeploymentState::LegacyOnly => "legacy-only",
            DeploymentState::TargetPartial => "target-partial",
            DeploymentState::TargetHealthy => "target-healthy",
        }
    }

    /// 是否已达到目标健康状态
    pub fn is_healthy(&self) -> bool {
        matches!(self, DeploymentState::TargetHealthy)
    }
}

impl std::fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
