//! deployctl - 环境部署与迁移编排器
//!
//! 将一个环境从任意起始状态（全新、仅旧版布局、部分部署）收敛到
//! 健康的目标布局：旧版数据校验迁移、配置合成、部署前快照、
//! 依赖序启动与健康门控、失败自动回滚。

pub mod config;
pub mod domain;
pub mod error;
pub mod infra;
pub mod services;
