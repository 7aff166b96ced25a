//! 编排服务层：状态检查、迁移、配置、快照、启动与回滚

pub mod backup;
pub mod context;
pub mod deploy;
pub mod health;
pub mod inspector;
pub mod migrator;
pub mod orchestrator;
pub mod rollback;

#[cfg(test)]
pub mod test_support;
