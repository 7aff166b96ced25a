//! 领域模型

pub mod migration;
pub mod service;
pub mod snapshot;
pub mod state;
