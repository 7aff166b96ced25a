//! 基础设施层

pub mod command;
pub mod docker;
pub mod fsutil;
pub mod lock;

pub use command::{CommandError, CommandResult, CommandRunner};
pub use docker::{ContainerRuntime, ContainerState, DockerCli};
pub use lock::EnvironmentLock;
