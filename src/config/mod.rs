//! 配置层

pub mod settings;
pub mod synthesize;

pub use settings::{EnvironmentPaths, Settings};
pub use synthesize::{EnvironmentConfig, Provenance};
