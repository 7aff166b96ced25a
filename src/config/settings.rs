//! 进程设置加载
//!
//! 重试次数、退避参数、快照保留数等可调项来自环境变量，
//! 未设置时使用 `defaults` 中的默认值

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// 默认值
///
/// 原始脚本未给出权威数值，全部可经环境变量覆盖
pub mod defaults {
    /// 目标布局根目录
    pub const ROOT: &str = "/opt/deployctl";

    /// 旧版布局根目录
    pub const LEGACY_ROOT: &str = "/opt/app-legacy";

    /// 服务启动最大尝试次数
    pub const MAX_START_ATTEMPTS: u32 = 3;

    /// 指数退避基数（秒）
    pub const BACKOFF_BASE_SECS: u64 = 2;

    /// 退避上限（秒）
    pub const BACKOFF_CAP_SECS: u64 = 30;

    /// 单个服务的健康等待总超时（秒）
    pub const HEALTH_TIMEOUT_SECS: u64 = 60;

    /// 健康轮询间隔（秒）
    pub const HEALTH_INTERVAL_SECS: u64 = 2;

    /// 无响应被视为瞬态（starting）的前 N 次尝试
    pub const TRANSIENT_GRACE_ATTEMPTS: u32 = 5;

    /// 快照保留数量
    pub const SNAPSHOT_RETENTION: usize = 5;

    /// 短命令超时（秒）
    pub const COMMAND_TIMEOUT_SECS: u64 = 30;

    /// 容器启动命令超时（秒）
    pub const START_TIMEOUT_SECS: u64 = 300;

    /// 同层服务并行启动的工作池上限
    pub const MAX_PARALLEL_STARTS: usize = 4;

    /// 版本号
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// 进程设置
#[derive(Clone, Debug)]
pub struct Settings {
    /// 目标布局根目录（每个环境一个子目录）
    pub root: PathBuf,
    /// 旧版布局根目录
    pub legacy_root: PathBuf,
    /// 服务启动最大尝试次数
    pub max_start_attempts: u32,
    /// 指数退避基数
    pub backoff_base: Duration,
    /// 退避上限
    pub backoff_cap: Duration,
    /// 健康等待总超时
    pub health_timeout: Duration,
    /// 健康轮询间隔
    pub health_interval: Duration,
    /// 无响应视为瞬态的前 N 次尝试
    pub transient_grace_attempts: u32,
    /// 快照保留数量
    pub snapshot_retention: usize,
    /// 短命令超时
    pub command_timeout: Duration,
    /// 容器启动超时
    pub start_timeout: Duration,
    /// 并行启动上限
    pub max_parallel_starts: usize,
}

impl Settings {
    /// 从环境变量加载设置
    pub fn from_env() -> Self {
        Self {
            root: env::var("DEPLOYCTL_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(defaults::ROOT)),
            legacy_root: env::var("DEPLOYCTL_LEGACY_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(defaults::LEGACY_ROOT)),
            max_start_attempts: load_parsed(
                "DEPLOYCTL_MAX_START_ATTEMPTS",
                defaults::MAX_START_ATTEMPTS,
            ),
            backoff_base: Duration::from_secs(load_parsed(
                "DEPLOYCTL_BACKOFF_BASE_SECS",
                defaults::BACKOFF_BASE_SECS,
            )),
            backoff_cap: Duration::from_secs(load_parsed(
                "DEPLOYCTL_BACKOFF_CAP_SECS",
                defaults::BACKOFF_CAP_SECS,
            )),
            health_timeout: Duration::from_secs(load_parsed(
                "DEPLOYCTL_HEALTH_TIMEOUT_SECS",
                defaults::HEALTH_TIMEOUT_SECS,
            )),
            health_interval: Duration::from_secs(load_parsed(
                "DEPLOYCTL_HEALTH_INTERVAL_SECS",
                defaults::HEALTH_INTERVAL_SECS,
            )),
            transient_grace_attempts: load_parsed(
                "DEPLOYCTL_TRANSIENT_GRACE_ATTEMPTS",
                defaults::TRANSIENT_GRACE_ATTEMPTS,
            ),
            snapshot_retention: load_parsed(
                "DEPLOYCTL_SNAPSHOT_RETENTION",
                defaults::SNAPSHOT_RETENTION,
            ),
            command_timeout: Duration::from_secs(load_parsed(
                "DEPLOYCTL_COMMAND_TIMEOUT_SECS",
                defaults::COMMAND_TIMEOUT_SECS,
            )),
            start_timeout: Duration::from_secs(load_parsed(
                "DEPLOYCTL_START_TIMEOUT_SECS",
                defaults::START_TIMEOUT_SECS,
            )),
            max_parallel_starts: load_parsed(
                "DEPLOYCTL_MAX_PARALLEL_STARTS",
                defaults::MAX_PARALLEL_STARTS,
            ),
        }
    }

    /// 指数退避：第 `attempt` 次失败后的等待时长（attempt 从 1 计）
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_cap)
    }
}

/// 环境路径解析
///
/// 所有组件经由这里取得环境内的固定路径，避免路径知识散落
#[derive(Clone, Debug)]
pub struct EnvironmentPaths {
    /// 环境根：`<root>/<environment>`
    pub root: PathBuf,
    /// 配置目录
    pub config_dir: PathBuf,
    /// 配置存储文件
    pub config_store: PathBuf,
    /// 服务清单
    pub services_manifest: PathBuf,
    /// 持久数据目录
    pub data_dir: PathBuf,
    /// 快照目录
    pub snapshots_dir: PathBuf,
    /// 迁移清单所在目录（环境根）
    pub manifest_dir: PathBuf,
    /// 环境锁文件
    pub lock_path: PathBuf,
}

impl EnvironmentPaths {
    pub fn new(settings: &Settings, environment: &str) -> Self {
        let root = settings.root.join(environment);
        Self {
            config_dir: root.join("config"),
            config_store: root.join("config").join("app.env"),
            services_manifest: root.join("services.json"),
            data_dir: root.join("data"),
            snapshots_dir: root.join("snapshots"),
            manifest_dir: root.clone(),
            lock_path: root.join(".lock"),
            root,
        }
    }
}

/// 解析环境变量，失败时回退默认值
fn load_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
