//! 服务注册表与健康检查契约
//!
//! 将分散在脚本中的容器名/端口知识集中为按逻辑名索引的
//! `ServiceSpec` 注册表，运行时标识符仅在执行时解析

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 健康检查方式
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealthCheck {
    /// HTTP 健康端点，响应 JSON 中的 `status` 字段区分
    /// healthy / starting / unhealthy
    Http { port: u16, path: String },
    /// 通过容器运行时查询容器自身的健康状态
    Docker,
}

/// 单次健康探测的结果
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    /// 服务健康
    Healthy,
    /// 端点有响应并明确报告启动中
    Starting,
    /// 无响应：连接被拒或尝试超时，前几次按瞬态对待，
    /// 超出宽限次数后升级为失败
    Unreachable,
    /// 终态失败：健康端点明确报告不健康，重试无意义
    Unhealthy,
}

/// 服务规格
///
/// 每个环境静态定义，单次编排运行期间不可变
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// 逻辑名（环境内唯一）
    pub name: String,
    /// 镜像引用
    pub image: String,
    /// 依赖的服务逻辑名集合
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// 健康检查契约
    pub health_check: HealthCheck,
    /// 暴露端口（"host:container" 格式）
    #[serde(default)]
    pub exposed_ports: Vec<String>,
    /// 启动所需的环境配置键
    #[serde(default)]
    pub required_env_keys: Vec<String>,
    /// 持久数据卷（目标布局 data/ 下的子目录），以及该卷是否为
    /// 迁移时不可缺失的必需工件
    #[serde(default)]
    pub data_volume: Option<DataVolume>,
}

/// 服务的持久数据卷声明
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataVolume {
    /// data/ 下的子目录名
    pub subdir: String,
    /// 迁移失败时是否阻塞编排（可再生的缓存卷为 false）
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

impl ServiceSpec {
    /// 解析该服务在指定环境下的容器名
    ///
    /// 命名约定：`<environment>-<name>`，StateInspector 和编排器
    /// 都依赖这一约定定位既有实例
    pub fn container_name(&self, environment: &str) -> String {
        format!("{}-{}", environment, self.name)
    }
}

/// 从 `DEPLOYCTL_SERVICES` 环境变量或环境默认集加载服务注册表
///
/// 环境变量值为 JSON 数组（与 `services.json` 清单同构），用于
/// 覆盖内置默认；解析失败时回退到默认集并记录警告
pub fn load_services(environment: &str) -> Vec<ServiceSpec> {
    if let Ok(raw) = std::env::var("DEPLOYCTL_SERVICES") {
        match serde_json::from_str::<Vec<ServiceSpec>>(&raw) {
            Ok(specs) if !specs.is_empty() => return specs,
            Ok(_) => {
                tracing::warn!("DEPLOYCTL_SERVICES is an empty list, using defaults");
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to parse DEPLOYCTL_SERVICES, using defaults");
            }
        }
    }
    default_services(environment)
}

/// 每个环境的内置默认服务集
///
/// dev 不含 web 前端；staging/production 含完整集合
pub fn default_services(environment: &str) -> Vec<ServiceSpec> {
    let mut specs = vec![
        ServiceSpec {
            name: "db".to_string(),
            image: "postgres:16-alpine".to_string(),
            depends_on: vec![],
            health_check: HealthCheck::Docker,
            exposed_ports: vec!["5432:5432".to_string()],
            required_env_keys: vec!["DB_PASSWORD".to_string()],
            data_volume: Some(DataVolume {
                subdir: "postgres".to_string(),
                required: true,
            }),
        },
        ServiceSpec {
            name: "cache".to_string(),
            image: "redis:7-alpine".to_string(),
            depends_on: vec![],
            health_check: HealthCheck::Docker,
            exposed_ports: vec!["6379:6379".to_string()],
            required_env_keys: vec![],
            data_volume: None,
        },
        ServiceSpec {
            name: "api".to_string(),
            image: "app/api:latest".to_string(),
            depends_on: vec!["db".to_string(), "cache".to_string()],
            health_check: HealthCheck::Http {
                port: 8080,
                path: "/health".to_string(),
            },
            exposed_ports: vec!["8080:8080".to_string()],
            required_env_keys: vec!["DB_PASSWORD".to_string(), "JWT_SECRET".to_string()],
            data_volume: Some(DataVolume {
                subdir: "models".to_string(),
                required: false,
            }),
        },
    ];

    if environment != "dev" {
        specs.push(ServiceSpec {
            name: "web".to_string(),
            image: "app/web:latest".to_string(),
            depends_on: vec!["api".to_string()],
            health_check: HealthCheck::Http {
                port: 3000,
                path: "/health".to_string(),
            },
            exposed_ports: vec!["3000:3000".to_string()],
            required_env_keys: vec![],
            data_volume: None,
        });
    }

    specs
}

/// 校验注册表：名字唯一且依赖都指向已知服务
pub fn validate_registry(specs: &[ServiceSpec]) -> std::result::Result<(), String> {
    let mut names = HashMap::new();
    for spec in specs {
        if names.insert(spec.name.as_str(), ()).is_some() {
            return Err(format!("duplicate service name '{}'", spec.name));
        }
    }
    for spec in specs {
        for dep in &spec.depends_on {
            if !names.contains_key(dep.as_str()) {
                return Err(format!(
                    "service '{}' depends on unknown service '{}'",
                    spec.name, dep
                ));
            }
        }
    }
    Ok(())
}
