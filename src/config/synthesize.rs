//! 配置合成器
//!
//! 产出完整且经过校验的环境配置：
//! - 可生成的密钥（密码、令牌）用 CSPRNG 一次性生成，之后不再变更
//! - 必须由操作员提供的键缺失时报 `ConfigIncomplete`
//! - 配置存储为 KEY=VALUE 行格式，多值键支持 CSV 与 JSON 数组
//! - 持久化采用原子替换；已有有效存储未加 force 不会被改写其既有值

use rand::distributions::Alphanumeric;
use rand::rngs::OsRng;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::config::settings::EnvironmentPaths;
use crate::domain::service::ServiceSpec;
use crate::error::{OrchestratorError, Result};
use crate::infra::fsutil;

/// 配置值的来源
#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Provenance {
    /// 本次或此前运行生成
    Generated,
    /// 来自既有存储或操作员提供
    Inherited,
    /// 必需但缺失
    RequiredMissing,
}

/// 单个配置条目
#[derive(Clone, Debug)]
pub struct ConfigEntry {
    pub value: String,
    pub provenance: Provenance,
}

/// 环境配置：键 → 带来源标注的值
///
/// BTreeMap 保证写出顺序稳定，便于 diff
#[derive(Clone, Debug, Default)]
pub struct EnvironmentConfig {
    entries: BTreeMap<String, ConfigEntry>,
}

impl EnvironmentConfig {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|e| e.value.as_str())
    }

    /// 读取多值键：JSON 字符串数组或 CSV
    pub fn get_list(&self, key: &str) -> Vec<String> {
        let Some(raw) = self.get(key) else {
            return Vec::new();
        };
        let trimmed = raw.trim();
        if trimmed.starts_with('[') {
            if let Ok(values) = serde_json::from_str::<Vec<String>>(trimmed) {
                return values;
            }
            warn!(key = %key, "Value looks like a JSON array but failed to parse, falling back to CSV");
        }
        trimmed
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// 仍缺失的必需键
    pub fn missing_keys(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.provenance == Provenance::RequiredMissing)
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// 导出为普通键值映射（供容器启动注入环境变量）
    pub fn as_map(&self) -> std::collections::HashMap<String, String> {
        self.entries
            .iter()
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ConfigEntry)> {
        self.entries.iter()
    }

    /// 序列化为存储格式
    fn to_store_format(&self) -> String {
        let mut out = String::from("# Managed by deployctl. Generated values are written once.\n");
        for (key, entry) in &self.entries {
            out.push_str(key);
            out.push('=');
            out.push_str(&entry.value);
            out.push('\n');
        }
        out
    }
}

/// 每个键的取值规则
#[derive(Clone, Debug, PartialEq)]
pub enum GenerationRule {
    /// 用加密安全随机源生成指定长度的字母数字令牌
    Generate { length: usize },
    /// 必须由操作员提供
    Operator,
}

/// 配置模板条目
#[derive(Clone, Debug)]
pub struct KeyRule {
    pub key: String,
    pub rule: GenerationRule,
}

/// 由服务注册表推导配置模板
///
/// 敏感命名的键（password/secret/token/key 等）可生成，
/// 其余必需键由操作员提供
pub fn template_for(specs: &[ServiceSpec]) -> Vec<KeyRule> {
    let mut seen = BTreeMap::new();
    for spec in specs {
        for key in &spec.required_env_keys {
            seen.entry(key.clone()).or_insert_with(|| KeyRule {
                key: key.clone(),
                rule: if is_sensitive_key(key) {
                    GenerationRule::Generate { length: 32 }
                } else {
                    GenerationRule::Operator
                },
            });
        }
    }
    seen.into_values().collect()
}

/// 敏感关键词列表
const SENSITIVE_KEYWORDS: &[&str] = &[
    "password", "secret", "key", "token", "credential", "auth", "jwt",
];

/// 检查键名是否为可生成的敏感值
pub fn is_sensitive_key(key: &str) -> bool {
    let key_lower = key.to_lowercase();
    SENSITIVE_KEYWORDS.iter().any(|kw| key_lower.contains(kw))
}

/// 生成加密安全的随机字母数字令牌
fn generate_secret(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// 合成配置：既有值短路生成，缺失的操作员键标记 RequiredMissing
pub fn synthesize(
    template: &[KeyRule],
    existing: &BTreeMap<String, String>,
) -> EnvironmentConfig {
    let mut entries = BTreeMap::new();

    // 既有存储中、模板外的键原样继承（操作员手工追加的配置）
    for (key, value) in existing {
        entries.insert(
            key.clone(),
            ConfigEntry {
                value: value.clone(),
                provenance: Provenance::Inherited,
            },
        );
    }

    for rule in template {
        if existing.contains_key(&rule.key) {
            continue;
        }
        let entry = match &rule.rule {
            GenerationRule::Generate { length } => {
                info!(key = %rule.key, "Generating secret value");
                ConfigEntry {
                    value: generate_secret(*length),
                    provenance: Provenance::Generated,
                }
            }
            GenerationRule::Operator => ConfigEntry {
                value: String::new(),
                provenance: Provenance::RequiredMissing,
            },
        };
        entries.insert(rule.key.clone(), entry);
    }

    EnvironmentConfig { entries }
}

/// 解析 KEY=VALUE 存储内容
///
/// 跳过空行与 # 注释；无 '=' 的行记警告后忽略
pub fn parse_store(raw: &str) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => {
                map.insert(key.trim().to_string(), value.to_string());
            }
            None => {
                warn!(line = %line, "Ignoring malformed config line");
            }
        }
    }
    map
}

/// 确保环境配置完整并已持久化
///
/// - 无既有存储：合成并写入
/// - 有既有存储：既有值全部保留；仅当需要追加新键时才改写文件
///   （纯追加不构成覆盖既有有效配置）
/// - `force`：允许重新生成 Generate 规则的键（显式密钥轮换）
///
/// 任何 RequiredMissing 残留都会阻止编排继续
pub async fn ensure(
    paths: &EnvironmentPaths,
    specs: &[ServiceSpec],
    force: bool,
) -> Result<EnvironmentConfig> {
    let template = template_for(specs);

    let existing = match tokio::fs::read_to_string(&paths.config_store).await {
        Ok(raw) => parse_store(&raw),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
        Err(e) => return Err(e.into()),
    };
    let store_existed = !existing.is_empty();

    let effective_existing = if force {
        // 显式轮换：丢弃可生成键的既有值，操作员键保留
        existing
            .iter()
            .filter(|(k, _)| {
                !template
                    .iter()
                    .any(|r| &r.key == *k && matches!(r.rule, GenerationRule::Generate { .. }))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    } else {
        existing.clone()
    };

    let config = synthesize(&template, &effective_existing);

    let missing = config.missing_keys();
    if !missing.is_empty() {
        return Err(OrchestratorError::ConfigIncomplete { missing });
    }

    // 既有存储已完整且无需追加：不触碰文件，防止意外轮换
    let unchanged = store_existed
        && !force
        && config
            .iter()
            .all(|(k, e)| existing.get(k).map(String::as_str) == Some(e.value.as_str()));
    if unchanged {
        info!(path = %paths.config_store.display(), "Config store already complete");
        return Ok(config);
    }

    tokio::fs::create_dir_all(&paths.config_dir).await?;
    fsutil::atomic_write(&paths.config_store, config.to_store_format().as_bytes()).await?;
    info!(
        path = %paths.config_store.display(),
        keys = config.iter().count(),
        forced = force,
        "Config store written"
    );

    Ok(config)
}
