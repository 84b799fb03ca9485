// 配置读取与覆盖合并：数据库连接、查询策略、影子表与日志级别。
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;

const DEFAULT_CONFIG_PATH: &str = "config/shadow-store.yaml";
const DEFAULT_OVERRIDE_PATH: &str = "data/config/shadow-store.override.yaml";

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub shadow: ShadowConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: String,
    #[serde(default)]
    pub db_path: String,
    #[serde(default)]
    pub postgres: PostgresConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PostgresConfig {
    #[serde(default)]
    pub dsn: String,
    #[serde(default)]
    pub connect_timeout_s: u64,
    #[serde(default)]
    pub pool_size: usize,
}

/// SQL 失败时的处理策略：默认返回错误，由调用方决定是否退出进程。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FatalPolicy {
    #[default]
    Propagate,
    Exit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    #[serde(default)]
    pub developer_mode: bool,
    /// 0 关闭；正数只记录超过阈值的查询；负数记录全部查询。
    #[serde(default)]
    pub slow_query_threshold_s: f64,
    /// 内部便捷调用（execute、影子表读写）是否记录 SQL 错误日志。
    #[serde(default = "default_log_errors")]
    pub log_errors: bool,
    #[serde(default)]
    pub on_fatal: FatalPolicy,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            developer_mode: false,
            slow_query_threshold_s: 0.0,
            log_errors: default_log_errors(),
            on_fatal: FatalPolicy::default(),
        }
    }
}

fn default_log_errors() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    #[serde(default = "default_conflict_target")]
    pub conflict_target: String,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            conflict_target: default_conflict_target(),
        }
    }
}

fn default_conflict_target() -> String {
    "uk1".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub log_level: String,
}

pub fn load_config() -> Config {
    let base_path = env::var("SHADOW_STORE_CONFIG_PATH")
        .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let override_path = env::var("SHADOW_STORE_CONFIG_OVERRIDE_PATH")
        .unwrap_or_else(|_| DEFAULT_OVERRIDE_PATH.to_string());
    load_config_from(&base_path, &override_path)
}

/// 依次叠加基础文件与覆盖文件，展开环境变量后反序列化；任何一步失败都回退默认值。
pub fn load_config_from(base_path: &str, override_path: &str) -> Config {
    let mut merged = Value::Null;
    for (path, required) in [(base_path, true), (override_path, false)] {
        if let Some(layer) = read_layer(path, required) {
            overlay(&mut merged, layer);
        }
    }
    if merged.is_null() {
        return Config::default();
    }
    expand_env(&mut merged);
    serde_yaml::from_value::<Config>(merged).unwrap_or_else(|err| {
        warn!("config {base_path} is invalid, using defaults: {err}");
        Config::default()
    })
}

/// 覆盖层可以不存在；基础层缺失时记一条警告。
fn read_layer(path: &str, required: bool) -> Option<Value> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) => {
            if required || Path::new(path).exists() {
                warn!("cannot read config layer {path}: {err}");
            }
            return None;
        }
    };
    match serde_yaml::from_str::<Value>(&content) {
        Ok(layer) => Some(layer),
        Err(err) => {
            warn!("config layer {path} is not valid YAML: {err}");
            None
        }
    }
}

/// 映射逐键递归合并；其余节点整体替换，上层的 null 不会清掉下层的值。
fn overlay(lower: &mut Value, upper: Value) {
    if let (Value::Mapping(lower_map), Value::Mapping(upper_map)) = (&mut *lower, &upper) {
        for (key, value) in upper_map {
            match lower_map.get_mut(key) {
                Some(slot) => overlay(slot, value.clone()),
                None => {
                    lower_map.insert(key.clone(), value.clone());
                }
            }
        }
        return;
    }
    if !upper.is_null() {
        *lower = upper;
    }
}

fn expand_env(value: &mut Value) {
    match value {
        Value::String(text) => *text = expand_env_placeholders(text),
        Value::Sequence(items) => items.iter_mut().for_each(expand_env),
        Value::Mapping(map) => map.iter_mut().for_each(|(_, item)| expand_env(item)),
        _ => {}
    }
}

fn env_placeholder_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]*?)(?::-([^}]*))?\}").ok())
        .as_ref()
}

/// 展开 `${NAME}` 与 `${NAME:-default}`；变量为空视同未设置，名字为空的占位符原样保留。
fn expand_env_placeholders(input: &str) -> String {
    let Some(regex) = env_placeholder_regex() else {
        return input.to_string();
    };
    regex
        .replace_all(input, |caps: &Captures<'_>| {
            let name = caps.get(1).map(|m| m.as_str().trim()).unwrap_or_default();
            if name.is_empty() {
                return caps[0].to_string();
            }
            env::var(name)
                .ok()
                .filter(|value| !value.is_empty())
                .or_else(|| caps.get(2).map(|m| m.as_str().to_string()))
                .unwrap_or_default()
        })
        .into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_expand_env_placeholders() {
        std::env::remove_var("SHADOW_STORE_TEST_PLACEHOLDER");
        assert_eq!(
            expand_env_placeholders("postgres://app:${SHADOW_STORE_TEST_PLACEHOLDER:-secret}@db"),
            "postgres://app:secret@db"
        );

        std::env::set_var("SHADOW_STORE_TEST_PLACEHOLDER", "value");
        assert_eq!(
            expand_env_placeholders("prefix-${SHADOW_STORE_TEST_PLACEHOLDER}-suffix"),
            "prefix-value-suffix"
        );

        std::env::remove_var("SHADOW_STORE_TEST_PLACEHOLDER");
        assert_eq!(expand_env_placeholders("${SHADOW_STORE_TEST_PLACEHOLDER}"), "");
        assert_eq!(expand_env_placeholders("${unterminated"), "${unterminated");
        assert_eq!(expand_env_placeholders("keep ${} as is"), "keep ${} as is");
    }

    #[test]
    fn missing_files_fall_back_to_defaults() {
        let config = load_config_from("/nonexistent/base.yaml", "/nonexistent/override.yaml");
        assert!(!config.query.developer_mode);
        assert!(config.query.log_errors);
        assert_eq!(config.query.on_fatal, FatalPolicy::Propagate);
        assert_eq!(config.shadow.conflict_target, "uk1");
    }

    #[test]
    fn override_file_wins_over_base() {
        let dir = tempfile::tempdir().expect("temp dir");
        let base = dir.path().join("base.yaml");
        let over = dir.path().join("override.yaml");
        let mut file = fs::File::create(&base).expect("create base");
        writeln!(
            file,
            "database:\n  backend: sqlite\n  db_path: ./data/app.db\nquery:\n  slow_query_threshold_s: 0.5\n  on_fatal: exit"
        )
        .expect("write base");
        let mut file = fs::File::create(&over).expect("create override");
        writeln!(file, "query:\n  developer_mode: true\n  slow_query_threshold_s: -1").expect("write override");

        let config = load_config_from(
            base.to_string_lossy().as_ref(),
            over.to_string_lossy().as_ref(),
        );
        assert_eq!(config.database.backend, "sqlite");
        assert_eq!(config.database.db_path, "./data/app.db");
        assert!(config.query.developer_mode);
        assert_eq!(config.query.slow_query_threshold_s, -1.0);
        assert_eq!(config.query.on_fatal, FatalPolicy::Exit);
    }

    #[test]
    fn null_override_keeps_base_and_nested_keys_merge() {
        let dir = tempfile::tempdir().expect("temp dir");
        let base = dir.path().join("base.yaml");
        let over = dir.path().join("override.yaml");
        fs::write(
            &base,
            "database:\n  backend: postgres\n  postgres:\n    dsn: postgres://base/db\n    pool_size: 8\nshadow:\n  conflict_target: uk1\n",
        )
        .expect("write base");
        fs::write(
            &over,
            "database:\n  postgres:\n    pool_size: 2\nshadow:\n  conflict_target: ~\n",
        )
        .expect("write override");

        let config = load_config_from(
            base.to_string_lossy().as_ref(),
            over.to_string_lossy().as_ref(),
        );
        assert_eq!(config.database.backend, "postgres");
        assert_eq!(config.database.postgres.dsn, "postgres://base/db");
        assert_eq!(config.database.postgres.pool_size, 2);
        assert_eq!(config.shadow.conflict_target, "uk1");
    }
}
