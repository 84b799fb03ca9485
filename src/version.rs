// 数据库版本探测与语义比较。
use crate::errors::DbError;
use crate::query::QueryHelper;
use crate::storage::Params;
use regex::Regex;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::OnceLock;

const UNKNOWN_VERSION: &str = "0.0.0";

/// 取版本串开头的数字与点号部分，例如 "16.2 (Debian 16.2-1)" -> "16.2"。
pub fn parse_version_prefix(raw: &str) -> String {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let prefix = RE
        .get_or_init(|| Regex::new(r"^[0-9.]+").ok())
        .as_ref()
        .and_then(|regex| regex.find(raw.trim()))
        .map(|m| m.as_str().trim_matches('.'))
        .unwrap_or_default();
    if prefix.is_empty() {
        UNKNOWN_VERSION.to_string()
    } else {
        prefix.to_string()
    }
}

/// 按点号分段做数值比较，缺失的段按 0 处理。
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let parse = |value: &str| -> Vec<u64> {
        value
            .split('.')
            .map(|part| part.trim().parse::<u64>().unwrap_or(0))
            .collect()
    };
    let left = parse(left);
    let right = parse(right);
    let len = left.len().max(right.len());
    for index in 0..len {
        let a = left.get(index).copied().unwrap_or(0);
        let b = right.get(index).copied().unwrap_or(0);
        match a.cmp(&b) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

impl QueryHelper {
    pub fn version_number(&mut self) -> Result<String, DbError> {
        let sql = self.engine().version_query();
        let log_errors = self.options().log_errors;
        let row = self.row_or_die(sql, &Params::new(), log_errors)?;
        let raw = row
            .and_then(|row| row.into_iter().next().map(|(_, value)| value))
            .map(|value| match value {
                Value::String(text) => text,
                other => other.to_string(),
            })
            .unwrap_or_default();
        Ok(parse_version_prefix(&raw))
    }

    pub fn version_at_least(&mut self, minimum: &str) -> Result<bool, DbError> {
        let current = self.version_number()?;
        Ok(compare_versions(&current, minimum) != Ordering::Less)
    }
}
