// 表结构探查：列元数据读取、按列名查找描述，以及类型/长度/可空性判断。
use crate::errors::DbError;
use crate::query::QueryHelper;
use crate::storage::{Engine, Row};
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

/// 列描述的来源：已取回的描述行，或需要先 `describe` 的表名。
#[derive(Debug, Clone, Copy)]
pub enum ColumnSource<'a> {
    Metadata(&'a [Row]),
    Table(&'a str),
}

impl<'a> From<&'a [Row]> for ColumnSource<'a> {
    fn from(rows: &'a [Row]) -> Self {
        ColumnSource::Metadata(rows)
    }
}

impl<'a> From<&'a Vec<Row>> for ColumnSource<'a> {
    fn from(rows: &'a Vec<Row>) -> Self {
        ColumnSource::Metadata(rows.as_slice())
    }
}

impl<'a> From<&'a str> for ColumnSource<'a> {
    fn from(table: &'a str) -> Self {
        ColumnSource::Table(table)
    }
}

/// 表名、列名会被直接拼进 SQL，只接受普通标识符。
pub fn validate_identifier(name: &str) -> Result<&str, DbError> {
    if identifier_regex().is_some_and(|regex| regex.is_match(name)) {
        Ok(name)
    } else {
        Err(DbError::InvalidIdentifier(name.to_string()))
    }
}

/// 解析 `name(length)` 形式的类型串，返回 (name, length)；无括号时长度为 0。
pub fn parse_column_type(raw: &str) -> (String, u64) {
    match column_type_regex().and_then(|regex| regex.captures(raw)) {
        Some(caps) => {
            let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default().to_string();
            let length = caps
                .get(2)
                .and_then(|m| m.as_str().parse::<u64>().ok())
                .unwrap_or(0);
            (name, length)
        }
        None => (raw.trim().to_string(), 0),
    }
}

fn identifier_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

fn column_type_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*([^()]+?)\s*\(\s*(\d+)\s*(?:,\s*\d+\s*)?\)").ok())
        .as_ref()
}

fn text(row: &Row, key: &str) -> String {
    match row.get(key) {
        Some(Value::String(value)) => value.clone(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

fn descriptor(field: String, column_type: String, nullable: bool, key: &str, default: Value, extra: &str) -> Row {
    let mut row = Row::new();
    row.insert("Field".to_string(), Value::String(field));
    row.insert("Type".to_string(), Value::String(column_type));
    row.insert(
        "Null".to_string(),
        Value::String(if nullable { "YES" } else { "NO" }.to_string()),
    );
    row.insert("Key".to_string(), Value::String(key.to_string()));
    row.insert("Default".to_string(), default);
    row.insert("Extra".to_string(), Value::String(extra.to_string()));
    row
}

/// Postgres 把未加引号的标识符折叠成小写，information_schema 里存的也是小写。
fn catalog_name(engine: Engine, table: &str) -> String {
    match engine {
        Engine::Sqlite => table.to_string(),
        Engine::Postgres => table.to_ascii_lowercase(),
    }
}

impl QueryHelper {
    /// 读取引擎原生的列信息行（SQLite `PRAGMA table_info`，Postgres `information_schema.columns`）。
    pub fn native_columns(&mut self, table: &str) -> Option<Vec<Row>> {
        let table = match validate_identifier(table) {
            Ok(table) => catalog_name(self.engine(), table),
            Err(err) => {
                warn!("metadata lookup rejected: {err}");
                return None;
            }
        };
        let sql = match self.engine() {
            Engine::Sqlite => format!("PRAGMA table_info(\"{table}\")"),
            Engine::Postgres => format!(
                "SELECT column_name::text AS column_name, data_type::text AS data_type, \
                 character_maximum_length::int8 AS character_maximum_length, \
                 numeric_precision::int8 AS numeric_precision, numeric_scale::int8 AS numeric_scale, \
                 is_nullable::text AS is_nullable, column_default::text AS column_default, \
                 ordinal_position::int8 AS ordinal_position \
                 FROM information_schema.columns \
                 WHERE table_schema = current_schema() AND table_name = '{table}' \
                 ORDER BY ordinal_position"
            ),
        };
        match self.client_mut().query(&sql) {
            // 表不存在时两种引擎都返回空结果，统一视为失败。
            Ok(rows) if rows.is_empty() => {
                warn!("metadata lookup found no columns for table {table}");
                None
            }
            Ok(rows) => Some(rows),
            Err(err) => {
                warn!("metadata lookup failed for table {table}: {err}");
                None
            }
        }
    }

    /// 表的列描述，统一为 Field/Type/Null/Key/Default/Extra 形态，可直接交给 `column_*` 系列。
    ///
    /// 失败或表不存在时返回 None。
    pub fn metadata(&mut self, table: &str) -> Option<Vec<Row>> {
        let columns = self.native_columns(table)?;
        let table = catalog_name(self.engine(), table);
        let keys = self.column_keys(&table);
        let rows = match self.engine() {
            Engine::Sqlite => columns
                .iter()
                .map(|column| {
                    let field = text(column, "name");
                    let column_type = text(column, "type");
                    let primary = column.get("pk").and_then(Value::as_i64).unwrap_or(0) > 0;
                    let not_null = column.get("notnull").and_then(Value::as_i64).unwrap_or(0) != 0;
                    let extra = if primary && column_type.eq_ignore_ascii_case("INTEGER") {
                        "auto_increment"
                    } else {
                        ""
                    };
                    let key = keys.get(&field).map(String::as_str).unwrap_or("");
                    let default = column.get("dflt_value").cloned().unwrap_or(Value::Null);
                    descriptor(field, column_type, !not_null && !primary, key, default, extra)
                })
                .collect(),
            Engine::Postgres => columns
                .iter()
                .map(|column| {
                    let field = text(column, "column_name");
                    let data_type = text(column, "data_type");
                    let length = column.get("character_maximum_length").and_then(Value::as_i64);
                    let precision = column.get("numeric_precision").and_then(Value::as_i64);
                    let scale = column.get("numeric_scale").and_then(Value::as_i64);
                    let column_type = match (length, precision, scale) {
                        (Some(length), _, _) => format!("{data_type}({length})"),
                        (None, Some(precision), Some(scale)) if data_type == "numeric" => {
                            format!("{data_type}({precision},{scale})")
                        }
                        _ => data_type,
                    };
                    let default = column.get("column_default").cloned().unwrap_or(Value::Null);
                    let extra = if text(column, "column_default").starts_with("nextval(") {
                        "auto_increment"
                    } else {
                        ""
                    };
                    let key = keys.get(&field).map(String::as_str).unwrap_or("");
                    let nullable = text(column, "is_nullable") == "YES";
                    descriptor(field, column_type, nullable, key, default, extra)
                })
                .collect(),
        };
        Some(rows)
    }

    /// 与 `metadata` 相同，对应 DESCRIBE 的叫法。
    pub fn describe(&mut self, table: &str) -> Option<Vec<Row>> {
        self.metadata(table)
    }

    /// 列名 -> PRI/UNI/MUL；探查失败时返回空映射，不影响 describe 结果。
    fn column_keys(&mut self, table: &str) -> HashMap<String, String> {
        let mut keys: HashMap<String, String> = HashMap::new();
        match self.engine() {
            Engine::Sqlite => {
                if let Ok(columns) = self.client_mut().query(&format!("PRAGMA table_info(\"{table}\")")) {
                    for column in &columns {
                        if column.get("pk").and_then(Value::as_i64).unwrap_or(0) > 0 {
                            keys.insert(text(column, "name"), "PRI".to_string());
                        }
                    }
                }
                let indexes = self
                    .client_mut()
                    .query(&format!("PRAGMA index_list(\"{table}\")"))
                    .unwrap_or_default();
                for index in indexes {
                    let name = text(&index, "name");
                    let unique = index.get("unique").and_then(Value::as_i64).unwrap_or(0) != 0;
                    let Ok(index_columns) =
                        self.client_mut().query(&format!("PRAGMA index_info(\"{name}\")"))
                    else {
                        continue;
                    };
                    let Some(first) = index_columns.first() else {
                        continue;
                    };
                    // 表达式索引的列名为空。
                    let column = text(first, "name");
                    if column.is_empty() {
                        continue;
                    }
                    let key = if unique && index_columns.len() == 1 { "UNI" } else { "MUL" };
                    keys.entry(column).or_insert_with(|| key.to_string());
                }
            }
            Engine::Postgres => {
                let sql = format!(
                    "SELECT kcu.column_name::text AS column_name, tc.constraint_type::text AS constraint_type \
                     FROM information_schema.table_constraints tc \
                     JOIN information_schema.key_column_usage kcu \
                       ON tc.constraint_name = kcu.constraint_name AND tc.table_schema = kcu.table_schema \
                     WHERE tc.table_schema = current_schema() AND tc.table_name = '{table}'"
                );
                let constraints = self.client_mut().query(&sql).unwrap_or_default();
                for constraint in &constraints {
                    let key = match text(constraint, "constraint_type").as_str() {
                        "PRIMARY KEY" => "PRI",
                        "UNIQUE" => "UNI",
                        _ => continue,
                    };
                    let column = text(constraint, "column_name");
                    if keys.get(&column).map(String::as_str) != Some("PRI") {
                        keys.insert(column, key.to_string());
                    }
                }
            }
        }
        keys
    }

    /// 按 Field 线性查找列描述，返回第一条匹配。
    pub fn describe_column<'a>(
        &mut self,
        field: &str,
        source: impl Into<ColumnSource<'a>>,
    ) -> Option<Row> {
        let find = |rows: &[Row]| {
            rows.iter()
                .find(|row| row.get("Field").and_then(Value::as_str) == Some(field))
                .cloned()
        };
        match source.into() {
            ColumnSource::Metadata(rows) => find(rows),
            ColumnSource::Table(table) => self.describe(table).and_then(|rows| find(rows.as_slice())),
        }
    }

    pub fn column_exists<'a>(&mut self, field: &str, source: impl Into<ColumnSource<'a>>) -> bool {
        self.describe_column(field, source).is_some()
    }

    pub fn column_is_null<'a>(
        &mut self,
        field: &str,
        source: impl Into<ColumnSource<'a>>,
    ) -> Result<bool, DbError> {
        let column = self.require_column(field, source)?;
        Ok(text(&column, "Null").eq_ignore_ascii_case("YES"))
    }

    pub fn column_type<'a>(
        &mut self,
        field: &str,
        source: impl Into<ColumnSource<'a>>,
    ) -> Result<String, DbError> {
        let column = self.require_column(field, source)?;
        Ok(parse_column_type(&text(&column, "Type")).0)
    }

    pub fn column_length<'a>(
        &mut self,
        field: &str,
        source: impl Into<ColumnSource<'a>>,
    ) -> Result<u64, DbError> {
        let column = self.require_column(field, source)?;
        Ok(parse_column_type(&text(&column, "Type")).1)
    }

    fn require_column<'a>(
        &mut self,
        field: &str,
        source: impl Into<ColumnSource<'a>>,
    ) -> Result<Row, DbError> {
        self.describe_column(field, source)
            .ok_or_else(|| DbError::ColumnNotFound {
                column: field.to_string(),
            })
    }
}
