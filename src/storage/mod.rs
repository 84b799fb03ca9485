// 存储模块：封装 SQLite/Postgres 客户端，统一 prepare/bind/execute/fetch 接口与错误模式。

mod placeholders;
mod postgres;
mod sqlite;

use crate::config::DatabaseConfig;
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use thiserror::Error;

pub use placeholders::{rewrite_named, PlaceholderStyle, RewrittenSql};
pub use postgres::{PostgresClient, PostgresConnector};
pub use sqlite::SqliteClient;

/// 一行结果：按列顺序保存列名到值的映射。
pub type Row = Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Engine {
    /// 文件型轻量引擎。
    Sqlite,
    /// 完整服务端引擎。
    Postgres,
}

impl Engine {
    pub fn name(self) -> &'static str {
        match self {
            Engine::Sqlite => "sqlite",
            Engine::Postgres => "postgres",
        }
    }

    pub fn is_lightweight(self) -> bool {
        matches!(self, Engine::Sqlite)
    }

    /// 服务端当前时间表达式，两种引擎唯一需要分支的写入差异。
    pub fn now_expression(self) -> &'static str {
        match self {
            Engine::Sqlite => "strftime('%Y-%m-%d %H:%M:%f', 'now')",
            Engine::Postgres => "NOW()",
        }
    }

    pub fn version_query(self) -> &'static str {
        match self {
            Engine::Sqlite => "SELECT sqlite_version() AS version",
            Engine::Postgres => "SELECT current_setting('server_version') AS version",
        }
    }

    pub(crate) fn placeholder_style(self) -> PlaceholderStyle {
        match self {
            Engine::Sqlite => PlaceholderStyle::QuestionNumbered,
            Engine::Postgres => PlaceholderStyle::DollarNumbered,
        }
    }
}

/// 客户端错误上报模式：Silent 把错误记在语句/连接上，Raise 直接返回 Err。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ErrorMode {
    #[default]
    Silent,
    Raise,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Bool(bool),
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<i32> for SqlValue {
    fn from(value: i32) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Bool(value)
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map(Into::into).unwrap_or(SqlValue::Null)
    }
}

/// 命名参数集合，键不带前导冒号。
#[derive(Debug, Clone, Default)]
pub struct Params {
    entries: Vec<(String, SqlValue)>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(mut self, name: &str, value: impl Into<SqlValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<SqlValue>) {
        let name = name.trim_start_matches(':').to_string();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&SqlValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 按占位符出现顺序取值，缺失的名字视为绑定错误。
    pub(crate) fn ordered(&self, names: &[String]) -> Result<Vec<&SqlValue>, ClientError> {
        names
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| {
                    ClientError::Bind(ErrorInfo::new(
                        "HY093",
                        None,
                        format!("missing value for parameter :{name}"),
                    ))
                })
            })
            .collect()
    }
}

/// 驱动错误三元组：SQLSTATE、驱动错误码、消息。
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorInfo {
    pub sql_state: String,
    pub driver_code: Option<i64>,
    pub message: String,
}

impl Default for ErrorInfo {
    fn default() -> Self {
        Self {
            sql_state: "00000".to_string(),
            driver_code: None,
            message: String::new(),
        }
    }
}

impl ErrorInfo {
    pub fn new(sql_state: &str, driver_code: Option<i64>, message: impl Into<String>) -> Self {
        Self {
            sql_state: sql_state.to_string(),
            driver_code,
            message: message.into(),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.sql_state == "00000" && self.message.is_empty()
    }

    /// 以空格拼接三元组中的非空部分。
    pub fn summary(&self) -> String {
        let mut parts: Vec<String> = Vec::with_capacity(3);
        if !self.sql_state.is_empty() {
            parts.push(self.sql_state.clone());
        }
        if let Some(code) = self.driver_code {
            parts.push(code.to_string());
        }
        if !self.message.is_empty() {
            parts.push(self.message.clone());
        }
        parts.join(" ")
    }
}

#[derive(Debug, Clone, Error)]
pub enum ClientError {
    #[error("prepare failed: {}", .0.summary())]
    Prepare(ErrorInfo),
    #[error("bind failed: {}", .0.summary())]
    Bind(ErrorInfo),
    #[error("execute failed: {}", .0.summary())]
    Execute(ErrorInfo),
    #[error("decode failed: {}", .0.summary())]
    Decode(ErrorInfo),
    #[error("connection failed: {}", .0.summary())]
    Connection(ErrorInfo),
}

impl ClientError {
    pub fn info(&self) -> &ErrorInfo {
        match self {
            ClientError::Prepare(info)
            | ClientError::Bind(info)
            | ClientError::Execute(info)
            | ClientError::Decode(info)
            | ClientError::Connection(info) => info,
        }
    }
}

pub(crate) enum StatementHandle {
    Sqlite,
    Postgres(tokio_postgres::Statement),
}

/// 预处理后的语句；执行结果缓存在语句内部（游标），取完后需释放。
pub struct Statement {
    sql: String,
    rewritten: RewrittenSql,
    handle: StatementHandle,
    columns: Vec<String>,
    rows: VecDeque<Row>,
    rows_affected: u64,
    error: ErrorInfo,
}

impl Statement {
    pub(crate) fn new(sql: &str, rewritten: RewrittenSql, handle: StatementHandle) -> Self {
        Self {
            sql: sql.to_string(),
            rewritten,
            handle,
            columns: Vec::new(),
            rows: VecDeque::new(),
            rows_affected: 0,
            error: ErrorInfo::default(),
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    /// 无结果列的语句为影响行数；返回行的语句为返回的行数。
    pub fn rows_affected(&self) -> u64 {
        self.rows_affected
    }

    pub fn error_code(&self) -> &str {
        &self.error.sql_state
    }

    pub fn error_info(&self) -> &ErrorInfo {
        &self.error
    }

    pub fn fetch_one(&mut self) -> Option<Row> {
        self.rows.pop_front()
    }

    pub fn fetch_all(&mut self) -> Vec<Row> {
        self.rows.drain(..).collect()
    }

    pub fn close_cursor(&mut self) {
        self.rows.clear();
        self.rows.shrink_to_fit();
    }

    pub(crate) fn rewritten(&self) -> &RewrittenSql {
        &self.rewritten
    }

    pub(crate) fn handle(&self) -> &StatementHandle {
        &self.handle
    }

    pub(crate) fn reset(&mut self) {
        self.close_cursor();
        self.rows_affected = 0;
        self.error = ErrorInfo::default();
    }

    pub(crate) fn load(&mut self, columns: Vec<String>, rows: Vec<Row>, rows_affected: u64) {
        self.columns = columns;
        self.rows = rows.into();
        self.rows_affected = rows_affected;
    }
}

/// 关系型客户端契约。驱动只实现 `*_statement` 原语，错误模式由默认方法统一处理。
pub trait DbClient: Send {
    fn engine(&self) -> Engine;
    fn error_mode(&self) -> ErrorMode;
    fn set_error_mode(&mut self, mode: ErrorMode);
    fn last_error(&self) -> &ErrorInfo;
    fn record_error(&mut self, info: ErrorInfo);

    fn prepare_statement(&mut self, sql: &str) -> Result<Statement, ClientError>;
    fn execute_statement(
        &mut self,
        statement: &mut Statement,
        params: &Params,
    ) -> Result<(), ClientError>;

    /// 一次性查询（结构探查等），不受错误模式影响。
    fn query(&mut self, sql: &str) -> Result<Vec<Row>, ClientError>;

    fn prepare(&mut self, sql: &str) -> Result<Option<Statement>, ClientError> {
        match self.prepare_statement(sql) {
            Ok(statement) => {
                self.record_error(ErrorInfo::default());
                Ok(Some(statement))
            }
            Err(err) => {
                self.record_error(err.info().clone());
                match self.error_mode() {
                    ErrorMode::Raise => Err(err),
                    ErrorMode::Silent => Ok(None),
                }
            }
        }
    }

    fn execute(&mut self, statement: &mut Statement, params: &Params) -> Result<bool, ClientError> {
        statement.reset();
        match self.execute_statement(statement, params) {
            Ok(()) => {
                self.record_error(ErrorInfo::default());
                Ok(true)
            }
            Err(err) => {
                statement.error = err.info().clone();
                self.record_error(err.info().clone());
                match self.error_mode() {
                    ErrorMode::Raise => Err(err),
                    ErrorMode::Silent => Ok(false),
                }
            }
        }
    }
}

/// 根据 backend 配置建立客户端连接。
pub fn connect(config: &DatabaseConfig) -> Result<Box<dyn DbClient>> {
    let backend = config.backend.trim().to_lowercase();
    match backend.as_str() {
        "" | "sqlite" | "default" | "file" => {
            let path = if config.db_path.trim().is_empty() {
                "./data/shadow-store.db"
            } else {
                config.db_path.trim()
            };
            Ok(Box::new(SqliteClient::open(path)?))
        }
        "postgres" | "postgresql" | "pg" => {
            let connector = PostgresConnector::new(
                &config.postgres.dsn,
                config.postgres.connect_timeout_s,
                config.postgres.pool_size,
            )?;
            Ok(Box::new(connector.client()?))
        }
        other => Err(anyhow!("unknown database backend: {other}")),
    }
}
