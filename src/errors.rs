// 错误类型：区分致命 SQL 错误、列缺失、校验失败等可由调用方处理的结果。
use crate::shadow::ShadowField;
use crate::storage::ErrorInfo;
use thiserror::Error;

/// 关闭开发模式时对外暴露的通用消息，细节只进日志。
pub const GENERIC_DB_ERROR: &str = "internal database error";

#[derive(Debug, Error)]
pub enum DbError {
    /// SQL 预处理/绑定/执行失败；视为编程错误，默认交给调用方决定是否退出。
    #[error("{message}")]
    FatalSql {
        message: String,
        info: ErrorInfo,
        sql: String,
    },
    #[error("column not found: {column}")]
    ColumnNotFound { column: String },
    #[error("invalid shadow payload: {0}")]
    Validation(#[from] ValidationError),
    #[error("invalid identifier: {0}")]
    InvalidIdentifier(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unexpected result: {0}")]
    UnexpectedResult(String),
}

impl DbError {
    pub fn is_fatal_sql(&self) -> bool {
        matches!(self, DbError::FatalSql { .. })
    }

    /// 致命 SQL 错误的驱动三元组，其它错误返回 None。
    pub fn sql_error_info(&self) -> Option<&ErrorInfo> {
        match self {
            DbError::FatalSql { info, .. } => Some(info),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("payload must be a JSON object")]
    NotAnObject,
    #[error("{field} must be a string")]
    NotAString { field: ShadowField },
    #[error("{field} must not be empty")]
    Empty { field: ShadowField },
    #[error("{field} exceeds {max} characters (got {actual})")]
    TooLong {
        field: ShadowField,
        max: usize,
        actual: usize,
    },
}
