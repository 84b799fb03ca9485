// SQLite 客户端：基于 rusqlite，语句缓存承担 prepare 句柄，结果按行缓冲到 Statement。
use crate::storage::{
    rewrite_named, ClientError, DbClient, Engine, ErrorInfo, ErrorMode, Params, Row, SqlValue,
    Statement, StatementHandle,
};
use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ErrorCode, ToSql};
use serde_json::Value;
use std::path::Path;

pub struct SqliteClient {
    conn: Connection,
    error_mode: ErrorMode,
    last_error: ErrorInfo,
}

impl SqliteClient {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|err| {
                    ClientError::Connection(ErrorInfo::new("08001", None, err.to_string()))
                })?;
            }
        }
        let conn = Connection::open(path)
            .map_err(|err| ClientError::Connection(error_info(&err)))?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        Ok(Self::from_connection(conn))
    }

    pub fn open_in_memory() -> Result<Self, ClientError> {
        let conn = Connection::open_in_memory()
            .map_err(|err| ClientError::Connection(error_info(&err)))?;
        Ok(Self::from_connection(conn))
    }

    pub fn from_connection(conn: Connection) -> Self {
        Self {
            conn,
            error_mode: ErrorMode::default(),
            last_error: ErrorInfo::default(),
        }
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl DbClient for SqliteClient {
    fn engine(&self) -> Engine {
        Engine::Sqlite
    }

    fn error_mode(&self) -> ErrorMode {
        self.error_mode
    }

    fn set_error_mode(&mut self, mode: ErrorMode) {
        self.error_mode = mode;
    }

    fn last_error(&self) -> &ErrorInfo {
        &self.last_error
    }

    fn record_error(&mut self, info: ErrorInfo) {
        self.last_error = info;
    }

    fn prepare_statement(&mut self, sql: &str) -> Result<Statement, ClientError> {
        let rewritten = rewrite_named(sql, Engine::Sqlite.placeholder_style());
        // 预处理结果留在连接的语句缓存里，执行时按同一文本取回。
        self.conn
            .prepare_cached(&rewritten.text)
            .map_err(|err| ClientError::Prepare(error_info(&err)))?;
        Ok(Statement::new(sql, rewritten, StatementHandle::Sqlite))
    }

    fn execute_statement(
        &mut self,
        statement: &mut Statement,
        params: &Params,
    ) -> Result<(), ClientError> {
        let values = params.ordered(&statement.rewritten().names)?;
        let mut stmt = self
            .conn
            .prepare_cached(&statement.rewritten().text)
            .map_err(|err| ClientError::Prepare(error_info(&err)))?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        if columns.is_empty() {
            let affected = stmt
                .execute(params_from_iter(values))
                .map_err(|err| ClientError::Execute(error_info(&err)))?;
            statement.load(columns, Vec::new(), affected as u64);
            return Ok(());
        }
        let rows = collect_rows(&mut stmt, &columns, params_from_iter(values))?;
        let count = rows.len() as u64;
        statement.load(columns, rows, count);
        Ok(())
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, ClientError> {
        let mut stmt = self
            .conn
            .prepare(sql)
            .map_err(|err| ClientError::Prepare(error_info(&err)))?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(str::to_string)
            .collect();
        collect_rows(&mut stmt, &columns, [])
    }
}

fn collect_rows<P: rusqlite::Params>(
    stmt: &mut rusqlite::Statement<'_>,
    columns: &[String],
    params: P,
) -> Result<Vec<Row>, ClientError> {
    let mut rows = stmt
        .query(params)
        .map_err(|err| ClientError::Execute(error_info(&err)))?;
    let mut output = Vec::new();
    while let Some(row) = rows
        .next()
        .map_err(|err| ClientError::Execute(error_info(&err)))?
    {
        let mut record = Row::new();
        for (index, name) in columns.iter().enumerate() {
            let value = row
                .get_ref(index)
                .map_err(|err| ClientError::Decode(error_info(&err)))?;
            record.insert(name.clone(), json_from_ref(value));
        }
        output.push(record);
    }
    Ok(output)
}

fn json_from_ref(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(number) => Value::from(number),
        ValueRef::Real(number) => serde_json::Number::from_f64(number)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(bytes) | ValueRef::Blob(bytes) => {
            Value::String(String::from_utf8_lossy(bytes).into_owned())
        }
    }
}

fn error_info(err: &rusqlite::Error) -> ErrorInfo {
    match err {
        rusqlite::Error::SqliteFailure(failure, message) => ErrorInfo::new(
            sql_state_for(failure.code),
            Some(i64::from(failure.extended_code)),
            message.clone().unwrap_or_else(|| err.to_string()),
        ),
        rusqlite::Error::InvalidParameterCount(..) | rusqlite::Error::InvalidParameterName(_) => {
            ErrorInfo::new("HY093", None, err.to_string())
        }
        _ => ErrorInfo::new("HY000", None, err.to_string()),
    }
}

fn sql_state_for(code: ErrorCode) -> &'static str {
    match code {
        ErrorCode::ConstraintViolation => "23000",
        ErrorCode::TypeMismatch => "22000",
        ErrorCode::TooBig => "22001",
        ErrorCode::CannotOpen | ErrorCode::NotADatabase => "08001",
        ErrorCode::PermissionDenied | ErrorCode::ReadOnly => "42000",
        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => "40001",
        _ => "HY000",
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Owned(SqliteValue::Null),
            SqlValue::Integer(number) => ToSqlOutput::Owned(SqliteValue::Integer(*number)),
            SqlValue::Real(number) => ToSqlOutput::Owned(SqliteValue::Real(*number)),
            SqlValue::Text(text) => ToSqlOutput::Borrowed(ValueRef::Text(text.as_bytes())),
            SqlValue::Bool(flag) => ToSqlOutput::Owned(SqliteValue::Integer(i64::from(*flag))),
        })
    }
}
