// Postgres 客户端：deadpool 连接池 + tokio-postgres，在同步调用中阻塞等待异步结果。
use crate::storage::{
    rewrite_named, ClientError, DbClient, Engine, ErrorInfo, ErrorMode, Params, Row, SqlValue,
    Statement, StatementHandle,
};
use anyhow::{anyhow, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;

/// 连接工厂：持有连接池与后备运行时，每个调用方从这里取一条独立连接。
pub struct PostgresConnector {
    pool: Pool,
    runtime: Arc<tokio::runtime::Runtime>,
}

impl PostgresConnector {
    pub fn new(dsn: &str, connect_timeout_s: u64, pool_size: usize) -> Result<Self> {
        let cleaned = dsn.trim();
        if cleaned.is_empty() {
            return Err(anyhow!("postgres dsn is empty"));
        }
        let timeout = Duration::from_secs(connect_timeout_s.max(1));
        let mut config = cleaned.parse::<tokio_postgres::Config>()?;
        config.connect_timeout(timeout);
        let manager_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };
        let manager = Manager::from_config(config, NoTls, manager_config);
        let pool = Pool::builder(manager)
            .max_size(if pool_size == 0 { 16 } else { pool_size })
            .build()?;
        let runtime = tokio::runtime::Runtime::new()
            .map_err(|err| anyhow!("create tokio runtime for postgres: {err}"))?;
        Ok(Self {
            pool,
            runtime: Arc::new(runtime),
        })
    }

    pub fn client(&self) -> Result<PostgresClient, ClientError> {
        let client = block_on(&self.runtime, self.pool.get()).map_err(|err| {
            ClientError::Connection(ErrorInfo::new("08001", None, err.to_string()))
        })?;
        Ok(PostgresClient {
            client,
            runtime: self.runtime.clone(),
            error_mode: ErrorMode::default(),
            last_error: ErrorInfo::default(),
        })
    }
}

pub struct PostgresClient {
    client: deadpool_postgres::Client,
    runtime: Arc<tokio::runtime::Runtime>,
    error_mode: ErrorMode,
    last_error: ErrorInfo,
}

fn block_on<F, T>(runtime: &tokio::runtime::Runtime, fut: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => tokio::task::block_in_place(|| handle.block_on(fut)),
        Err(_) => runtime.block_on(fut),
    }
}

impl DbClient for PostgresClient {
    fn engine(&self) -> Engine {
        Engine::Postgres
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
        let rewritten = rewrite_named(sql, Engine::Postgres.placeholder_style());
        let prepared = block_on(&self.runtime, self.client.prepare_cached(&rewritten.text))
            .map_err(|err| ClientError::Prepare(error_info(&err)))?;
        Ok(Statement::new(
            sql,
            rewritten,
            StatementHandle::Postgres(prepared),
        ))
    }

    fn execute_statement(
        &mut self,
        statement: &mut Statement,
        params: &Params,
    ) -> Result<(), ClientError> {
        let StatementHandle::Postgres(prepared) = statement.handle() else {
            return Err(ClientError::Execute(ErrorInfo::new(
                "HY000",
                None,
                "statement was not prepared by a postgres client",
            )));
        };
        let prepared = prepared.clone();
        let values = params.ordered(&statement.rewritten().names)?;
        let bound = values
            .iter()
            .zip(prepared.params())
            .map(|(value, ty)| to_pg_param(value, ty))
            .collect::<Result<Vec<_>, _>>()?;
        let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|value| value.as_ref()).collect();

        let columns: Vec<String> = prepared
            .columns()
            .iter()
            .map(|column| column.name().to_string())
            .collect();
        if columns.is_empty() {
            let affected = block_on(&self.runtime, self.client.execute(&prepared, &refs))
                .map_err(|err| ClientError::Execute(error_info(&err)))?;
            statement.load(columns, Vec::new(), affected);
            return Ok(());
        }
        let rows = block_on(&self.runtime, self.client.query(&prepared, &refs))
            .map_err(|err| ClientError::Execute(error_info(&err)))?;
        let decoded = rows
            .iter()
            .map(decode_row)
            .collect::<Result<Vec<_>, _>>()?;
        let count = decoded.len() as u64;
        statement.load(columns, decoded, count);
        Ok(())
    }

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, ClientError> {
        let rows = block_on(&self.runtime, self.client.query(sql, &[]))
            .map_err(|err| ClientError::Execute(error_info(&err)))?;
        rows.iter().map(decode_row).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PgKind {
    Bool,
    Int2,
    Int4,
    Int8,
    Float4,
    Float8,
    Text,
    Json,
    Timestamp,
    TimestampTz,
    Date,
    Other,
}

fn kind_of(ty: &Type) -> PgKind {
    if *ty == Type::BOOL {
        PgKind::Bool
    } else if *ty == Type::INT2 {
        PgKind::Int2
    } else if *ty == Type::INT4 {
        PgKind::Int4
    } else if *ty == Type::INT8 {
        PgKind::Int8
    } else if *ty == Type::FLOAT4 {
        PgKind::Float4
    } else if *ty == Type::FLOAT8 {
        PgKind::Float8
    } else if *ty == Type::TEXT
        || *ty == Type::VARCHAR
        || *ty == Type::BPCHAR
        || *ty == Type::NAME
        || *ty == Type::UNKNOWN
    {
        PgKind::Text
    } else if *ty == Type::JSON || *ty == Type::JSONB {
        PgKind::Json
    } else if *ty == Type::TIMESTAMP {
        PgKind::Timestamp
    } else if *ty == Type::TIMESTAMPTZ {
        PgKind::TimestampTz
    } else if *ty == Type::DATE {
        PgKind::Date
    } else {
        PgKind::Other
    }
}

fn bind_error(value: &SqlValue, ty: &Type) -> ClientError {
    ClientError::Bind(ErrorInfo::new(
        "HY093",
        None,
        format!("cannot bind {value:?} to parameter of type {ty}"),
    ))
}

/// 按服务端推断的参数类型转换绑定值，tokio-postgres 对类型匹配是严格的。
fn to_pg_param(value: &SqlValue, ty: &Type) -> Result<Box<dyn ToSql + Sync>, ClientError> {
    let kind = kind_of(ty);
    let boxed: Box<dyn ToSql + Sync> = match (value, kind) {
        (SqlValue::Null, PgKind::Bool) => Box::new(None::<bool>),
        (SqlValue::Null, PgKind::Int2) => Box::new(None::<i16>),
        (SqlValue::Null, PgKind::Int4) => Box::new(None::<i32>),
        (SqlValue::Null, PgKind::Int8) => Box::new(None::<i64>),
        (SqlValue::Null, PgKind::Float4) => Box::new(None::<f32>),
        (SqlValue::Null, PgKind::Float8) => Box::new(None::<f64>),
        (SqlValue::Null, PgKind::Json) => Box::new(None::<Value>),
        (SqlValue::Null, PgKind::Timestamp) => Box::new(None::<NaiveDateTime>),
        (SqlValue::Null, PgKind::TimestampTz) => Box::new(None::<DateTime<Utc>>),
        (SqlValue::Null, PgKind::Date) => Box::new(None::<NaiveDate>),
        (SqlValue::Null, _) => Box::new(None::<String>),

        (SqlValue::Integer(number), PgKind::Int2) => {
            Box::new(i16::try_from(*number).map_err(|_| bind_error(value, ty))?)
        }
        (SqlValue::Integer(number), PgKind::Int4) => {
            Box::new(i32::try_from(*number).map_err(|_| bind_error(value, ty))?)
        }
        (SqlValue::Integer(number), PgKind::Int8) => Box::new(*number),
        (SqlValue::Integer(number), PgKind::Float4) => Box::new(*number as f32),
        (SqlValue::Integer(number), PgKind::Float8) => Box::new(*number as f64),
        (SqlValue::Integer(number), PgKind::Bool) => Box::new(*number != 0),
        (SqlValue::Integer(number), PgKind::Text) => Box::new(number.to_string()),
        (SqlValue::Integer(number), PgKind::Json) => Box::new(Value::from(*number)),

        (SqlValue::Real(number), PgKind::Float4) => Box::new(*number as f32),
        (SqlValue::Real(number), PgKind::Float8) => Box::new(*number),
        (SqlValue::Real(number), PgKind::Text) => Box::new(number.to_string()),
        (SqlValue::Real(number), PgKind::Json) => Box::new(Value::from(*number)),

        (SqlValue::Bool(flag), PgKind::Bool) => Box::new(*flag),
        (SqlValue::Bool(flag), PgKind::Int2) => Box::new(i16::from(*flag)),
        (SqlValue::Bool(flag), PgKind::Int4) => Box::new(i32::from(*flag)),
        (SqlValue::Bool(flag), PgKind::Int8) => Box::new(i64::from(*flag)),
        (SqlValue::Bool(flag), PgKind::Text) => Box::new(flag.to_string()),
        (SqlValue::Bool(flag), PgKind::Json) => Box::new(Value::Bool(*flag)),

        (SqlValue::Text(text), PgKind::Text) => Box::new(text.clone()),
        (SqlValue::Text(text), PgKind::Json) => Box::new(
            serde_json::from_str::<Value>(text).unwrap_or_else(|_| Value::String(text.clone())),
        ),
        (SqlValue::Text(text), PgKind::Int2) => {
            Box::new(text.trim().parse::<i16>().map_err(|_| bind_error(value, ty))?)
        }
        (SqlValue::Text(text), PgKind::Int4) => {
            Box::new(text.trim().parse::<i32>().map_err(|_| bind_error(value, ty))?)
        }
        (SqlValue::Text(text), PgKind::Int8) => {
            Box::new(text.trim().parse::<i64>().map_err(|_| bind_error(value, ty))?)
        }
        (SqlValue::Text(text), PgKind::Float8) => {
            Box::new(text.trim().parse::<f64>().map_err(|_| bind_error(value, ty))?)
        }
        (SqlValue::Text(text), PgKind::Bool) => match text.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "t" | "yes" => Box::new(true),
            "0" | "false" | "f" | "no" => Box::new(false),
            _ => return Err(bind_error(value, ty)),
        },
        (SqlValue::Text(text), PgKind::Timestamp) => Box::new(
            NaiveDateTime::parse_from_str(text.trim(), "%Y-%m-%d %H:%M:%S%.f")
                .map_err(|_| bind_error(value, ty))?,
        ),
        (SqlValue::Text(text), PgKind::TimestampTz) => Box::new(
            DateTime::parse_from_rfc3339(text.trim())
                .map(|value| value.with_timezone(&Utc))
                .map_err(|_| bind_error(value, ty))?,
        ),
        (SqlValue::Text(text), PgKind::Date) => Box::new(
            NaiveDate::parse_from_str(text.trim(), "%Y-%m-%d").map_err(|_| bind_error(value, ty))?,
        ),
        _ => return Err(bind_error(value, ty)),
    };
    Ok(boxed)
}

fn decode_row(row: &tokio_postgres::Row) -> Result<Row, ClientError> {
    let mut record = Row::new();
    for (index, column) in row.columns().iter().enumerate() {
        let value = decode_value(row, index, column.type_()).map_err(|err| {
            ClientError::Decode(ErrorInfo::new(
                "22000",
                None,
                format!("column {}: {err}", column.name()),
            ))
        })?;
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

fn decode_value(
    row: &tokio_postgres::Row,
    index: usize,
    ty: &Type,
) -> Result<Value, tokio_postgres::Error> {
    let value = match kind_of(ty) {
        PgKind::Bool => row.try_get::<_, Option<bool>>(index)?.map(Value::Bool),
        PgKind::Int2 => row.try_get::<_, Option<i16>>(index)?.map(Value::from),
        PgKind::Int4 => row.try_get::<_, Option<i32>>(index)?.map(Value::from),
        PgKind::Int8 => row.try_get::<_, Option<i64>>(index)?.map(Value::from),
        PgKind::Float4 => row
            .try_get::<_, Option<f32>>(index)?
            .map(|number| Value::from(f64::from(number))),
        PgKind::Float8 => row.try_get::<_, Option<f64>>(index)?.map(Value::from),
        PgKind::Text => row.try_get::<_, Option<String>>(index)?.map(Value::String),
        PgKind::Json => row.try_get::<_, Option<Value>>(index)?,
        PgKind::Timestamp => row
            .try_get::<_, Option<NaiveDateTime>>(index)?
            .map(|value| Value::String(value.format("%Y-%m-%d %H:%M:%S%.f").to_string())),
        PgKind::TimestampTz => row
            .try_get::<_, Option<DateTime<Utc>>>(index)?
            .map(|value| Value::String(value.to_rfc3339())),
        PgKind::Date => row
            .try_get::<_, Option<NaiveDate>>(index)?
            .map(|value| Value::String(value.format("%Y-%m-%d").to_string())),
        // 其余类型（numeric、uuid 等）没有对应的 Rust 解码器时按空值返回。
        PgKind::Other => row.try_get::<_, Option<String>>(index).ok().flatten().map(Value::String),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn error_info(err: &tokio_postgres::Error) -> ErrorInfo {
    match err.as_db_error() {
        Some(db_error) => ErrorInfo::new(db_error.code().code(), None, db_error.message()),
        None => ErrorInfo::new("HY000", None, err.to_string()),
    }
}
