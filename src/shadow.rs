// 影子列存储：把任意 JSON 对象整体存入 json_body，同时抽取 uk1/sk1/tk1/co1/co2 五个可索引的影子列。
use crate::errors::{DbError, ValidationError};
use crate::query::QueryHelper;
use crate::schema::validate_identifier;
use crate::storage::{Engine, Params, Row};
use serde::Serialize;
use serde_json::{Map, Value};
use std::fmt;
use tracing::debug;

/// 五个影子列及其长度上限。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowField {
    Uk1,
    Sk1,
    Tk1,
    Co1,
    Co2,
}

impl ShadowField {
    pub const ALL: [ShadowField; 5] = [
        ShadowField::Uk1,
        ShadowField::Sk1,
        ShadowField::Tk1,
        ShadowField::Co1,
        ShadowField::Co2,
    ];

    pub fn column(self) -> &'static str {
        match self {
            ShadowField::Uk1 => "uk1",
            ShadowField::Sk1 => "sk1",
            ShadowField::Tk1 => "tk1",
            ShadowField::Co1 => "co1",
            ShadowField::Co2 => "co2",
        }
    }

    /// 字符数上限；tk1 没有上限但不能为空。
    pub fn max_chars(self) -> Option<usize> {
        match self {
            ShadowField::Uk1 | ShadowField::Co1 | ShadowField::Co2 => Some(150),
            ShadowField::Sk1 => Some(75),
            ShadowField::Tk1 => None,
        }
    }
}

impl fmt::Display for ShadowField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column())
    }
}

/// 校验载荷：必须是对象；出现的影子字段必须是字符串且满足长度约束。返回第一处违规。
///
/// 值为 null 的字段与缺失同等对待。
pub fn validate(data: &Value) -> Result<(), ValidationError> {
    let object = data.as_object().ok_or(ValidationError::NotAnObject)?;
    for field in ShadowField::ALL {
        let value = match object.get(field.column()) {
            None | Some(Value::Null) => continue,
            Some(Value::String(value)) => value,
            Some(_) => return Err(ValidationError::NotAString { field }),
        };
        let actual = value.chars().count();
        match field.max_chars() {
            Some(max) if actual > max => {
                return Err(ValidationError::TooLong { field, max, actual });
            }
            None if actual == 0 => return Err(ValidationError::Empty { field }),
            _ => {}
        }
    }
    Ok(())
}

/// 影子表中的一行，json_body 已反序列化为对象。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShadowRecord {
    pub id: i64,
    pub foreign_key: i64,
    pub uk1: Option<String>,
    pub sk1: Option<String>,
    pub tk1: Option<String>,
    pub co1: Option<String>,
    pub co2: Option<String>,
    pub body: Map<String, Value>,
    pub created_at: String,
    pub updated_at: String,
}

impl ShadowRecord {
    fn from_row(row: Row) -> Result<Self, DbError> {
        let integer = |key: &str| -> Result<i64, DbError> {
            row.get(key)
                .and_then(|value| match value {
                    Value::Number(number) => number.as_i64(),
                    Value::String(text) => text.trim().parse::<i64>().ok(),
                    _ => None,
                })
                .ok_or_else(|| DbError::UnexpectedResult(format!("column {key} is not an integer")))
        };
        let optional = |key: &str| -> Option<String> {
            match row.get(key) {
                Some(Value::String(text)) => Some(text.clone()),
                Some(Value::Null) | None => None,
                Some(other) => Some(other.to_string()),
            }
        };
        // SQLite 里是文本，Postgres 的 JSONB 直接解码成对象。
        let body = match row.get("json_body") {
            Some(Value::String(text)) => serde_json::from_str::<Value>(text)?,
            Some(value) => value.clone(),
            None => Value::Null,
        };
        let Value::Object(body) = body else {
            return Err(DbError::UnexpectedResult(
                "json_body is not a JSON object".to_string(),
            ));
        };
        Ok(Self {
            id: integer("id")?,
            foreign_key: integer("foreign_key")?,
            uk1: optional("uk1"),
            sk1: optional("sk1"),
            tk1: optional("tk1"),
            co1: optional("co1"),
            co2: optional("co2"),
            body,
            created_at: optional("created_at").unwrap_or_default(),
            updated_at: optional("updated_at").unwrap_or_default(),
        })
    }
}

/// 影子表建表语句，按顺序执行；主键、uk1 唯一约束与各索引都在这里。
pub fn table_ddl(engine: Engine, table: &str, foreign_key_name: &str) -> Result<Vec<String>, DbError> {
    let table = validate_identifier(table)?;
    let fk = validate_identifier(foreign_key_name)?;
    let statements = match engine {
        Engine::Sqlite => vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id INTEGER PRIMARY KEY AUTOINCREMENT, \
                 {fk} INTEGER NOT NULL, \
                 uk1 VARCHAR(150) UNIQUE, \
                 sk1 VARCHAR(75), \
                 tk1 TEXT, \
                 co1 VARCHAR(150), \
                 co2 VARCHAR(150), \
                 json_body TEXT NOT NULL, \
                 created_at TIMESTAMP NOT NULL, \
                 updated_at TIMESTAMP NOT NULL)"
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_{fk} ON {table} ({fk})"),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_sk1 ON {table} (sk1)"),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_tk1 ON {table} (substr(tk1, 1, 75))"),
        ],
        Engine::Postgres => vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {table} (\
                 id BIGSERIAL PRIMARY KEY, \
                 {fk} BIGINT NOT NULL, \
                 uk1 VARCHAR(150) UNIQUE, \
                 sk1 VARCHAR(75), \
                 tk1 TEXT, \
                 co1 VARCHAR(150), \
                 co2 VARCHAR(150), \
                 json_body JSONB NOT NULL, \
                 created_at TIMESTAMP NOT NULL, \
                 updated_at TIMESTAMP NOT NULL)"
            ),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_{fk} ON {table} ({fk})"),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_sk1 ON {table} (sk1)"),
            format!("CREATE INDEX IF NOT EXISTS idx_{table}_tk1 ON {table} ((left(tk1, 75)))"),
        ],
    };
    Ok(statements)
}

/// 绑定到单个所属实体的影子列存储，所有读写都限定在该外键值之下。
pub struct ShadowStore<'h> {
    db: &'h mut QueryHelper,
    table: String,
    foreign_key_name: String,
    foreign_key_value: i64,
    conflict_target: String,
    now_expression: &'static str,
}

impl<'h> ShadowStore<'h> {
    pub fn new(
        db: &'h mut QueryHelper,
        table: &str,
        foreign_key_name: &str,
        foreign_key_value: i64,
    ) -> Result<Self, DbError> {
        let table = validate_identifier(table)?.to_string();
        let foreign_key_name = validate_identifier(foreign_key_name)?.to_string();
        let now_expression = db.engine().now_expression();
        Ok(Self {
            db,
            table,
            foreign_key_name,
            foreign_key_value,
            conflict_target: ShadowField::Uk1.column().to_string(),
            now_expression,
        })
    }

    /// 替换 upsert 的冲突列，须是表上的唯一约束。
    pub fn with_conflict_target(mut self, column: &str) -> Result<Self, DbError> {
        self.conflict_target = validate_identifier(column)?.to_string();
        Ok(self)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn foreign_key_value(&self) -> i64 {
        self.foreign_key_value
    }

    pub fn validate(&self, data: &Value) -> Result<(), ValidationError> {
        validate(data)
    }

    /// 插入新行并返回生成的 id。校验失败时不会触及数据库。
    pub fn insert(&mut self, data: &Value) -> Result<i64, DbError> {
        let params = self.extract(data)?;
        let sql = format!(
            "INSERT INTO {table} ({fk}, uk1, sk1, tk1, co1, co2, json_body, created_at, updated_at) \
             VALUES (:foreign_key, :uk1, :sk1, :tk1, :co1, :co2, :json_body, {now}, {now}) \
             RETURNING id",
            table = self.table,
            fk = self.foreign_key_name,
            now = self.now_expression,
        );
        let id = self.returned_id(&sql, &params)?;
        id.ok_or_else(|| DbError::UnexpectedResult("insert returned no id".to_string()))
    }

    /// 按冲突列 upsert：命中时覆盖影子列与 json_body 并刷新 updated_at，created_at 保持不变。
    ///
    /// 冲突行属于其它实体时不会被覆盖，返回 `UnexpectedResult`。
    pub fn insert_or_update(&mut self, data: &Value) -> Result<i64, DbError> {
        let params = self.extract(data)?;
        let sql = format!(
            "INSERT INTO {table} ({fk}, uk1, sk1, tk1, co1, co2, json_body, created_at, updated_at) \
             VALUES (:foreign_key, :uk1, :sk1, :tk1, :co1, :co2, :json_body, {now}, {now}) \
             ON CONFLICT ({target}) DO UPDATE SET \
             uk1 = excluded.uk1, sk1 = excluded.sk1, tk1 = excluded.tk1, \
             co1 = excluded.co1, co2 = excluded.co2, json_body = excluded.json_body, \
             updated_at = {now} \
             WHERE {table}.{fk} = excluded.{fk} \
             RETURNING id",
            table = self.table,
            fk = self.foreign_key_name,
            target = self.conflict_target,
            now = self.now_expression,
        );
        let id = self.returned_id(&sql, &params)?;
        id.ok_or_else(|| {
            DbError::UnexpectedResult(format!(
                "{} conflict on a row owned by another {}",
                self.conflict_target, self.foreign_key_name
            ))
        })
    }

    pub fn get(&mut self, id: i64) -> Result<Option<ShadowRecord>, DbError> {
        let sql = format!("{} AND id = :id", self.select_clause());
        let params = self.scope().bind("id", id);
        let log_errors = self.db.options().log_errors;
        self.db
            .row_or_die(&sql, &params, log_errors)?
            .map(ShadowRecord::from_row)
            .transpose()
    }

    pub fn get_by_unique(&mut self, uk1: &str) -> Result<Option<ShadowRecord>, DbError> {
        let sql = format!("{} AND uk1 = :uk1", self.select_clause());
        let params = self.scope().bind("uk1", uk1);
        let log_errors = self.db.options().log_errors;
        self.db
            .row_or_die(&sql, &params, log_errors)?
            .map(ShadowRecord::from_row)
            .transpose()
    }

    pub fn list_by_sort_key(&mut self, sk1: &str) -> Result<Vec<ShadowRecord>, DbError> {
        let sql = format!("{} AND sk1 = :sk1 ORDER BY id", self.select_clause());
        let params = self.scope().bind("sk1", sk1);
        self.records(&sql, &params)
    }

    pub fn list(&mut self) -> Result<Vec<ShadowRecord>, DbError> {
        let sql = format!("{} ORDER BY id", self.select_clause());
        let params = self.scope();
        self.records(&sql, &params)
    }

    fn records(&mut self, sql: &str, params: &Params) -> Result<Vec<ShadowRecord>, DbError> {
        let log_errors = self.db.options().log_errors;
        self.db
            .all_rows_or_die(sql, params, log_errors)?
            .into_iter()
            .map(ShadowRecord::from_row)
            .collect()
    }

    fn select_clause(&self) -> String {
        format!(
            "SELECT id, {fk} AS foreign_key, uk1, sk1, tk1, co1, co2, json_body, created_at, updated_at \
             FROM {table} WHERE {fk} = :foreign_key",
            table = self.table,
            fk = self.foreign_key_name,
        )
    }

    fn scope(&self) -> Params {
        Params::new().bind("foreign_key", self.foreign_key_value)
    }

    fn extract(&self, data: &Value) -> Result<Params, DbError> {
        validate(data)?;
        let mut params = self.scope();
        for field in ShadowField::ALL {
            let value = data.get(field.column()).and_then(Value::as_str);
            params.set(field.column(), value);
        }
        params.set("json_body", serde_json::to_string(data)?);
        Ok(params)
    }

    fn returned_id(&mut self, sql: &str, params: &Params) -> Result<Option<i64>, DbError> {
        let log_errors = self.db.options().log_errors;
        let row = self.db.row_or_die(sql, params, log_errors)?;
        let id = row.and_then(|row| row.get("id").and_then(Value::as_i64));
        debug!(table = %self.table, id = ?id, "shadow row written");
        Ok(id)
    }
}
