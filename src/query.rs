// 查询助手：统一 prepare/execute 的成功失败形态，计时并记录慢查询与 SQL 错误。
use crate::config::{FatalPolicy, QueryConfig};
use crate::errors::{DbError, GENERIC_DB_ERROR};
use crate::storage::{DbClient, Engine, ErrorInfo, ErrorMode, Params, Row, Statement};
use std::time::{Duration, Instant};
use tracing::{error, warn};

#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// 开发模式下致命错误携带完整驱动消息，否则只给通用提示。
    pub developer_mode: bool,
    /// 秒；0 关闭，正数只记录超过阈值的查询，负数记录全部。
    pub slow_query_threshold_s: f64,
    /// 未显式传入 log_errors 的内部调用使用该默认值。
    pub log_errors: bool,
    pub fatal_policy: FatalPolicy,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}

impl QueryOptions {
    pub fn from_config(config: &QueryConfig) -> Self {
        Self {
            developer_mode: config.developer_mode,
            slow_query_threshold_s: config.slow_query_threshold_s,
            log_errors: config.log_errors,
            fatal_policy: config.on_fatal,
        }
    }

    fn should_log_slow(&self, elapsed: Duration) -> bool {
        let threshold = self.slow_query_threshold_s;
        if threshold == 0.0 {
            return false;
        }
        threshold < 0.0 || elapsed.as_secs_f64() > threshold
    }
}

/// 调用方显式提供的诊断上下文，仅用于日志。
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    pub caller: Option<String>,
    pub request_path: Option<String>,
}

impl QueryContext {
    pub fn new(caller: impl Into<String>) -> Self {
        Self {
            caller: Some(caller.into()),
            request_path: None,
        }
    }

    pub fn with_request_path(mut self, path: impl Into<String>) -> Self {
        self.request_path = Some(path.into());
        self
    }

    fn caller(&self) -> &str {
        self.caller.as_deref().unwrap_or("-")
    }

    fn request_path(&self) -> &str {
        self.request_path.as_deref().unwrap_or("-")
    }
}

enum Backing {
    Live(Statement),
    /// prepare 阶段就失败，没有可用的语句句柄。
    Synthetic,
}

/// 单次查询的统一结果；失败时不要假定存在可用语句。
pub struct QueryResult {
    pub success: bool,
    pub elapsed: Duration,
    pub error_code: String,
    pub error_info: ErrorInfo,
    pub error_summary: String,
    backing: Backing,
}

impl QueryResult {
    fn live(statement: Statement, elapsed: Duration) -> Self {
        let info = statement.error_info().clone();
        Self {
            success: true,
            elapsed,
            error_code: info.sql_state.clone(),
            error_summary: info.summary(),
            error_info: info,
            backing: Backing::Live(statement),
        }
    }

    fn failed(statement: Option<Statement>, info: ErrorInfo, elapsed: Duration) -> Self {
        Self {
            success: false,
            elapsed,
            error_code: info.sql_state.clone(),
            error_summary: info.summary(),
            error_info: info,
            backing: match statement {
                Some(statement) => Backing::Live(statement),
                None => Backing::Synthetic,
            },
        }
    }

    pub fn is_synthetic(&self) -> bool {
        matches!(self.backing, Backing::Synthetic)
    }

    pub fn statement(&self) -> Option<&Statement> {
        match &self.backing {
            Backing::Live(statement) => Some(statement),
            Backing::Synthetic => None,
        }
    }

    pub fn statement_mut(&mut self) -> Option<&mut Statement> {
        match &mut self.backing {
            Backing::Live(statement) => Some(statement),
            Backing::Synthetic => None,
        }
    }

    pub fn into_statement(self) -> Option<Statement> {
        match self.backing {
            Backing::Live(statement) => Some(statement),
            Backing::Synthetic => None,
        }
    }

    /// 释放缓冲的结果集。
    pub fn release(&mut self) {
        if let Some(statement) = self.statement_mut() {
            statement.close_cursor();
        }
    }
}

/// 在作用域内强制 Raise 模式，离开时恢复调用前的模式。
struct ErrorModeGuard<'a> {
    client: &'a mut dyn DbClient,
    previous: ErrorMode,
}

impl<'a> ErrorModeGuard<'a> {
    fn raise(client: &'a mut dyn DbClient) -> Self {
        let previous = client.error_mode();
        if previous != ErrorMode::Raise {
            client.set_error_mode(ErrorMode::Raise);
        }
        Self { client, previous }
    }
}

impl ErrorModeGuard<'_> {
    fn client(&mut self) -> &mut dyn DbClient {
        &mut *self.client
    }
}

impl Drop for ErrorModeGuard<'_> {
    fn drop(&mut self) {
        if self.client.error_mode() != self.previous {
            self.client.set_error_mode(self.previous);
        }
    }
}

pub struct QueryHelper {
    client: Box<dyn DbClient>,
    options: QueryOptions,
    context: QueryContext,
}

impl QueryHelper {
    pub fn new(client: Box<dyn DbClient>, options: QueryOptions) -> Self {
        Self {
            client,
            options,
            context: QueryContext::default(),
        }
    }

    pub fn with_context(mut self, context: QueryContext) -> Self {
        self.context = context;
        self
    }

    pub fn set_context(&mut self, context: QueryContext) {
        self.context = context;
    }

    pub fn context(&self) -> &QueryContext {
        &self.context
    }

    pub fn options(&self) -> &QueryOptions {
        &self.options
    }

    pub fn engine(&self) -> Engine {
        self.client.engine()
    }

    pub fn client(&self) -> &dyn DbClient {
        self.client.as_ref()
    }

    pub fn client_mut(&mut self) -> &mut dyn DbClient {
        self.client.as_mut()
    }

    /// 预处理并执行语句，任何阶段的失败都折叠进返回的 `QueryResult`。
    ///
    /// 调用期间客户端被强制为 Raise 模式，返回前恢复原模式。
    pub fn query_return_error(&mut self, sql: &str, params: &Params, log_errors: bool) -> QueryResult {
        let started = Instant::now();
        let outcome = {
            let mut guard = ErrorModeGuard::raise(self.client.as_mut());
            let client = guard.client();
            match client.prepare(sql) {
                Ok(Some(mut statement)) => match client.execute(&mut statement, params) {
                    Ok(true) => Ok(statement),
                    Ok(false) => {
                        let info = statement.error_info().clone();
                        Err((Some(statement), info))
                    }
                    Err(err) => Err((Some(statement), err.info().clone())),
                },
                Ok(None) => Err((None, client.last_error().clone())),
                Err(err) => Err((None, err.info().clone())),
            }
        };
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(statement) => QueryResult::live(statement, elapsed),
            Err((statement, info)) => {
                if log_errors {
                    error!(
                        caller = self.context.caller(),
                        request_path = self.context.request_path(),
                        "SQL error: {} | {}",
                        info.summary(),
                        sql
                    );
                }
                QueryResult::failed(statement, info, elapsed)
            }
        };
        self.log_slow_query(sql, elapsed);
        result
    }

    /// 执行失败即视为致命：释放结果后返回 `DbError::FatalSql`，或在 Exit 策略下终止进程。
    pub fn query_or_die(
        &mut self,
        sql: &str,
        params: &Params,
        log_errors: bool,
    ) -> Result<Statement, DbError> {
        let mut result = self.query_return_error(sql, params, log_errors);
        if result.success {
            return result.into_statement().ok_or_else(|| {
                DbError::UnexpectedResult("successful query without a statement".to_string())
            });
        }
        result.release();
        let detail = format!("{} | {}", result.error_summary, sql);
        error!(
            caller = self.context.caller(),
            request_path = self.context.request_path(),
            "fatal SQL error: {detail}"
        );
        let message = if self.options.developer_mode {
            detail
        } else {
            GENERIC_DB_ERROR.to_string()
        };
        if self.options.fatal_policy == FatalPolicy::Exit {
            eprintln!("{message}");
            std::process::exit(1);
        }
        Err(DbError::FatalSql {
            message,
            info: result.error_info,
            sql: sql.to_string(),
        })
    }

    /// 至多取一行；没有数据不算错误。
    pub fn row_or_die(
        &mut self,
        sql: &str,
        params: &Params,
        log_errors: bool,
    ) -> Result<Option<Row>, DbError> {
        let mut statement = self.query_or_die(sql, params, log_errors)?;
        let row = statement.fetch_one();
        statement.close_cursor();
        Ok(row)
    }

    /// 一次取回全部行，零行时返回空列表。
    pub fn all_rows_or_die(
        &mut self,
        sql: &str,
        params: &Params,
        log_errors: bool,
    ) -> Result<Vec<Row>, DbError> {
        let mut statement = self.query_or_die(sql, params, log_errors)?;
        let rows = statement.fetch_all();
        statement.close_cursor();
        Ok(rows)
    }

    /// 执行不关心结果集的语句，返回影响行数。
    pub fn execute(&mut self, sql: &str, params: &Params) -> Result<u64, DbError> {
        let log_errors = self.options.log_errors;
        let mut statement = self.query_or_die(sql, params, log_errors)?;
        let affected = statement.rows_affected();
        statement.close_cursor();
        Ok(affected)
    }

    fn log_slow_query(&self, sql: &str, elapsed: Duration) {
        if !self.options.should_log_slow(elapsed) {
            return;
        }
        warn!(
            elapsed_s = elapsed.as_secs_f64(),
            caller = self.context.caller(),
            request_path = self.context.request_path(),
            "slow query: {sql}"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteClient;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if let Ok(mut bytes) = self.0.lock() {
                bytes.extend_from_slice(buf);
            }
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLog {
        fn contents(&self) -> String {
            self.0
                .lock()
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_default()
        }
    }

    fn capture_logs<T>(run: impl FnOnce() -> T) -> (T, String) {
        let log = CapturedLog::default();
        let writer = log.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::TRACE)
            .finish();
        let value = tracing::subscriber::with_default(subscriber, run);
        (value, log.contents())
    }

    fn helper(options: QueryOptions) -> QueryHelper {
        let client = SqliteClient::open_in_memory().expect("open sqlite");
        client
            .connection()
            .execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL UNIQUE);
                 INSERT INTO items (name) VALUES ('alpha'), ('beta'), ('gamma');",
            )
            .expect("seed");
        QueryHelper::new(Box::new(client), options)
    }

    #[test]
    fn slow_query_threshold_semantics() {
        let mut options = QueryOptions::default();
        assert!(!options.should_log_slow(Duration::from_secs(10)));
        options.slow_query_threshold_s = 0.5;
        assert!(!options.should_log_slow(Duration::from_millis(100)));
        assert!(options.should_log_slow(Duration::from_secs(1)));
        options.slow_query_threshold_s = -1.0;
        assert!(options.should_log_slow(Duration::ZERO));
    }

    #[test]
    fn error_mode_is_restored_after_success_and_failure() {
        let mut db = helper(QueryOptions::default());
        for mode in [ErrorMode::Silent, ErrorMode::Raise] {
            db.client_mut().set_error_mode(mode);
            let ok = db.query_return_error("SELECT name FROM items", &Params::new(), false);
            assert!(ok.success);
            assert_eq!(db.client().error_mode(), mode);

            let failed = db.query_return_error("SELECT FROM WHERE", &Params::new(), false);
            assert!(!failed.success);
            assert_eq!(db.client().error_mode(), mode);
        }
    }

    #[test]
    fn prepare_failure_yields_synthetic_result() {
        let mut db = helper(QueryOptions::default());
        let result = db.query_return_error("SELECT * FROM missing_table", &Params::new(), false);
        assert!(!result.success);
        assert!(result.is_synthetic());
        assert!(result.statement().is_none());
        assert_eq!(result.error_code, "HY000");
        assert!(result.error_summary.contains("missing_table"));
    }

    #[test]
    fn execute_failure_keeps_live_statement() {
        let mut db = helper(QueryOptions::default());
        let params = Params::new().bind("name", "alpha");
        let result = db.query_return_error("INSERT INTO items (name) VALUES (:name)", &params, false);
        assert!(!result.success);
        assert!(!result.is_synthetic());
        assert_eq!(result.error_code, "23000");
        assert_eq!(result.statement().map(|stmt| stmt.error_code()), Some("23000"));
    }

    #[test]
    fn success_reports_clean_error_fields() {
        let mut db = helper(QueryOptions::default());
        let result = db.query_return_error("SELECT COUNT(*) AS total FROM items", &Params::new(), true);
        assert!(result.success);
        assert_eq!(result.error_code, "00000");
        assert!(result.error_info.message.is_empty());
        assert_eq!(result.error_summary, "00000");
    }

    #[test]
    fn missing_bind_value_is_a_failure() {
        let mut db = helper(QueryOptions::default());
        let result = db.query_return_error("SELECT * FROM items WHERE name = :name", &Params::new(), false);
        assert!(!result.success);
        assert_eq!(result.error_code, "HY093");
    }

    #[test]
    fn fatal_message_depends_on_developer_mode() {
        let mut quiet = helper(QueryOptions::default());
        let err = quiet
            .query_or_die("SELECT nope FROM items", &Params::new(), false)
            .err()
            .expect("fatal error");
        assert!(err.is_fatal_sql());
        assert_eq!(err.to_string(), GENERIC_DB_ERROR);
        assert!(err.sql_error_info().is_some_and(|info| info.message.contains("nope")));

        let mut verbose = helper(QueryOptions {
            developer_mode: true,
            ..QueryOptions::default()
        });
        let err = verbose
            .query_or_die("SELECT nope FROM items", &Params::new(), false)
            .err()
            .expect("fatal error");
        assert!(err.to_string().contains("nope"));
        assert!(err.to_string().contains("SELECT nope FROM items"));
    }

    #[test]
    fn row_and_rows_helpers() {
        let mut db = helper(QueryOptions::default());
        let row = db
            .row_or_die("SELECT name FROM items WHERE id = :id", &Params::new().bind("id", 2), true)
            .expect("row query");
        assert_eq!(row.and_then(|row| row["name"].as_str().map(str::to_string)), Some("beta".to_string()));

        let none = db
            .row_or_die("SELECT name FROM items WHERE id = :id", &Params::new().bind("id", 99), true)
            .expect("row query");
        assert!(none.is_none());

        let empty = db
            .all_rows_or_die("SELECT name FROM items WHERE id > :id", &Params::new().bind("id", 99), true)
            .expect("rows query");
        assert!(empty.is_empty());

        let names: Vec<String> = db
            .all_rows_or_die("SELECT name FROM items ORDER BY id DESC", &Params::new(), true)
            .expect("rows query")
            .into_iter()
            .filter_map(|row| row["name"].as_str().map(str::to_string))
            .collect();
        assert_eq!(names, vec!["gamma", "beta", "alpha"]);
    }

    #[test]
    fn execute_returns_affected_rows() {
        let mut db = helper(QueryOptions::default());
        let affected = db
            .execute("DELETE FROM items WHERE id < :id", &Params::new().bind("id", 3))
            .expect("delete");
        assert_eq!(affected, 2);
    }

    #[test]
    fn failures_are_logged_only_when_requested() {
        let mut db = helper(QueryOptions::default());
        db.set_context(QueryContext::new("inventory_report").with_request_path("/reports/stock"));

        let (result, logged) = capture_logs(|| {
            db.query_return_error("SELECT * FROM missing_table", &Params::new(), true)
        });
        assert!(!result.success);
        assert!(logged.contains("ERROR"), "{logged}");
        assert!(logged.contains("SQL error"), "{logged}");
        assert!(logged.contains("missing_table"), "{logged}");
        assert!(logged.contains("inventory_report"), "{logged}");
        assert!(logged.contains("/reports/stock"), "{logged}");

        let (result, logged) = capture_logs(|| {
            db.query_return_error("SELECT * FROM missing_table", &Params::new(), false)
        });
        assert!(!result.success);
        assert!(!logged.contains("SQL error"), "{logged}");
        assert!(logged.trim().is_empty(), "{logged}");
    }

    #[test]
    fn slow_queries_log_timing_and_context() {
        let mut db = helper(QueryOptions {
            slow_query_threshold_s: -1.0,
            ..QueryOptions::default()
        });
        db.set_context(QueryContext::new("nightly_sync").with_request_path("/jobs/sync"));
        let (result, logged) = capture_logs(|| {
            db.query_return_error("SELECT name FROM items", &Params::new(), true)
        });
        assert!(result.success);
        assert!(logged.contains("WARN"), "{logged}");
        assert!(logged.contains("slow query: SELECT name FROM items"), "{logged}");
        assert!(logged.contains("elapsed_s="), "{logged}");
        assert!(logged.contains("nightly_sync"), "{logged}");
        assert!(logged.contains("/jobs/sync"), "{logged}");

        let mut fast = helper(QueryOptions {
            slow_query_threshold_s: 60.0,
            ..QueryOptions::default()
        });
        let (_, logged) = capture_logs(|| {
            fast.query_return_error("SELECT name FROM items", &Params::new(), true)
        });
        assert!(!logged.contains("slow query"), "{logged}");
    }
}
