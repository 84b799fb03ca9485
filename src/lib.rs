#![allow(clippy::result_large_err)]
// Library entrypoint: query helper, schema introspection and the shadow-column store.
pub mod config;
pub mod errors;
pub mod observability;
pub mod query;
pub mod schema;
pub mod shadow;
pub mod storage;
pub mod version;

pub use errors::{DbError, ValidationError, GENERIC_DB_ERROR};
pub use query::{QueryContext, QueryHelper, QueryOptions, QueryResult};
pub use schema::{parse_column_type, validate_identifier, ColumnSource};
pub use shadow::{table_ddl, validate, ShadowField, ShadowRecord, ShadowStore};
pub use storage::{
    connect, DbClient, Engine, ErrorInfo, ErrorMode, Params, Row, SqlValue, Statement,
};
pub use version::{compare_versions, parse_version_prefix};
