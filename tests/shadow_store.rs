use serde_json::json;
use shadow_store::storage::SqliteClient;
use shadow_store::{
    table_ddl, DbError, Engine, Params, QueryHelper, QueryOptions, ShadowStore,
};
use std::time::Duration;

const TABLE: &str = "shadow_items";
const FK: &str = "owner_id";

fn open_db(dir: &tempfile::TempDir) -> QueryHelper {
    let client = SqliteClient::open(dir.path().join("shadow.db")).expect("open sqlite");
    let mut db = QueryHelper::new(Box::new(client), QueryOptions::default());
    for statement in table_ddl(Engine::Sqlite, TABLE, FK).expect("ddl") {
        db.execute(&statement, &Params::new()).expect("create schema");
    }
    db
}

fn count_rows(db: &mut QueryHelper) -> i64 {
    db.row_or_die(
        &format!("SELECT COUNT(*) AS total FROM {TABLE}"),
        &Params::new(),
        true,
    )
    .expect("count")
    .and_then(|row| row.get("total").and_then(|value| value.as_i64()))
    .unwrap_or(-1)
}

#[test]
fn insert_then_get_returns_original_body() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut db = open_db(&dir);
    let payload = json!({
        "uk1": "order-1001",
        "sk1": "2026-10",
        "tk1": "first order of the month",
        "co1": "pending",
        "items": [{ "sku": "A-1", "qty": 2 }, { "sku": "B-7", "qty": 1 }],
        "meta": { "source": "import", "flags": [true, false, null] }
    });

    let mut store = ShadowStore::new(&mut db, TABLE, FK, 7).expect("store");
    let id = store.insert(&payload).expect("insert");
    assert!(id > 0);

    let record = store.get(id).expect("get").expect("record exists");
    assert_eq!(record.id, id);
    assert_eq!(record.foreign_key, 7);
    assert_eq!(record.uk1.as_deref(), Some("order-1001"));
    assert_eq!(record.sk1.as_deref(), Some("2026-10"));
    assert_eq!(record.co1.as_deref(), Some("pending"));
    assert_eq!(record.co2, None);
    assert_eq!(serde_json::Value::Object(record.body.clone()), payload);
    assert!(!record.created_at.is_empty());
    assert_eq!(record.created_at, record.updated_at);

    let by_unique = store
        .get_by_unique("order-1001")
        .expect("get by unique")
        .expect("record exists");
    assert_eq!(by_unique.id, id);
}

#[test]
fn insert_or_update_overwrites_single_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut db = open_db(&dir);
    let first = json!({ "uk1": "user-42", "sk1": "bronze", "co1": "a", "points": 10 });
    let second = json!({ "uk1": "user-42", "sk1": "gold", "co2": "b", "points": 250 });

    let (first_id, created) = {
        let mut store = ShadowStore::new(&mut db, TABLE, FK, 1).expect("store");
        let id = store.insert_or_update(&first).expect("first upsert");
        let record = store.get(id).expect("get").expect("record exists");
        (id, record)
    };

    std::thread::sleep(Duration::from_millis(20));

    let mut store = ShadowStore::new(&mut db, TABLE, FK, 1).expect("store");
    let second_id = store.insert_or_update(&second).expect("second upsert");
    assert_eq!(second_id, first_id);

    let updated = store.get(second_id).expect("get").expect("record exists");
    assert_eq!(updated.sk1.as_deref(), Some("gold"));
    assert_eq!(updated.co1, None);
    assert_eq!(updated.co2.as_deref(), Some("b"));
    assert_eq!(serde_json::Value::Object(updated.body.clone()), second);
    assert_eq!(updated.created_at, created.created_at);
    assert!(updated.updated_at > created.updated_at);
    drop(store);

    assert_eq!(count_rows(&mut db), 1);
}

#[test]
fn invalid_payload_is_rejected_before_writing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut db = open_db(&dir);
    {
        let mut store = ShadowStore::new(&mut db, TABLE, FK, 3).expect("store");
        let err = store
            .insert(&json!({ "uk1": "x".repeat(151) }))
            .expect_err("too long");
        assert!(matches!(err, DbError::Validation(_)));
        assert!(err.to_string().contains("uk1"));

        let err = store
            .insert_or_update(&json!(["not", "an", "object"]))
            .expect_err("not an object");
        assert!(matches!(err, DbError::Validation(_)));
    }
    assert_eq!(count_rows(&mut db), 0);
}

#[test]
fn reads_are_scoped_to_owner() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut db = open_db(&dir);

    let mine = {
        let mut store = ShadowStore::new(&mut db, TABLE, FK, 10).expect("store");
        store.insert(&json!({ "sk1": "red", "n": 1 })).expect("insert");
        store.insert(&json!({ "sk1": "blue", "n": 2 })).expect("insert");
        store.insert(&json!({ "sk1": "red", "n": 3 })).expect("insert")
    };
    {
        let mut other = ShadowStore::new(&mut db, TABLE, FK, 11).expect("store");
        other.insert(&json!({ "sk1": "red", "n": 4 })).expect("insert");
        assert!(other.get(mine).expect("get").is_none());
        assert_eq!(other.list().expect("list").len(), 1);
    }

    let mut store = ShadowStore::new(&mut db, TABLE, FK, 10).expect("store");
    let reds: Vec<i64> = store
        .list_by_sort_key("red")
        .expect("list by sk1")
        .iter()
        .filter_map(|record| record.body.get("n").and_then(|value| value.as_i64()))
        .collect();
    assert_eq!(reds, vec![1, 3]);
    assert_eq!(store.list().expect("list").len(), 3);
    assert!(store.list_by_sort_key("green").expect("list").is_empty());
}

#[test]
fn upsert_never_takes_over_another_owners_row() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut db = open_db(&dir);
    {
        let mut owner = ShadowStore::new(&mut db, TABLE, FK, 1).expect("store");
        owner.insert(&json!({ "uk1": "shared", "v": "original" })).expect("insert");
    }
    {
        let mut intruder = ShadowStore::new(&mut db, TABLE, FK, 2).expect("store");
        let err = intruder
            .insert_or_update(&json!({ "uk1": "shared", "v": "hijacked" }))
            .expect_err("conflict with another owner");
        assert!(matches!(err, DbError::UnexpectedResult(_)));

        // 普通插入撞上唯一约束属于致命 SQL 错误。
        let err = intruder
            .insert(&json!({ "uk1": "shared" }))
            .expect_err("unique violation");
        assert!(err.is_fatal_sql());
        assert_eq!(err.sql_error_info().map(|info| info.sql_state.as_str()), Some("23000"));
    }

    let mut owner = ShadowStore::new(&mut db, TABLE, FK, 1).expect("store");
    let record = owner
        .get_by_unique("shared")
        .expect("get")
        .expect("record exists");
    assert_eq!(record.body.get("v"), Some(&json!("original")));
}

#[test]
fn store_rejects_unsafe_identifiers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut db = open_db(&dir);
    assert!(matches!(
        ShadowStore::new(&mut db, "items; DROP TABLE x", FK, 1),
        Err(DbError::InvalidIdentifier(_))
    ));
    assert!(ShadowStore::new(&mut db, TABLE, "owner id", 1).is_err());
    let store = ShadowStore::new(&mut db, TABLE, FK, 1).expect("store");
    assert!(store.with_conflict_target("uk1);--").is_err());
}
