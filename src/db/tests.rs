//! Database and task store unit tests

use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::db::{
    queries, Database, KeyValueStore, MemoryKvStore, SqliteKvStore, TaskStatus, TaskStore,
};

fn sqlite_store() -> TaskStore {
    let db = Arc::new(Database::open_in_memory().expect("in-memory DB"));
    TaskStore::new(Arc::new(SqliteKvStore::new(db)))
}

#[test]
fn test_record_start_round_trip() {
    for store in [TaskStore::in_memory(), sqlite_store()] {
        store.record_start("A", "T", "Bot").unwrap();

        let task = store.get("A").unwrap().expect("record present");
        assert_eq!(task.status, TaskStatus::Training);
        assert_eq!(task.task_id, "T");
        assert_eq!(task.agent_name, "Bot");
        assert_eq!(task.agent_id, "A");
    }
}

#[test]
fn test_update_status_absent_is_noop() {
    let store = TaskStore::in_memory();
    let updated = store.update_status("missing", TaskStatus::Completed).unwrap();
    assert!(updated.is_none());
    assert!(store.get("missing").unwrap().is_none());
}

#[test]
fn test_update_status_moves_forward_only() {
    let store = TaskStore::in_memory();
    store.record_start("A", "T", "Bot").unwrap();

    let done = store.update_status("A", TaskStatus::Completed).unwrap().unwrap();
    assert_eq!(done.status, TaskStatus::Completed);

    let after = store.update_status("A", TaskStatus::Training).unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Completed);

    let after = store.update_status("A", TaskStatus::Failed).unwrap().unwrap();
    assert_eq!(after.status, TaskStatus::Completed);
}

#[test]
fn test_remove_and_get_all() {
    let store = sqlite_store();
    store.record_start("1", "t1", "First").unwrap();
    store.record_start("2", "t2", "Second").unwrap();

    let all = store.get_all().unwrap();
    let agents: Vec<_> = all.iter().map(|t| t.agent_id.as_str()).collect();
    assert_eq!(agents.len(), 2);
    assert!(agents.contains(&"1") && agents.contains(&"2"));

    assert!(store.remove("1").unwrap());
    assert!(!store.remove("1").unwrap());
    assert_eq!(store.get_all().unwrap().len(), 1);
    assert!(store.is_in_flight("2").unwrap());
    assert!(!store.is_in_flight("1").unwrap());
}

#[test]
fn test_persisted_layout_matches_dashboard_format() {
    let kv = Arc::new(MemoryKvStore::new());
    let store = TaskStore::new(kv.clone());
    let task = store.record_start("42", "task-9", "Support Bot").unwrap();

    let raw = kv.get("training_task:42").unwrap().expect("raw record");
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value["taskId"], "task-9");
    assert_eq!(value["agentName"], "Support Bot");
    assert_eq!(value["status"], "training");
    assert_eq!(value["timestamp"], task.started_at.timestamp_millis());
}

#[test]
fn test_reads_records_without_last_updated_field() {
    let kv = Arc::new(MemoryKvStore::new());
    kv.put(
        "training_task:7",
        r#"{"taskId":"t","agentName":"Legacy","timestamp":1700000000000,"status":"failed"}"#,
    )
    .unwrap();
    let store = TaskStore::new(kv);

    let task = store.get("7").unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.started_at, task.last_updated_at);
}

#[test]
fn test_corrupt_record_is_skipped_by_get_all() {
    let kv = Arc::new(MemoryKvStore::new());
    kv.put("training_task:bad", "not json").unwrap();
    let store = TaskStore::new(kv);
    store.record_start("good", "t", "Good").unwrap();

    assert!(store.get("bad").is_err());
    let all = store.get_all().unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].agent_id, "good");
}

#[test]
fn test_sqlite_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("training.db");

    {
        let db = Arc::new(Database::open(&path).unwrap());
        let store = TaskStore::new(Arc::new(SqliteKvStore::new(db)));
        store.record_start("A", "T", "Bot").unwrap();
    }

    let db = Arc::new(Database::open(&path).unwrap());
    let store = TaskStore::new(Arc::new(SqliteKvStore::new(db)));
    let task = store.get("A").unwrap().expect("persisted across reopen");
    assert_eq!(task.task_id, "T");
}

#[test]
fn test_prefix_listing_ignores_other_keys() {
    let db = Database::open_in_memory().unwrap();
    queries::upsert_entry(&db, "training_task:a", "{}", "now").unwrap();
    queries::upsert_entry(&db, "other:a", "{}", "now").unwrap();
    queries::upsert_entry(&db, "training_task_x", "{}", "now").unwrap();

    let keys = queries::list_keys_with_prefix(&db, "training_task:").unwrap();
    assert_eq!(keys, vec!["training_task:a".to_string()]);
}

#[test]
fn test_migrations_create_only_the_kv_table() {
    let db = Database::open_in_memory().expect("in-memory DB");
    let conn = db.conn().unwrap();

    let mut stmt = conn
        .prepare(
            "SELECT type, name FROM sqlite_master
             WHERE name NOT LIKE 'sqlite_%' ORDER BY type, name",
        )
        .unwrap();
    let objects: Vec<(String, String)> = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    assert_eq!(
        objects,
        vec![
            ("table".to_string(), "_migrations".to_string()),
            ("table".to_string(), "kv_entries".to_string()),
        ]
    );
    let applied: i64 = conn
        .query_row("SELECT COUNT(*) FROM _migrations", [], |row| row.get(0))
        .unwrap();
    assert_eq!(applied, 1);
}
