use crate::db::*;
use tempfile::NamedTempFile;

#[tokio::test]
async fn test_database_creation() {
    let temp_file = NamedTempFile::new().unwrap();
    let db_path = temp_file.path();

    let db = Database::new(db_path).await.unwrap();

    // Verify tables exist
    let mut conn = db.pool.acquire().await.unwrap();

    let tables: Vec<String> =
        sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .fetch_all(&mut *conn)
            .await
            .unwrap();

    assert!(tables.contains(&"items".to_string()));
    assert!(tables.contains(&"schema_version".to_string()));
    assert!(tables.contains(&"runtime_state".to_string()));

    drop(conn);
    db.close().await;
}

#[tokio::test]
async fn test_reopen_does_not_reapply_migrations() {
    let temp_file = NamedTempFile::new().unwrap();

    let db = Database::new(temp_file.path()).await.unwrap();
    db.set_item_status("abc", crate::types::RecordStatus::Complete, 1, None)
        .await
        .unwrap();
    db.close().await;

    let db = Database::new(temp_file.path()).await.unwrap();
    let versions: Vec<i64> = sqlx::query_scalar("SELECT version FROM schema_version")
        .fetch_all(&db.pool)
        .await
        .unwrap();
    assert_eq!(versions, vec![1]);
    assert!(db.get_item("abc").await.unwrap().is_some());
    db.close().await;
}

#[tokio::test]
async fn test_database_in_nested_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("work").join("state.db");
    let db = Database::new(&path).await.unwrap();
    assert!(path.exists());
    db.close().await;
}
