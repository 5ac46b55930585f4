use crate::db::*;
use crate::types::RecordStatus;
use tempfile::NamedTempFile;

async fn open() -> (NamedTempFile, Database) {
    let temp_file = NamedTempFile::new().unwrap();
    let db = Database::new(temp_file.path()).await.unwrap();
    (temp_file, db)
}

#[tokio::test]
async fn test_status_upsert_and_read_back() {
    let (_f, db) = open().await;

    assert!(db.get_item("a").await.unwrap().is_none());

    assert!(db
        .set_item_status("a", RecordStatus::InProgress, 0, None)
        .await
        .unwrap());
    let row = db.get_item("a").await.unwrap().unwrap();
    assert_eq!(RecordStatus::from_i32(row.status), RecordStatus::InProgress);
    assert_eq!(row.attempts, 0);

    db.set_item_status("a", RecordStatus::Failed, 3, Some("timed out"))
        .await
        .unwrap();
    let row = db.get_item("a").await.unwrap().unwrap();
    assert_eq!(RecordStatus::from_i32(row.status), RecordStatus::Failed);
    assert_eq!(row.attempts, 3);
    assert_eq!(row.last_error.as_deref(), Some("timed out"));

    db.close().await;
}

#[tokio::test]
async fn test_complete_is_never_overwritten() {
    let (_f, db) = open().await;

    db.set_item_status("a", RecordStatus::Complete, 2, None)
        .await
        .unwrap();

    for status in [
        RecordStatus::Pending,
        RecordStatus::InProgress,
        RecordStatus::Failed,
    ] {
        let changed = db
            .set_item_status("a", status, 1, Some("late update"))
            .await
            .unwrap();
        assert!(!changed, "{status:?} must not overwrite COMPLETE");
    }
    assert!(!db.reset_item_to_pending("a").await.unwrap());

    let row = db.get_item("a").await.unwrap().unwrap();
    assert_eq!(RecordStatus::from_i32(row.status), RecordStatus::Complete);
    assert_eq!(row.attempts, 2);
    assert!(row.last_error.is_none());

    db.close().await;
}

#[tokio::test]
async fn test_attempts_accumulate_across_runs() {
    let (_f, db) = open().await;
    db.set_item_status("a", RecordStatus::Failed, 4, Some("x"))
        .await
        .unwrap();
    db.set_item_status("a", RecordStatus::Complete, 1, None)
        .await
        .unwrap();
    let row = db.get_item("a").await.unwrap().unwrap();
    assert_eq!(row.attempts, 5);
    db.close().await;
}

#[tokio::test]
async fn test_reset_in_progress_only_touches_in_progress() {
    let (_f, db) = open().await;
    db.set_item_status("p", RecordStatus::InProgress, 0, None).await.unwrap();
    db.set_item_status("q", RecordStatus::InProgress, 0, None).await.unwrap();
    db.set_item_status("c", RecordStatus::Complete, 1, None).await.unwrap();
    db.set_item_status("f", RecordStatus::Failed, 1, Some("e")).await.unwrap();

    assert_eq!(db.reset_in_progress().await.unwrap(), 2);
    assert_eq!(db.reset_in_progress().await.unwrap(), 0);

    let pending = db.list_items_by_status(RecordStatus::Pending).await.unwrap();
    let ids: Vec<_> = pending.iter().map(|r| r.item_id.as_str()).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&"p") && ids.contains(&"q"));

    let counts = db.count_items_by_status().await.unwrap();
    assert_eq!(counts.pending, 2);
    assert_eq!(counts.in_progress, 0);
    assert_eq!(counts.complete, 1);
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.total(), 4);

    db.close().await;
}

#[tokio::test]
async fn test_reset_single_item_requires_in_progress() {
    let (_f, db) = open().await;
    db.set_item_status("a", RecordStatus::Failed, 1, Some("e")).await.unwrap();
    assert!(!db.reset_item_to_pending("a").await.unwrap());

    db.set_item_status("b", RecordStatus::InProgress, 0, None).await.unwrap();
    assert!(db.reset_item_to_pending("b").await.unwrap());
    let row = db.get_item("b").await.unwrap().unwrap();
    assert_eq!(RecordStatus::from_i32(row.status), RecordStatus::Pending);

    db.close().await;
}

#[tokio::test]
async fn test_completed_item_ids() {
    let (_f, db) = open().await;
    db.set_item_status("a", RecordStatus::Complete, 1, None).await.unwrap();
    db.set_item_status("b", RecordStatus::Failed, 1, Some("e")).await.unwrap();
    db.set_item_status("c", RecordStatus::Complete, 1, None).await.unwrap();

    let done = db.completed_item_ids().await.unwrap();
    assert_eq!(done.len(), 2);
    assert!(done.contains("a") && done.contains("c"));

    db.close().await;
}
