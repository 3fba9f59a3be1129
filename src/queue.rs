/// Job-queue depth from the experiments SQLite database.
///
/// Depth is the number of experiments still demanding the pod: rows with
/// status running, queued, or paused. Any read failure (including a
/// missing database file) yields an invalid sample so the policy treats
/// the queue as non-empty rather than terminating on missing data.
use crate::policy::QueueSample;
use chrono::Utc;
use rusqlite::{Connection, OpenFlags};
use std::path::Path;
use std::time::Duration;

/// Experiment statuses that keep the pod busy.
const ACTIVE_STATUSES: [&str; 3] = ["running", "queued", "paused"];

/// Query the queue depth, bounded by `timeout`.
///
/// The rusqlite read is synchronous, so it runs on the blocking pool to
/// keep the watchdog loop responsive.
pub async fn sample(db_path: &Path, timeout: Duration) -> QueueSample {
    let now = Utc::now();
    let path = db_path.to_path_buf();

    let read = tokio::task::spawn_blocking(move || read_queue_depth(&path));
    match tokio::time::timeout(timeout, read).await {
        Ok(Ok(Ok(depth))) => QueueSample::depth(now, depth),
        Ok(Ok(Err(e))) => {
            tracing::warn!(error = %e, db = %db_path.display(), "queue depth query failed");
            QueueSample::invalid(now)
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "queue depth task panicked");
            QueueSample::invalid(now)
        }
        Err(_) => {
            tracing::warn!(timeout_secs = timeout.as_secs(), "queue depth query timed out");
            QueueSample::invalid(now)
        }
    }
}

/// Count active experiments. Opens read-only so a missing database is an
/// error here, not a silently created empty file.
fn read_queue_depth(path: &Path) -> rusqlite::Result<u64> {
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM experiments GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut depth: u64 = 0;
    for row in rows {
        let (status, count) = row?;
        if ACTIVE_STATUSES.contains(&status.as_str()) {
            depth += count.max(0) as u64;
        }
    }
    Ok(depth)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_db(path: &Path, statuses: &[&str]) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch(
            "CREATE TABLE experiments (
                id     INTEGER PRIMARY KEY AUTOINCREMENT,
                status TEXT NOT NULL
            );",
        )
        .unwrap();
        for status in statuses {
            conn.execute("INSERT INTO experiments (status) VALUES (?1)", [status])
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_counts_active_statuses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.sqlite");
        create_db(&path, &["running", "queued", "queued", "paused", "done"]);

        let sample = sample(&path, Duration::from_secs(5)).await;
        assert!(sample.valid);
        assert_eq!(sample.queue_depth, Some(4));
    }

    #[tokio::test]
    async fn test_empty_table_is_valid_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.sqlite");
        create_db(&path, &[]);

        // A genuine zero is a valid reading, distinct from a failed query.
        let sample = sample(&path, Duration::from_secs(5)).await;
        assert!(sample.valid);
        assert_eq!(sample.queue_depth, Some(0));
    }

    #[tokio::test]
    async fn test_finished_experiments_do_not_count() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.sqlite");
        create_db(&path, &["done", "failed", "cancelled"]);

        let sample = sample(&path, Duration::from_secs(5)).await;
        assert_eq!(sample.queue_depth, Some(0));
    }

    #[tokio::test]
    async fn test_missing_database_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such.sqlite");

        let sample = sample(&path, Duration::from_secs(5)).await;
        assert!(!sample.valid);
        assert!(sample.queue_depth.is_none());
        // Read-only open must not have created the file.
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_missing_table_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("experiments.sqlite");
        Connection::open(&path).unwrap();

        let sample = sample(&path, Duration::from_secs(5)).await;
        assert!(!sample.valid);
    }
}
