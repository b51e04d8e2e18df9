//! Aggregate counters and batch summaries.

use crate::Result;
use crate::types::{BatchSummary, QueueStats, Status};
use sqlx::FromRow;

use super::{JobStore, query_failed};

#[derive(Debug, FromRow)]
struct StatsRow {
    total_jobs: i64,
    completed: i64,
    failed: i64,
    cancelled: i64,
    total_retries: i64,
    bytes_downloaded: i64,
}

fn count(value: i64) -> u64 {
    value.max(0) as u64
}

impl JobStore {
    /// Lifetime counters plus live per-status counts
    ///
    /// Read in one transaction so the counters and live counts describe the
    /// same moment.
    pub async fn get_stats(&self) -> Result<QueueStats> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| query_failed("Failed to begin transaction", e))?;

        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT total_jobs, completed, failed, cancelled, total_retries, bytes_downloaded
            FROM stats WHERE id = 1
            "#,
        )
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| query_failed("Failed to read stats", e))?;

        let live: Vec<(i32, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM jobs GROUP BY status")
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| query_failed("Failed to count jobs by status", e))?;

        let queue_length: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM queue_entries")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| query_failed("Failed to count queue entries", e))?;

        tx.commit()
            .await
            .map_err(|e| query_failed("Failed to finish stats read", e))?;

        let live_count = |status: Status| {
            live.iter()
                .find(|(code, _)| *code == status.to_i32())
                .map(|(_, n)| count(*n))
                .unwrap_or(0)
        };

        Ok(QueueStats {
            total_jobs: count(row.total_jobs),
            completed: count(row.completed),
            failed: count(row.failed),
            cancelled: count(row.cancelled),
            total_retries: count(row.total_retries),
            bytes_downloaded: count(row.bytes_downloaded),
            pending: live_count(Status::Pending),
            downloading: live_count(Status::Downloading),
            paused: live_count(Status::Paused),
            queue_length: count(queue_length),
        })
    }

    /// Grouped view of one batch; `None` when no job carries `batch_id`
    pub async fn batch_summary(&self, batch_id: &str) -> Result<Option<BatchSummary>> {
        let jobs = self.get_jobs_by_batch(batch_id).await?;
        if jobs.is_empty() {
            return Ok(None);
        }

        let mut summary = BatchSummary {
            batch_id: batch_id.to_string(),
            total: jobs.len(),
            ..Default::default()
        };

        let mut progress_sum = 0.0;
        for job in &jobs {
            *summary
                .by_status
                .entry(job.status.as_str().to_string())
                .or_insert(0) += 1;
            summary.bytes_written += job.bytes_written;
            summary.known_size += job.file_size.unwrap_or(0);
            progress_sum += job.progress;
        }
        summary.progress = progress_sum / jobs.len() as f64;

        Ok(Some(summary))
    }
}
