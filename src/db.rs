use crate::content::ContentStore;
use crate::queue::QueueStore;
use crate::{ContentRecord, NewQueueEntry, QueueEntry};
use anyhow::{bail, Error};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Executor;
use std::sync::Arc;
use tracing::{debug, instrument};
use uuid::Uuid;

const QUEUE_COLUMNS: &str = "queue_id, parent_media_id, thread_sequence, content, media_urls, \
    media_type, social_id, access_token, user_id, reply_to_id, status, created_at, \
    processed_at, retry_count, max_retries, error";

#[derive(Clone)]
pub struct DbHandle {
    pool: Arc<PgPool>,
}

impl DbHandle {
    #[instrument(name = "db.new", skip_all)]
    pub async fn new(url: &str) -> Result<Self, Error> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await?;

        (&pool).execute(include_str!("setup.sql")).await?;

        Ok(DbHandle {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl QueueStore for DbHandle {
    #[instrument(name = "db.insert_entries", skip_all, fields(count = entries.len()))]
    async fn insert_entries(&self, entries: &[NewQueueEntry]) -> Result<Vec<Uuid>, Error> {
        let mut tx = self.pool.begin().await?;
        let mut ids = Vec::with_capacity(entries.len());

        for entry in entries {
            let queue_id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO thread_queue \
                (queue_id, parent_media_id, thread_sequence, content, media_urls, media_type, \
                 social_id, access_token, user_id, reply_to_id, status, max_retries) \
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, 'pending', $11)",
            )
            .bind(queue_id)
            .bind(&entry.parent_media_id)
            .bind(entry.item.sequence)
            .bind(&entry.item.content)
            .bind(&entry.item.media_urls)
            .bind(entry.item.media_type)
            .bind(&entry.credentials.social_id)
            .bind(&entry.credentials.access_token)
            .bind(&entry.credentials.user_id)
            .bind(&entry.reply_to_id)
            .bind(entry.max_retries)
            .execute(&mut *tx)
            .await?;
            ids.push(queue_id);
        }

        tx.commit().await?;
        Ok(ids)
    }

    #[instrument(name = "db.claim_pending", skip(self))]
    async fn claim_pending(&self, limit: i64) -> Result<Vec<QueueEntry>, Error> {
        debug!("Claiming up to {} pending entries", limit);
        let sql = format!(
            "UPDATE thread_queue \
                SET status = 'processing' \
            WHERE queue_id IN ( \
                SELECT queue_id FROM thread_queue \
                WHERE status = 'pending' \
                ORDER BY created_at ASC, thread_sequence ASC \
                LIMIT $1 \
                FOR UPDATE SKIP LOCKED) \
            RETURNING {}",
            QUEUE_COLUMNS
        );

        let mut claimed = sqlx::query_as::<_, QueueEntry>(&sql)
            .bind(limit)
            .fetch_all(&*self.pool)
            .await?;

        // Entries of one chain share created_at (same insert transaction).
        claimed.sort_by_key(|entry| (entry.created_at, entry.thread_sequence));
        Ok(claimed)
    }

    #[instrument(name = "db.complete", skip(self))]
    async fn complete(&self, queue_id: Uuid) -> Result<(), Error> {
        sqlx::query(
            "UPDATE thread_queue \
                SET status = 'completed', \
                processed_at = now(), \
                error = NULL \
            WHERE queue_id = $1 AND status = 'processing'",
        )
        .bind(queue_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    #[instrument(name = "db.requeue", skip(self, error))]
    async fn requeue(&self, queue_id: Uuid, error: &str) -> Result<(), Error> {
        let result = sqlx::query(
            "UPDATE thread_queue \
                SET status = 'pending', \
                retry_count = retry_count + 1, \
                error = $2 \
            WHERE queue_id = $1 AND status = 'processing' AND retry_count < max_retries",
        )
        .bind(queue_id)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("queue entry {} cannot be requeued", queue_id);
        }
        Ok(())
    }

    #[instrument(name = "db.fail", skip(self, error))]
    async fn fail(&self, queue_id: Uuid, error: &str) -> Result<(), Error> {
        sqlx::query(
            "UPDATE thread_queue \
                SET status = 'failed', \
                processed_at = now(), \
                error = $2 \
            WHERE queue_id = $1 AND status = 'processing'",
        )
        .bind(queue_id)
        .bind(error)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    async fn has_pending(&self) -> Result<bool, Error> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM thread_queue WHERE status = 'pending')",
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(exists)
    }

    #[instrument(name = "db.delete_completed", skip(self))]
    async fn delete_completed_before(&self, cutoff: DateTime<Utc>) -> Result<u64, Error> {
        let result = sqlx::query(
            "DELETE FROM thread_queue \
            WHERE status = 'completed' AND processed_at < $1",
        )
        .bind(cutoff)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(name = "db.reset_processing", skip(self))]
    async fn reset_processing(&self) -> Result<u64, Error> {
        let result = sqlx::query(
            "UPDATE thread_queue \
                SET status = 'pending' \
            WHERE status = 'processing'",
        )
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn entries_for_chain(&self, parent_media_id: &str) -> Result<Vec<QueueEntry>, Error> {
        let sql = format!(
            "SELECT {} FROM thread_queue \
            WHERE parent_media_id = $1 \
            ORDER BY thread_sequence ASC",
            QUEUE_COLUMNS
        );

        Ok(sqlx::query_as::<_, QueueEntry>(&sql)
            .bind(parent_media_id)
            .fetch_all(&*self.pool)
            .await?)
    }
}

#[async_trait]
impl ContentStore for DbHandle {
    #[instrument(name = "db.save_chain", skip_all, fields(count = records.len()))]
    async fn save_chain(&self, records: &[ContentRecord]) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        for record in records {
            sqlx::query(
                "INSERT INTO my_contents \
                (id, user_id, social_id, content, media_urls, media_type, publish_status, \
                 media_id, parent_media_id, thread_sequence, is_thread_chain) \
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) \
                ON CONFLICT (parent_media_id, thread_sequence) DO UPDATE SET \
                    content = EXCLUDED.content, \
                    media_urls = EXCLUDED.media_urls, \
                    media_type = EXCLUDED.media_type, \
                    publish_status = EXCLUDED.publish_status, \
                    media_id = EXCLUDED.media_id, \
                    is_thread_chain = EXCLUDED.is_thread_chain, \
                    updated_at = now()",
            )
            .bind(Uuid::new_v4())
            .bind(&record.user_id)
            .bind(&record.social_id)
            .bind(&record.content)
            .bind(&record.media_urls)
            .bind(record.media_type)
            .bind(record.publish_status)
            .bind(&record.media_id)
            .bind(&record.parent_media_id)
            .bind(record.thread_sequence)
            .bind(record.is_thread_chain)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    #[instrument(name = "db.mark_posted", skip(self))]
    async fn mark_posted(
        &self,
        parent_media_id: &str,
        thread_sequence: i32,
        media_id: &str,
    ) -> Result<(), Error> {
        sqlx::query(
            "UPDATE my_contents \
                SET publish_status = 'posted', \
                media_id = $3, \
                updated_at = now() \
            WHERE parent_media_id = $1 AND thread_sequence = $2",
        )
        .bind(parent_media_id)
        .bind(thread_sequence)
        .bind(media_id)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }

    #[instrument(name = "db.mark_failed", skip(self))]
    async fn mark_failed(&self, parent_media_id: &str, thread_sequence: i32) -> Result<(), Error> {
        sqlx::query(
            "UPDATE my_contents \
                SET publish_status = 'failed', \
                updated_at = now() \
            WHERE parent_media_id = $1 AND thread_sequence = $2",
        )
        .bind(parent_media_id)
        .bind(thread_sequence)
        .execute(&*self.pool)
        .await?;

        Ok(())
    }
}
