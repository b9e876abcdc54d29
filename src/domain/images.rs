//! Image review domain - DB queries for `midbot_images`
//!
//! All functions use the generic Executor pattern, allowing them to work with
//! both `&PgPool` (for standalone queries) and `&mut PgConnection` (for transactions).

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{Executor, Postgres};

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ImageRecord {
    pub id: i64,
    pub job_id: Option<String>,
    pub image_index: Option<i32>,
    pub actual_image_url: Option<String>,
    pub review_status: String,
    pub auto_review_status: Option<String>,
    pub auto_review_details: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Values of the `review_status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewStatus {
    Added,
    Processing,
    AutoReviewSuccess,
    AutoReviewError,
}

impl ReviewStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReviewStatus::Added => "added",
            ReviewStatus::Processing => "processing",
            ReviewStatus::AutoReviewSuccess => "auto_review_success",
            ReviewStatus::AutoReviewError => "auto_review_error",
        }
    }
}

/// Get a single image record by id
pub async fn get_image_record<'e, E>(
    executor: E,
    image_id: i64,
) -> Result<Option<ImageRecord>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        SELECT id, job_id, image_index, actual_image_url, review_status,
               auto_review_status, auto_review_details, created_at, updated_at
        FROM midbot_images
        WHERE id = $1
        "#,
    )
    .bind(image_id)
    .fetch_optional(executor)
    .await
}

/// Claim up to `limit` of the oldest rows in `status` and mark them processing.
///
/// Concurrent claimers skip each other's locked rows, so a row is handed to
/// at most one batch.
pub async fn claim_images_with_status<'e, E>(
    executor: E,
    status: ReviewStatus,
    limit: i64,
) -> Result<Vec<ImageRecord>, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query_as(
        r#"
        WITH claimed AS (
            SELECT id
            FROM midbot_images
            WHERE review_status = $1
            ORDER BY created_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE midbot_images m
        SET review_status = $3,
            updated_at = NOW()
        FROM claimed
        WHERE m.id = claimed.id
        RETURNING m.id, m.job_id, m.image_index, m.actual_image_url, m.review_status,
                  m.auto_review_status, m.auto_review_details, m.created_at, m.updated_at
        "#,
    )
    .bind(status.as_str())
    .bind(limit)
    .bind(ReviewStatus::Processing.as_str())
    .fetch_all(executor)
    .await
    .map(|mut rows: Vec<ImageRecord>| {
        // RETURNING does not preserve the CTE order
        rows.sort_by_key(|r| (r.created_at, r.id));
        rows
    })
}

/// Record the auto review outcome for an image
pub async fn update_auto_review_results<'e, E>(
    executor: E,
    image_id: i64,
    auto_review_status: &str,
    review_status: ReviewStatus,
    auto_review_details: &str,
) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE midbot_images
        SET auto_review_status = $2,
            review_status = $3,
            auto_review_details = $4
        WHERE id = $1
        "#,
    )
    .bind(image_id)
    .bind(auto_review_status)
    .bind(review_status.as_str())
    .bind(auto_review_details)
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}

/// Put claimed rows that were never processed back in the queue
pub async fn release_images<'e, E>(executor: E, image_ids: &[i64]) -> Result<u64, sqlx::Error>
where
    E: Executor<'e, Database = Postgres>,
{
    let result = sqlx::query(
        r#"
        UPDATE midbot_images
        SET review_status = $2
        WHERE id = ANY($1) AND review_status = $3
        "#,
    )
    .bind(image_ids)
    .bind(ReviewStatus::Added.as_str())
    .bind(ReviewStatus::Processing.as_str())
    .execute(executor)
    .await?;

    Ok(result.rows_affected())
}
