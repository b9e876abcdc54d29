//! Persistence seam for the review service.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::domain::images::{self, ImageRecord, ReviewStatus};
use crate::moderation::Verdict;

/// Column values written back for one reviewed image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReviewUpdate {
    pub auto_review_status: String,
    pub review_status: ReviewStatus,
    pub details: String,
}

impl ReviewUpdate {
    pub fn from_verdict(verdict: &Verdict) -> Self {
        let review_status = if verdict.label.is_error() {
            ReviewStatus::AutoReviewError
        } else {
            ReviewStatus::AutoReviewSuccess
        };
        Self {
            auto_review_status: verdict.label.to_string(),
            review_status,
            details: verdict.details.clone(),
        }
    }

    /// The pipeline never ran, e.g. the download or URL lookup failed.
    pub fn failure(details: impl Into<String>) -> Self {
        Self {
            auto_review_status: ReviewStatus::AutoReviewError.as_str().to_string(),
            review_status: ReviewStatus::AutoReviewError,
            details: details.into(),
        }
    }
}

#[async_trait]
pub trait ReviewStore: Send + Sync {
    /// Claim up to `limit` rows still in `added` and mark them `processing`.
    async fn claim_pending(&self, limit: i64) -> Result<Vec<ImageRecord>, sqlx::Error>;

    async fn get(&self, image_id: i64) -> Result<Option<ImageRecord>, sqlx::Error>;

    async fn record_result(&self, image_id: i64, update: &ReviewUpdate) -> Result<(), sqlx::Error>;

    /// Return claimed rows to `added`.
    async fn release(&self, image_ids: &[i64]) -> Result<(), sqlx::Error>;
}

pub struct PgReviewStore {
    pool: PgPool,
}

impl PgReviewStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReviewStore for PgReviewStore {
    async fn claim_pending(&self, limit: i64) -> Result<Vec<ImageRecord>, sqlx::Error> {
        images::claim_images_with_status(&self.pool, ReviewStatus::Added, limit).await
    }

    async fn get(&self, image_id: i64) -> Result<Option<ImageRecord>, sqlx::Error> {
        images::get_image_record(&self.pool, image_id).await
    }

    async fn record_result(&self, image_id: i64, update: &ReviewUpdate) -> Result<(), sqlx::Error> {
        tracing::info!(
            "[store] Updating auto_review_status for {} = {}",
            image_id,
            update.auto_review_status
        );
        let updated = images::update_auto_review_results(
            &self.pool,
            image_id,
            &update.auto_review_status,
            update.review_status,
            &update.details,
        )
        .await?;
        if updated == 0 {
            tracing::warn!("[store] No midbot_images row with id {}", image_id);
        }
        Ok(())
    }

    async fn release(&self, image_ids: &[i64]) -> Result<(), sqlx::Error> {
        if image_ids.is_empty() {
            return Ok(());
        }
        let released = images::release_images(&self.pool, image_ids).await?;
        tracing::info!("[store] Released {} unprocessed images back to 'added'", released);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::{Category, DebugTrace, Label};

    fn verdict(label: Label) -> Verdict {
        Verdict {
            label,
            details: "details".into(),
            trace: DebugTrace::default(),
        }
    }

    #[test]
    fn test_update_from_flagged_verdict() {
        let update = ReviewUpdate::from_verdict(&verdict(Label::Flags(vec![
            Category::H1,
            Category::BR,
        ])));
        assert_eq!(update.auto_review_status, "H1, BR");
        assert_eq!(update.review_status, ReviewStatus::AutoReviewSuccess);
        assert_eq!(update.details, "details");
    }

    #[test]
    fn test_update_from_error_verdict() {
        let update = ReviewUpdate::from_verdict(&verdict(Label::Error));
        assert_eq!(update.auto_review_status, "error");
        assert_eq!(update.review_status, ReviewStatus::AutoReviewError);
    }

    #[test]
    fn test_failure_update() {
        let update = ReviewUpdate::failure("No image URL found for image_id=4");
        assert_eq!(update.auto_review_status, "auto_review_error");
        assert_eq!(update.review_status, ReviewStatus::AutoReviewError);
    }
}
