//! Review service: download, moderate and persist images, one at a time or in
//! bounded-concurrency batches.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use sqlx::PgPool;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::domain::images::ImageRecord;
use crate::error::ReviewError;
use crate::moderation::{
    GeminiClient, HttpFetcher, ImageCompressor, ImageFetcher, Moderator, Verdict,
};
use crate::store::{PgReviewStore, ReviewStore, ReviewUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutcomeStatus {
    Success,
    Error,
}

/// Per-image result reported by batch runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReviewOutcome {
    pub image_id: i64,
    pub status: OutcomeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub categories: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ReviewOutcome {
    fn from_verdict(image_id: i64, verdict: &Verdict) -> Self {
        let failed = verdict.label.is_error();
        Self {
            image_id,
            status: if failed {
                OutcomeStatus::Error
            } else {
                OutcomeStatus::Success
            },
            categories: Some(verdict.label.to_string()),
            details: Some(verdict.details.clone()),
            error: failed.then(|| verdict.details.clone()),
        }
    }

    pub fn failed(image_id: i64, error: impl Into<String>) -> Self {
        Self {
            image_id,
            status: OutcomeStatus::Error,
            categories: None,
            details: None,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[derive(Debug, Default, Serialize)]
pub struct BatchReport {
    pub outcomes: Vec<ReviewOutcome>,
    pub succeeded: usize,
    pub failed: usize,
    /// Claimed rows returned to `added` because the batch was cancelled.
    pub released: usize,
}

impl BatchReport {
    fn push(&mut self, outcome: ReviewOutcome) {
        if outcome.is_success() {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
        self.outcomes.push(outcome);
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty() && self.released == 0
    }
}

pub struct ReviewService {
    fetcher: Arc<dyn ImageFetcher>,
    moderator: Moderator,
    store: Arc<dyn ReviewStore>,
    cdn_base_url: String,
    concurrency: usize,
}

impl ReviewService {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        moderator: Moderator,
        store: Arc<dyn ReviewStore>,
        cdn_base_url: impl Into<String>,
        concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            moderator,
            store,
            cdn_base_url: cdn_base_url.into(),
            concurrency: concurrency.max(1),
        }
    }

    /// Wire the production collaborators: reqwest fetcher, Gemini, Postgres.
    pub fn from_config(config: &Config, pool: PgPool) -> anyhow::Result<Self> {
        let fetcher: Arc<dyn ImageFetcher> = Arc::new(
            HttpFetcher::new(config.fetch_timeout).context("Failed to build CDN client")?,
        );
        let classifier =
            GeminiClient::new(config.gemini.clone()).context("Failed to build Gemini client")?;
        let moderator = Moderator::new(
            Arc::clone(&fetcher),
            Arc::new(classifier),
            Arc::new(ImageCompressor),
            config.moderation_settings(),
        );

        Ok(Self::new(
            fetcher,
            moderator,
            Arc::new(PgReviewStore::new(pool)),
            config.cdn_base_url.clone(),
            config.concurrency,
        ))
    }

    pub fn image_url(&self, job_id: &str, image_index: i32) -> String {
        format!("{}/{}/0_{}.png", self.cdn_base_url, job_id, image_index)
    }

    /// CDN URL built from the job coordinates, else the stored image URL.
    pub fn record_url(&self, record: &ImageRecord) -> Option<String> {
        match (record.job_id.as_deref(), record.image_index) {
            (Some(job_id), Some(index)) if !job_id.trim().is_empty() => {
                Some(self.image_url(job_id.trim(), index))
            }
            _ => record
                .actual_image_url
                .as_deref()
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(str::to_string),
        }
    }

    /// Download and moderate one CDN image without touching the database.
    pub async fn review_job_image(
        &self,
        job_id: &str,
        image_index: i32,
    ) -> Result<Verdict, ReviewError> {
        let url = self.image_url(job_id, image_index);
        info!("[review] Constructed Image URL: {}", url);

        let data = self.fetcher.fetch(&url).await?;
        Ok(self.moderator.moderate(data, &url).await)
    }

    /// Review a stored record and persist the outcome. Only store failures
    /// are returned as errors; everything else is recorded on the row.
    pub async fn review_record(&self, record: &ImageRecord) -> Result<ReviewOutcome, ReviewError> {
        let (update, outcome) = match self.record_url(record) {
            None => {
                let err = ReviewError::MissingUrl(record.id).to_string();
                warn!("[review] {}", err);
                (ReviewUpdate::failure(&err), ReviewOutcome::failed(record.id, err))
            }
            Some(url) => match self.fetcher.fetch(&url).await {
                Err(e) => {
                    warn!("[review] Image {} download failed: {}", record.id, e);
                    let err = e.to_string();
                    (ReviewUpdate::failure(&err), ReviewOutcome::failed(record.id, err))
                }
                Ok(data) => {
                    let verdict = self.moderator.moderate(data, &url).await;
                    (
                        ReviewUpdate::from_verdict(&verdict),
                        ReviewOutcome::from_verdict(record.id, &verdict),
                    )
                }
            },
        };

        self.store.record_result(record.id, &update).await?;
        Ok(outcome)
    }

    pub async fn review_by_id(&self, image_id: i64) -> Result<ReviewOutcome, ReviewError> {
        let record = self
            .store
            .get(image_id)
            .await?
            .ok_or(ReviewError::NotFound(image_id))?;
        self.review_record(&record).await
    }

    /// Claim up to `limit` pending rows and review them.
    ///
    /// The batch runs on its own task. Dropping the returned future (an HTTP
    /// client hanging up) leaves the claimed rows to be reviewed or released
    /// as usual instead of stuck in `processing`.
    pub async fn run_batch(
        self: &Arc<Self>,
        limit: i64,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, ReviewError> {
        if cancel.is_cancelled() {
            return Ok(BatchReport::default());
        }

        let service = Arc::clone(self);
        let cancel = cancel.clone();
        tokio::spawn(service.claim_and_process(limit, cancel)).await?
    }

    async fn claim_and_process(
        self: Arc<Self>,
        limit: i64,
        cancel: CancellationToken,
    ) -> Result<BatchReport, ReviewError> {
        let records = self.store.claim_pending(limit).await?;
        if records.is_empty() {
            return Ok(BatchReport::default());
        }

        info!("[review] Claimed {} images", records.len());
        Ok(self.process_records(records, &cancel).await)
    }

    /// Review `records` with at most `concurrency` in flight.
    ///
    /// A failing or panicking review never affects its siblings. Once `cancel`
    /// fires no new reviews start; rows that never started are released.
    async fn process_records(
        self: &Arc<Self>,
        records: Vec<ImageRecord>,
        cancel: &CancellationToken,
    ) -> BatchReport {
        let mut queue: VecDeque<ImageRecord> = records.into();
        let mut tasks = JoinSet::new();
        let mut in_flight = HashSet::new();
        let mut report = BatchReport::default();

        loop {
            while tasks.len() < self.concurrency && !cancel.is_cancelled() {
                let Some(record) = queue.pop_front() else {
                    break;
                };
                in_flight.insert(record.id);
                let service = Arc::clone(self);
                tasks.spawn(async move {
                    let image_id = record.id;
                    // inner task so a panic is still attributed to its image
                    let result =
                        tokio::spawn(async move { service.review_record(&record).await }).await;
                    (image_id, result)
                });
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };

            if let Ok((image_id, _)) = &joined {
                in_flight.remove(image_id);
            }

            match joined {
                Ok((_, Ok(Ok(outcome)))) => report.push(outcome),
                Ok((image_id, Ok(Err(e)))) => {
                    error!("[review] Failed to record image {}: {}", image_id, e);
                    report.push(ReviewOutcome::failed(image_id, e.to_string()));
                }
                Ok((image_id, Err(e))) => {
                    error!("[review] Task for image {} panicked: {}", image_id, e);
                    let outcome = self.record_task_failure(image_id, &e.to_string()).await;
                    report.push(outcome);
                }
                // settled below through `in_flight`
                Err(e) => error!("[review] Worker task failed: {}", e),
            }
        }

        // rows whose worker died without reporting back
        for image_id in in_flight {
            let outcome = self.record_task_failure(image_id, "worker aborted").await;
            report.push(outcome);
        }

        if !queue.is_empty() {
            let ids: Vec<i64> = queue.iter().map(|r| r.id).collect();
            warn!(
                "[review] Cancelled with {} images unstarted, releasing them",
                ids.len()
            );
            match self.store.release(&ids).await {
                Ok(()) => report.released = ids.len(),
                Err(e) => error!("[review] Failed to release images {:?}: {}", ids, e),
            }
        }

        info!(
            "[review] Batch done: {} succeeded, {} failed, {} released",
            report.succeeded, report.failed, report.released
        );
        report
    }

    async fn record_task_failure(&self, image_id: i64, reason: &str) -> ReviewOutcome {
        let message = format!("Review task failed: {reason}");
        if let Err(e) = self
            .store
            .record_result(image_id, &ReviewUpdate::failure(&message))
            .await
        {
            error!("[review] Failed to record task failure for {}: {}", image_id, e);
        }
        ReviewOutcome::failed(image_id, message)
    }
}

/// Running totals across batches, printed when a bulk run ends.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub batches: usize,
}

impl RunSummary {
    pub fn record(&mut self, report: &BatchReport) {
        self.batches += 1;
        self.succeeded += report.succeeded;
        self.failed += report.failed;
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed
    }

    pub fn render(&self, elapsed: Duration) -> String {
        let total = self.total();
        let percent = |n: usize| {
            if total == 0 {
                0.0
            } else {
                n as f64 / total as f64 * 100.0
            }
        };
        let average = if total == 0 {
            "N/A".to_string()
        } else {
            format!("{:.2} seconds per image", elapsed.as_secs_f64() / total as f64)
        };
        let rule = "=".repeat(50);

        format!(
            "{rule}\nPROCESSING SUMMARY\n{rule}\n\
             Total images processed: {total}\n\
             Successful: {} ({:.1}% of total)\n\
             Failed: {} ({:.1}% of total)\n\
             Time elapsed: {}\n\
             Average processing time: {average}\n\
             {rule}\n\
             Total batches processed: {}",
            self.succeeded,
            percent(self.succeeded),
            self.failed,
            percent(self.failed),
            format_elapsed(elapsed),
            self.batches,
        )
    }
}

fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::images::ReviewStatus;
    use crate::error::FetchError;
    use crate::testing::{
        CountingCompressor, FakeFetcher, MemoryStore, ScriptedClassifier, analysis_json,
        image_record, png_bytes, test_settings,
    };
    use async_trait::async_trait;
    use bytes::Bytes;

    const CDN: &str = "https://cdn.example";

    fn service_with(
        fetcher: Arc<dyn ImageFetcher>,
        store: Arc<MemoryStore>,
        concurrency: usize,
    ) -> Arc<ReviewService> {
        let moderator = Moderator::new(
            Arc::clone(&fetcher),
            Arc::new(ScriptedClassifier::always(analysis_json(&["contains_humans"]))),
            Arc::new(CountingCompressor::working()),
            test_settings(),
        );
        Arc::new(ReviewService::new(fetcher, moderator, store, CDN, concurrency))
    }

    fn service(fetcher: FakeFetcher, store: Arc<MemoryStore>) -> Arc<ReviewService> {
        service_with(Arc::new(fetcher), store, 4)
    }

    #[test]
    fn test_image_url_construction() {
        let svc = service(FakeFetcher::failing(), Arc::new(MemoryStore::default()));
        assert_eq!(svc.image_url("job-1", 3), "https://cdn.example/job-1/0_3.png");
    }

    #[test]
    fn test_record_url_prefers_job_coordinates() {
        let svc = service(FakeFetcher::failing(), Arc::new(MemoryStore::default()));
        let both = image_record(1, Some("abc"), Some(2), Some("https://other/x.png"));
        assert_eq!(svc.record_url(&both).as_deref(), Some("https://cdn.example/abc/0_2.png"));

        let url_only = image_record(2, None, None, Some("https://other/x.png"));
        assert_eq!(svc.record_url(&url_only).as_deref(), Some("https://other/x.png"));

        let nothing = image_record(3, Some(""), Some(1), Some(" "));
        assert_eq!(svc.record_url(&nothing), None);
    }

    #[tokio::test]
    async fn test_review_record_persists_success() {
        let store = Arc::new(MemoryStore::with_rows(vec![image_record(1, Some("job"), Some(0), None)]));
        let svc = service(FakeFetcher::serving(png_bytes(16, 16)), store.clone());

        let outcome = svc.review_by_id(1).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Success);
        assert_eq!(outcome.categories.as_deref(), Some("H1"));

        let row = store.row(1).unwrap();
        assert_eq!(row.review_status, "auto_review_success");
        assert_eq!(row.auto_review_status.as_deref(), Some("H1"));
        assert_eq!(row.auto_review_details.as_deref(), Some("Synthetic test image."));
    }

    #[tokio::test]
    async fn test_review_record_without_url_records_error() {
        let store = Arc::new(MemoryStore::with_rows(vec![image_record(7, None, None, None)]));
        let svc = service(FakeFetcher::serving(png_bytes(16, 16)), store.clone());

        let outcome = svc.review_by_id(7).await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Error);
        assert_eq!(outcome.error.as_deref(), Some("No image URL found for image_id=7"));

        let row = store.row(7).unwrap();
        assert_eq!(row.review_status, "auto_review_error");
        assert_eq!(row.auto_review_status.as_deref(), Some("auto_review_error"));
    }

    #[tokio::test]
    async fn test_download_failure_records_error_details() {
        let store = Arc::new(MemoryStore::with_rows(vec![image_record(3, Some("gone"), Some(1), None)]));
        let svc = service(FakeFetcher::failing(), store.clone());

        let outcome = svc.review_by_id(3).await.unwrap();
        let expected = "Failed to download image https://cdn.example/gone/0_1.png: server returned 404 Not Found";
        assert_eq!(outcome.error.as_deref(), Some(expected));
        assert_eq!(store.row(3).unwrap().auto_review_details.as_deref(), Some(expected));
    }

    #[tokio::test]
    async fn test_unknown_record_is_not_found() {
        let svc = service(FakeFetcher::failing(), Arc::new(MemoryStore::default()));
        assert!(matches!(svc.review_by_id(99).await, Err(ReviewError::NotFound(99))));
    }

    #[tokio::test]
    async fn test_review_job_image_uses_cdn_url() {
        let fetcher = Arc::new(FakeFetcher::serving(png_bytes(8, 8)));
        let svc = service_with(fetcher.clone(), Arc::new(MemoryStore::default()), 1);

        let verdict = svc.review_job_image("job-9", 2).await.unwrap();
        assert_eq!(verdict.label.to_string(), "H1");
        assert_eq!(fetcher.requested(), vec!["https://cdn.example/job-9/0_2.png".to_string()]);
    }

    #[tokio::test]
    async fn test_batch_failure_does_not_affect_siblings() {
        let store = Arc::new(MemoryStore::with_rows(vec![
            image_record(1, Some("a"), Some(0), None),
            image_record(2, Some("missing"), Some(0), None),
            image_record(3, Some("c"), Some(0), None),
        ]));
        let fetcher = FakeFetcher::failing()
            .with("https://cdn.example/a/0_0.png", png_bytes(8, 8))
            .with("https://cdn.example/c/0_0.png", png_bytes(8, 8));
        let svc = service(fetcher, store.clone());

        let report = svc.run_batch(10, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(report.outcomes.len(), 3);
        assert_eq!(store.row(1).unwrap().review_status, "auto_review_success");
        assert_eq!(store.row(2).unwrap().review_status, "auto_review_error");
        assert_eq!(store.row(3).unwrap().review_status, "auto_review_success");

        let next = svc.run_batch(10, &CancellationToken::new()).await.unwrap();
        assert!(next.is_empty());
    }

    #[tokio::test]
    async fn test_batch_respects_limit() {
        let store = Arc::new(MemoryStore::with_rows(
            (1..=5).map(|id| image_record(id, Some("j"), Some(0), None)).collect(),
        ));
        let svc = service(FakeFetcher::serving(png_bytes(8, 8)), store.clone());

        let report = svc.run_batch(2, &CancellationToken::new()).await.unwrap();
        assert_eq!(report.outcomes.len(), 2);
        let ids: Vec<i64> = report.outcomes.iter().map(|o| o.image_id).collect();
        assert!(ids.contains(&1) && ids.contains(&2));
        assert_eq!(store.row(5).unwrap().review_status, ReviewStatus::Added.as_str());
    }

    struct CancellingFetcher {
        inner: FakeFetcher,
        cancel: CancellationToken,
    }

    #[async_trait]
    impl ImageFetcher for CancellingFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            self.cancel.cancel();
            self.inner.fetch(url).await
        }
    }

    #[tokio::test]
    async fn test_cancellation_releases_unstarted_rows() {
        let store = Arc::new(MemoryStore::with_rows(
            (1..=3).map(|id| image_record(id, Some("j"), Some(0), None)).collect(),
        ));
        let cancel = CancellationToken::new();
        let fetcher = CancellingFetcher {
            inner: FakeFetcher::serving(png_bytes(8, 8)),
            cancel: cancel.clone(),
        };
        let svc = service_with(Arc::new(fetcher), store.clone(), 1);

        let report = svc.run_batch(10, &cancel).await.unwrap();
        assert_eq!(report.outcomes.len(), 1);
        assert_eq!(report.released, 2);
        assert_eq!(store.row(1).unwrap().review_status, "auto_review_success");
        assert_eq!(store.row(2).unwrap().review_status, "added");
        assert_eq!(store.row(3).unwrap().review_status, "added");
        assert_eq!(store.released(), vec![2, 3]);
    }

    struct SlowFetcher {
        inner: FakeFetcher,
        delay: Duration,
    }

    #[async_trait]
    impl ImageFetcher for SlowFetcher {
        async fn fetch(&self, url: &str) -> Result<Bytes, FetchError> {
            tokio::time::sleep(self.delay).await;
            self.inner.fetch(url).await
        }
    }

    #[tokio::test]
    async fn test_dropped_batch_still_settles_claimed_rows() {
        let store = Arc::new(MemoryStore::with_rows(
            (1..=3).map(|id| image_record(id, Some("j"), Some(0), None)).collect(),
        ));
        let fetcher = SlowFetcher {
            inner: FakeFetcher::serving(png_bytes(8, 8)),
            delay: Duration::from_millis(100),
        };
        let svc = service_with(Arc::new(fetcher), store.clone(), 1);
        let cancel = CancellationToken::new();

        let dropped =
            tokio::time::timeout(Duration::from_millis(30), svc.run_batch(10, &cancel)).await;
        assert!(dropped.is_err());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let statuses: Vec<String> = (1..=3)
                .map(|id| store.row(id).unwrap().review_status)
                .collect();
            if statuses.iter().all(|s| s == "auto_review_success") {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "rows left unsettled: {statuses:?}"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(store.released().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_token_claims_nothing() {
        let store = Arc::new(MemoryStore::with_rows(vec![image_record(1, Some("j"), Some(0), None)]));
        let svc = service(FakeFetcher::serving(png_bytes(8, 8)), store.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = svc.run_batch(10, &cancel).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(store.row(1).unwrap().review_status, "added");
    }

    #[test]
    fn test_outcome_serialization_shape() {
        let failed = serde_json::to_value(ReviewOutcome::failed(4, "boom")).unwrap();
        assert_eq!(
            failed,
            serde_json::json!({"image_id": 4, "status": "error", "error": "boom"})
        );
    }

    #[test]
    fn test_summary_render() {
        let mut summary = RunSummary::default();
        let report = BatchReport {
            outcomes: Vec::new(),
            succeeded: 3,
            failed: 1,
            released: 0,
        };
        summary.record(&report);
        summary.record(&BatchReport::default());

        let text = summary.render(Duration::from_secs(3725));
        assert!(text.contains("Total images processed: 4"));
        assert!(text.contains("Successful: 3 (75.0% of total)"));
        assert!(text.contains("Failed: 1 (25.0% of total)"));
        assert!(text.contains("Time elapsed: 1:02:05"));
        assert!(text.contains("Average processing time: 931.25 seconds per image"));
        assert!(text.ends_with("Total batches processed: 2"));

        let empty = RunSummary::default().render(Duration::from_secs(5));
        assert!(empty.contains("Successful: 0 (0.0% of total)"));
        assert!(empty.contains("Average processing time: N/A"));
    }
}
