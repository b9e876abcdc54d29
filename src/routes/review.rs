//! Auto review endpoints (/auto_review/*, /images/*/auto_review, /bulk_auto_review)

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::post,
};
use serde::Serialize;
use std::sync::Arc;

use crate::AppState;
use crate::error::{LogErr, ReviewError};
use crate::review::ReviewOutcome;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auto_review/{job_id}/{image_index}", post(auto_review))
        .route("/images/{id}/auto_review", post(auto_review_record))
        .route("/bulk_auto_review", post(bulk_auto_review))
}

#[derive(Debug, Serialize)]
struct AutoReviewResponse {
    message: &'static str,
    categories: String,
    details: String,
}

#[derive(Debug, Serialize)]
struct BulkReviewResponse {
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<Vec<ReviewOutcome>>,
}

/// POST /auto_review/:job_id/:image_index - Review a CDN image without persisting
async fn auto_review(
    State(state): State<Arc<AppState>>,
    Path((job_id, image_index)): Path<(String, i32)>,
) -> Result<Json<AutoReviewResponse>, StatusCode> {
    let verdict = state
        .reviews
        .review_job_image(&job_id, image_index)
        .await
        .log_500("Error in auto_review endpoint")?;

    Ok(Json(AutoReviewResponse {
        message: "Auto review success",
        categories: verdict.label.to_string(),
        details: verdict.details,
    }))
}

/// POST /images/:id/auto_review - Review a stored record and persist the result
async fn auto_review_record(
    State(state): State<Arc<AppState>>,
    Path(image_id): Path<i64>,
) -> Result<Json<ReviewOutcome>, StatusCode> {
    match state.reviews.review_by_id(image_id).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(ReviewError::NotFound(_)) => Err(StatusCode::NOT_FOUND),
        Err(e) => Err(e).log_500("Auto review record error"),
    }
}

/// POST /bulk_auto_review - Review one batch of pending images
async fn bulk_auto_review(
    State(state): State<Arc<AppState>>,
) -> Result<Json<BulkReviewResponse>, StatusCode> {
    let report = state
        .reviews
        .run_batch(state.batch_size, &state.shutdown)
        .await
        .log_500("Bulk auto review error")?;

    if report.is_empty() {
        return Ok(Json(BulkReviewResponse {
            message: "No images found with review_status='added'.",
            results: None,
        }));
    }

    Ok(Json(BulkReviewResponse {
        message: "Bulk processing completed.",
        results: Some(report.outcomes),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::moderation::Moderator;
    use crate::review::ReviewService;
    use crate::routes::build_router;
    use crate::testing::{
        CountingCompressor, FakeFetcher, MemoryStore, ScriptedClassifier, analysis_json,
        image_record, png_bytes, test_settings,
    };
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use serde_json::{Value, json};
    use tokio_util::sync::CancellationToken;
    use tower::ServiceExt;

    fn app(fetcher: FakeFetcher, store: Arc<MemoryStore>) -> Router {
        let fetcher = Arc::new(fetcher);
        let moderator = Moderator::new(
            fetcher.clone(),
            Arc::new(ScriptedClassifier::always(analysis_json(&[
                "contains_humans",
                "contains_brands",
            ]))),
            Arc::new(CountingCompressor::working()),
            test_settings(),
        );
        let reviews = ReviewService::new(fetcher, moderator, store, "https://cdn.example", 2);
        build_router(Arc::new(AppState {
            reviews: Arc::new(reviews),
            batch_size: 10,
            shutdown: CancellationToken::new(),
        }))
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&body).unwrap_or_else(|_| {
            Value::String(String::from_utf8_lossy(&body).into_owned())
        });
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (status, body) = call(
            app(FakeFetcher::failing(), Arc::new(MemoryStore::default())),
            "GET",
            "/health",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!("ok"));
    }

    #[tokio::test]
    async fn test_auto_review_response_shape() {
        let (status, body) = call(
            app(FakeFetcher::serving(png_bytes(16, 16)), Arc::new(MemoryStore::default())),
            "POST",
            "/auto_review/job-1/2",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({
                "message": "Auto review success",
                "categories": "H1, BR",
                "details": "Synthetic test image."
            })
        );
    }

    #[tokio::test]
    async fn test_auto_review_download_failure_is_500() {
        let (status, _) = call(
            app(FakeFetcher::failing(), Arc::new(MemoryStore::default())),
            "POST",
            "/auto_review/job-1/2",
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_record_is_404() {
        let (status, _) = call(
            app(FakeFetcher::failing(), Arc::new(MemoryStore::default())),
            "POST",
            "/images/42/auto_review",
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_record_review_persists() {
        let store = Arc::new(MemoryStore::with_rows(vec![image_record(5, Some("j"), Some(1), None)]));
        let (status, body) = call(
            app(FakeFetcher::serving(png_bytes(8, 8)), store.clone()),
            "POST",
            "/images/5/auto_review",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "success");
        assert_eq!(body["categories"], "H1, BR");
        assert_eq!(store.row(5).unwrap().auto_review_status.as_deref(), Some("H1, BR"));
    }

    #[tokio::test]
    async fn test_bulk_auto_review() {
        let store = Arc::new(MemoryStore::default());
        let (status, body) = call(
            app(FakeFetcher::serving(png_bytes(8, 8)), store),
            "POST",
            "/bulk_auto_review",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"message": "No images found with review_status='added'."}));

        let store = Arc::new(MemoryStore::with_rows(vec![
            image_record(1, Some("a"), Some(0), None),
            image_record(2, None, None, None),
        ]));
        let (status, body) = call(
            app(FakeFetcher::serving(png_bytes(8, 8)), store),
            "POST",
            "/bulk_auto_review",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Bulk processing completed.");
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        let errors: Vec<&Value> = results.iter().filter(|r| r["status"] == "error").collect();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0]["image_id"], 2);
    }
}
