pub mod config;
pub mod constants;
pub mod domain;
pub mod error;
pub mod logging;
pub mod moderation;
pub mod review;
pub mod routes;
pub mod store;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use review::ReviewService;

#[derive(Clone)]
pub struct AppState {
    pub reviews: Arc<ReviewService>,
    pub batch_size: i64,
    /// Fired on server shutdown so in-flight bulk requests stop scheduling work.
    pub shutdown: CancellationToken,
}
