pub mod category;
pub mod classify;
pub mod compress;
pub mod fetch;
pub mod normalize;
pub mod orchestrator;
pub mod retry;
pub mod validate;

pub use category::{Category, Label, derive_label};
pub use classify::{Classifier, GeminiClient, GeminiSettings, ImagePayload};
pub use compress::{Compressor, ImageCompressor};
pub use fetch::{HttpFetcher, ImageFetcher};
pub use normalize::{AnalysisRecord, normalize};
pub use orchestrator::{DebugTrace, ModerationSettings, Moderator, TraceStep, Verdict};
pub use retry::RetryPolicy;
pub use validate::{ImageCheck, validate};
