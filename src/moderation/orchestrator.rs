//! Per-image moderation pipeline.
//!
//! Validate, compress with a bounded budget, fall back to a single redownload,
//! then classify with retries and derive the category label. Every path ends
//! in a `Verdict`; failures become an `error` label rather than an `Err`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::category::{Label, derive_label};
use super::classify::{ANALYSIS_PROMPT, Classifier, ImagePayload};
use super::compress::{Compressor, DEFAULT_QUALITY};
use super::fetch::ImageFetcher;
use super::normalize::normalize;
use super::retry::{RetryPolicy, retry};
use super::validate::{ImageCheck, validate};
use crate::error::ClassifyError;

pub const DEFAULT_MIME_TYPE: &str = "image/png";
pub const REDOWNLOAD_INVALID: &str = "Redownloaded image is invalid.";

#[derive(Debug, Clone, Copy)]
pub struct ModerationSettings {
    pub compression_quality: u8,
    pub compression: RetryPolicy,
    pub classification: RetryPolicy,
}

impl Default for ModerationSettings {
    fn default() -> Self {
        Self {
            compression_quality: DEFAULT_QUALITY,
            compression: RetryPolicy::immediate(2),
            classification: RetryPolicy::new(3, Duration::from_millis(500)),
        }
    }
}

/// One recorded pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceStep {
    Validation {
        redownloaded: bool,
        check: ImageCheck,
    },
    Compression {
        attempt: u32,
        redownloaded: bool,
        compressed_len: Option<usize>,
    },
    Redownload {
        bytes: Option<usize>,
        error: Option<String>,
    },
    UncompressedFallback,
    Classification {
        attempt: u32,
        error: Option<String>,
    },
    Resolved {
        label: Label,
    },
}

/// Append-only diagnostic log of a single moderation run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DebugTrace {
    steps: Vec<TraceStep>,
}

impl DebugTrace {
    fn push(&mut self, step: TraceStep) {
        debug!(?step, "[moderation] step");
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[TraceStep] {
        &self.steps
    }

    pub fn compression_attempts(&self) -> usize {
        self.count(|s| matches!(s, TraceStep::Compression { .. }))
    }

    pub fn redownloads(&self) -> usize {
        self.count(|s| matches!(s, TraceStep::Redownload { .. }))
    }

    pub fn classification_attempts(&self) -> usize {
        self.count(|s| matches!(s, TraceStep::Classification { .. }))
    }

    pub fn used_uncompressed_fallback(&self) -> bool {
        self.count(|s| matches!(s, TraceStep::UncompressedFallback)) > 0
    }

    fn count(&self, pred: impl Fn(&TraceStep) -> bool) -> usize {
        self.steps.iter().filter(|s| pred(s)).count()
    }
}

/// Outcome of `Moderator::moderate`.
#[derive(Debug, Clone)]
pub struct Verdict {
    pub label: Label,
    pub details: String,
    pub trace: DebugTrace,
}

pub struct Moderator {
    fetcher: Arc<dyn ImageFetcher>,
    classifier: Arc<dyn Classifier>,
    compressor: Arc<dyn Compressor>,
    settings: ModerationSettings,
}

impl Moderator {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        classifier: Arc<dyn Classifier>,
        compressor: Arc<dyn Compressor>,
        settings: ModerationSettings,
    ) -> Self {
        Self {
            fetcher,
            classifier,
            compressor,
            settings,
        }
    }

    /// Run the full pipeline for `data`, which was downloaded from `source_url`.
    pub async fn moderate(&self, data: Bytes, source_url: &str) -> Verdict {
        let mut trace = DebugTrace::default();

        let check = check_image(data.clone()).await;
        if !check.ok {
            warn!("[moderation] Image from {} failed validation, attempting to continue", source_url);
        }
        trace.push(TraceStep::Validation {
            redownloaded: false,
            check,
        });

        let mut format = check.format;
        let mut original = data;
        let mut compressed = self
            .compress_with_budget(&original, self.settings.compression, false, &mut trace)
            .await;

        if compressed.is_none() {
            info!("[moderation] Compression failed, redownloading {}", source_url);
            let fresh = match self.fetcher.fetch(source_url).await {
                Ok(fresh) => {
                    trace.push(TraceStep::Redownload {
                        bytes: Some(fresh.len()),
                        error: None,
                    });
                    fresh
                }
                Err(e) => {
                    warn!("[moderation] Image redownload failed: {}", e);
                    trace.push(TraceStep::Redownload {
                        bytes: None,
                        error: Some(e.to_string()),
                    });
                    return terminal(trace, format!("Image redownload failed: {e}"));
                }
            };

            let check = check_image(fresh.clone()).await;
            trace.push(TraceStep::Validation {
                redownloaded: true,
                check,
            });
            if !check.ok {
                warn!("[moderation] Redownloaded image from {} is invalid", source_url);
                return terminal(trace, REDOWNLOAD_INVALID.to_string());
            }

            format = check.format;
            original = fresh;
            compressed = self
                .compress_with_budget(&original, RetryPolicy::immediate(1), true, &mut trace)
                .await;

            if compressed.is_none() {
                warn!("[moderation] Compression still failing, classifying uncompressed image");
                trace.push(TraceStep::UncompressedFallback);
            }
        }

        let payload = ImagePayload {
            mime_type: format
                .map(|f| f.to_mime_type())
                .unwrap_or(DEFAULT_MIME_TYPE)
                .to_string(),
            data: compressed.unwrap_or(original),
        };

        self.classify(payload, trace).await
    }

    async fn compress_with_budget(
        &self,
        data: &Bytes,
        policy: RetryPolicy,
        redownloaded: bool,
        trace: &mut DebugTrace,
    ) -> Option<Bytes> {
        let quality = self.settings.compression_quality;
        let result = retry(
            policy,
            |attempt| {
                let compressor = Arc::clone(&self.compressor);
                let data = data.clone();
                async move {
                    let output =
                        tokio::task::spawn_blocking(move || compressor.compress(&data, quality))
                            .await
                            .unwrap_or_else(|e| {
                                warn!("[moderation] Compression task failed: {}", e);
                                None
                            });
                    match output {
                        Some(bytes) if !bytes.is_empty() => Ok((attempt, Bytes::from(bytes))),
                        _ => Err(()),
                    }
                }
            },
            |attempt, _: &()| {
                warn!("[moderation] Compression attempt {} failed", attempt);
                trace.push(TraceStep::Compression {
                    attempt,
                    redownloaded,
                    compressed_len: None,
                });
            },
        )
        .await;

        match result {
            Ok((attempt, bytes)) => {
                trace.push(TraceStep::Compression {
                    attempt,
                    redownloaded,
                    compressed_len: Some(bytes.len()),
                });
                Some(bytes)
            }
            Err(_) => None,
        }
    }

    async fn classify(&self, payload: ImagePayload, mut trace: DebugTrace) -> Verdict {
        let classifier = &self.classifier;
        let image = &payload;
        let result = retry(
            self.settings.classification,
            move |attempt| async move {
                classifier
                    .classify(ANALYSIS_PROMPT, image)
                    .await
                    .map(|text| (attempt, text))
            },
            |attempt, e: &ClassifyError| {
                warn!("[moderation] Error analyzing image (attempt {}): {}", attempt, e);
                trace.push(TraceStep::Classification {
                    attempt,
                    error: Some(e.to_string()),
                });
            },
        )
        .await;

        let text = match result {
            Ok((attempt, text)) => {
                trace.push(TraceStep::Classification {
                    attempt,
                    error: None,
                });
                text
            }
            Err(exhausted) => {
                return terminal(
                    trace,
                    format!(
                        "Failed after {} retries: {}",
                        exhausted.attempts, exhausted.last_error
                    ),
                );
            }
        };

        let record = normalize(&text);
        let label = derive_label(&record);
        info!("[moderation] Moderation resolved: {}", label);
        trace.push(TraceStep::Resolved {
            label: label.clone(),
        });

        Verdict {
            label,
            details: record.details().to_string(),
            trace,
        }
    }
}

async fn check_image(data: Bytes) -> ImageCheck {
    tokio::task::spawn_blocking(move || validate(&data))
        .await
        .unwrap_or_else(|e| {
            warn!("[moderation] Validation task failed: {}", e);
            ImageCheck::invalid(None)
        })
}

fn terminal(mut trace: DebugTrace, details: String) -> Verdict {
    trace.push(TraceStep::Resolved {
        label: Label::Error,
    });
    Verdict {
        label: Label::Error,
        details,
        trace,
    }
}
