//! Classification collaborator: the `Classifier` seam and the Gemini REST client
//! behind it.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ClassifyError;

pub const ANALYSIS_PROMPT: &str = r#"
Analyze this image and check for the following:
1. Text content and spelling
2. Watermarks
3. Human presence
4. Nudity or inappropriate content
5. Blood or violence
6. Brand logos or trademarks
7. Copyright or movie content
8. Recognizable places
9. Recognizable people

Respond in this exact format (replace Yes/No with true/false):
{
    "text_present": Yes/No,
    "text_analysis": {
        "has_spelling_errors": Yes/No,
        "correct_spelling": Yes/No
    },
    "watermark_present": Yes/No,
    "contains_humans": Yes/No,
    "contains_nudity": Yes/No,
    "contains_blood_violence": Yes/No,
    "contains_brands": Yes/No,
    "copyright_content": Yes/No,
    "recognizable_places": Yes/No,
    "recognizable_people": Yes/No,
    "details": "Describe what you found here"
}
"#;

pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";
pub const DEFAULT_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Image part of a classification request.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: Bytes,
}

/// Sends `[prompt, image]` to a vision model and returns its raw text reply.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, prompt: &str, image: &ImagePayload) -> Result<String, ClassifyError>;
}

#[derive(Debug, Clone)]
pub struct GeminiSettings {
    pub api_key: String,
    pub model: String,
    pub api_base: String,
    pub timeout: Duration,
}

impl GeminiSettings {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(120),
        }
    }
}

pub struct GeminiClient {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl GeminiClient {
    pub fn new(settings: GeminiSettings) -> Result<Self, ClassifyError> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .build()?;

        Ok(Self {
            http,
            endpoint: endpoint_for_model(&settings.api_base, &settings.model),
            api_key: settings.api_key,
        })
    }
}

fn endpoint_for_model(api_base: &str, model: &str) -> String {
    let trimmed = model.trim();
    let model_path = if trimmed.starts_with("models/") {
        trimmed.to_string()
    } else {
        format!("models/{trimmed}")
    };
    format!("{}/{}:generateContent", api_base.trim_end_matches('/'), model_path)
}

#[async_trait]
impl Classifier for GeminiClient {
    async fn classify(&self, prompt: &str, image: &ImagePayload) -> Result<String, ClassifyError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::Text {
                        text: prompt.to_string(),
                    },
                    Part::InlineData {
                        inline_data: InlineData {
                            mime_type: image.mime_type.clone(),
                            data: BASE64.encode(&image.data),
                        },
                    },
                ],
            }],
        };

        debug!(
            "[classify] Submitting {} byte {} image to {}",
            image.data.len(),
            image.mime_type,
            self.endpoint
        );

        let response = self
            .http
            .post(&self.endpoint)
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifyError::Status { status, body });
        }

        let payload: GenerateResponse = response.json().await?;
        extract_text(payload)
    }
}

#[derive(Debug, Serialize)]
struct GenerateRequest {
    contents: Vec<Content>,
}

#[derive(Debug, Serialize)]
struct Content {
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text { text: String },
    InlineData { inline_data: InlineData },
}

#[derive(Debug, Serialize)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

fn extract_text(payload: GenerateResponse) -> Result<String, ClassifyError> {
    let Some(candidate) = payload.candidates.into_iter().next() else {
        return Err(match payload.prompt_feedback.and_then(|f| f.block_reason) {
            Some(reason) => ClassifyError::Blocked(reason),
            None => ClassifyError::EmptyResponse,
        });
    };

    let text: String = candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|part| part.text)
        .collect();

    if text.trim().is_empty() {
        return Err(ClassifyError::EmptyResponse);
    }
    Ok(text)
}
