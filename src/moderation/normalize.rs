//! Turns the model's free-form reply into a fully populated `AnalysisRecord`.
//!
//! The model is asked for JSON but routinely wraps it in code fences, adds
//! prose around it, or answers with the prompt's `Yes`/`No` placeholders.
//! None of that is allowed to escape as an error.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, warn};

pub const NO_JSON_DETAILS: &str = "Analysis failed - invalid JSON response.";
pub const PARSE_ERROR_PREFIX: &str = "Error parsing response: ";
pub const NO_DETAILS: &str = "No details provided.";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextAnalysis {
    #[serde(deserialize_with = "lenient_bool")]
    pub has_spelling_errors: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub correct_spelling: bool,
}

/// Structured moderation answer. Missing flags read as `false`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisRecord {
    #[serde(deserialize_with = "lenient_bool")]
    pub text_present: bool,
    #[serde(deserialize_with = "null_as_default")]
    pub text_analysis: TextAnalysis,
    #[serde(deserialize_with = "lenient_bool")]
    pub watermark_present: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub contains_humans: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub contains_nudity: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub contains_blood_violence: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub contains_brands: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub copyright_content: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub recognizable_places: bool,
    #[serde(deserialize_with = "lenient_bool")]
    pub recognizable_people: bool,
    pub details: Option<String>,
}

impl AnalysisRecord {
    /// The all-false record substituted whenever a response cannot be used.
    pub fn failed(details: impl Into<String>) -> Self {
        Self {
            details: Some(details.into()),
            ..Self::default()
        }
    }

    pub fn details(&self) -> &str {
        self.details.as_deref().unwrap_or(NO_DETAILS)
    }
}

/// Extract and parse the JSON body of a model reply.
pub fn normalize(raw: &str) -> AnalysisRecord {
    let cleaned = raw.replace("```json", "").replace("```", "");
    let cleaned = cleaned.trim();

    let body = match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(start), Some(end)) if start < end => &cleaned[start..=end],
        _ => {
            warn!("[normalize] Model response contained no JSON object");
            return AnalysisRecord::failed(NO_JSON_DETAILS);
        }
    };

    let strict_err = match serde_json::from_str::<AnalysisRecord>(body) {
        Ok(record) => return record,
        Err(e) => e,
    };

    match serde_json::from_str::<AnalysisRecord>(&rewrite_yes_no(body)) {
        Ok(record) => {
            debug!("[normalize] Accepted response after rewriting Yes/No literals");
            record
        }
        Err(_) => {
            error!("[normalize] JSON parsing error: {}", strict_err);
            AnalysisRecord::failed(format!("{PARSE_ERROR_PREFIX}{strict_err}"))
        }
    }
}

/// Replace bare `Yes`/`No` tokens outside string literals with JSON booleans.
fn rewrite_yes_no(json: &str) -> String {
    let mut out = String::with_capacity(json.len());
    let mut word = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in json.chars() {
        if in_string {
            out.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }

        if ch.is_ascii_alphanumeric() || ch == '_' {
            word.push(ch);
            continue;
        }

        flush_word(&mut out, &mut word);
        if ch == '"' {
            in_string = true;
        }
        out.push(ch);
    }
    flush_word(&mut out, &mut word);

    out
}

fn flush_word(out: &mut String, word: &mut String) {
    match word.to_ascii_lowercase().as_str() {
        "yes" => out.push_str("true"),
        "no" => out.push_str("false"),
        _ => out.push_str(word),
    }
    word.clear();
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" => Ok(true),
            "false" | "no" | "n" | "0" | "" => Ok(false),
            other => Err(de::Error::custom(format!(
                "expected a boolean or yes/no, got \"{other}\""
            ))),
        },
        other => Err(de::Error::custom(format!("expected a boolean, got {other}"))),
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
