//! Sentiment classification.
//!
//! [`Classifier::classify`] never fails: any error degrades to
//! [`Classification::unavailable`] (`neutral`, confidence 0, no tags) so an
//! event is always recordable.
//!
//! | Implementation | Used when |
//! |----------------|-----------|
//! | [`HttpClassifier`] | An API key is configured |
//! | [`NeutralClassifier`] | No credentials |

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use kiln_types::SentimentLabel;

use crate::error::AnalyticsError;

/// Tags the model may attach.
pub const KNOWN_TAGS: &[&str] = &[
    "spam",
    "toxic",
    "valuable",
    "question",
    "announcement",
    "discussion",
    "meme",
    "support",
];

/// Classifier output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Sentiment label.
    pub label: SentimentLabel,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// Content tags.
    pub tags: Vec<String>,
}

impl Classification {
    /// The degraded result: neutral, zero confidence, no tags.
    pub const fn unavailable() -> Self {
        Self {
            label: SentimentLabel::Neutral,
            confidence: 0.0,
            tags: Vec::new(),
        }
    }
}

/// Anything that can label text.
pub trait Classifier: Send + Sync {
    /// Classify `text`. Never fails.
    fn classify(&self, text: &str) -> impl Future<Output = Classification> + Send;
}

// ---------------------------------------------------------------------------
// Neutral (no credentials)
// ---------------------------------------------------------------------------

/// Labels everything as unavailable.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeutralClassifier;

impl Classifier for NeutralClassifier {
    async fn classify(&self, _text: &str) -> Classification {
        Classification::unavailable()
    }
}

// ---------------------------------------------------------------------------
// HTTP (generative model endpoint)
// ---------------------------------------------------------------------------

/// Classifier endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// API base URL.
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Model name.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key; `None` selects [`NeutralClassifier`].
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_api_url() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_owned()
}

fn default_model() -> String {
    "gemini-1.5-flash".to_owned()
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            model: default_model(),
            api_key: None,
        }
    }
}

/// Classifier backed by a generative model's `generateContent` endpoint.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
}

impl HttpClassifier {
    /// Create a classifier with an explicit key.
    pub fn new(config: &ClassifierConfig, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.api_url.trim_end_matches('/').to_owned(),
            api_key: api_key.to_owned(),
            model: config.model.clone(),
        }
    }

    /// Send the prompt and return the model's raw text reply.
    ///
    /// # Errors
    ///
    /// Returns [`AnalyticsError::Classifier`] on transport errors, non-2xx
    /// statuses, or a reply without text.
    pub async fn request(&self, text: &str) -> Result<String, AnalyticsError> {
        let url = format!("{}/models/{}:generateContent", self.api_url, self.model);
        let body = serde_json::json!({
            "contents": [{"parts": [{"text": prompt(text)}]}]
        });

        let response = self
            .client
            .post(&url)
            .query(&[("key", self.api_key.as_str())])
            .json(&body)
            .send()
            .await
            .map_err(|e| AnalyticsError::Classifier(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let error_body = response
                .text()
                .await
                .unwrap_or_else(|_| "unable to read error body".to_owned());
            return Err(AnalyticsError::Classifier(format!("returned {status}: {error_body}")));
        }

        let json: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AnalyticsError::Classifier(format!("response parse failed: {e}")))?;

        json.get("candidates")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("content"))
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.get(0))
            .and_then(|p| p.get("text"))
            .and_then(serde_json::Value::as_str)
            .map(ToOwned::to_owned)
            .ok_or_else(|| {
                AnalyticsError::Classifier(
                    "response missing candidates[0].content.parts[0].text".to_owned(),
                )
            })
    }
}

impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str) -> Classification {
        match self.request(text).await {
            Ok(reply) => {
                let parsed = parse_reply(&reply);
                debug!(label = ?parsed.label, confidence = parsed.confidence, "Classified content");
                parsed
            }
            Err(e) => {
                warn!(error = %e, "Classifier unavailable, degrading to neutral");
                Classification::unavailable()
            }
        }
    }
}

fn prompt(text: &str) -> String {
    format!(
        "Analyze the sentiment of this community chat message and classify it.\n\n\
         Message: \"{text}\"\n\n\
         Respond with JSON only, with these fields:\n\
         1. sentiment: \"positive\", \"neutral\", or \"negative\"\n\
         2. confidence: a number between 0 and 1\n\
         3. tags: applicable tags from [{tags}]\n",
        tags = KNOWN_TAGS
            .iter()
            .map(|t| format!("\"{t}\""))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

/// Extract the outermost `{...}` object from a model reply.
///
/// A reply with no object is neutral at 0.5; fields missing from the object
/// default to neutral, 0.5 and no tags.
pub fn parse_reply(reply: &str) -> Classification {
    let object = reply
        .find('{')
        .zip(reply.rfind('}'))
        .filter(|(open, close)| open < close)
        .and_then(|(open, close)| reply.get(open..=close))
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok());

    let Some(object) = object else {
        return Classification {
            label: SentimentLabel::Neutral,
            confidence: 0.5,
            tags: Vec::new(),
        };
    };

    let label = object
        .get("sentiment")
        .and_then(serde_json::Value::as_str)
        .and_then(SentimentLabel::parse)
        .unwrap_or(SentimentLabel::Neutral);
    let confidence = object
        .get("confidence")
        .and_then(serde_json::Value::as_f64)
        .filter(|c| c.is_finite() && *c > 0.0)
        .map_or(0.5, |c| c.clamp(0.0, 1.0));
    let tags = object
        .get("tags")
        .and_then(serde_json::Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(serde_json::Value::as_str)
                .map(str::to_lowercase)
                .collect()
        })
        .unwrap_or_default();

    Classification {
        label,
        confidence,
        tags,
    }
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// The classifier selected from configuration.
#[derive(Debug, Clone)]
pub enum SentimentClassifier {
    /// Remote model.
    Http(HttpClassifier),
    /// No credentials.
    Neutral(NeutralClassifier),
}

impl SentimentClassifier {
    /// [`HttpClassifier`] when an API key is configured, otherwise neutral.
    pub fn from_config(config: &ClassifierConfig) -> Self {
        match config.api_key.as_deref().filter(|k| !k.is_empty()) {
            Some(key) => Self::Http(HttpClassifier::new(config, key)),
            None => {
                warn!("No classifier API key configured, sentiment will be neutral");
                Self::Neutral(NeutralClassifier)
            }
        }
    }

    /// Human-readable name for logging.
    pub const fn name(&self) -> &str {
        match self {
            Self::Http(_) => "http",
            Self::Neutral(_) => "neutral",
        }
    }
}

impl Classifier for SentimentClassifier {
    async fn classify(&self, text: &str) -> Classification {
        match self {
            Self::Http(inner) => inner.classify(text).await,
            Self::Neutral(inner) => inner.classify(text).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_object_embedded_in_prose() {
        let reply = concat!(
            "Sure! ```json\n",
            "{\"sentiment\": \"negative\", \"confidence\": 0.9, \"tags\": [\"Toxic\"]}",
            "\n```"
        );
        let parsed = parse_reply(reply);
        assert_eq!(parsed.label, SentimentLabel::Negative);
        assert!((parsed.confidence - 0.9).abs() < f64::EPSILON);
        assert_eq!(parsed.tags, vec!["toxic".to_owned()]);
    }

    #[test]
    fn missing_fields_default() {
        let parsed = parse_reply("{\"tags\": []}");
        assert_eq!(parsed.label, SentimentLabel::Neutral);
        assert!((parsed.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn no_object_is_neutral_half_confidence() {
        let parsed = parse_reply("I cannot help with that");
        assert_eq!(parsed.label, SentimentLabel::Neutral);
        assert!((parsed.confidence - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn no_key_selects_neutral() {
        let classifier = SentimentClassifier::from_config(&ClassifierConfig::default());
        assert_eq!(classifier.name(), "neutral");
    }

    #[tokio::test]
    async fn neutral_classifier_is_unavailable() {
        let result = NeutralClassifier.classify("great project").await;
        assert_eq!(result, Classification::unavailable());
    }

    #[tokio::test]
    async fn unreachable_endpoint_degrades() {
        let config = ClassifierConfig {
            api_url: "http://127.0.0.1:9".to_owned(),
            model: "m".to_owned(),
            api_key: Some("k".to_owned()),
        };
        let result = HttpClassifier::new(&config, "k").classify("hello").await;
        assert_eq!(result, Classification::unavailable());
    }
}
