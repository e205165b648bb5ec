pub mod archive;
pub mod classifier;
pub mod client;
pub mod geo;
mod http;
pub mod pattern;
pub mod pipeline;
pub mod store;
pub mod submission;
#[cfg(feature = "web")]
pub mod web;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub use classifier::{CachedClassifier, Classifier, ClassifyError, HttpClassifier};
pub use pipeline::{OpinionPipeline, SentimentSource};
pub use submission::{NEGATIVE_REJECTION_THRESHOLD, SurveyForm};

/// Polarity reported by the sentiment model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "web", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum SentimentLabel {
    Positive,
    Negative,
    Neutral,
}

impl SentimentLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentLabel::Positive => "positive",
            SentimentLabel::Negative => "negative",
            SentimentLabel::Neutral => "neutral",
        }
    }

    /// Maps a raw model label onto the three polarities.
    ///
    /// Accepts the plain names in any case as well as the positional
    /// `LABEL_0..2` names emitted by three-class RoBERTa sentiment heads
    /// (negative, neutral, positive in that order).
    pub fn from_model_label(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "positive" | "pos" | "label_2" => Some(SentimentLabel::Positive),
            "negative" | "neg" | "label_0" => Some(SentimentLabel::Negative),
            "neutral" | "neu" | "label_1" => Some(SentimentLabel::Neutral),
            _ => None,
        }
    }
}

impl fmt::Display for SentimentLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SentimentLabel {
    type Err = ShapeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "positive" => Ok(SentimentLabel::Positive),
            "negative" => Ok(SentimentLabel::Negative),
            "neutral" => Ok(SentimentLabel::Neutral),
            other => Err(ShapeError::UnknownLabel(other.to_string())),
        }
    }
}

/// A single classification outcome.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "web", derive(utoipa::ToSchema))]
pub struct SentimentResult {
    pub label: SentimentLabel,
    pub score: f32,
}

/// Reasons a classifier payload is not a usable `{label, score}` pair.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ShapeError {
    #[error("unknown sentiment label {0:?}")]
    UnknownLabel(String),
    #[error("sentiment score {0} is outside [0, 1]")]
    ScoreOutOfRange(f64),
    #[error("classifier returned no predictions")]
    Empty,
}

impl SentimentResult {
    pub fn new(label: SentimentLabel, score: f32) -> Result<Self, ShapeError> {
        Self::from_raw(label.as_str(), f64::from(score))
    }

    /// Validates an untrusted wire payload.
    pub fn from_raw(label: &str, score: f64) -> Result<Self, ShapeError> {
        let label = label.parse::<SentimentLabel>()?;
        if !score.is_finite() || !(0.0..=1.0).contains(&score) {
            return Err(ShapeError::ScoreOutOfRange(score));
        }
        Ok(Self {
            label,
            score: score as f32,
        })
    }

    /// Re-checks a deserialized value, since serde alone does not bound the score.
    pub fn validate(self) -> Result<Self, ShapeError> {
        Self::from_raw(self.label.as_str(), f64::from(self.score))
    }

    /// Width of the sentiment meter, in percent.
    ///
    /// Positive scores fill 50-100%, negative scores 0-50%, neutral sits at 50%.
    pub fn progress_percent(&self) -> f32 {
        match self.label {
            SentimentLabel::Positive => self.score * 50.0 + 50.0,
            SentimentLabel::Negative => (1.0 - self.score) * 50.0,
            SentimentLabel::Neutral => 50.0,
        }
    }

    pub fn progress_width(&self) -> String {
        format!("{:.1}%", self.progress_percent())
    }

    /// Caption shown under the meter, e.g. "Positive Sentiment".
    pub fn label_title(&self) -> String {
        let label = self.label.as_str();
        let mut chars = label.chars();
        match chars.next() {
            Some(first) => format!("{}{} Sentiment", first.to_ascii_uppercase(), chars.as_str()),
            None => "Sentiment".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positive_score_maps_to_upper_half_of_meter() {
        let result = SentimentResult::new(SentimentLabel::Positive, 0.92).unwrap();
        assert!((result.progress_percent() - 96.0).abs() < 1e-4);
        assert_eq!(result.progress_width(), "96.0%");
        assert_eq!(result.label_title(), "Positive Sentiment");
    }

    #[test]
    fn negative_and_neutral_meter_positions() {
        let negative = SentimentResult::new(SentimentLabel::Negative, 0.8).unwrap();
        assert!((negative.progress_percent() - 10.0).abs() < 1e-4);
        let neutral = SentimentResult::new(SentimentLabel::Neutral, 0.3).unwrap();
        assert_eq!(neutral.progress_percent(), 50.0);
    }

    #[test]
    fn rejects_malformed_payloads() {
        assert_eq!(
            SentimentResult::from_raw("happy", 0.5),
            Err(ShapeError::UnknownLabel("happy".to_string()))
        );
        assert_eq!(
            SentimentResult::from_raw("positive", 1.5),
            Err(ShapeError::ScoreOutOfRange(1.5))
        );
        assert!(SentimentResult::from_raw("neutral", f64::NAN).is_err());
        assert!(SentimentResult::from_raw("neutral", 0.0).is_ok());
    }

    #[test]
    fn model_labels_are_normalized() {
        assert_eq!(
            SentimentLabel::from_model_label("LABEL_2"),
            Some(SentimentLabel::Positive)
        );
        assert_eq!(
            SentimentLabel::from_model_label(" Negative "),
            Some(SentimentLabel::Negative)
        );
        assert_eq!(SentimentLabel::from_model_label("joy"), None);
    }

    #[test]
    fn wire_format_uses_lowercase_labels() {
        let result: SentimentResult =
            serde_json::from_str(r#"{"label":"neutral","score":0.4}"#).unwrap();
        assert_eq!(result.label, SentimentLabel::Neutral);
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains(r#""label":"neutral""#));
    }
}
