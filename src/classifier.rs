use crate::{SentimentLabel, SentimentResult, ShapeError, http};
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Hosted three-class RoBERTa sentiment model.
pub const DEFAULT_MODEL_URL: &str = "https://router.huggingface.co/hf-inference/models/cardiffnlp/twitter-roberta-base-sentiment-latest";
pub const DEFAULT_CACHE_CAPACITY: usize = 100;
pub const INVALID_OPINION_MESSAGE: &str = "No valid opinion provided. Please enter a valid opinion.";

#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifyError {
    /// The opinion was rejected before classification (empty, not a string, ...).
    #[error("{0}")]
    Invalid(String),
    /// The caller gave up on this request. Never surfaced to users.
    #[error("classification aborted")]
    Aborted,
    #[error("classifier unreachable: {0}")]
    Transport(String),
    #[error("classifier responded with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("malformed classifier response: {0}")]
    Shape(#[from] ShapeError),
    #[error("undecodable classifier response: {0}")]
    Decode(String),
    #[error("classification task failed: {0}")]
    Internal(String),
}

impl ClassifyError {
    pub fn is_abort(&self) -> bool {
        matches!(self, ClassifyError::Aborted)
    }
}

pub(crate) fn from_ureq(err: ureq::Error) -> ClassifyError {
    match err {
        ureq::Error::Status(400, response) => ClassifyError::Invalid(http::error_message(response)),
        ureq::Error::Status(499, _) => ClassifyError::Aborted,
        ureq::Error::Status(status, response) => ClassifyError::Status {
            status,
            message: http::error_message(response),
        },
        ureq::Error::Transport(transport) => ClassifyError::Transport(transport.to_string()),
    }
}

/// Maps opinion text to exactly one `{label, score}` pair.
///
/// Implementations block; async callers run them on the blocking pool. The
/// token is advisory: implementations should check it around slow work but
/// are allowed to ignore it.
pub trait Classifier: Send + Sync {
    fn classify(
        &self,
        opinion: &str,
        cancel: &CancellationToken,
    ) -> Result<SentimentResult, ClassifyError>;
}

impl<C: Classifier + ?Sized> Classifier for Arc<C> {
    fn classify(
        &self,
        opinion: &str,
        cancel: &CancellationToken,
    ) -> Result<SentimentResult, ClassifyError> {
        (**self).classify(opinion, cancel)
    }
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn classify(
        &self,
        opinion: &str,
        cancel: &CancellationToken,
    ) -> Result<SentimentResult, ClassifyError> {
        (**self).classify(opinion, cancel)
    }
}

/// Calls a Hugging Face style text-classification endpoint.
#[derive(Debug, Clone)]
pub struct HttpClassifier {
    endpoint: String,
    token: Option<String>,
}

impl HttpClassifier {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            token: None,
        }
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

impl Default for HttpClassifier {
    fn default() -> Self {
        Self::new(DEFAULT_MODEL_URL)
    }
}

impl Classifier for HttpClassifier {
    fn classify(
        &self,
        opinion: &str,
        cancel: &CancellationToken,
    ) -> Result<SentimentResult, ClassifyError> {
        let opinion = opinion.trim();
        if opinion.is_empty() {
            return Err(ClassifyError::Invalid(INVALID_OPINION_MESSAGE.to_string()));
        }
        if cancel.is_cancelled() {
            return Err(ClassifyError::Aborted);
        }
        let mut request = http::agent().post(&self.endpoint);
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        let response = request
            .send_json(json!({ "inputs": opinion }))
            .map_err(from_ureq)?;
        if cancel.is_cancelled() {
            debug!(endpoint = %self.endpoint, "dropping model response for aborted request");
            return Err(ClassifyError::Aborted);
        }
        let body: Value = response
            .into_json()
            .map_err(|err| ClassifyError::Decode(err.to_string()))?;
        Ok(top_prediction(&body)?)
    }
}

/// Picks the highest-scoring prediction out of a model response.
///
/// Text-classification endpoints answer with `[[{label, score}, ..]]` for a
/// single input, some deployments flatten that to `[{label, score}, ..]`, and
/// a few return the bare object.
pub fn top_prediction(body: &Value) -> Result<SentimentResult, ShapeError> {
    let candidates: Vec<&Value> = match body {
        Value::Array(outer) => match outer.first() {
            Some(Value::Array(inner)) => inner.iter().collect(),
            _ => outer.iter().collect(),
        },
        Value::Object(_) => vec![body],
        _ => Vec::new(),
    };

    let mut best: Option<(&str, f64)> = None;
    for candidate in candidates {
        let Some(label) = candidate.get("label").and_then(Value::as_str) else {
            continue;
        };
        let Some(score) = candidate.get("score").and_then(Value::as_f64) else {
            continue;
        };
        if best.is_none_or(|(_, top)| score > top) {
            best = Some((label, score));
        }
    }

    let (label, score) = best.ok_or(ShapeError::Empty)?;
    let label = SentimentLabel::from_model_label(label)
        .ok_or_else(|| ShapeError::UnknownLabel(label.to_string()))?;
    SentimentResult::from_raw(label.as_str(), score)
}

/// Bounded LRU memo of classifications keyed by the exact opinion text.
///
/// The lock is only held for lookups and inserts, never across the inner
/// classification, so concurrent requests for different texts proceed in
/// parallel.
pub struct CachedClassifier<C> {
    inner: C,
    cache: Mutex<LruCache<String, SentimentResult>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
}

impl<C: Classifier> CachedClassifier<C> {
    pub fn new(inner: C, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Looks up a cached result and marks it as recently used.
    pub fn cached(&self, opinion: &str) -> Option<SentimentResult> {
        self.cache.lock().get(opinion).copied()
    }

    pub fn stats(&self) -> CacheStats {
        let guard = self.cache.lock();
        CacheStats {
            entries: guard.len(),
            capacity: guard.cap().get(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

impl<C: Classifier> Classifier for CachedClassifier<C> {
    fn classify(
        &self,
        opinion: &str,
        cancel: &CancellationToken,
    ) -> Result<SentimentResult, ClassifyError> {
        if let Some(hit) = self.cached(opinion) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(hit);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let result = self.inner.classify(opinion, cancel)?;
        self.cache.lock().put(opinion.to_string(), result);
        Ok(result)
    }
}
