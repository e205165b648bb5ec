use crate::classifier::from_ureq;
use crate::pipeline::SentimentSource;
use crate::submission::{SubmissionBackend, SubmissionRecord, SubmitError};
use crate::{ClassifyError, SentimentResult, http};
use serde::Deserialize;
use serde_json::json;
use std::future::Future;
use tokio_util::sync::CancellationToken;

pub const ANALYZE_PATH: &str = "/api/analyzeSentiment";
pub const SUBMIT_PATH: &str = "/api/submitOpinion";

#[derive(Debug, Deserialize)]
struct RawSentiment {
    label: String,
    score: f64,
}

#[derive(Debug, Deserialize)]
struct SubmitReply {
    #[serde(default)]
    message: String,
}

/// Talks to the sentiment and submission endpoints of one server.
#[derive(Debug, Clone)]
pub struct SurveyClient {
    base_url: String,
}

impl SurveyClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { base_url }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Blocking classification round trip.
    pub fn analyze(&self, opinion: &str) -> Result<SentimentResult, ClassifyError> {
        let response = http::agent()
            .post(&self.url(ANALYZE_PATH))
            .send_json(json!({ "opinion": opinion }))
            .map_err(from_ureq)?;
        let raw: RawSentiment = response
            .into_json()
            .map_err(|err| ClassifyError::Decode(err.to_string()))?;
        Ok(SentimentResult::from_raw(&raw.label, raw.score)?)
    }

    /// Blocking submission; returns the server's confirmation message.
    pub fn send_submission(&self, record: &SubmissionRecord) -> Result<String, SubmitError> {
        let response = http::agent()
            .post(&self.url(SUBMIT_PATH))
            .send_json(record)
            .map_err(|err| match err {
                ureq::Error::Status(status, response) => SubmitError::Status {
                    status,
                    message: http::error_message(response),
                },
                ureq::Error::Transport(transport) => SubmitError::Transport(transport.to_string()),
            })?;
        let reply: SubmitReply = response
            .into_json()
            .map_err(|err| SubmitError::Internal(err.to_string()))?;
        Ok(reply.message)
    }
}

impl SentimentSource for SurveyClient {
    fn classify(
        &self,
        opinion: &str,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<SentimentResult, ClassifyError>> + Send {
        let client = self.clone();
        let opinion = opinion.to_string();
        async move {
            let call = tokio::task::spawn_blocking(move || client.analyze(&opinion));
            tokio::select! {
                biased;
                // the blocking call finishes in the background; its result is dropped
                _ = cancel.cancelled() => Err(ClassifyError::Aborted),
                joined = call => joined.map_err(|err| ClassifyError::Internal(err.to_string()))?,
            }
        }
    }
}

impl SubmissionBackend for SurveyClient {
    fn submit(
        &self,
        record: &SubmissionRecord,
    ) -> impl Future<Output = Result<String, SubmitError>> + Send {
        let client = self.clone();
        let record = record.clone();
        async move {
            tokio::task::spawn_blocking(move || client.send_submission(&record))
                .await
                .map_err(|err| SubmitError::Internal(err.to_string()))?
        }
    }
}
