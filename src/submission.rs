use crate::pipeline::{DisplayedSentiment, SentimentSource};
use crate::{SentimentLabel, SentimentResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Negative opinions at or above this confidence are not accepted.
pub const NEGATIVE_REJECTION_THRESHOLD: f32 = 0.6;

pub const REJECTION_MESSAGE: &str =
    "Opinion sentiment is too negative to be submitted. Please revise your opinion.";
pub const FAILURE_MESSAGE: &str = "Something went wrong. Please try again later.";
pub const EMPTY_OPINION_MESSAGE: &str = "Please share your opinion before submitting.";
pub const ANONYMOUS_NAME: &str = "Anonymous";
pub const GRADE_LEVELS: [&str; 4] = ["Freshman", "Sophomore", "Junior", "Senior"];

/// Canonical spelling of a grade level, matched case-insensitively.
pub fn grade_level(input: &str) -> Option<&'static str> {
    let input = input.trim();
    GRADE_LEVELS
        .iter()
        .copied()
        .find(|grade| grade.eq_ignore_ascii_case(input))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "web", derive(utoipa::ToSchema))]
#[serde(rename_all = "lowercase")]
pub enum NameOption {
    Provide,
    #[default]
    Anonymous,
}

/// Read-only snapshot of the submitting environment, captured once per session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "web", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase", default)]
pub struct ClientMetadata {
    pub user_agent: String,
    pub platform: String,
    pub language: String,
    pub screen_resolution: String,
    pub viewport_size: String,
    pub timezone: String,
    pub referrer: String,
}

impl ClientMetadata {
    /// Describes the local process. `screen` is the terminal size in cells when known.
    pub fn snapshot(screen: Option<(u16, u16)>) -> Self {
        let dimensions = screen
            .map(|(width, height)| format!("{width}x{height}"))
            .unwrap_or_default();
        Self {
            user_agent: format!(
                "realvoice-rs/{} ({}; {})",
                env!("CARGO_PKG_VERSION"),
                std::env::consts::OS,
                std::env::consts::ARCH
            ),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            language: locale_from_env(),
            screen_resolution: dimensions.clone(),
            viewport_size: dimensions,
            timezone: std::env::var("TZ")
                .ok()
                .filter(|tz| !tz.trim().is_empty())
                .unwrap_or_else(|| "UTC".to_string()),
            referrer: String::new(),
        }
    }
}

fn locale_from_env() -> String {
    ["LC_ALL", "LC_MESSAGES", "LANG"]
        .iter()
        .filter_map(|key| std::env::var(key).ok())
        .find(|value| !value.is_empty() && value != "C" && value != "POSIX")
        .map(|value| {
            // en_US.UTF-8 -> en-US
            let base = value.split('.').next().unwrap_or_default();
            base.replace('_', "-")
        })
        .unwrap_or_else(|| "en-US".to_string())
}

/// What gets persisted for an accepted opinion. Doubles as the submission wire payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "web", derive(utoipa::ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct SubmissionRecord {
    #[serde(default)]
    pub grade_level: String,
    pub opinion: String,
    #[serde(default)]
    pub name_option: NameOption,
    /// Display name, or "Anonymous".
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "clientData")]
    pub client_metadata: ClientMetadata,
}

impl SubmissionRecord {
    /// An anonymous record never carries the name field as sent.
    pub fn normalized(mut self) -> Self {
        if self.name_option == NameOption::Anonymous {
            self.name = ANONYMOUS_NAME.to_string();
        }
        self
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SubmitError {
    #[error("submission endpoint unreachable: {0}")]
    Transport(String),
    #[error("submission rejected with status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("submission task failed: {0}")]
    Internal(String),
}

/// Stores accepted submissions. Once issued, a persistence call is never cancelled.
pub trait SubmissionBackend: Send + Sync {
    fn submit(
        &self,
        record: &SubmissionRecord,
    ) -> impl Future<Output = Result<String, SubmitError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Accept,
    Reject,
}

pub fn gate(result: &SentimentResult) -> GateDecision {
    if result.label == SentimentLabel::Negative && result.score >= NEGATIVE_REJECTION_THRESHOLD {
        GateDecision::Reject
    } else {
        GateDecision::Accept
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    Classifying,
    Rejected,
    Accepted,
}

/// Whether submit may reuse the live sentiment instead of classifying again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClassifyPolicy {
    #[default]
    Fresh,
    /// Reuse the displayed result when it belongs to exactly the submitted text.
    ReuseDisplayed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted { message: String },
    Rejected(SentimentResult),
    Invalid(String),
    Failed,
}

pub struct SurveyForm {
    pub grade_level: String,
    pub opinion: String,
    pub name_option: NameOption,
    pub name: String,
    metadata: ClientMetadata,
    policy: ClassifyPolicy,
    state: GateState,
    submitted: bool,
    error: Option<String>,
    sentiment: Option<SentimentResult>,
    displayed: Option<DisplayedSentiment>,
}

impl SurveyForm {
    pub fn new(metadata: ClientMetadata) -> Self {
        Self {
            grade_level: String::new(),
            opinion: String::new(),
            name_option: NameOption::default(),
            name: String::new(),
            metadata,
            policy: ClassifyPolicy::default(),
            state: GateState::Idle,
            submitted: false,
            error: None,
            sentiment: None,
            displayed: None,
        }
    }

    pub fn with_policy(mut self, policy: ClassifyPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    /// True once a submission went through, until `submit_another`.
    pub fn is_submitted(&self) -> bool {
        self.submitted
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn sentiment(&self) -> Option<SentimentResult> {
        self.sentiment
    }

    /// Mirrors what the live pipeline currently shows.
    pub fn remember_displayed(&mut self, shown: Option<&DisplayedSentiment>) {
        self.displayed = shown.cloned();
        self.sentiment = shown.map(|s| s.result);
    }

    pub fn record(&self) -> SubmissionRecord {
        SubmissionRecord {
            grade_level: self.grade_level.clone(),
            opinion: self.opinion.clone(),
            name_option: self.name_option,
            name: self.name.clone(),
            client_metadata: self.metadata.clone(),
        }
        .normalized()
    }

    pub async fn submit<S, B>(&mut self, source: &S, backend: &B) -> SubmitOutcome
    where
        S: SentimentSource,
        B: SubmissionBackend,
    {
        self.error = None;
        // later edits do not affect this submission
        let record = self.record();
        if record.opinion.trim().is_empty() {
            self.error = Some(EMPTY_OPINION_MESSAGE.to_string());
            return SubmitOutcome::Invalid(EMPTY_OPINION_MESSAGE.to_string());
        }

        self.state = GateState::Classifying;
        let reusable = match self.policy {
            ClassifyPolicy::ReuseDisplayed => self
                .displayed
                .as_ref()
                .filter(|shown| shown.opinion == record.opinion)
                .map(|shown| shown.result),
            ClassifyPolicy::Fresh => None,
        };
        let classified = match reusable {
            Some(result) => Ok(result),
            None => {
                source
                    .classify(record.opinion.trim(), CancellationToken::new())
                    .await
            }
        };
        let result = match classified {
            Ok(result) => result,
            Err(err) => {
                warn!(error = %err, "submit-time classification failed");
                return self.fail();
            }
        };
        self.sentiment = Some(result);

        if gate(&result) == GateDecision::Reject {
            self.state = GateState::Rejected;
            info!(score = result.score, "submission rejected as too negative");
            self.error = Some(REJECTION_MESSAGE.to_string());
            self.state = GateState::Idle;
            return SubmitOutcome::Rejected(result);
        }

        self.state = GateState::Accepted;
        match backend.submit(&record).await {
            Ok(message) => {
                self.submitted = true;
                info!(grade = %record.grade_level, label = %result.label, "opinion submitted");
                SubmitOutcome::Accepted { message }
            }
            Err(err) => {
                warn!(error = %err, "persisting submission failed");
                self.fail()
            }
        }
    }

    fn fail(&mut self) -> SubmitOutcome {
        self.error = Some(FAILURE_MESSAGE.to_string());
        self.state = GateState::Idle;
        SubmitOutcome::Failed
    }

    /// Leaves the "submitted" screen with a blank form.
    pub fn submit_another(&mut self) {
        self.grade_level.clear();
        self.opinion.clear();
        self.name_option = NameOption::default();
        self.name.clear();
        self.state = GateState::Idle;
        self.submitted = false;
        self.error = None;
        self.sentiment = None;
        self.displayed = None;
    }
}
