use crate::{ClassifyError, SentimentResult};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEBOUNCE_DELAY: Duration = Duration::from_millis(500);

/// Asynchronous access to a classifier, typically over the network.
///
/// The token is cancelled when the request is superseded. Implementations may
/// ignore it; the pipeline never applies a result for an outdated opinion.
pub trait SentimentSource: Send + Sync + 'static {
    fn classify(
        &self,
        opinion: &str,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<SentimentResult, ClassifyError>> + Send;
}

impl<S: SentimentSource> SentimentSource for Arc<S> {
    fn classify(
        &self,
        opinion: &str,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<SentimentResult, ClassifyError>> + Send {
        (**self).classify(opinion, cancel)
    }
}

/// The sentiment currently on screen and the exact opinion text it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayedSentiment {
    pub opinion: String,
    pub result: SentimentResult,
}

#[derive(Debug, Default)]
struct PipelineCounters {
    issued: AtomicU64,
    aborted: AtomicU64,
    stale: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStats {
    /// Classification requests sent to the source.
    pub issued: u64,
    /// In-flight requests superseded before they answered.
    pub aborted: u64,
    /// Responses that arrived after the opinion had changed.
    pub stale: u64,
    /// Genuine classification failures.
    pub failed: u64,
}

/// Responses are applied only while the text they were issued for is still current.
pub struct OpinionPipeline {
    edits: mpsc::UnboundedSender<String>,
    displayed: watch::Receiver<Option<DisplayedSentiment>>,
    counters: Arc<PipelineCounters>,
    task: JoinHandle<()>,
}

impl OpinionPipeline {
    /// Starts the driver on the current tokio runtime with the default delay.
    pub fn spawn<S: SentimentSource>(source: Arc<S>) -> Self {
        Self::with_delay(source, DEBOUNCE_DELAY)
    }

    pub fn with_delay<S: SentimentSource>(source: Arc<S>, delay: Duration) -> Self {
        let (edits_tx, edits_rx) = mpsc::unbounded_channel();
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let (displayed_tx, displayed_rx) = watch::channel(None);
        let counters = Arc::new(PipelineCounters::default());
        let driver = Driver {
            source,
            delay,
            current: String::new(),
            deadline: None,
            in_flight: None,
            next_request: 0,
            completions: completions_tx,
            displayed: displayed_tx,
            counters: Arc::clone(&counters),
        };
        let task = tokio::spawn(driver.run(edits_rx, completions_rx));
        Self {
            edits: edits_tx,
            displayed: displayed_rx,
            counters,
            task,
        }
    }

    /// Records a new value of the opinion field.
    pub fn set_opinion(&self, text: impl Into<String>) {
        if self.edits.send(text.into()).is_err() {
            warn!("opinion pipeline driver has stopped; edit ignored");
        }
    }

    pub fn displayed(&self) -> Option<SentimentResult> {
        self.displayed.borrow().as_ref().map(|shown| shown.result)
    }

    /// Watches the displayed sentiment; `None` means nothing is shown.
    pub fn subscribe(&self) -> watch::Receiver<Option<DisplayedSentiment>> {
        self.displayed.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            issued: self.counters.issued.load(Ordering::Relaxed),
            aborted: self.counters.aborted.load(Ordering::Relaxed),
            stale: self.counters.stale.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stops the driver and aborts whatever request is still in flight.
    pub async fn shutdown(self) {
        drop(self.edits);
        if let Err(err) = self.task.await {
            warn!(error = %err, "opinion pipeline driver panicked");
        }
    }
}

struct InFlight {
    id: u64,
    token: CancellationToken,
}

struct Completion {
    id: u64,
    opinion: String,
    result: Result<SentimentResult, ClassifyError>,
}

struct Driver<S> {
    source: Arc<S>,
    delay: Duration,
    current: String,
    deadline: Option<Instant>,
    in_flight: Option<InFlight>,
    next_request: u64,
    completions: mpsc::UnboundedSender<Completion>,
    displayed: watch::Sender<Option<DisplayedSentiment>>,
    counters: Arc<PipelineCounters>,
}

impl<S: SentimentSource> Driver<S> {
    async fn run(
        mut self,
        mut edits: mpsc::UnboundedReceiver<String>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        loop {
            let deadline = self.deadline;
            tokio::select! {
                biased;
                edit = edits.recv() => match edit {
                    Some(text) => self.on_edit(text),
                    None => break,
                },
                _ = sleep_until(deadline) => self.fire(),
                Some(done) = completions.recv() => self.on_completion(done),
            }
        }
        self.abort_in_flight();
        debug!("opinion pipeline driver stopped");
    }

    fn on_edit(&mut self, text: String) {
        self.current = text;
        if self.current.trim().is_empty() {
            self.deadline = None;
            self.abort_in_flight();
            self.displayed.send_replace(None);
            debug!("opinion cleared; sentiment hidden");
            return;
        }
        self.deadline = Some(Instant::now() + self.delay);
    }

    fn fire(&mut self) {
        self.deadline = None;
        self.abort_in_flight();

        let id = self.next_request;
        self.next_request += 1;
        let token = CancellationToken::new();
        self.in_flight = Some(InFlight {
            id,
            token: token.clone(),
        });
        self.counters.issued.fetch_add(1, Ordering::Relaxed);
        debug!(request = id, chars = self.current.len(), "issuing sentiment request");

        let source = Arc::clone(&self.source);
        let opinion = self.current.clone();
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => Err(ClassifyError::Aborted),
                result = source.classify(opinion.trim(), token.clone()) => result,
            };
            let _ = completions.send(Completion {
                id,
                opinion,
                result,
            });
        });
    }

    fn abort_in_flight(&mut self) {
        if let Some(previous) = self.in_flight.take() {
            previous.token.cancel();
            self.counters.aborted.fetch_add(1, Ordering::Relaxed);
            debug!(request = previous.id, "aborted superseded sentiment request");
        }
    }

    fn on_completion(&mut self, done: Completion) {
        if self.in_flight.as_ref().is_some_and(|f| f.id == done.id) {
            self.in_flight = None;
        }
        match done.result {
            Err(err) if err.is_abort() => {}
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(request = done.id, error = %err, "sentiment inference failed");
            }
            Ok(result) if done.opinion == self.current => {
                self.displayed.send_replace(Some(DisplayedSentiment {
                    opinion: done.opinion,
                    result,
                }));
            }
            Ok(_) => {
                self.counters.stale.fetch_add(1, Ordering::Relaxed);
                debug!(request = done.id, "discarding response for outdated opinion");
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SentimentLabel;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use tokio::time::sleep;

    #[derive(Default)]
    struct ScriptedSource {
        calls: Mutex<Vec<String>>,
        delays: HashMap<&'static str, Duration>,
    }

    impl ScriptedSource {
        fn with_delays(delays: &[(&'static str, u64)]) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                delays: delays
                    .iter()
                    .map(|(text, ms)| (*text, Duration::from_millis(*ms)))
                    .collect(),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl SentimentSource for ScriptedSource {
        fn classify(
            &self,
            opinion: &str,
            _cancel: CancellationToken,
        ) -> impl Future<Output = Result<SentimentResult, ClassifyError>> + Send {
            let opinion = opinion.to_string();
            self.calls.lock().push(opinion.clone());
            let delay = self
                .delays
                .get(opinion.as_str())
                .copied()
                .unwrap_or(Duration::from_millis(50));
            async move {
                sleep(delay).await;
                if opinion == "boom" {
                    return Err(ClassifyError::Transport("connection reset".to_string()));
                }
                let (label, score) = if opinion.contains("hate") || opinion == "new" {
                    (SentimentLabel::Negative, 0.81)
                } else {
                    (SentimentLabel::Positive, 0.92)
                };
                Ok(SentimentResult::new(label, score)?)
            }
        }
    }

    async fn wait_for_some(pipeline: &OpinionPipeline) -> SentimentResult {
        let mut rx = pipeline.subscribe();
        let shown = rx.wait_for(|value| value.is_some()).await.unwrap().clone();
        shown.unwrap().result
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_edits_issues_one_request() {
        let source = Arc::new(ScriptedSource::default());
        let pipeline = OpinionPipeline::spawn(Arc::clone(&source));
        for text in ["I", "I lo", "I love", "I love this school"] {
            pipeline.set_opinion(text);
            sleep(Duration::from_millis(200)).await;
        }
        let shown = wait_for_some(&pipeline).await;
        assert_eq!(shown.label, SentimentLabel::Positive);
        assert_eq!(shown.progress_width(), "96.0%");
        assert_eq!(source.calls(), vec!["I love this school".to_string()]);
        assert_eq!(pipeline.stats().issued, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn nothing_is_issued_before_the_delay_elapses() {
        let source = Arc::new(ScriptedSource::default());
        let pipeline = OpinionPipeline::spawn(Arc::clone(&source));
        pipeline.set_opinion("almost");
        sleep(Duration::from_millis(450)).await;
        assert!(source.calls().is_empty());
        sleep(Duration::from_millis(100)).await;
        assert_eq!(source.calls(), vec!["almost".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_for_old_text_is_discarded() {
        let source = Arc::new(ScriptedSource::with_delays(&[("old", 600)]));
        let pipeline = OpinionPipeline::spawn(Arc::clone(&source));
        pipeline.set_opinion("old");
        // request for "old" is issued at 500ms and answers at 1100ms
        sleep(Duration::from_millis(700)).await;
        pipeline.set_opinion("new");
        sleep(Duration::from_millis(450)).await;
        assert_eq!(pipeline.displayed(), None);
        assert_eq!(pipeline.stats().stale, 1);

        let shown = wait_for_some(&pipeline).await;
        assert_eq!(shown.label, SentimentLabel::Negative);
        assert_eq!(source.calls(), vec!["old".to_string(), "new".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_request_is_aborted() {
        let source = Arc::new(ScriptedSource::with_delays(&[("slow", 5_000)]));
        let pipeline = OpinionPipeline::spawn(Arc::clone(&source));
        pipeline.set_opinion("slow");
        sleep(Duration::from_millis(600)).await;
        pipeline.set_opinion("I hate waiting");
        let shown = wait_for_some(&pipeline).await;
        assert_eq!(shown.label, SentimentLabel::Negative);

        sleep(Duration::from_secs(10)).await;
        assert_eq!(pipeline.displayed(), Some(shown));
        let stats = pipeline.stats();
        assert_eq!(stats.issued, 2);
        assert_eq!(stats.aborted, 1);
        assert_eq!(stats.stale, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn blank_input_clears_immediately_without_request() {
        let source = Arc::new(ScriptedSource::default());
        let pipeline = OpinionPipeline::spawn(Arc::clone(&source));
        pipeline.set_opinion("I love this school");
        wait_for_some(&pipeline).await;

        let start = Instant::now();
        pipeline.set_opinion("   ");
        let mut rx = pipeline.subscribe();
        rx.wait_for(|value| value.is_none()).await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));

        sleep(Duration::from_secs(2)).await;
        assert_eq!(source.calls().len(), 1);
        assert_eq!(pipeline.displayed(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_never_reaches_the_source() {
        let source = Arc::new(ScriptedSource::default());
        let pipeline = OpinionPipeline::spawn(Arc::clone(&source));
        pipeline.set_opinion("");
        sleep(Duration::from_secs(2)).await;
        assert!(source.calls().is_empty());
        assert_eq!(pipeline.stats().issued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn classification_failure_keeps_previous_display() {
        let source = Arc::new(ScriptedSource::default());
        let pipeline = OpinionPipeline::spawn(Arc::clone(&source));
        pipeline.set_opinion("I love this school");
        let shown = wait_for_some(&pipeline).await;

        pipeline.set_opinion("boom");
        sleep(Duration::from_secs(2)).await;
        assert_eq!(pipeline.displayed(), Some(shown));
        assert_eq!(pipeline.stats().failed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_aborts_in_flight_request() {
        let source = Arc::new(ScriptedSource::with_delays(&[("lingering", 60_000)]));
        let pipeline = OpinionPipeline::spawn(Arc::clone(&source));
        pipeline.set_opinion("lingering");
        sleep(Duration::from_millis(600)).await;
        assert_eq!(source.calls().len(), 1);
        pipeline.shutdown().await;
    }
}
