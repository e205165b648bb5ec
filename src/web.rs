use crate::archive::{ArchiveError, ImageArchive};
use crate::classifier::{
    CachedClassifier, Classifier, DEFAULT_CACHE_CAPACITY, DEFAULT_MODEL_URL, HttpClassifier,
    INVALID_OPINION_MESSAGE,
};
use crate::geo::{DEFAULT_LOCATION, FixedLocator, Geolocator, IpApiLocator};
use crate::pattern::Pattern;
use crate::store::{StoreError, StoredSubmission, SubmissionLog};
use crate::submission::{ClientMetadata, NameOption, SubmissionRecord};
use crate::{ClassifyError, SentimentLabel, SentimentResult};
use axum::{
    Json, Router,
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, Method, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::compression::CompressionLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{info, warn};
use utoipa::{IntoParams, OpenApi, ToSchema};

type SharedState = Arc<AppState>;

const EMPTY_BODY_MESSAGE: &str = "Request body is empty or invalid.";
const ANALYZE_FAILURE_MESSAGE: &str = "Failed to analyze sentiment.";
const CANCELLED_MESSAGE: &str = "Request cancelled.";
const SUBMIT_OK_MESSAGE: &str = "Data received successfully";
const SUBMIT_FAILURE_MESSAGE: &str = "Something went wrong.";
const MALFORMED_SUBMISSION_MESSAGE: &str = "Submission payload is malformed.";
const CLIENT_CLOSED_REQUEST: u16 = 499;

pub struct AppState {
    classifier: CachedClassifier<Box<dyn Classifier>>,
    submissions: SubmissionLog,
    images: Option<ImageArchive>,
    geolocator: Box<dyn Geolocator>,
    base_url: String,
}

impl AppState {
    pub fn new(
        classifier: Box<dyn Classifier>,
        cache_capacity: usize,
        submissions: SubmissionLog,
    ) -> Self {
        Self {
            classifier: CachedClassifier::new(classifier, cache_capacity),
            submissions,
            images: None,
            geolocator: Box::new(FixedLocator::default()),
            base_url: String::new(),
        }
    }

    pub fn with_images(mut self, archive: ImageArchive) -> Self {
        self.images = Some(archive);
        self
    }

    pub fn with_geolocator(mut self, geolocator: impl Geolocator + 'static) -> Self {
        self.geolocator = Box::new(geolocator);
        self
    }

    pub fn from_config(config: &WebConfig) -> Result<Self, WebError> {
        let classifier = HttpClassifier::new(config.classifier_url.clone())
            .with_token(config.classifier_token.clone());
        let submissions = match &config.data_dir {
            Some(dir) => SubmissionLog::persistent(dir.join("submissions.jsonl")),
            None => SubmissionLog::ephemeral(),
        };
        let mut state = Self::new(Box::new(classifier), config.cache_capacity, submissions);
        state.base_url = config.base_url.clone();
        if config.render_images {
            let dir = config
                .data_dir
                .as_ref()
                .map(|dir| dir.join("images"))
                .unwrap_or_else(|| PathBuf::from("images"));
            state = state.with_images(ImageArchive::open(dir)?);
        }
        if config.geolocation {
            state = state.with_geolocator(IpApiLocator::default());
        }
        Ok(state)
    }

    pub fn submissions(&self) -> &SubmissionLog {
        &self.submissions
    }
}

#[derive(Clone)]
pub struct WebConfig {
    pub addr: SocketAddr,
    pub enable_openapi: bool,
    pub base_url: String,
    pub classifier_url: String,
    pub classifier_token: Option<String>,
    pub cache_capacity: usize,
    pub data_dir: Option<PathBuf>,
    pub render_images: bool,
    pub geolocation: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            enable_openapi: true,
            base_url: "http://127.0.0.1:3000".to_string(),
            classifier_url: DEFAULT_MODEL_URL.to_string(),
            classifier_token: None,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            data_dir: None,
            render_images: false,
            geolocation: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WebError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image archive unavailable: {0}")]
    Archive(#[from] ArchiveError),
}

pub async fn serve(config: WebConfig) -> Result<(), WebError> {
    let state = Arc::new(AppState::from_config(&config)?);
    let router = build_router(state, config.enable_openapi);
    info!(
        %config.addr,
        classifier = %config.classifier_url,
        cache = config.cache_capacity,
        images = config.render_images,
        openapi = config.enable_openapi,
        base = %config.base_url,
        "Binding HTTP listener"
    );
    let listener = TcpListener::bind(config.addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;
    info!("HTTP server exited");
    Ok(())
}

#[derive(Debug, Serialize, ToSchema)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct MessageBody {
    message: String,
}

#[derive(Debug, Deserialize, ToSchema)]
struct AnalyzeRequest {
    opinion: String,
}

#[derive(Debug, Clone, Copy)]
enum ErrorField {
    Error,
    Message,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    field: ErrorField,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            field: ErrorField::Error,
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            field: ErrorField::Message,
            message: message.into(),
        }
    }

    fn cancelled() -> Self {
        Self {
            status: StatusCode::from_u16(CLIENT_CLOSED_REQUEST)
                .unwrap_or(StatusCode::REQUEST_TIMEOUT),
            field: ErrorField::Error,
            message: CANCELLED_MESSAGE.to_string(),
        }
    }

    fn analyze_failed() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            field: ErrorField::Error,
            message: ANALYZE_FAILURE_MESSAGE.to_string(),
        }
    }

    fn submission_failed() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            field: ErrorField::Message,
            message: SUBMIT_FAILURE_MESSAGE.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self.field {
            ErrorField::Error => (self.status, Json(ErrorBody { error: self.message })).into_response(),
            ErrorField::Message => {
                (self.status, Json(MessageBody { message: self.message })).into_response()
            }
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(analyze_sentiment, submit_opinion, pattern_svg, health),
    components(schemas(
        AnalyzeRequest,
        SentimentResult,
        SentimentLabel,
        SubmissionRecord,
        ClientMetadata,
        NameOption,
        ErrorBody,
        MessageBody
    )),
    tags((name = "survey", description = "Opinion sentiment and submission"))
)]
struct ApiDoc;

fn build_router(state: SharedState, openapi: bool) -> Router {
    let mut router = Router::new()
        .route("/api/analyzeSentiment", post(analyze_sentiment))
        .route("/api/submitOpinion", post(submit_opinion))
        .route("/api/pattern", get(pattern_svg))
        .route("/healthz", get(health));
    if openapi {
        router = router.route("/api-docs/openapi.json", get(openapi_json));
    }
    router
        .with_state(state)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(true))
                .on_response(DefaultOnResponse::new().include_headers(true)),
        )
        .layer(CompressionLayer::new())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut stream) = signal(SignalKind::terminate()) {
            let _ = stream.recv().await;
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

fn parse_opinion(body: &[u8]) -> Result<String, ApiError> {
    let value: Value =
        serde_json::from_slice(body).map_err(|_| ApiError::bad_request(EMPTY_BODY_MESSAGE))?;
    let request: AnalyzeRequest =
        serde_json::from_value(value).map_err(|_| ApiError::invalid(INVALID_OPINION_MESSAGE))?;
    if request.opinion.trim().is_empty() {
        return Err(ApiError::invalid(INVALID_OPINION_MESSAGE));
    }
    Ok(request.opinion)
}

#[utoipa::path(
    post,
    path = "/api/analyzeSentiment",
    tag = "survey",
    request_body = AnalyzeRequest,
    responses(
        (status = 200, description = "Top sentiment for the opinion", body = SentimentResult),
        (status = 400, description = "Empty body or missing opinion"),
        (status = 499, description = "Client went away before classification finished", body = ErrorBody),
        (status = 500, description = "Classifier failure", body = ErrorBody)
    )
)]
async fn analyze_sentiment(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<SentimentResult>, ApiError> {
    let opinion = parse_opinion(&body)?;

    // dropping this handler (client disconnect) cancels the token
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();
    let worker = Arc::clone(&state);
    let outcome =
        tokio::task::spawn_blocking(move || worker.classifier.classify(&opinion, &token)).await;
    guard.disarm();

    match outcome {
        Ok(Ok(result)) => Ok(Json(result)),
        Ok(Err(ClassifyError::Aborted)) => Err(ApiError::cancelled()),
        Ok(Err(ClassifyError::Invalid(message))) => Err(ApiError::invalid(message)),
        Ok(Err(err)) => {
            warn!(error = %err, "sentiment analysis failed");
            Err(ApiError::analyze_failed())
        }
        Err(err) => {
            warn!(error = %err, "sentiment worker panicked");
            Err(ApiError::analyze_failed())
        }
    }
}

fn caller_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .and_then(|first| first.trim().parse::<IpAddr>().ok());
    let real = || {
        headers
            .get("x-real-ip")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<IpAddr>().ok())
    };
    forwarded.or_else(real).or(peer.map(|addr| addr.ip()))
}

fn persist(
    state: &AppState,
    record: SubmissionRecord,
    ip: Option<IpAddr>,
) -> Result<StoredSubmission, StoreError> {
    let location = match ip {
        Some(ip) => state.geolocator.locate(ip),
        None => DEFAULT_LOCATION.to_string(),
    };
    let image = state.images.as_ref().and_then(|archive| {
        match archive.store(&Pattern::generate(&record.opinion)) {
            Ok(name) => Some(name),
            Err(err) => {
                warn!(error = %err, "pattern image was not stored");
                None
            }
        }
    });
    let appended = state.submissions.append(record, location, image.clone());
    if appended.is_err() {
        // the record never landed, so its image must not either
        if let (Some(archive), Some(name)) = (&state.images, &image) {
            archive.discard(name);
        }
    }
    appended
}

#[utoipa::path(
    post,
    path = "/api/submitOpinion",
    tag = "survey",
    request_body = SubmissionRecord,
    responses(
        (status = 200, description = "Submission persisted", body = MessageBody),
        (status = 400, description = "Malformed submission", body = MessageBody),
        (status = 500, description = "Persistence failed", body = MessageBody)
    )
)]
async fn submit_opinion(
    State(state): State<SharedState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<MessageBody>, ApiError> {
    let record = serde_json::from_slice::<SubmissionRecord>(&body)
        .map_err(|_| ApiError::invalid(MALFORMED_SUBMISSION_MESSAGE))?
        .normalized();
    if record.opinion.trim().is_empty() {
        return Err(ApiError::invalid(INVALID_OPINION_MESSAGE));
    }
    let ip = caller_ip(&headers, peer.map(|ConnectInfo(addr)| addr));

    // blocking tasks run to completion even if this handler is dropped
    let worker = Arc::clone(&state);
    let job = tokio::task::spawn_blocking(move || persist(&worker, record, ip));
    match job.await {
        Ok(Ok(stored)) => {
            info!(
                id = %stored.id,
                grade = %stored.record.grade_level,
                location = %stored.location,
                image = stored.image.as_deref().unwrap_or("-"),
                "submission stored"
            );
            Ok(Json(MessageBody {
                message: SUBMIT_OK_MESSAGE.to_string(),
            }))
        }
        Ok(Err(err)) => {
            warn!(error = %err, "failed to persist submission");
            Err(ApiError::submission_failed())
        }
        Err(err) => {
            warn!(error = %err, "submission worker panicked");
            Err(ApiError::submission_failed())
        }
    }
}

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
struct PatternQuery {
    #[serde(default)]
    opinion: String,
}

#[utoipa::path(
    get,
    path = "/api/pattern",
    tag = "survey",
    params(PatternQuery),
    responses((status = 200, description = "Background pattern", body = String, content_type = "image/svg+xml"))
)]
async fn pattern_svg(Query(query): Query<PatternQuery>) -> impl IntoResponse {
    let svg = Pattern::generate(&query.opinion).to_svg();
    ([(header::CONTENT_TYPE, "image/svg+xml")], svg)
}

#[utoipa::path(
    get,
    path = "/healthz",
    tag = "survey",
    responses((status = 200, description = "Service status and cache counters"))
)]
async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "realvoice-web",
        "version": env!("CARGO_PKG_VERSION"),
        "base_url": state.base_url,
        "cache": state.classifier.stats(),
        "submissions": state.submissions.total(),
    }))
}

async fn openapi_json() -> impl IntoResponse {
    Json(ApiDoc::openapi())
}
