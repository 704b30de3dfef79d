use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, Method, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use coursegate_engine::gating::GatingSnapshot;
use coursegate_engine::ledger::UnlockReceipt;
use coursegate_engine::progress::{PlaybackSample, SampleOutcome};
use coursegate_engine::sync::UpdateOrigin;
use coursegate_engine::Engine;
use coursegate_shared::{CourseId, ItemStatus, LearnerId, LedgerEntry};
use futures::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

use crate::config::ServerConfig;
use crate::error::ApiError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub config: Arc<ServerConfig>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_check))
        .route("/learners/:learner/courses", get(list_courses))
        .route("/learners/:learner/courses/:course", get(get_course))
        .route("/learners/:learner/courses/:course/unlock", post(unlock_course))
        .route("/learners/:learner/courses/:course/quiz", post(complete_quiz))
        .route("/learners/:learner/courses/:course/events", get(course_events))
        .route("/learners/:learner/progress", post(record_progress))
        .route("/learners/:learner/balance", get(balance))
        .route("/learners/:learner/ledger", get(ledger))
        .route("/admin/learners/:learner/credit", post(admin_credit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct ProgressResponse {
    status: ItemStatus,
    persisted: bool,
}

#[derive(Serialize)]
struct BalanceResponse {
    balance: u64,
}

#[derive(Deserialize)]
struct CreditRequest {
    amount: u64,
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn list_courses(
    State(state): State<AppState>,
    Path(learner): Path<LearnerId>,
) -> Result<Json<Vec<GatingSnapshot>>, ApiError> {
    Ok(Json(state.engine.resolve_catalogue(&learner).await?))
}

/// Resolve one course and refresh its materialized status.
async fn get_course(
    State(state): State<AppState>,
    Path((learner, course)): Path<(LearnerId, CourseId)>,
) -> Result<Json<GatingSnapshot>, ApiError> {
    Ok(Json(state.engine.materialize(&learner, &course).await?))
}

/// Playback samples are fire-and-forget: the player never blocks on
/// persistence, so this always answers 202.
async fn record_progress(
    State(state): State<AppState>,
    Path(learner): Path<LearnerId>,
    Json(sample): Json<PlaybackSample>,
) -> (StatusCode, Json<ProgressResponse>) {
    let outcome = state.engine.record_sample(&learner, &sample).await;
    let persisted = matches!(outcome, SampleOutcome::Written { .. });
    (
        StatusCode::ACCEPTED,
        Json(ProgressResponse {
            status: outcome.status(),
            persisted,
        }),
    )
}

async fn unlock_course(
    State(state): State<AppState>,
    Path((learner, course)): Path<(LearnerId, CourseId)>,
) -> Result<Json<UnlockReceipt>, ApiError> {
    Ok(Json(state.engine.unlock(&learner, &course).await?))
}

async fn complete_quiz(
    State(state): State<AppState>,
    Path((learner, course)): Path<(LearnerId, CourseId)>,
) -> Result<Json<GatingSnapshot>, ApiError> {
    state.engine.complete_quiz(&learner, &course).await?;
    Ok(Json(state.engine.resolve(&learner, &course).await?))
}

async fn balance(
    State(state): State<AppState>,
    Path(learner): Path<LearnerId>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state.engine.balance(&learner).await?;
    Ok(Json(BalanceResponse { balance }))
}

async fn ledger(
    State(state): State<AppState>,
    Path(learner): Path<LearnerId>,
) -> Result<Json<Vec<LedgerEntry>>, ApiError> {
    Ok(Json(state.engine.history(&learner).await?))
}

/// Server-sent stream of gating updates for one course. The connection
/// closing drops the subscription.
async fn course_events(
    State(state): State<AppState>,
    Path((learner, course)): Path<(LearnerId, CourseId)>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    // Fail fast on unknown courses instead of streaming nothing.
    let initial = state.engine.resolve(&learner, &course).await?;
    let subscription = state.engine.subscribe(&learner, &course);
    debug!(learner = %learner, course = %course, "event stream opened");

    let first = stream::once(async move { Event::default().event("snapshot").json_data(&initial) });
    let updates = stream::unfold(subscription, |mut subscription| async move {
        let update = subscription.recv().await?;
        let name = match update.origin {
            UpdateOrigin::Server => "server",
            UpdateOrigin::Local => "local",
            UpdateOrigin::Resync => "resync",
        };
        Some((Event::default().event(name).json_data(&update), subscription))
    });

    Ok(Sse::new(futures::StreamExt::chain(first, updates))
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

fn verify_admin_token(headers: &HeaderMap, config: &ServerConfig) -> Result<(), ApiError> {
    let Some(ref expected) = config.admin_token else {
        return Err(ApiError::Forbidden(
            "Admin API is disabled (no ADMIN_TOKEN configured)".into(),
        ));
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = auth.strip_prefix("Bearer ").unwrap_or(auth);

    use subtle::ConstantTimeEq;
    let token_bytes = token.as_bytes();
    let expected_bytes = expected.as_bytes();
    if token_bytes.len() != expected_bytes.len()
        || token_bytes.ct_eq(expected_bytes).unwrap_u8() != 1
    {
        return Err(ApiError::Forbidden("Invalid admin token".into()));
    }

    Ok(())
}

/// Credit coins to a learner on behalf of an external reward or payment
/// flow. Creates the learner on first credit.
async fn admin_credit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(learner): Path<LearnerId>,
    Json(req): Json<CreditRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
    verify_admin_token(&headers, &state.config)?;
    if req.amount == 0 {
        return Err(ApiError::BadRequest("amount must be positive".into()));
    }

    let balance = state.engine.credit(&learner, req.amount).await?;
    info!(learner = %learner, amount = req.amount, balance, "Admin credited coins");
    Ok(Json(BalanceResponse { balance }))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use coursegate_engine::catalogue::CatalogueFile;
    use coursegate_engine::EngineConfig;
    use coursegate_shared::{Course, CourseTier, CourseVideo};
    use coursegate_store::SqliteProgressStore;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;

    async fn app(admin_token: Option<&str>) -> Router {
        let store = Arc::new(SqliteProgressStore::open_in_memory().unwrap());
        let engine = Engine::new(store, EngineConfig::default());
        let course = |id: &str, videos: &[&str]| Course {
            id: id.parse().unwrap(),
            title: id.to_string(),
            tier: CourseTier::Intermediate,
            unlock_cost: None,
            quiz_id: None,
            videos: videos
                .iter()
                .map(|v| CourseVideo {
                    id: v.parse().unwrap(),
                    order: None,
                    duration: None,
                })
                .collect(),
        };
        engine
            .catalogue()
            .import(&CatalogueFile {
                courses: vec![course("c1", &["v1", "v2"]), course("c2", &["w1"])],
            })
            .await
            .unwrap();

        build_router(AppState {
            engine: Arc::new(engine),
            config: Arc::new(ServerConfig {
                admin_token: admin_token.map(str::to_string),
                ..ServerConfig::default()
            }),
        })
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), 1 << 20).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    fn post_json(uri: &str, body: Value, token: Option<&str>) -> Request<Body> {
        let mut builder = Request::post(uri).header("content-type", "application/json");
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_progress_then_course_view() {
        let app = app(None).await;

        let (status, body) = send(
            &app,
            post_json(
                "/learners/l1/progress",
                json!({
                    "video_id": "v1",
                    "course_id": "c1",
                    "position_secs": 95.0,
                    "duration": "01:40",
                    "trigger": "pause"
                }),
                None,
            ),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "completed");

        let (status, body) = send(
            &app,
            Request::get("/learners/l1/courses/c1").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["course"], "in_progress");
        assert_eq!(body["videos"][1]["status"], "unblocked");
    }

    #[tokio::test]
    async fn test_unlock_requires_funds() {
        let app = app(Some("secret")).await;

        let (status, _) = send(&app, post_json("/admin/learners/l1/credit", json!({"amount": 50}), Some("secret"))).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&app, post_json("/learners/l1/courses/c2/unlock", json!({}), None)).await;
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["balance"], 50);
        assert_eq!(body["cost"], 200);

        let (_, body) = send(&app, post_json("/admin/learners/l1/credit", json!({"amount": 150}), Some("secret"))).await;
        assert_eq!(body["balance"], 200);

        let (status, body) = send(&app, post_json("/learners/l1/courses/c2/unlock", json!({}), None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["new_balance"], 0);

        let (_, body) = send(
            &app,
            Request::get("/learners/l1/ledger").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(body.as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn test_admin_token_enforced() {
        let guarded = app(Some("secret")).await;
        let (status, _) = send(&guarded, post_json("/admin/learners/l1/credit", json!({"amount": 5}), Some("wrong"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let disabled = app(None).await;
        let (status, _) = send(&disabled, post_json("/admin/learners/l1/credit", json!({"amount": 5}), Some("secret"))).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_unknown_course_is_404() {
        let app = app(None).await;
        let (status, _) = send(
            &app,
            Request::get("/learners/l1/courses/nope").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
