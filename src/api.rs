//! HTTP API for lifesync-server

use axum::{
    Extension, Json, Router,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::Config;
use crate::db::{self, Database};
use crate::intake;
use crate::llm::TextGenerator;
use crate::models::{HabitError, NewCompletion, ValidationError};
use crate::notify::{self, NotificationHub};
use crate::patterns;
use crate::schedule;
use crate::sync::{self, ConflictResolution, SyncError, SyncRequest};

/// Application state shared across handlers
pub struct AppState {
    pub db: Database,
    pub config: Config,
    pub generator: Arc<dyn TextGenerator>,
    pub notifications: NotificationHub,
}

impl AppState {
    pub fn new(db: Database, config: Config, generator: Arc<dyn TextGenerator>) -> Arc<Self> {
        Arc::new(Self {
            db,
            config,
            generator,
            notifications: NotificationHub::new(),
        })
    }
}

/// The user a request acts as, resolved from its bearer token
#[derive(Debug, Clone)]
pub struct Actor(pub String);

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/sync", post(sync_batch))
        .route("/api/v1/sync/status", get(sync_status))
        .route("/api/v1/sync/resolve-conflict", post(resolve_conflict))
        .route("/api/v1/schedule/optimize", post(optimize_schedule))
        .route("/api/v1/habits/analyze", post(analyze_habits))
        .route("/api/v1/habits/patterns", get(behavior_patterns))
        .route("/api/v1/habits/{id}/complete", post(complete_habit))
        .route("/api/v1/habits/{id}/patterns", get(habit_patterns))
        .route("/api/v1/habits/{id}/insights", get(habit_insights))
        .route("/api/v1/insights/{id}/read", put(mark_insight_read))
        .route("/api/v1/tasks/parse", post(parse_tasks))
        .route("/api/v1/notifications", get(drain_notifications))
        .route("/api/v1/notifications/overdue", post(sweep_overdue))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Health check endpoint (no auth required)
async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "lifesync-server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Auth middleware - resolves the Bearer token to an [`Actor`]
async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    // Skip auth for health check
    if request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Missing or invalid Authorization header" })),
        )
            .into_response();
    };

    let Some(user_id) = state.config.resolve_token(token) else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Invalid API token" })),
        )
            .into_response();
    };

    let actor = Actor(user_id.to_string());
    request.extensions_mut().insert(actor);
    next.run(request).await
}

/// Apply a batch of client operations
async fn sync_batch(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
    Json(request): Json<SyncRequest>,
) -> Result<impl IntoResponse, ApiError> {
    tracing::info!(
        user_id = %user_id,
        device_id = %request.device_id,
        last_sync = ?request.last_sync_timestamp,
        operations = request.operations.len(),
        "Sync request received"
    );

    let response = sync::sync(&state.db, &user_id, &request, Utc::now())?;

    if !response.conflicts.is_empty() {
        tracing::info!(
            conflicts = response.conflicts.len(),
            "Sync conflicts detected"
        );
    }

    tracing::info!(
        device_id = %request.device_id,
        processed = response.processed_operations,
        outgoing_changes = response.server_changes.len(),
        "Sync complete"
    );

    Ok(Json(response))
}

async fn sync_status(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(sync::sync_status(&state.db, &user_id, Utc::now())?))
}

async fn resolve_conflict(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
    Json(request): Json<ConflictResolution>,
) -> Result<impl IntoResponse, ApiError> {
    let outcome = sync::resolve_conflict(&state.db, &user_id, &request, Utc::now())?;
    Ok(Json(outcome))
}

#[derive(Debug, Default, Deserialize)]
struct OptimizeRequest {
    /// Defaults to today (UTC)
    #[serde(default)]
    date: Option<NaiveDate>,
}

async fn optimize_schedule(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
    Json(request): Json<OptimizeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let date = request.date.unwrap_or_else(|| now.date_naive());

    let plan = schedule::optimize_schedule(
        &state.db,
        state.generator.as_ref(),
        state.config.llm.schedule_timeout(),
        &user_id,
        date,
        now,
    )
    .await?;

    Ok(Json(plan))
}

async fn complete_habit(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
    Path(habit_id): Path<String>,
    Json(completion): Json<NewCompletion>,
) -> Result<impl IntoResponse, ApiError> {
    let (completion, habit) =
        state
            .db
            .record_completion(&user_id, &habit_id, completion, Utc::now())?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "completion": completion,
            "current_streak": habit.current_streak,
            "longest_streak": habit.longest_streak,
            "total_completions": habit.total_completions,
        })),
    ))
}

async fn habit_patterns(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
    Path(habit_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(patterns::habit_patterns(
        &state.db,
        &user_id,
        &habit_id,
        Utc::now(),
    )?))
}

async fn analyze_habits(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let report =
        patterns::analyze_user(&state.db, &state.notifications, &user_id, Utc::now())?;

    tracing::info!(
        user_id = %user_id,
        habits = report.habits.len(),
        insights = report.insights_created,
        pending_notifications = state.notifications.pending(&user_id),
        "Habit analysis complete"
    );
    Ok(Json(report))
}

async fn behavior_patterns(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(patterns::behavior_patterns(&state.db, &user_id)?))
}

#[derive(Debug, Default, Deserialize)]
struct InsightQuery {
    #[serde(default)]
    unread_only: bool,
}

async fn habit_insights(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
    Path(habit_id): Path<String>,
    Query(query): Query<InsightQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let insights =
        patterns::habit_insights(&state.db, &user_id, &habit_id, query.unread_only)?;
    Ok(Json(insights))
}

async fn mark_insight_read(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
    Path(insight_id): Path<i64>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state
        .db
        .with_conn(|conn| db::mark_insight_read(conn, &user_id, insight_id))?;

    if !updated {
        return Err(NotFound(format!("insight {insight_id}")).into());
    }
    Ok(Json(json!({ "id": insight_id, "is_read": true })))
}

#[derive(Debug, Deserialize)]
struct ParseRequest {
    text: String,
}

async fn parse_tasks(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ParseRequest>,
) -> impl IntoResponse {
    let tasks = intake::parse_tasks(
        state.generator.as_ref(),
        state.config.llm.parse_timeout(),
        &request.text,
    )
    .await;

    Json(json!({ "tasks": tasks }))
}

async fn drain_notifications(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
) -> impl IntoResponse {
    Json(json!({ "notifications": state.notifications.drain(&user_id) }))
}

async fn sweep_overdue(
    State(state): State<Arc<AppState>>,
    Extension(Actor(user_id)): Extension<Actor>,
) -> Result<impl IntoResponse, ApiError> {
    let queued = notify::sweep_overdue(&state.db, &state.notifications, &user_id, Utc::now())?;
    Ok(Json(json!({ "queued": queued })))
}

/// Marker for lookups that found nothing the actor may see
#[derive(Debug, thiserror::Error)]
#[error("{0} not found")]
struct NotFound(String);

/// API error type
#[derive(Debug)]
pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        if let Some(err) = self.0.downcast_ref::<SyncError>() {
            return match err {
                SyncError::Validation(_) | SyncError::UnsupportedEntity(_) => {
                    StatusCode::BAD_REQUEST
                }
                SyncError::NotFound { .. } => StatusCode::NOT_FOUND,
                SyncError::Storage(_) | SyncError::Serialize(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            };
        }
        if let Some(err) = self.0.downcast_ref::<HabitError>() {
            return match err {
                HabitError::Validation(_) => StatusCode::BAD_REQUEST,
                HabitError::NotFound(_) => StatusCode::NOT_FOUND,
                HabitError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            };
        }
        if self.0.is::<ValidationError>() {
            return StatusCode::BAD_REQUEST;
        }
        if self.0.is::<NotFound>() {
            return StatusCode::NOT_FOUND;
        }
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self.0, "API error");
        } else {
            tracing::warn!(status = status.as_u16(), error = %self.0, "Request rejected");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TokenConfig;
    use crate::llm::testing::ScriptedGenerator;
    use crate::models::{Habit, Task};
    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    const TOKEN: &str = "ls_test_token";

    fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.tokens.push(TokenConfig {
            name: "test".to_string(),
            user_id: "alice".to_string(),
            token_hash: TOKEN.to_string(),
        });
        let db = Database::open_in_memory().unwrap();
        AppState::new(db, config, Arc::new(ScriptedGenerator::failing()))
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"));
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn send(state: &Arc<AppState>, req: Request<Body>) -> (StatusCode, Value) {
        let response = create_router(state.clone()).oneshot(req).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, body)
    }

    #[tokio::test]
    async fn health_needs_no_token() {
        let state = test_state();
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(&state, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn api_rejects_missing_and_unknown_tokens() {
        let state = test_state();
        let bare = Request::builder()
            .uri("/api/v1/sync/status")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, bare).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let wrong = Request::builder()
            .uri("/api/v1/sync/status")
            .header(header::AUTHORIZATION, "Bearer nope")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(&state, wrong).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error"], "Invalid API token");
    }

    #[tokio::test]
    async fn sync_applies_operations_as_token_user() {
        let state = test_state();
        let body = json!({
            "device_id": "phone",
            "operations": [
                {
                    "action": "CREATE",
                    "entity_type": "task",
                    "entity_id": "t-1",
                    "data": { "title": "Buy milk" },
                    "timestamp": "2025-06-10T09:00:00Z"
                },
                {
                    "action": "DELETE",
                    "entity_type": "task",
                    "entity_id": "missing",
                    "timestamp": "2025-06-10T09:00:00Z"
                }
            ]
        });

        let (status, response) = send(&state, request("POST", "/api/v1/sync", Some(body))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["processed_operations"], 1);
        assert_eq!(response["conflicts"][0]["operation_index"], 1);
        assert_eq!(response["conflicts"][0]["conflict_type"], "not_found");

        let task = state
            .db
            .with_conn(|conn| db::get_task(conn, "t-1"))
            .unwrap()
            .unwrap();
        assert_eq!(task.user_id, "alice");

        let (status, status_body) =
            send(&state, request("GET", "/api/v1/sync/status", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(status_body["data_counts"]["tasks"], 1);
    }

    #[tokio::test]
    async fn resolve_conflict_maps_errors_to_status() {
        let state = test_state();
        let unsupported = json!({
            "entity_type": "goal",
            "entity_id": "g-1",
            "resolution": "client",
            "data": {}
        });
        let (status, body) = send(
            &state,
            request("POST", "/api/v1/sync/resolve-conflict", Some(unsupported)),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("goal"));

        let missing = json!({
            "entity_type": "task",
            "entity_id": "nope",
            "resolution": "merge",
            "merged_data": { "title": "x" }
        });
        let (status, _) = send(
            &state,
            request("POST", "/api/v1/sync/resolve-conflict", Some(missing)),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn schedule_falls_back_when_generator_fails() {
        let state = test_state();
        state
            .db
            .with_conn(|conn| {
                let mut habit = Habit::new("alice", "Stretch", Utc::now());
                habit.category = Some("exercise".to_string());
                db::insert_habit(conn, &habit)?;
                db::insert_task(conn, &Task::new("alice", "Write report", Utc::now()))
            })
            .unwrap();

        let (status, body) = send(
            &state,
            request(
                "POST",
                "/api/v1/schedule/optimize",
                Some(json!({ "date": "2025-06-10" })),
            ),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["optimization_score"], 70.0);
        assert_eq!(body["source"], "fallback");
        assert_eq!(body["schedule_blocks"][0]["type"], "habit");
        assert_eq!(body["target_date"], "2025-06-10");
    }

    #[tokio::test]
    async fn habit_completion_and_patterns() {
        let state = test_state();
        let habit = Habit::new("alice", "Read", Utc::now());
        state
            .db
            .with_conn(|conn| db::insert_habit(conn, &habit))
            .unwrap();

        let uri = format!("/api/v1/habits/{}/complete", habit.id);
        let (status, body) = send(
            &state,
            request("POST", &uri, Some(json!({ "quality_rating": 4 }))),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["current_streak"], 1);

        let (status, body) = send(
            &state,
            request("POST", &uri, Some(json!({ "quality_rating": 9 }))),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("quality_rating"));

        let uri = format!("/api/v1/habits/{}/patterns", habit.id);
        let (status, body) = send(&state, request("GET", &uri, None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["completion_count"], 1);
        assert!(body["patterns"].is_null());
        assert_eq!(body["streaks_consistent"], true);

        let (status, _) = send(
            &state,
            request("GET", "/api/v1/habits/unknown/patterns", None),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_insight_is_not_found() {
        let state = test_state();
        let (status, _) = send(&state, request("PUT", "/api/v1/insights/42/read", None)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn parse_returns_empty_list_on_generator_failure() {
        let state = test_state();
        let (status, body) = send(
            &state,
            request(
                "POST",
                "/api/v1/tasks/parse",
                Some(json!({ "text": "call mum tomorrow" })),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tasks"], json!([]));
    }

    #[tokio::test]
    async fn overdue_sweep_feeds_notifications() {
        let state = test_state();
        let mut task = Task::new("alice", "Renew passport", Utc::now());
        task.due_date = Some(Utc::now() - chrono::Duration::days(1));
        state
            .db
            .with_conn(|conn| db::insert_task(conn, &task))
            .unwrap();

        let (status, body) = send(
            &state,
            request("POST", "/api/v1/notifications/overdue", None),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["queued"], 1);

        let (_, body) = send(&state, request("GET", "/api/v1/notifications", None)).await;
        assert_eq!(body["notifications"][0]["type"], "overdue_task");

        let (_, body) = send(&state, request("GET", "/api/v1/notifications", None)).await;
        assert_eq!(body["notifications"], json!([]));
    }

    #[tokio::test]
    async fn overdue_sweep_stays_within_the_callers_tasks() {
        let state = test_state();
        let yesterday = Utc::now() - chrono::Duration::days(1);
        let mut mine = Task::new("alice", "Renew passport", yesterday);
        mine.due_date = Some(yesterday);
        let mut theirs = Task::new("bob", "Pay rent", yesterday);
        theirs.due_date = Some(yesterday);
        state
            .db
            .with_conn(|conn| {
                db::insert_task(conn, &mine)?;
                db::insert_task(conn, &theirs)
            })
            .unwrap();

        let mut queued = Vec::new();
        for _ in 0..3 {
            let (status, body) = send(
                &state,
                request("POST", "/api/v1/notifications/overdue", None),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            queued.push(body["queued"].clone());
        }

        assert_eq!(queued, vec![json!(1), json!(0), json!(0)]);
        assert_eq!(state.notifications.pending("alice"), 1);
        assert_eq!(state.notifications.pending("bob"), 0);
    }

    #[tokio::test]
    async fn behavior_patterns_follow_analysis() {
        let state = test_state();
        let now = Utc::now();
        let habit = Habit::new("alice", "Read", now - chrono::Duration::days(10));
        state
            .db
            .with_conn(|conn| db::insert_habit(conn, &habit))
            .unwrap();
        for days_ago in (1..=9).rev() {
            let at = now - chrono::Duration::days(days_ago);
            let completion = NewCompletion {
                completed_at: Some(at),
                quality_rating: Some(4),
                ..Default::default()
            };
            state
                .db
                .record_completion("alice", &habit.id, completion, at)
                .unwrap();
        }

        let (status, body) = send(&state, request("GET", "/api/v1/habits/patterns", None)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([]));

        let (status, _) = send(&state, request("POST", "/api/v1/habits/analyze", None)).await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&state, request("GET", "/api/v1/habits/patterns", None)).await;
        assert_eq!(status, StatusCode::OK);
        let stored = body.as_array().unwrap();
        assert_eq!(stored.len(), 4);
        assert!(stored.iter().all(|p| p["confidence_score"] == 0.8));
        assert!(
            stored
                .iter()
                .any(|p| p["pattern_type"] == "habit_synergy_score" && p["data"] == 0.5)
        );
    }
}
