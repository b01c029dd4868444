use anyhow::{Context, Result};
use axum::body::Bytes;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tower_governor::GovernorLayer;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;
use webhook_intake::audit::{AuditSink, TracingAuditSink};
use webhook_intake::config::Config;
use webhook_intake::dispatcher::{Dispatcher, epoch_seconds, run_dispatch_worker};
use webhook_intake::handlers::{LoggingEventEmitter, LoggingNotificationSender, TopicRouter};
use webhook_intake::keys::idempotency_key;
use webhook_intake::model::{EventStatus, RecordOutcome, Topic, WebhookEvent, PRIORITY_NORMAL};
use webhook_intake::retry::{RetryPolicy, run_retention_sweeper};
use webhook_intake::store::WebhookStore;
use webhook_intake::validator::{InboundNotification, ValidationError, validate_request};

#[derive(Clone)]
struct AppState {
    config: Config,
    store: WebhookStore,
    audit: Arc<dyn AuditSink>,
    workers_alive: Arc<AtomicBool>,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_tracing();

    let config = Config::from_env().context("load intake config")?;
    let store = WebhookStore::open(&config.db_path).context("open webhook store")?;

    let router = Arc::new(TopicRouter::new(
        Arc::new(LoggingNotificationSender),
        Arc::new(LoggingEventEmitter),
    ));
    let dispatcher = Dispatcher::new(store.clone(), router, RetryPolicy::from_config(&config));

    let workers_alive = Arc::new(AtomicBool::new(true));
    let mut worker_handles = Vec::with_capacity(config.worker_count);
    for _ in 0..config.worker_count {
        worker_handles.push(tokio::spawn(run_dispatch_worker(
            dispatcher.clone(),
            std::time::Duration::from_millis(config.poll_interval_ms),
            workers_alive.clone(),
        )));
    }

    let sweeper_handle = tokio::spawn(run_retention_sweeper(
        store.clone(),
        config.dlq_retention_seconds,
        std::time::Duration::from_secs(config.dlq_sweep_interval_seconds),
    ));

    let state = Arc::new(AppState {
        audit: Arc::new(TracingAuditSink::new(config.audit_log_limit_per_minute)),
        store,
        workers_alive: workers_alive.clone(),
        config,
    });

    let period_ms = ip_refill_period_ms(state.config.ip_limit_per_minute);
    let mut governor_builder = GovernorConfigBuilder::default()
        .key_extractor(SmartIpKeyExtractor)
        .use_headers();
    governor_builder
        .per_millisecond(period_ms)
        .burst_size(state.config.ip_limit_per_minute)
        .methods(vec![Method::POST]);
    let governor_config = Arc::new(
        governor_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("build governor config"))?,
    );

    let app = Router::new()
        .route(
            "/webhooks/marketplace",
            post(intake_handler).get(challenge_handler),
        )
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/dlq", get(list_dlq_handler))
        .route("/dlq/{event_id}/replay", post(replay_dlq_handler))
        .layer(DefaultBodyLimit::max(state.config.max_payload_bytes))
        .layer(GovernorLayer::new(governor_config))
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.bind_addr)
        .await
        .with_context(|| format!("bind {}", state.config.bind_addr))?;

    info!(
        bind = %state.config.bind_addr,
        environment = %state.config.environment,
        workers = state.config.worker_count,
        "webhook intake listening"
    );

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
    });

    server.await.context("serve webhook intake")?;

    workers_alive.store(false, Ordering::SeqCst);
    sweeper_handle.abort();
    for handle in worker_handles {
        handle.abort();
        let _ = handle.await;
    }

    Ok(())
}

/// Intake path: validate, persist a PENDING record, acknowledge. Never
/// processes inline; the marketplace expects a sub-second response.
async fn intake_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let now_epoch = epoch_seconds();

    let notification = match validate_request(
        &state.config,
        remote_addr.ip(),
        &headers,
        &body,
        now_epoch,
    ) {
        Ok(notification) => notification,
        Err(err) => {
            state
                .audit
                .record_validation_failure(remote_addr.ip(), err.reason(), now_epoch);
            return match err {
                ValidationError::Forbidden(reason) => {
                    (StatusCode::FORBIDDEN, Json(json!({"error": reason})))
                }
                ValidationError::BadRequest(reason) => {
                    (StatusCode::BAD_REQUEST, Json(json!({"error": reason})))
                }
            };
        }
    };

    let event = build_event(notification, now_epoch);
    let event_id = event.event_id.clone();
    match state.store.record_or_reject(event) {
        Ok(RecordOutcome::Inserted) => (
            StatusCode::OK,
            Json(json!({"received": true, "webhookId": event_id})),
        ),
        Ok(RecordOutcome::Duplicate(existing)) => {
            info!(
                event_id = %existing.event_id,
                topic = %existing.topic,
                "duplicate delivery acknowledged without side effects"
            );
            (
                StatusCode::OK,
                Json(json!({"received": true, "webhookId": existing.event_id})),
            )
        }
        Err(err) => {
            error!(error = %err, "failed to persist webhook record");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "intake unavailable"})),
            )
        }
    }
}

/// The marketplace probes subscriptions with a GET carrying a challenge
/// parameter; echo it back verbatim.
async fn challenge_handler(Query(params): Query<HashMap<String, String>>) -> Response {
    match params.get("challenge") {
        Some(challenge) => (StatusCode::OK, challenge.clone()).into_response(),
        None => (StatusCode::OK, Json(json!({"status": "ok"}))).into_response(),
    }
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({"status": "ok"})))
}

async fn ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if !state.workers_alive.load(Ordering::SeqCst) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status":"not_ready","reason":"dispatch workers not running"})),
        );
    }

    let pending = state.store.pending_count().unwrap_or_default();
    let dead_letter = state.store.dlq_count().unwrap_or_default();

    (
        StatusCode::OK,
        Json(json!({
            "status": "ready",
            "pending": pending,
            "deadLetter": dead_letter,
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
}

#[derive(Debug, Deserialize)]
struct DlqListParams {
    limit: Option<usize>,
}

async fn list_dlq_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<DlqListParams>,
) -> impl IntoResponse {
    let limit = params.limit.unwrap_or(50).min(500);
    match state.store.list_dlq_events(limit) {
        Ok(entries) => (StatusCode::OK, Json(json!({"entries": entries}))),
        Err(err) => {
            error!(error = %err, "failed to list dead-letter entries");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "dead letter store unavailable"})),
            )
        }
    }
}

async fn replay_dlq_handler(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> impl IntoResponse {
    match state.store.replay_dlq_event(&event_id, epoch_seconds()) {
        Ok(true) => {
            warn!(event_id = %event_id, "dead-letter event replayed by operator");
            (StatusCode::OK, Json(json!({"replayed": true})))
        }
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "no such dead-letter event"})),
        ),
        Err(err) => {
            error!(event_id = %event_id, error = %err, "replay failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "replay unavailable"})),
            )
        }
    }
}

fn build_event(notification: InboundNotification, now_epoch: i64) -> WebhookEvent {
    let priority = Topic::parse(&notification.topic)
        .map(Topic::priority)
        .unwrap_or(PRIORITY_NORMAL);

    WebhookEvent {
        event_id: Uuid::new_v4().to_string(),
        idempotency_key: idempotency_key(
            &notification.topic,
            &notification.resource,
            &notification.sender_id,
            notification.sent_at_epoch,
        ),
        topic: notification.topic,
        resource: notification.resource,
        sender_id: notification.sender_id,
        application_id: notification.application_id,
        attempt_id: notification.attempt_id,
        sent_at_epoch: notification.sent_at_epoch,
        received_at_epoch: now_epoch,
        priority,
        status: EventStatus::Pending,
        attempts: 0,
        visible_at_epoch: now_epoch,
        processed_at_epoch: None,
        last_error: None,
        replay_count: 0,
        payload: notification.payload,
    }
}

fn ip_refill_period_ms(limit_per_minute: u32) -> u64 {
    if limit_per_minute == 0 {
        return 1;
    }

    let period = 60_000u64 / u64::from(limit_per_minute);
    period.max(1)
}

fn setup_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
