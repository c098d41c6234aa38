use std::sync::{Arc, Mutex};

use anyhow::Context;
use axum::{
    routing::{get, post},
    Router,
};
use rusqlite::Connection;
use subtrack_core::config::{NotifierKind, SubtrackConfig};
use subtrack_scheduler::{
    Clock, LogNotifier, NotificationDispatcher, RetryPolicy, SchedulerEngine, SubscriptionTracker,
    WebhookNotifier, WorkflowAdmin, WorkflowExecutor, WorkflowLifecycleManager, WorkflowStore,
};
use subtrack_subscriptions::SubscriptionStore;
use subtrack_users::UserDirectory;
use tracing::info;

/// Central shared state, passed as `Arc<AppState>` to all Axum handlers.
pub struct AppState {
    pub config: SubtrackConfig,
    pub users: Arc<UserDirectory>,
    pub tracker: SubscriptionTracker,
    pub admin: WorkflowAdmin,
}

/// Everything the binary needs, wired over one SQLite connection.
pub struct Stack {
    pub state: Arc<AppState>,
    pub engine: SchedulerEngine,
}

/// Run every crate's schema migration on `conn` (idempotent).
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    subtrack_users::db::init_db(conn)?;
    subtrack_subscriptions::db::init_db(conn)?;
    subtrack_scheduler::db::init_db(conn)?;
    Ok(())
}

fn build_dispatcher(config: &SubtrackConfig) -> anyhow::Result<Arc<dyn NotificationDispatcher>> {
    let dispatcher: Arc<dyn NotificationDispatcher> = match config.notifier.kind {
        NotifierKind::Log => Arc::new(LogNotifier),
        NotifierKind::Webhook => {
            let hook = config
                .notifier
                .webhook
                .as_ref()
                .context("notifier.kind = \"webhook\" requires a [notifier.webhook] section")?;
            Arc::new(WebhookNotifier::new(hook)?)
        }
    };
    info!(dispatcher = dispatcher.name(), "notification dispatcher ready");
    Ok(dispatcher)
}

/// Build the stores, the lifecycle manager, the executor and the engine.
pub fn assemble(
    config: SubtrackConfig,
    db: Arc<Mutex<Connection>>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<Stack> {
    let dispatcher = build_dispatcher(&config)?;

    let users = Arc::new(UserDirectory::new(db.clone()));
    let subscriptions = Arc::new(SubscriptionStore::new(db.clone(), clock.clone()));
    let workflows = Arc::new(WorkflowStore::new(db, clock.clone()));
    let lifecycle = Arc::new(WorkflowLifecycleManager::new(
        subscriptions.clone(),
        workflows.clone(),
        config.gateway.workflow_target(),
        &config.scheduler,
    ));
    let executor = Arc::new(WorkflowExecutor::new(
        subscriptions.clone(),
        users.clone(),
        workflows.clone(),
        dispatcher,
        lifecycle.clone(),
        RetryPolicy::from_config(&config.scheduler),
    ));
    let engine = SchedulerEngine::new(
        workflows.clone(),
        executor,
        lifecycle.clone(),
        config.scheduler.clone(),
    );

    let state = Arc::new(AppState {
        tracker: SubscriptionTracker::new(subscriptions.clone(), users.clone(), lifecycle, clock),
        admin: WorkflowAdmin::new(workflows, subscriptions),
        users,
        config,
    });
    Ok(Stack { state, engine })
}

/// Assemble the admin router.
pub fn build_router(state: Arc<AppState>) -> Router {
    use crate::http::{health, workflows};

    Router::new()
        .route("/health", get(health::health_handler))
        .route("/api/v1/workflows", get(workflows::running))
        .route("/api/v1/workflows/failed", get(workflows::failed))
        .route("/api/v1/workflows/undelivered", get(workflows::undelivered))
        .route("/api/v1/workflows/cancel-all", post(workflows::cancel_all))
        .route(
            "/api/v1/workflows/subscription/reminder",
            get(workflows::running),
        )
        .route("/api/v1/workflows/{handle}", get(workflows::status))
        .route("/api/v1/workflows/{handle}/steps", get(workflows::steps))
        .route("/api/v1/workflows/{handle}/cancel", post(workflows::cancel))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
