//! HTTP surface for sheetvault.
//!
//! The router is built from an [`AppState`] so the binary and the
//! integration tests drive exactly the same routes.

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod handlers;
pub mod state;
pub mod tasks;
pub mod webhook;

pub use state::{AppState, KeyPolicy};

use handlers::*;

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        // Edit sessions
        .route(
            "/sessions",
            post(start_session_handler).get(session_history_handler),
        )
        .route("/sessions/{id}", get(get_session_handler))
        .route("/sessions/{id}/complete", post(complete_session_handler))
        .route(
            "/sessions/{id}/force-complete",
            post(force_complete_session_handler),
        )
        .route("/locks", get(check_lock_handler))
        // Backup replication
        .route("/backup/migrate", post(migrate_handler))
        .route("/backup/sync", post(sync_handler))
        .route("/backup/sync/bidirectional", post(sync_bidirectional_handler))
        .route("/backup/conflicts/resolve", post(resolve_conflict_handler))
        .route("/backup/records", get(records_handler))
        .route("/backup/log", get(log_handler))
        // Editing bridge
        .route("/bridge", get(list_copies_handler))
        .route("/bridge/stage", post(stage_handler))
        .route("/bridge/{id}", get(get_copy_handler))
        .route("/bridge/{id}/fork", post(fork_handler))
        .route("/bridge/{id}/open", post(open_handler))
        .route("/bridge/{id}/layout", post(layout_handler))
        .route("/bridge/{id}/close", post(close_handler))
        .route("/bridge/{id}/reconcile", post(reconcile_handler))
        // Webhooks
        .route(
            "/webhooks/graph",
            get(graph_webhook_handler).post(graph_webhook_handler),
        )
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
