//! `api` crate: HTTP surface of the flow engine.
//!
//! Exposes:
//!   GET    /api/v1/health
//!   GET    /api/v1/flows                          POST /api/v1/flows
//!   GET    /api/v1/flows/:id                      PUT  /api/v1/flows/:id
//!   GET    /api/v1/flows/:id/versions
//!   GET    /api/v1/flows/:id/versions/:version
//!   POST   /api/v1/flows/:id/rollback
//!   POST   /api/v1/flows/:id/trigger
//!   POST   /api/v1/flows/:id/preview
//!   GET    /api/v1/tasks                          GET  /api/v1/my/tasks
//!   GET    /api/v1/tasks/:id
//!   GET    /api/v1/tasks/:id/dag
//!   GET    /api/v1/tasks/:id/steps
//!   POST   /api/v1/tasks/:id/terminate
//!   POST   /api/v1/tasks/:id/urge
//!   GET    /api/v1/steps/:id
//!   POST   /api/v1/steps/:id/submit
//!   POST   /api/v1/steps/:id/reject
//!
//! The calling user is read from the `x-user` header.

pub mod error;
pub mod handlers;
pub mod state;

use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub use error::ApiError;
pub use state::AppState;

use handlers::{flows, steps, tasks};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(handlers::health))
        .route("/api/v1/flows", get(flows::list).post(flows::create))
        .route("/api/v1/flows/:id", get(flows::get).put(flows::update))
        .route("/api/v1/flows/:id/versions", get(flows::versions))
        .route("/api/v1/flows/:id/versions/:version", get(flows::version))
        .route("/api/v1/flows/:id/rollback", post(flows::rollback))
        .route("/api/v1/flows/:id/trigger", post(flows::trigger))
        .route("/api/v1/flows/:id/preview", post(flows::preview))
        .route("/api/v1/tasks", get(tasks::list))
        .route("/api/v1/my/tasks", get(tasks::mine))
        .route("/api/v1/tasks/:id", get(tasks::get))
        .route("/api/v1/tasks/:id/dag", get(tasks::dag))
        .route("/api/v1/tasks/:id/steps", get(tasks::steps))
        .route("/api/v1/tasks/:id/terminate", post(tasks::terminate))
        .route("/api/v1/tasks/:id/urge", post(tasks::urge))
        .route("/api/v1/steps/:id", get(steps::get))
        .route("/api/v1/steps/:id/submit", post(steps::submit))
        .route("/api/v1/steps/:id/reject", post(steps::reject))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve the API on `bind` until Ctrl-C.
pub async fn serve(bind: &str, state: AppState) -> std::io::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    info!(bind = %bind, "api listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("api shut down");
    Ok(())
}
