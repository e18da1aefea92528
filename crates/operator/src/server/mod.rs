mod routes;

use axum::{
    routing::get,
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{dispatcher::Dispatcher, store::AlertStore, Result};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub store: Arc<dyn AlertStore>,
    /// Set once the template and job caches have synced.
    pub ready: Arc<AtomicBool>,
}

pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(dispatcher: Arc<Dispatcher>, ready: Arc<AtomicBool>) -> Self {
        let store = dispatcher.store().clone();
        Self {
            state: AppState {
                dispatcher,
                store,
                ready,
            },
        }
    }

    pub fn build_router(self) -> Router {
        Router::new()
            .route("/healthz", get(routes::healthz))
            .route("/readiness", get(routes::readiness))
            .route("/alerts", get(routes::alerts_get).post(routes::alerts_post))
            .route("/alertStore", get(routes::alert_store))
            .route("/metrics", get(routes::metrics))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.state)
    }

    /// Serve until `shutdown` resolves. In-flight requests are drained;
    /// dispatch tasks already spawned keep running.
    pub async fn start<F>(self, addr: SocketAddr, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Starting server on {}", listener.local_addr()?);
        axum::serve(listener, self.build_router())
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
