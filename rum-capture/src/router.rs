use std::future::ready;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post, put},
    Router,
};
use health::HealthRegistry;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::enrich::Enricher;
use crate::feed::Feeder;
use crate::ingest::{self, IngestConfig};
use crate::prometheus::{setup_metrics_recorder, track_metrics};
use crate::replay::handler::{self as replay_handler, ReplayIngest};
use crate::sourcemap::handlers::{self as sourcemap_handlers, SourceMapState};
use crate::time::TimeSource;

#[derive(Clone)]
pub struct State {
    pub feeder: Arc<dyn Feeder + Send + Sync>,
    pub timesource: Arc<dyn TimeSource + Send + Sync>,
    pub enricher: Arc<Enricher>,
    pub ingest: Arc<IngestConfig>,
}

async fn index() -> &'static str {
    "rum-capture"
}

/// Everything the routes need, built by the server or by tests.
pub struct RouterParts {
    pub rum_endpoints: Vec<String>,
    pub ingest: IngestConfig,
    pub enricher: Arc<Enricher>,
    pub sourcemaps: SourceMapState,
    /// Replay routes are only mounted when an upstream is configured
    pub replay: Option<(Vec<String>, Arc<ReplayIngest>)>,
    pub liveness: HealthRegistry,
}

pub fn router<
    TZ: TimeSource + Send + Sync + 'static,
    F: Feeder + Send + Sync + 'static,
>(
    timesource: TZ,
    feeder: F,
    parts: RouterParts,
    metrics: bool,
) -> Router {
    let state = State {
        feeder: Arc::new(feeder),
        timesource: Arc::new(timesource),
        enricher: parts.enricher,
        ingest: Arc::new(parts.ingest),
    };

    let liveness = parts.liveness;
    let mut rum = Router::new()
        .route("/", get(index))
        .route(
            "/_liveness",
            get(move || ready(liveness.get_status())),
        );
    for endpoint in &parts.rum_endpoints {
        rum = rum.route(endpoint, post(ingest::write));
    }

    let sourcemaps = Router::new()
        .route("/v1/sourcemap/check", get(sourcemap_handlers::check))
        .route(
            "/v1/sourcemap",
            put(sourcemap_handlers::upload).delete(sourcemap_handlers::delete),
        )
        .layer(DefaultBodyLimit::disable())
        .with_state(parts.sourcemaps);

    let mut router = rum.with_state(state).merge(sourcemaps);

    if let Some((endpoints, ingest)) = parts.replay {
        let mut replay = Router::new();
        for endpoint in &endpoints {
            replay = replay.route(endpoint, post(replay_handler::upload));
        }
        router = router.merge(replay.layer(DefaultBodyLimit::disable()).with_state(ingest));
    }

    let router = router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(track_metrics));

    // Don't install metrics unless asked to
    // Installing a global recorder when capture is used as a library (during tests etc)
    // does not work well.
    if metrics {
        let recorder_handle = setup_metrics_recorder();

        router.route("/metrics", get(move || ready(recorder_handle.render())))
    } else {
        router
    }
}
