//! # img3d: image-to-3D conversion service
//!
//! `img3d` turns 2D images into 3D model assets: a GLB, an FBX, a USDZ and a PNG preview. Outfit
//! conversions also get a Roblox-ready FBX. All of the actual image work (analysis, background
//! removal, reconstruction and Roblox processing) happens in an external executable, usually a
//! Python script or a headless Blender run. This crate treats it as an opaque program that talks
//! JSON over stdout.
//!
//! ## Request flow
//!
//! A `POST /api/convert` request is handled in one pass:
//!
//! 1. The multipart image is stored under `<uploads>/<job_id>/`, where `job_id` is a fresh UUID.
//! 2. The converter is spawned with the input path, an output base path under
//!    `<output>/<job_id>/`, and the outfit flags. Stdout and stderr are drained concurrently and a
//!    deadline bounds the run.
//! 3. The upload is deleted, the final stdout line is parsed as the result, and the expected
//!    artifacts are checked on disk.
//! 4. The response carries a `/api/files/<job_id>/...` URL for every artifact.
//!
//! See [`conversion`] for the pipeline and its failure modes, and [`errors`] for how each failure
//! maps onto an HTTP status.
//!
//! ## Other endpoints
//!
//! - `POST /api/validate-image` runs a separate validator executable and passes its verdict
//!   through.
//! - `POST /api/save-model` stores a GLB edited in the browser viewer.
//! - `GET /api/files/{*path}` and `GET /api/uploads/{*path}` stream files from the output and
//!   uploads roots.
//! - `GET /healthz`, `GET /api/openapi.json`, `GET /api/docs`, and optionally
//!   `GET /internal/metrics`.
//!
//! ## Configuration
//!
//! See [`config`]. Everything can be set from `config.yaml` or `IMG3D_*` environment variables.

pub mod api;
pub mod config;
pub mod conversion;
pub mod errors;
pub mod limits;
pub mod openapi;
pub mod storage;
pub mod telemetry;
pub mod types;

#[cfg(test)]
pub mod test_utils;

use std::sync::Arc;

use anyhow::Context;
use axum::{
    Json, Router,
    extract::DefaultBodyLimit,
    http::{self, HeaderValue},
    routing::{get, post},
};
use axum_prometheus::PrometheusMetricLayer;
use bon::Builder;
use tokio::net::TcpListener;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{Level, debug, info, instrument};
use utoipa::OpenApi;
use utoipa_scalar::{Scalar, Servable};

pub use config::Config;

use crate::{
    api::handlers,
    config::CorsOrigin,
    conversion::Orchestrator,
    limits::Limiters,
    openapi::ApiDoc,
    storage::Storage,
};

/// Shared state handed to every request handler.
///
/// ```ignore
/// let state = AppState::builder()
///     .config(config)
///     .orchestrator(Arc::new(orchestrator))
///     .build();
/// ```
#[derive(Clone, Builder)]
pub struct AppState {
    pub config: Config,
    pub orchestrator: Arc<Orchestrator>,
    #[builder(default)]
    pub limiters: Limiters,
}

fn create_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let allow_origin = if config.cors.allowed_origins.contains(&CorsOrigin::Wildcard) {
        AllowOrigin::any()
    } else {
        let mut origins = Vec::new();
        for origin in &config.cors.allowed_origins {
            if let CorsOrigin::Url(url) = origin {
                origins.push(url.origin().ascii_serialization().parse::<HeaderValue>()?);
            }
        }
        AllowOrigin::list(origins)
    };

    let mut cors = CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods([http::Method::GET, http::Method::POST, http::Method::OPTIONS])
        .allow_headers(Any)
        .expose_headers([http::header::CONTENT_DISPOSITION, http::header::CONTENT_LENGTH]);

    if let Some(max_age) = config.cors.max_age {
        cors = cors.max_age(std::time::Duration::from_secs(max_age));
    }

    Ok(cors)
}

/// Build the application router with every endpoint and middleware layer.
#[instrument(skip_all)]
pub fn build_router(state: &AppState) -> anyhow::Result<Router> {
    let upload_limit = DefaultBodyLimit::max(state.config.limits.max_upload_size);

    let router = Router::new()
        .route("/healthz", get(|| async { "OK" }))
        .route("/api/convert", post(handlers::convert::convert_image).layer(upload_limit.clone()))
        .route(
            "/api/validate-image",
            post(handlers::validate::validate_image).layer(upload_limit.clone()),
        )
        .route("/api/save-model", post(handlers::models::save_model).layer(upload_limit))
        .route("/api/files/{*path}", get(handlers::files::serve_output_file))
        .route("/api/uploads/{*path}", get(handlers::files::serve_upload))
        .route("/api/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(state.clone())
        .merge(Scalar::with_url("/api/docs", ApiDoc::openapi()));

    let cors_layer = create_cors_layer(&state.config)?;
    let mut router = router.layer(cors_layer);

    if state.config.enable_metrics {
        let (prometheus_layer, metric_handle) = PrometheusMetricLayer::pair();
        router = router
            .route("/internal/metrics", get(|| async move { metric_handle.render() }))
            .layer(prometheus_layer);
    }

    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// The assembled service: storage prepared, router built, ready to bind.
pub struct Application {
    router: Router,
    state: AppState,
    config: Config,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting img3d with configuration: {:#?}", config);

        let storage = Storage::new(&config.storage);
        storage.ensure_dirs().await.with_context(|| {
            format!(
                "failed to create storage directories {} and {}",
                storage.uploads_dir().display(),
                storage.output_dir().display()
            )
        })?;

        let state = AppState::builder()
            .config(config.clone())
            .orchestrator(Arc::new(Orchestrator::new(storage, &config)))
            .limiters(Limiters::new(&config.limits))
            .build();
        let router = build_router(&state)?;

        Ok(Self { router, state, config })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router).expect("Failed to create test server")
    }

    /// Serve until `shutdown` resolves, then flush telemetry.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("failed to bind {bind_addr}"))?;
        info!(
            converter = %self.config.converter.program,
            "img3d listening on http://{}, available at http://localhost:{}",
            bind_addr,
            self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Shutting down telemetry...");
        telemetry::shutdown_telemetry();

        Ok(())
    }
}
