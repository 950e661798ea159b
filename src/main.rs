mod config;
mod engine;
mod error;
mod processor;
mod routes;
mod storage;

use std::{collections::HashSet, sync::Arc};

use axum::http::{HeaderValue, Method, header::CONTENT_DISPOSITION};
use tokio::{net::TcpListener, sync::Semaphore};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    config::Config,
    engine::YtDlp,
    processor::VideoProcessor,
    routes::{AppState, router},
};

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "video_downloader=info,tower_http=info".to_string()),
        )
        .init();

    if let Err(error) = run().await {
        eprintln!("Server error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), AnyError> {
    let config = Config::from_env();

    storage::prepare_storage_root(&config.storage_root)
        .await
        .map_err(|error| {
            format!(
                "could not create storage root {}: {error}",
                config.storage_root.display()
            )
        })?;
    storage::cleanup_stale_downloads(&config.storage_root, config.stale_after).await;

    if config.strict_domain_match {
        info!("strict domain matching enabled");
    } else {
        warn!("platform check matches domains by substring; set STRICT_DOMAIN_MATCH=true for suffix matching");
    }

    let engine = YtDlp::new(config.yt_dlp_bin.clone(), config.engine_timeout);
    let processor = VideoProcessor::new(Arc::new(engine), config.storage_root.clone())
        .with_strict_domain_match(config.strict_domain_match);

    let state = AppState {
        processor: Arc::new(processor),
        download_semaphore: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
        download_retention: config.download_retention,
        stale_after: config.stale_after,
    };

    let mut app = router(state).layer(TraceLayer::new_for_http());
    if let Some(cors) = build_cors_layer(&config.allowed_origins)? {
        app = app.layer(cors);
    }

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(|error| format!("could not bind {}: {error}", config.bind_addr))?;

    info!(
        addr = %config.bind_addr,
        storage_root = %config.storage_root.display(),
        engine = %config.yt_dlp_bin,
        "video-downloader listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

/// Same-origin deployments need no CORS layer; one is built only when
/// `ALLOWED_ORIGINS` lists origins.
fn build_cors_layer(origins: &[String]) -> Result<Option<CorsLayer>, AnyError> {
    if origins.is_empty() {
        return Ok(None);
    }

    let normalized_origins = origins
        .iter()
        .map(|origin| {
            normalize_origin(origin).ok_or_else(|| {
                format!("invalid origin in ALLOWED_ORIGINS: {origin}. Use values like https://example.com")
            })
        })
        .collect::<Result<HashSet<_>, _>>()?;
    info!(origins = ?normalized_origins, "CORS allow-list loaded");

    let allowed_origins = Arc::new(normalized_origins);
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let normalized = origin.to_str().ok().and_then(normalize_origin);
        let allowed = normalized
            .as_ref()
            .is_some_and(|value| allowed_origins.contains(value));
        debug!(?origin, ?normalized, allowed, "CORS origin check");
        allowed
    });

    Ok(Some(
        CorsLayer::new()
            .allow_origin(allow_origin)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(Any)
            .expose_headers([CONTENT_DISPOSITION]),
    ))
}

/// Reduces an origin to `scheme://host[:port]`, default port elided. Anything
/// with a path, query or fragment is not an origin.
fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let bare = parsed.path() == "/" && parsed.query().is_none() && parsed.fragment().is_none();
    if !bare || !matches!(parsed.scheme(), "http" | "https") {
        return None;
    }

    let origin = parsed.origin();
    origin.is_tuple().then(|| origin.ascii_serialization())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(%error, "could not listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(error) => {
                warn!(%error, "could not listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutdown signal received");
}
