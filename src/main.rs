//! AxoStitch server binary.
//!
//! Accepts files uploaded as independent byte-range chunks, stores each
//! chunk as it arrives, and stitches a session's chunks back into the
//! original file on request. The main entry point prepares the chunk store,
//! rebuilds the session registry from disk, and serves the upload routes.

mod atomic;
mod background;
mod config;
mod error;
mod http;
mod ingest;
mod key;
mod locking;
mod logging;
mod merge;
mod session;
mod storage;
mod upload;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{post, put};
use axum::{Router, middleware};
use axum_server::Handle;
use clap::Parser;
use shadow_rs::shadow;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span};

use crate::background::spawn_background_tasks;
use crate::config::Args;
use crate::http::build_cors_layer;
use crate::ingest::{IngestCoordinator, UploadConfig};
use crate::locking::SessionLocks;
use crate::merge::MergeEngine;
use crate::session::SessionTracker;
use crate::storage::ChunkStore;

shadow!(build);

/// Starts the AxoStitch server and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), std::io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let store = Arc::new(ChunkStore::new(PathBuf::from(&args.storage_dir)));
    store.ensure_root().await?;

    let tracker = Arc::new(SessionTracker::new());
    tracker.recover_from(&store).await?;
    let locks = Arc::new(SessionLocks::new());
    let upload_config = Arc::new(UploadConfig {
        max_chunk_size: args.max_chunk_size,
        max_chunks: args.upload_max_chunks,
    });
    let coordinator = Arc::new(IngestCoordinator::new(
        store.clone(),
        tracker.clone(),
        locks.clone(),
        upload_config,
    ));
    let engine = Arc::new(MergeEngine::new(
        store.clone(),
        tracker.clone(),
        locks.clone(),
    ));

    let mut app = Router::new()
        .route(
            "/upload",
            post(upload::upload_chunks).layer(DefaultBodyLimit::disable()),
        )
        .route(
            "/upload/{key}",
            put(upload::upload_chunk_raw).layer(DefaultBodyLimit::disable()),
        )
        .route("/mergeChunks", post(upload::merge_chunks))
        .route("/abortUpload", post(upload::abort_upload))
        .layer(middleware::from_fn(http::add_security_headers))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<_>| {
                    let forwarded_ip = request
                        .headers()
                        .get("x-forwarded-for")
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.split(',').next().unwrap_or("").trim().to_string());
                    let connect_ip = request
                        .extensions()
                        .get::<ConnectInfo<SocketAddr>>()
                        .map(|ConnectInfo(addr)| addr.to_string());
                    let client_ip = forwarded_ip
                        .or(connect_ip)
                        .unwrap_or_else(|| "unknown".to_string());

                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = ?request.uri().path(),
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(coordinator))
        .layer(Extension(engine));

    if let Some(cors_layer) = build_cors_layer(args.cors_origins.as_deref()) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidInput, err.to_string()))?;
    let http_addr = SocketAddr::new(host, args.http_port);
    let handle = Handle::new();

    info!(
        storage = %store.root_path().display(),
        "Starting HTTP server at {}",
        http_addr
    );

    let http_server = axum_server::bind(http_addr)
        .handle(handle.clone())
        .serve(app.into_make_service_with_connect_info::<SocketAddr>());

    spawn_background_tasks(
        store,
        tracker,
        locks,
        Duration::from_secs(args.upload_temp_ttl_secs),
    );
    tokio::select! {
        result = http_server => result?,
        _ = shutdown_signal(handle) => {}
    }

    Ok(())
}

async fn shutdown_signal(handle: Handle) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Received termination signal shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
