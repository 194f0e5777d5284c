//! File provider server binary.
//!
//! Issues short-lived download tokens for files on the local filesystem,
//! serves them with byte-range support, and manages uploads below a
//! dedicated root. The main entry point builds the collaborators and the
//! Axum router, starts the key rotation task, and serves HTTP until a
//! termination signal arrives.

mod atomic;
mod background;
mod config;
mod error;
mod handlers;
mod health;
mod http;
mod keys;
mod logging;
mod metastore;
mod path_guard;
mod permission;
mod provider;
mod range;
mod stream;
mod token;

use axum::extract::{DefaultBodyLimit, Extension, connect_info::ConnectInfo};
use axum::http::Request;
use axum::routing::{delete, get, post};
use axum::{Router, middleware};
use axum_server::Handle;
use chrono::Utc;
use clap::Parser;
use shadow_rs::shadow;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower_http::trace::{DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{Level, info, info_span, warn};

use crate::background::spawn_key_rotation;
use crate::config::{Args, SHUTDOWN_GRACE_SECS, UPSTREAM_TIMEOUT_SECS};
use crate::http::build_cors_layer;
use crate::keys::{KeyStore, epoch_salt};
use crate::metastore::{HttpMetaStore, MetaStore};
use crate::path_guard::PathGuard;
use crate::permission::{AllowAll, HttpPermissionClient, PermissionChecker};
use crate::provider::FileProvider;
use crate::token::TokenCodec;

shadow!(build);

/// Starts the file provider and blocks until shutdown.
#[tokio::main]
async fn main() -> Result<(), io::Error> {
    logging::init_logging();

    let args = Args::parse();
    let rotation = Duration::from_secs(args.key_rotation_secs);
    let key_history = args.effective_key_history();
    if key_history > args.key_history {
        info!(
            configured = args.key_history,
            effective = key_history,
            "key history raised to cover token lifetime"
        );
    }
    let keys = Arc::new(KeyStore::new(
        args.secret_key.clone(),
        &epoch_salt(Utc::now(), rotation),
        key_history,
    ));

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
        .build()
        .map_err(|err| io::Error::other(err.to_string()))?;
    let permissions: Arc<dyn PermissionChecker> =
        match (args.ignore_permission_check, args.permission_url.as_deref()) {
            (true, _) => {
                warn!("permission checks are disabled");
                Arc::new(AllowAll)
            }
            (false, Some(url)) => Arc::new(HttpPermissionClient::new(client.clone(), url)),
            (false, None) => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "PERMISSION_SERVICE must be set unless API_IGNORE_PERMISSION_CHECK is enabled",
                ));
            }
        };
    let meta: Arc<dyn MetaStore> = Arc::new(HttpMetaStore::new(
        client,
        &args.meta_store_url,
        args.record_store_url.as_deref(),
    ));

    let upload_root = PathBuf::from(&args.upload_root);
    if let Err(err) = tokio::fs::create_dir_all(&upload_root).await {
        warn!(path = ?upload_root, error = %err, "upload root is not writable");
    }
    let provider = Arc::new(FileProvider::new(
        PathGuard::new(args.system_dirs.iter().map(|dir| dir.trim().to_string())),
        TokenCodec::new(keys.clone(), args.token_leeway_secs),
        permissions,
        meta,
        Duration::from_secs(args.jwt_lifetime),
        upload_root,
    ));

    let mut app = Router::new()
        .route("/healthz", get(health::healthz))
        .route("/version", get(health::get_version_info))
        .route("/download", post(handlers::request_download_token))
        .route("/download/{token}", get(handlers::download_file))
        .route("/file", get(handlers::get_file))
        .route(
            "/upload",
            post(handlers::upload_file).layer(DefaultBodyLimit::disable()),
        )
        .route("/delete", delete(handlers::delete_file))
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

                    // Download tokens travel in the path; only the route prefix is recorded.
                    let path = request.uri().path();
                    let route = if path.starts_with("/download/") {
                        "/download/{token}"
                    } else {
                        path
                    };
                    info_span!(
                        env!("CARGO_CRATE_NAME"),
                        client_ip,
                        method = ?request.method(),
                        path = route,
                    )
                })
                .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
        )
        .layer(Extension(provider));

    if let Some(cors_layer) = build_cors_layer(Some(args.cors_origins.as_str())) {
        app = app.layer(cors_layer);
    }

    let host = args
        .host
        .parse::<IpAddr>()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidInput, err.to_string()))?;
    let addr = SocketAddr::new(host, args.port);
    let handle = Handle::new();

    info!("Starting HTTP server at {}", addr);
    spawn_key_rotation(keys, rotation);
    tokio::spawn(shutdown_signal(handle.clone()));
    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    info!("server stopped");
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

    info!("Received termination signal, shutting down");
    handle.graceful_shutdown(Some(Duration::from_secs(SHUTDOWN_GRACE_SECS)));
}
