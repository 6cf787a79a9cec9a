/*
 * Ambient Code Platform - Kubernetes Operator for Agentic Sessions
 * Copyright (C) 2025 Ambient Code
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Operator Service - Kubernetes controller for `AgenticSession` resources
//!
//! This service:
//! - Watches `AgenticSession`, `ProjectSettings` and managed `Namespace` objects
//! - Provisions per-session RBAC, workspace volumes and agent Jobs
//! - Provides health, readiness and metrics endpoints

use ambient_operator::reconcile::metrics::ControllerMetrics;
use ambient_operator::reconcile::{run_operator, Context, KubeResourceClient};
use ambient_operator::OperatorConfig;
use anyhow::Context as _;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use clap::Parser;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    timeout::TimeoutLayer,
    trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer},
};
use tracing::{error, info, Level};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ambient-operator", version, about = "Ambient Code session operator")]
struct Args {
    /// Address for the health and metrics server
    #[arg(long, env = "HTTP_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    listen: SocketAddr,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", default_value = "text", value_parser = ["text", "json"])]
    log_format: String,
}

#[derive(Clone)]
struct AppState {
    metrics: Arc<ControllerMetrics>,
}

fn init_tracing(format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info,kube=warn".into());
    let registry = tracing_subscriber::registry().with(filter);
    if format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_format);

    info!(
        "Starting Ambient Code operator v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = OperatorConfig::from_env().context("failed to load operator configuration")?;
    config
        .validate()
        .context("operator configuration is invalid")?;
    info!(
        namespace = %config.namespace,
        secrets_source_namespace = %config.secrets_source_namespace,
        secrets_to_copy = ?config.secrets_to_copy,
        "configuration loaded"
    );

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let context = Arc::new(Context::new(
        Arc::new(KubeResourceClient::new(client.clone())),
        Arc::new(config),
    ));
    let state = AppState {
        metrics: context.metrics.clone(),
    };

    let controller_handle = tokio::spawn(async move {
        if let Err(e) = run_operator(client, context).await {
            error!(error = %e, "operator error");
        }
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/metrics", get(metrics))
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::DEBUG)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    info!("Operator HTTP server listening on {}", args.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Controllers stop on the same signal; give them a moment to drain
    if tokio::time::timeout(Duration::from_secs(20), controller_handle)
        .await
        .is_err()
    {
        error!("controllers did not stop in time");
    }
    info!("Operator stopped");

    Ok(())
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "ambient-operator",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn readiness_check(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if !state.metrics.is_ready() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(json!({
        "status": "ready",
        "service": "ambient-operator",
        "version": env!("CARGO_PKG_VERSION")
    })))
}

async fn metrics(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "service": "ambient-operator",
        "version": env!("CARGO_PKG_VERSION"),
        "controllers": state.metrics.snapshot()
    }))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
