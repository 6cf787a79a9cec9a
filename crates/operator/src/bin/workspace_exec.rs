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

//! Workspace exec server
//!
//! Runs inside the agent container and exposes a single MCP `exec` tool that
//! executes commands in the sibling workspace container of the same pod.

use ambient_operator::exec::{router, RemoteExecutor};
use anyhow::Context as _;
use clap::Parser;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "workspace-exec", version, about = "MCP exec tool backed by the pod exec API")]
struct Args {
    /// Pod hosting both the agent and the workspace container
    #[arg(long, env = "POD_NAME")]
    pod_name: String,

    #[arg(long, env = "POD_NAMESPACE", default_value = "default")]
    pod_namespace: String,

    /// Container the commands run in
    #[arg(long, env = "WORKSPACE_CONTAINER", default_value = "workspace")]
    workspace_container: String,

    #[arg(long, env = "WORKSPACE_EXEC_PORT", default_value_t = 9999)]
    port: u16,

    #[arg(long, env = "LOG_FORMAT", default_value = "text", value_parser = ["text", "json"])]
    log_format: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()));
    if args.log_format == "json" {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    let client = kube::Client::try_default()
        .await
        .context("failed to create Kubernetes client")?;
    let runner = RemoteExecutor::new(
        client,
        &args.pod_namespace,
        args.pod_name.clone(),
        args.workspace_container.clone(),
    );

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, args.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(
        pod = %args.pod_name,
        namespace = %args.pod_namespace,
        container = %args.workspace_container,
        "workspace-exec MCP server listening on {addr}"
    );

    axum::serve(listener, router(Arc::new(runner)))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;

    Ok(())
}
