// Copyright 2026 The LLM Relay Project
// SPDX-License-Identifier: Apache-2.0

use clap::Parser;
use llm_relay::config::RelayConfig;
use llm_relay::proxy;
use llm_relay::upstream::{ReqwestUpstreamClient, UpstreamClient};

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "llm-relay",
    about = "Protocol-preserving LLM API relay with anti-truncation streaming"
)]
struct Cli {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "RELAY_BIND")]
    bind: IpAddr,

    /// Port to listen on
    #[arg(long, default_value_t = 8080, env = "RELAY_PORT")]
    port: u16,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .json()
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match RelayConfig::from_env() {
        Ok(c) => Arc::new(c),
        Err(e) => {
            tracing::error!("failed to load config: {e}");
            std::process::exit(1);
        }
    };
    config.log_startup_warnings();

    tracing::info!(
        openai_upstream = %config.openai_base_url,
        gemini_upstream = %config.gemini_base_url,
        claude_upstream = %config.claude_base_url,
        anti_truncation_default = config.anti_truncation_default,
        max_attempts = config.max_attempts,
        "relay starting"
    );

    let upstream: Arc<dyn UpstreamClient> = Arc::new(ReqwestUpstreamClient::new(&config));
    let app = proxy::build_router(config, upstream);

    let addr = SocketAddr::from((cli.bind, cli.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("failed to bind to address");

    tracing::info!(%addr, "relay listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("server error");
}
