//! georelay - Main entry point
//!
//! HTTP relay that makes a geo-restricted Firebase realtime database
//! and its companion website reachable through a single host.

use anyhow::Result;
use clap::Parser;
use georelay::{RelayConfig, RelayServer};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;
use url::Url;

/// Geo-bypass relay for a Firebase realtime database and its website
#[derive(Parser, Debug)]
#[command(name = "georelay")]
#[command(version = "0.1.0")]
#[command(about = "Geo-bypass relay for a Firebase realtime database and its website")]
struct Args {
    /// Port to listen on
    #[arg(long, env = "SERVER_PORT", default_value = "3000")]
    port: u16,

    /// Upstream website base URL (e.g. https://site.example.com)
    #[arg(long, env = "REMOTE_URI_PREFIX")]
    remote_uri_prefix: Url,

    /// Firebase realtime-database namespace served through the relay
    #[arg(long, env = "FIREBASE_RTDB_ID")]
    firebase_rtdb_id: String,

    /// Trust x-forwarded-for from a fronting proxy for client addresses
    #[arg(long, env = "TRUST_PROXY", default_value = "false")]
    trust_proxy: bool,

    /// Domain suffix database-proxy targets must end with
    #[arg(long, env = "UPSTREAM_DOMAIN_SUFFIX", default_value = ".firebaseio.com")]
    upstream_domain_suffix: String,

    /// Disable the target admission check. This turns the relay into
    /// an open proxy; only for streaming endpoint variants the check
    /// would reject
    #[arg(long, env = "ALLOW_ANY_HOST", default_value = "false")]
    allow_any_host: bool,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("starting georelay");
    info!("listening port: {}", args.port);
    info!("website upstream: {}", args.remote_uri_prefix);
    if args.allow_any_host {
        info!("target admission check is DISABLED");
    }

    let config = RelayConfig {
        port: args.port,
        site_upstream: args.remote_uri_prefix,
        database_id: args.firebase_rtdb_id,
        trust_proxy: args.trust_proxy,
        upstream_domain_suffix: args.upstream_domain_suffix,
        allow_any_host: args.allow_any_host,
    };

    let server = Arc::new(RelayServer::new(config)?);
    server.run().await?;

    Ok(())
}
