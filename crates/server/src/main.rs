mod config;
mod signaling;
mod tls;
mod web;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::Level;
use tracing_subscriber::EnvFilter;

use relay_core::{RoomRegistry, WebRtcFacade};

use crate::web::AppState;

struct Cli {
    config_path: PathBuf,
    port: Option<u16>,
    tls_cert: Option<String>,
    tls_key: Option<String>,
    stun_server: Option<String>,
    udp_start: Option<u16>,
    udp_end: Option<u16>,
    verbose: bool,
    debug: bool,
}

/// Manual flag loop, no `clap`: `--config`/`-c`, `--port`/`-p`,
/// `--tls-cert`, `--tls-key`, `--stun-server`, `--udp-start`, `--udp-end`,
/// `--verbose`, `--debug`. CLI overrides win over config file and
/// environment (§6) because they are the most specific and visible at
/// invocation time.
fn parse_args() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = Cli {
        config_path: PathBuf::from("./config/relay.toml"),
        port: None,
        tls_cert: None,
        tls_key: None,
        stun_server: None,
        udp_start: None,
        udp_end: None,
        verbose: false,
        debug: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                if i + 1 < args.len() {
                    cli.config_path = PathBuf::from(&args[i + 1]);
                    i += 1;
                }
            }
            "--port" | "-p" => {
                if i + 1 < args.len() {
                    cli.port = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--tls-cert" => {
                if i + 1 < args.len() {
                    cli.tls_cert = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--tls-key" => {
                if i + 1 < args.len() {
                    cli.tls_key = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--stun-server" => {
                if i + 1 < args.len() {
                    cli.stun_server = Some(args[i + 1].clone());
                    i += 1;
                }
            }
            "--udp-start" => {
                if i + 1 < args.len() {
                    cli.udp_start = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--udp-end" => {
                if i + 1 < args.len() {
                    cli.udp_end = args[i + 1].parse().ok();
                    i += 1;
                }
            }
            "--verbose" => cli.verbose = true,
            "--debug" => cli.debug = true,
            _ => {}
        }
        i += 1;
    }

    cli
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = parse_args();

    let default_filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mut config = config::load_config(&cli.config_path)?;
    config.apply_env_overrides();
    if let Some(p) = cli.port {
        config.endpoint_port = p;
    }
    if cli.tls_cert.is_some() {
        config.tls_cert = cli.tls_cert;
    }
    if cli.tls_key.is_some() {
        config.tls_key = cli.tls_key;
    }
    if let Some(stun) = cli.stun_server {
        config.stun_server = stun;
    }
    if let Some(start) = cli.udp_start {
        config.webrtc_udp_start = start;
    }
    if let Some(end) = cli.udp_end {
        config.webrtc_udp_end = end;
    }
    if cli.verbose {
        config.verbose = true;
    }
    if cli.debug {
        config.debug = true;
    }

    if let Err(issues) = config.validate() {
        let has_errors = issues.iter().any(|i| i.starts_with("ERROR:"));
        for issue in &issues {
            if issue.starts_with("ERROR:") {
                tracing::error!("{}", issue);
            } else {
                tracing::warn!("{}", issue);
            }
        }
        if has_errors {
            tracing::error!(
                "Configuration has {} issue(s). Fix the ERROR(s) above and restart.",
                issues.len()
            );
            std::process::exit(1);
        }
    }

    let facade = Arc::new(WebRtcFacade::new(&config).context("Failed to build WebRTC facade")?);
    let registry = RoomRegistry::new();

    let port = config.endpoint_port;
    let bind_addr: SocketAddr = format!("0.0.0.0:{port}")
        .parse()
        .context("Invalid bind address")?;

    let tls_config = tls::build_tls_config(config.tls_cert.as_deref(), config.tls_key.as_deref())?;
    let tls_acceptor = tls::make_acceptor(tls_config);

    let state = Arc::new(AppState {
        registry,
        facade,
        config,
        started_at: std::time::Instant::now(),
    });

    let app = web::build_router(Arc::clone(&state)).layer(
        TraceLayer::new_for_http()
            .on_request(|_request: &axum::http::Request<_>, _span: &tracing::Span| {
                tracing::event!(Level::INFO, "started");
            })
            .on_response(
                |response: &axum::http::Response<_>,
                 latency: std::time::Duration,
                 _span: &tracing::Span| {
                    tracing::event!(
                        Level::INFO,
                        status = %response.status().as_u16(),
                        duration_ms = %latency.as_millis(),
                        "completed"
                    );
                },
            ),
    );

    tracing::info!("===========================================");
    tracing::info!("  Media Relay Server");
    tracing::info!("  Listening on https://{bind_addr}");
    tracing::info!("===========================================");

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))?;

    tracing::info!("Server ready, accepting connections");

    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Failed to accept TCP connection: {e}");
                        continue;
                    }
                };

                let acceptor = tls_acceptor.clone();
                let app = app.clone();

                tokio::spawn(async move {
                    let tls_stream = match tokio::time::timeout(
                        std::time::Duration::from_secs(10),
                        acceptor.accept(stream),
                    ).await {
                        Ok(Ok(s)) => s,
                        Ok(Err(e)) => {
                            tracing::debug!(%peer_addr, "TLS handshake failed: {e}");
                            return;
                        }
                        Err(_) => {
                            tracing::debug!(%peer_addr, "TLS handshake timed out");
                            return;
                        }
                    };

                    let io = hyper_util::rt::TokioIo::new(tls_stream);
                    let hyper_service = hyper_util::service::TowerToHyperService::new(app);
                    let builder = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    );

                    if let Err(e) = builder.serve_connection_with_upgrades(io, hyper_service).await {
                        tracing::debug!(%peer_addr, "Connection error: {e}");
                    }
                });
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
                break;
            }
        }
    }

    tracing::info!("Media relay server shut down cleanly");

    Ok(())
}
