//! `fc-relay-server` — CLI entry point and process wiring for the CDC relay.
//!
//! Keeps configuration parsing, logging setup, and signal trapping out of
//! the pipeline crates (`fc-relay`, `fc-sinks`, ...): this binary is the
//! "external collaborator" layer the core crates are built to not know about.

use std::net::SocketAddr;
use std::process::ExitCode;

use clap::Parser;
use fc_config::Config;
use fc_relay::Supervisor;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal::unix::{signal, SignalKind};

/// MongoDB change-stream CDC relay.
#[derive(Parser, Debug)]
#[command(name = "fc-relay-server")]
struct Cli {
    /// Print build metadata and exit.
    #[arg(short = 'v', long = "version")]
    version: bool,

    /// Bare positional alternative to `-v`/`--version`.
    #[arg(value_parser = ["version"])]
    command: Option<String>,
}

impl Cli {
    fn wants_version(&self) -> bool {
        self.version || self.command.as_deref() == Some("version")
    }
}

fn print_version() {
    println!(
        "{} {} ({})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("CARGO_PKG_DESCRIPTION")
    );
}

async fn serve_metrics() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let app = axum::Router::new()
        .route("/health", axum::routing::get(|| async { "UP" }))
        .route(
            "/ready",
            axum::routing::get(|| async { "READY" }),
        )
        .route("/metrics", axum::routing::get(move || async move { handle.render() }));

    let addr: SocketAddr = ([0, 0, 0, 0], 9090).into();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "metrics/health server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

/// Waits for SIGINT or SIGTERM (the catchable analogues of the spec's
/// `INT`/`KILL`) and triggers a graceful stop.
async fn wait_for_shutdown_signal() {
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

/// One `New` + `Run`, returning once a shutdown or reload signal fires.
/// `reload` is set when the loop should exit because a SIGHUP asked for a
/// fresh `Stop`+`New`+`Run` cycle rather than full process exit.
async fn run_once(cfg: Config) -> anyhow::Result<bool> {
    let mut supervisor = Supervisor::new(cfg).await?;
    supervisor.run().await?;

    let mut hup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let reload = tokio::select! {
        _ = wait_for_shutdown_signal() => {
            tracing::info!("shutdown signal received");
            false
        }
        _ = hup.recv() => {
            tracing::info!("reload signal received, restarting with fresh configuration");
            true
        }
    };

    supervisor.stop().await;
    Ok(reload)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.wants_version() {
        print_version();
        return ExitCode::SUCCESS;
    }

    fc_common::telemetry::init_tracing();
    tokio::spawn(async {
        if let Err(e) = serve_metrics().await {
            tracing::warn!(error = %e, "metrics/health server exited");
        }
    });

    loop {
        let cfg = match Config::load(None) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!(error = %e, "configuration error");
                return ExitCode::FAILURE;
            }
        };

        match run_once(cfg).await {
            Ok(true) => continue,
            Ok(false) => return ExitCode::SUCCESS,
            Err(e) => {
                tracing::error!(error = %e, "relay terminated with an error");
                return ExitCode::FAILURE;
            }
        }
    }
}
