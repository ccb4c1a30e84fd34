//! sikreg: command-line client for section registration
//!
//! Scans are fed in as text (the QR reader's output), either plaintext
//! JSON or a base64 payload sealed with the stored keyenc.

mod app;
mod cli;

use std::io::Read;
use std::path::Path;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use sikreg_core::{Config, LoadingState, RegistrationState, codec};

use crate::app::App;
use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_file.as_deref())?;

    let config = match &cli.config {
        Some(path) => Config::load_from(path).with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::load().unwrap_or_else(|e| {
            tracing::warn!("Failed to load config: {}, using defaults", e);
            Config::default()
        }),
    };
    let app = App::new(config, cli.ephemeral)?;

    match cli.command {
        Commands::Register { qr, check } => {
            let raw = read_input(&qr)?;
            let outcome = app.register(&raw, check, cancel_on_ctrl_c).await;
            let report = &outcome.report;

            if cli.json {
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                    "registered": report.is_registered(),
                    "failure": report.failure,
                    "stream_url": report.endpoint.as_ref().map(|e| e.url.as_str()),
                    "election": report.endpoint.as_ref().map(|e| e.election.as_str()),
                    "check": outcome.check.as_ref().map(|state| format!("{state:?}")),
                }))?);
            } else {
                for state in &report.transitions {
                    println!("{}", describe(state));
                }
                if outcome.check == Some(LoadingState::Success) {
                    println!("Test stream confirmed");
                }
            }
            outcome.into_result()?;
        }
        Commands::Check { mode, udi } => {
            app.load_check_section(&mode, udi);
            run_check(&app, cli.json).await?;
        }
        Commands::Relogin { qr } => {
            let raw = read_input(&qr)?;
            let section = app.load_section(&raw)?;
            tracing::info!(mode = %section.mode, udi = section.udi_or_empty(), "Re-login");

            let relogin = app.relogin();
            cancel_on_ctrl_c(relogin.cancel_handle());
            let endpoint = relogin.run().await.context("Re-login gave up")?;
            println!("{}", endpoint.url);
        }
        Commands::Seal { json, key } => {
            println!("{}", app.seal(&json, key.as_deref())?);
        }
        Commands::Keygen => {
            println!("{}", codec::encode_key(&codec::generate_key()));
        }
        Commands::Show => {
            let stored = app.stored();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&stored)?);
            } else {
                println!("udi:      {}", stored.udi);
                println!("rtmpUrl:  {}", stored.rtmp_url);
                println!("election: {}", stored.election);
                println!("keyenc:   {}", stored.keyenc.as_deref().unwrap_or("(none)"));
            }
        }
    }

    Ok(())
}

fn init_tracing(log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "sikreg=info,sikreg_core=info".into());

    match log_file {
        Some(path) => {
            let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or(Path::new("."));
            let name = path.file_name().context("Log file path has no file name")?;
            std::fs::create_dir_all(dir)?;

            let appender = tracing_appender::rolling::never(dir, name);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(appender).with_ansi(false))
                .init();
        }
        None => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
    Ok(())
}

/// Poll the test result for the current section, Ctrl-C stops early
async fn run_check(app: &App, json: bool) -> anyhow::Result<()> {
    let state = app.check_test_result(cancel_on_ctrl_c).await;
    if json {
        println!("{}", serde_json::json!({ "state": format!("{:?}", state) }));
    } else if state == LoadingState::Success {
        println!("Test stream confirmed");
    }
    app::check_result(state)
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, stopping after the current attempt");
            token.cancel();
        }
    });
}

/// "-" reads the payload from stdin
fn read_input(arg: &str) -> anyhow::Result<String> {
    if arg != "-" {
        return Ok(arg.to_string());
    }
    let mut buf = String::new();
    std::io::stdin().read_to_string(&mut buf).context("Failed to read stdin")?;
    Ok(buf.trim().to_string())
}

fn describe(state: &RegistrationState) -> String {
    match state {
        RegistrationState::ScanQrCode => "Waiting for a QR code".to_string(),
        RegistrationState::GetRtmpUrl => "Requesting stream address".to_string(),
        RegistrationState::Success => "Done".to_string(),
        RegistrationState::Failure(kind) => format!("Failed: {kind}"),
    }
}
