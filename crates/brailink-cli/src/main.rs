//! brailink CLI entry point.

mod args;
mod cells;
mod config;

use std::time::Duration;

use anyhow::Context;
use brailink_core::driver::{find_driver, DriverInfo, DRIVER_TABLE};
use brailink_core::{ErrorReport, InputEvent, Session, SessionConfig};
use chrono::{SecondsFormat, Utc};
use clap::Parser;
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::args::{Cli, Commands, RunArgs, WriteArgs};
use crate::cells::text_cells;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Err(e) = run_command(cli) {
        error!("{}", e);
        std::process::exit(1);
    }
}

fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Drivers => list_drivers(),
        Commands::Examples => {
            println!("{}", crate::args::EXAMPLES_TEXT);
            Ok(())
        }
        Commands::Run(args) => {
            let config = config::load(cli.config.as_deref())?;
            run_session(args, config)
        }
        Commands::Write(args) => {
            let config = config::load(cli.config.as_deref())?;
            write_text(args, config)
        }
    }
}

fn list_drivers() -> anyhow::Result<()> {
    let drivers = DRIVER_TABLE
        .iter()
        .map(|entry| entry.info().map_err(ErrorReport::from))
        .collect::<Result<Vec<DriverInfo>, _>>()?;
    println!("{}", serde_json::to_string_pretty(&drivers)?);
    Ok(())
}

fn open_session(
    driver: &str,
    device: &str,
    parameters: &str,
    config: SessionConfig,
) -> anyhow::Result<Session> {
    let entry = find_driver(driver).map_err(ErrorReport::from)?;
    let session = Session::open(entry, device, parameters, config)
        .map_err(ErrorReport::from)
        .with_context(|| format!("Failed to open {} display on {}", entry.name, device))?;
    if let Some(identity) = session.identity() {
        info!(
            "{} on {}: {} with {} cells",
            entry.name, device, identity.model, identity.cells
        );
    }
    Ok(session)
}

fn show_text(session: &mut Session, text: &str) -> anyhow::Result<()> {
    let width = session.identity().map_or(0, |identity| identity.cells);
    session
        .write_window(&text_cells(text, width))
        .map_err(ErrorReport::from)?;
    session.write_visual(text).map_err(ErrorReport::from)?;
    Ok(())
}

fn write_text(args: WriteArgs, config: SessionConfig) -> anyhow::Result<()> {
    let mut session = open_session(&args.driver, &args.device, &args.parameters, config)?;
    let written = show_text(&mut session, &args.text);
    session.close().map_err(ErrorReport::from)?;
    written
}

/// One line of `run` output.
#[derive(Serialize)]
struct OutputLine<'a> {
    timestamp: String,
    #[serde(flatten)]
    body: LineBody<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum LineBody<'a> {
    Event(&'a InputEvent),
    Error { error: &'a ErrorReport },
}

fn print_line(body: LineBody<'_>) -> anyhow::Result<()> {
    let line = OutputLine {
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        body,
    };
    println!("{}", serde_json::to_string(&line)?);
    Ok(())
}

/// Deliver every queued input event, restarting the session after a
/// transport or write failure.
fn poll_session(session: &mut Session, text: Option<&str>) -> anyhow::Result<()> {
    loop {
        match session.read_input() {
            Ok(Some(event)) => print_line(LineBody::Event(&event))?,
            Ok(None) => return Ok(()),
            Err(e) if e.is_fatal() => {
                let report = ErrorReport::from(&e);
                warn!("{}", report);
                print_line(LineBody::Error { error: &report })?;

                session.restart().map_err(ErrorReport::from)?;
                if let Some(text) = text {
                    show_text(session, text)?;
                }
                return Ok(());
            }
            Err(e) => return Err(ErrorReport::from(e).into()),
        }
    }
}

fn run_session(args: RunArgs, mut config: SessionConfig) -> anyhow::Result<()> {
    if let Some(mode) = args.mode {
        config.input_mode = mode.into();
    }
    let interval = Duration::from_millis(config.poll_interval_ms.max(1));

    let mut session = open_session(&args.driver, &args.device, &args.parameters, config)?;
    if let Some(text) = &args.text {
        show_text(&mut session, text)?;
    }

    let runtime = tokio::runtime::Runtime::new()?;
    let result = runtime.block_on(async {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = shutdown_signal();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => poll_session(&mut session, args.text.as_deref())?,
                _ = &mut shutdown => break,
            }
        }
        Ok::<(), anyhow::Error>(())
    });

    if let Err(e) = session.close() {
        warn!("Failed to close session: {}", e);
    }
    result
}

/// Wait for SIGINT (Ctrl+C) or SIGTERM.
async fn shutdown_signal() {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received SIGINT, closing session");
        }
        _ = sigterm() => {
            info!("Received SIGTERM, closing session");
        }
    }
}

/// Wait for SIGTERM signal (Unix only).
///
/// If signal registration fails, logs a warning and waits indefinitely.
#[cfg(unix)]
async fn sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            warn!(
                "Failed to register SIGTERM handler: {}, only SIGINT will close the session",
                e
            );
            std::future::pending::<()>().await;
        }
    }
}

/// SIGTERM is not available on non-Unix platforms; use a never-completing future.
#[cfg(not(unix))]
async fn sigterm() {
    std::future::pending::<()>().await;
}
