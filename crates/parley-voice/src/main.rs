//! `parley` - spoken dialogue from the terminal.
//!
//! Reads configuration from `PARLEY_CONFIG` / `PARLEY__*` and `.env`, then
//! listens until CTRL-C. Exits 1 when the session cannot start.

use anyhow::Context;
use parley_voice::{VoiceConfig, VoiceError};
use std::process::ExitCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    // Load .env file if present (before any env::var calls)
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[parley] .env not loaded: {} (using system environment)", e);
    }

    let config = match VoiceConfig::load().context("loading configuration") {
        Ok(config) => config,
        Err(e) => {
            eprintln!("[parley] configuration: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let default_filter = if config.debug { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    match parley_voice::run(config) {
        Ok(report) => {
            tracing::info!(
                utterances = report.utterances,
                recognized = report.recognized,
                turns = report.turns_recorded,
                barge_ins = report.barge_ins,
                "Session finished"
            );
            if let Ok(json) = serde_json::to_string_pretty(&report) {
                println!("{}", json);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            let component = e.component();
            let err = anyhow::Error::new(e).context(format!("{} failed", component));
            tracing::error!("{:#}", err);
            eprintln!("[parley] {:#}", err);
            if let Some(VoiceError::Config(_)) = err.downcast_ref::<VoiceError>() {
                eprintln!("[parley] check PARLEY_CONFIG and the API key variables");
            }
            ExitCode::FAILURE
        }
    }
}
