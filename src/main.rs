mod cli;
mod commands;
mod common;
mod config;
mod conflicts;
mod deps;
mod download;
mod engine;
mod error;
mod pipeline;
mod provision;
mod runner;
#[cfg(test)]
mod testing;
mod ui;
mod upscale;

use clap::Parser;
use std::io::{self, IsTerminal};

use crate::cli::Cli;
use crate::error::LipSyncError;
use crate::ui::prelude::*;

fn main() {
    let cli = Cli::parse();
    let color = !cli.no_color && io::stdout().is_terminal();
    let sink = ConsoleSink::new(cli.format, color, cli.debug);

    if let Err(err) = commands::dispatch(cli, &sink) {
        report_error(&sink, &err);
        std::process::exit(1);
    }
}

fn report_error(sink: &ConsoleSink, err: &anyhow::Error) {
    let chain: Vec<String> = err.chain().map(|cause| cause.to_string()).collect();
    match err.downcast_ref::<LipSyncError>() {
        Some(pipeline_err) => {
            let category = pipeline_err.category();
            sink.emit(
                Level::Error,
                &format!("error.{}", category.as_str()),
                &format!("Error ({}): {:#}", category.as_str(), err),
                Some(serde_json::json!({
                    "category": category.as_str(),
                    "hint": category.hint(),
                    "chain": chain,
                })),
            );
            sink.emit(Level::Warn, "error.hint", category.hint(), None);
        }
        None => sink.emit(
            Level::Error,
            "error",
            &format!("Error: {:#}", err),
            Some(serde_json::json!({ "chain": chain })),
        ),
    }
}
