// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Executable that supervises clusters of remote DNSSEC signing nodes.

use anyhow::Context;
use camino::Utf8PathBuf;
use clap::Parser;
use orr_controller::config::LogConfig;
use orr_controller::{Config, Controller};
use slog::{info, o, Drain};

#[derive(Parser, Debug)]
struct Args {
    #[clap(long, action)]
    config_file: Utf8PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();
    let config = Config::from_file(&args.config_file)
        .with_context(|| format!("load config file {:?}", args.config_file))?;
    let log = make_logger(&config.log)?;
    info!(log, "config"; "config" => ?config);

    let controller =
        Controller::start(&config, log.clone()).context("starting controller")?;

    tokio::signal::ctrl_c().await.context("waiting for shutdown signal")?;
    info!(log, "shutting down");
    controller.stop().await;
    Ok(())
}

fn make_logger(config: &LogConfig) -> Result<slog::Logger, anyhow::Error> {
    let level = match config.level.as_str() {
        "trace" => slog::Level::Trace,
        "debug" => slog::Level::Debug,
        "info" => slog::Level::Info,
        "warn" | "warning" => slog::Level::Warning,
        "error" => slog::Level::Error,
        "critical" => slog::Level::Critical,
        other => anyhow::bail!("unknown log level {:?}", other),
    };
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    Ok(slog::Logger::root(drain, o!("name" => "orr-controller")))
}
