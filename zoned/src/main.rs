/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::filter;
use tracing_subscriber::prelude::*;

use zoned::config::DaemonConfig;
use zoned::manager::ZonesManager;
use zoned::server::Server;

/// Zone supervisor daemon.
#[derive(Parser, Debug)]
struct Args {
    /// Daemon configuration file.
    #[clap(long, default_value = "/etc/zoned/daemon.conf")]
    config: PathBuf,
    /// Start every configured zone before serving.
    #[clap(long)]
    start_all: bool,
    /// Leave zones running on exit instead of stopping them.
    #[clap(long)]
    detach_on_exit: bool,
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let default_filter = filter::Targets::new().with_default(level);
    let log_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_filter(default_filter);
    tracing_subscriber::registry().with(log_layer).init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);
    zoned_ipc::sigfd::block_sigpipe().context("while blocking SIGPIPE")?;

    let config = DaemonConfig::load(&args.config)
        .with_context(|| format!("while loading {}", args.config.display()))?;
    let manager =
        Arc::new(ZonesManager::load(config).context("while loading the zone registry")?);

    if args.start_all {
        manager.start_all().context("while starting zones")?;
    }

    let mut server = Server::new(Arc::clone(&manager)).context("while binding the host socket")?;
    server.run().context("while serving")?;

    if !args.detach_on_exit {
        manager.stop_all();
    }
    Ok(())
}
