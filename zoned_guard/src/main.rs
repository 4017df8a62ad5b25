/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is licensed under the MIT license found in the
 * LICENSE file in the root directory of this source tree.
 */

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;

use zoned_guard::Guard;

/// Per-zone guard process. Spawned by the supervisor; not for human use.
#[derive(Parser, Debug)]
struct Args {
    /// Unix socket the guard serves the supervisor on.
    socket_path: PathBuf,
    /// Zone id and root path, passed for the process list only; the real
    /// values arrive with the configuration.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    title: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    let Args {
        socket_path,
        title: _,
    } = Args::parse();
    // No subscriber yet: stdio points at /dev/null after daemonization.
    // Logging comes up when the supervisor delivers the configuration.

    let mut guard = Guard::new(&socket_path)
        .with_context(|| format!("while binding {}", socket_path.display()))?;
    let status = guard.execute().context("while serving the zone")?;
    std::process::exit(status);
}
