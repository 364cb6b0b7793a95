// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;

/// `fedctl` — ad-hoc driver for the federation broker core, useful for
/// poking a single destination without booting the rest of the homeserver.
#[derive(Parser, Debug)]
#[command(name = "fedctl", about = "Drive the federation message broker core")]
pub struct Cli {
    /// Path to the broker config YAML.
    #[arg(short, long, default_value = "fedctl.yaml")]
    pub config: String,

    /// Destination to submit a request to, e.g. `matrix.org`.
    #[arg(short, long)]
    pub destination: String,

    /// HTTP method.
    #[arg(short, long, default_value = "GET")]
    pub method: String,

    /// Request path (including query string).
    #[arg(short, long, default_value = "/_matrix/federation/v1/version")]
    pub path: String,
}

pub fn resolve_config_path(rel: &str) -> Result<PathBuf> {
    let p = Path::new(rel);

    let abs = if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir()
            .context("cannot get current working dir")?
            .join(p)
    };

    let canon = abs
        .canonicalize()
        .with_context(|| format!("failed to canonicalize path {abs:?}"))?;

    Ok(canon)
}
