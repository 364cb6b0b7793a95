// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) Matrix Construct Developers, Authors & Contributors

use std::rc::Rc;

use anyhow::{Context, Result};
use clap::Parser;
use ircd_server::{
    cfg::{cli::Cli, config::Config, logger::init_logger},
    dispatcher::Dispatcher,
    request::{Request, RequestOptions, build_head},
};
use tracing::info;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let _init_logger = init_logger("fedctl-logger.yaml").ok();

    let cfg = Config::load_from_file(&cli.config)
        .or_else(|_| -> Result<Config> { Ok(Config::default()) })
        .context("failed to resolve or load config")?;

    let local = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build current-thread runtime")?;
    let local_set = tokio::task::LocalSet::new();

    local.block_on(local_set.run_until(run(cli, cfg)))
}

async fn run(cli: Cli, cfg: Config) -> Result<()> {
    let dispatcher = Rc::new(Dispatcher::new(&cfg).context("failed to build dispatcher")?);

    let head = build_head(&cli.method, &cli.path, &cli.destination, 0, None, &[]);
    let options = RequestOptions::from(&cfg.request_defaults);
    let request = Rc::new(Request::new(head, bytes::Bytes::new(), options));

    info!(destination = %cli.destination, method = %cli.method, path = %cli.path, "submitting request");

    let promise = dispatcher
        .submit(&cli.destination, request)
        .await
        .context("submit failed")?;

    match promise.await {
        Ok(Ok(outcome)) => {
            println!("status: {}", outcome.status);
            match outcome.content {
                ircd_server::tag::TagContent::Fixed(b) => {
                    println!("{}", String::from_utf8_lossy(&b));
                },
                ircd_server::tag::TagContent::Chunks(chunks) => {
                    for c in chunks {
                        print!("{}", String::from_utf8_lossy(&c));
                    }
                    println!();
                },
            }
            Ok(())
        },
        Ok(Err(e)) => Err(anyhow::anyhow!("request failed: {e}")),
        Err(_) => Err(anyhow::anyhow!("request promise dropped without resolution")),
    }
}
