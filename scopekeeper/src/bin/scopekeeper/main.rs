// SPDX-License-Identifier: MIT OR Apache-2.0
//! The `scopekeeper` proxy.
//!
//! Loads the configuration, binds the HTTP and host ports and runs the reactor until the
//! process is killed.

mod args;

use args::Args;
use clap::Parser;
use scopekeeper::{Config, Reactor};

fn main() {
    let args = Args::parse();
    if let Err(e) = run(args) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply(args.overrides());
    config.validate()?;
    if args.make_config {
        print!("{}", config.to_toml()?);
        return Ok(());
    }

    let mut reactor = Reactor::bind(&config)?;
    let http = reactor.http_addr()?;
    let host = reactor.host_addr()?;
    logwise::info_sync!(
        "server on {http}, waiting for a host on {host}",
        http = logwise::privacy::LogIt(&http),
        host = logwise::privacy::LogIt(&host)
    );
    if config.debug {
        logwise::info_sync!(
            "configuration: {config}",
            config = logwise::privacy::LogIt(&config)
        );
    }
    reactor.run()
}
