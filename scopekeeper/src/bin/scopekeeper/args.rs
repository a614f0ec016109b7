// SPDX-License-Identifier: MIT OR Apache-2.0
use clap::Parser;
use scopekeeper::config::Overrides;
use scopekeeper_internal::message::Format;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file (default: ./scopekeeper.toml if present)
    #[clap(short, long, env = "SCOPEKEEPER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address both listeners bind to.
    #[clap(long)]
    pub host: Option<String>,

    /// Port of the HTTP interface for debugger clients.
    #[clap(short = 's', long)]
    pub server_port: Option<u16>,

    /// Port the debuggee connects to.
    #[clap(short = 'p', long)]
    pub proxy_port: Option<u16>,

    /// Log every message passing through the proxy.
    #[clap(short, long)]
    pub debug: bool,

    /// Stay on STP/0 even if the host offers stp-1.
    #[clap(long = "force-stp-0")]
    pub force_stp_0: bool,

    /// Payload format for STP/1 commands: protobuf, json or xml.
    #[clap(short, long)]
    pub format: Option<Format>,

    /// Seconds a long-poll is held before answering <timeout/>.
    #[clap(long)]
    pub poll_timeout: Option<u64>,

    /// Print the effective configuration as TOML and exit.
    #[clap(long)]
    pub make_config: bool,
}

impl Args {
    pub fn overrides(&self) -> Overrides {
        Overrides {
            host: self.host.clone(),
            server_port: self.server_port,
            proxy_port: self.proxy_port,
            debug: self.debug,
            force_stp_0: self.force_stp_0,
            format: self.format,
            poll_timeout_secs: self.poll_timeout,
        }
    }
}
