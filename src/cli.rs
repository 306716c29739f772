//! Command-line interface, grounded on the teacher's `main.rs` clap derive `Cli` struct and the
//! Go original's `flag` definitions in `main.go`. Flag letters are kept identical to the original
//! so existing launch scripts keep working.

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "natproxy", about = "Reverse NAT-traversal TCP tunnel proxy")]
pub struct Cli {
    /// Run as a server proxy.
    #[arg(short = 's', long = "server")]
    pub server: bool,

    /// Run as a client proxy.
    #[arg(short = 'c', long = "client")]
    pub client: bool,

    /// Config file path (server mode).
    #[arg(short = 'f', long = "config", default_value = "config.json", env = "NATPROXY_CONFIG")]
    pub config: PathBuf,

    /// Serial number override (client mode).
    #[arg(short = 'i', long = "sn", default_value = "", env = "NATPROXY_SN")]
    pub sn: String,

    /// Server address to dial (client mode).
    #[arg(short = 'a', long = "addr", default_value = "")]
    pub addr: String,

    /// Server port to dial (client mode).
    #[arg(short = 'p', long = "port", default_value_t = 0)]
    pub port: u16,

    /// Local target service address exposed through the tunnel (client mode).
    #[arg(long = "target", default_value = "127.0.0.1:5900", env = "NATPROXY_TARGET")]
    pub target: String,
}
