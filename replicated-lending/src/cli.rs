use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueHint};

use crate::dispatcher::DispatcherConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a lending node: primary and secondary stores behind a TCP line server.
    Serve(ServeArgs),
    /// Send request lines to a running node and print the replies.
    Send(SendArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to accept request lines on. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5555")]
    pub listen: SocketAddr,

    /// Directory holding the primary, secondary and retry queue files.
    #[arg(long, default_value = "data", value_hint = ValueHint::DirPath)]
    pub data_dir: PathBuf,

    /// Identifier of this site, used in logs.
    #[arg(long, default_value = "1")]
    pub site: String,

    /// Grant workers. Defaults to the available parallelism.
    #[arg(long)]
    pub grant_workers: Option<usize>,

    /// Return/renewal workers. Defaults to the available parallelism.
    #[arg(long)]
    pub async_workers: Option<usize>,

    #[arg(long, default_value_t = 64)]
    pub grant_queue: usize,

    #[arg(long, default_value_t = 256)]
    pub async_queue: usize,

    /// Milliseconds a grant caller waits before getting `ERROR:Timeout`.
    #[arg(long, default_value_t = 5_000)]
    pub grant_timeout_ms: u64,

    /// Seconds between retry queue drains.
    #[arg(long, default_value_t = 10)]
    pub retry_interval_secs: u64,

    /// Add the demo books L1 and L2 to stores that do not have them yet.
    #[arg(long)]
    pub seed: bool,

    /// Switch the primary off after this many successful writes.
    #[arg(long)]
    pub fail_primary_after: Option<u64>,
}

impl ServeArgs {
    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let defaults = DispatcherConfig::default();
        DispatcherConfig {
            grant_workers: self.grant_workers.unwrap_or(defaults.grant_workers),
            async_workers: self.async_workers.unwrap_or(defaults.async_workers),
            grant_queue_capacity: self.grant_queue,
            async_queue_capacity: self.async_queue,
            grant_timeout: Duration::from_millis(self.grant_timeout_ms),
            retry_interval: Duration::from_secs(self.retry_interval_secs.max(1)),
            ..defaults
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct SendArgs {
    /// Address of the node to talk to.
    #[arg(long, default_value = "127.0.0.1:5555")]
    pub server: SocketAddr,

    /// Request lines, e.g. `DEVOLUCION;prestamoId=abc`.
    #[arg(required = true)]
    pub requests: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_flags_map_onto_dispatcher_config() {
        let cli = Cli::parse_from([
            "lending_node",
            "serve",
            "--grant-workers",
            "1",
            "--grant-queue",
            "2",
            "--grant-timeout-ms",
            "250",
            "--fail-primary-after",
            "3",
            "--seed",
        ]);
        let Command::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = args.dispatcher_config();
        assert_eq!(config.grant_workers, 1);
        assert_eq!(config.grant_queue_capacity, 2);
        assert_eq!(config.grant_timeout, Duration::from_millis(250));
        assert_eq!(args.fail_primary_after, Some(3));
        assert!(args.seed);
    }

    #[test]
    fn send_requires_a_request() {
        assert!(Cli::try_parse_from(["lending_node", "send"]).is_err());
        let cli = Cli::parse_from(["lending_node", "send", "DEVOLUCION;prestamoId=a"]);
        assert!(matches!(cli.command, Command::Send(args) if args.requests.len() == 1));
    }
}
