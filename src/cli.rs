//! Command line interface for the `respmux` diagnostic binary.
//!
//! The binary connects to one or more endpoints through a multiplexer and
//! either sends a single command or listens on channels.

use std::net::SocketAddr;

use clap::Parser;

const AFTER_HELP: &str = "\
Examples:
  respmux SET greeting hello
  respmux -e 127.0.0.1:7000 -r 127.0.0.1:7001 GET greeting
  respmux -n 100 INCR hits
  respmux --subscribe news 'weather.*'

Log output goes to stderr and is filtered with RUST_LOG, e.g. RUST_LOG=respmux=debug.";

/// Command line arguments for the `respmux` binary.
#[derive(Debug, Parser)]
#[command(
    name = "respmux",
    version,
    about = "Send RESP commands through a pipelined multiplexer",
    after_long_help = AFTER_HELP
)]
pub struct Cli {
    /// Primary endpoint address. May be repeated.
    #[arg(short, long = "endpoint", value_name = "ADDR", default_value = "127.0.0.1:6379")]
    pub endpoints: Vec<SocketAddr>,
    /// Replica endpoint address. May be repeated.
    #[arg(short, long = "replica", value_name = "ADDR")]
    pub replicas: Vec<SocketAddr>,
    /// Per-command timeout in milliseconds.
    #[arg(short, long, value_name = "MS", default_value_t = 5000)]
    pub timeout: u64,
    /// Send the command this many times, pipelined.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub repeat: usize,
    /// Treat the arguments as channels and print published messages until
    /// interrupted.
    #[arg(short, long)]
    pub subscribe: bool,
    /// Print collected metrics in Prometheus text format before exiting.
    #[arg(long)]
    pub metrics: bool,
    /// Command name followed by its arguments, or channels with
    /// `--subscribe`.
    #[arg(required = true, num_args = 1.., trailing_var_arg = true)]
    pub command: Vec<String>,
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, Parser};

    use super::Cli;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
        let cmd = Cli::command();
        assert_eq!(cmd.get_name(), "respmux");
        let help = cmd.get_after_long_help().map(ToString::to_string).unwrap_or_default();
        assert!(help.contains("RUST_LOG"));
    }

    #[test]
    fn parses_command_and_endpoints() {
        let cli = Cli::parse_from([
            "respmux",
            "--endpoint",
            "127.0.0.1:7000",
            "-r",
            "127.0.0.1:7001",
            "SET",
            "key",
            "value",
        ]);
        assert_eq!(cli.endpoints, vec!["127.0.0.1:7000".parse().expect("addr")]);
        assert_eq!(cli.replicas.len(), 1);
        assert_eq!(cli.command, vec!["SET", "key", "value"]);
        assert_eq!(cli.repeat, 1);
    }

    #[test]
    fn defaults_to_local_endpoint() {
        let cli = Cli::parse_from(["respmux", "PING"]);
        assert_eq!(cli.endpoints, vec!["127.0.0.1:6379".parse().expect("addr")]);
        assert_eq!(cli.timeout, 5000);
        assert!(!cli.subscribe);
    }

    #[test]
    fn requires_a_command() {
        assert!(Cli::try_parse_from(["respmux"]).is_err());
    }
}
