use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod call;
pub mod nodes;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a node and expose its configured greeter services.
    Serve(ServeArgs),
    /// Call a greeter service and print the reply.
    Call(CallArgs),
    /// List configured nodes and services.
    Nodes(NodesArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Call(args) => call::run(args, format),
        Command::Nodes(args) => nodes::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Node configuration file (JSON).
    #[arg(long, short = 'c', env = "NODEBIND_CONFIG")]
    pub config: PathBuf,
    /// Id of the node to run.
    #[arg(long, short = 'n')]
    pub node: u32,
}

#[derive(Args, Debug)]
pub struct CallArgs {
    /// Node configuration file (JSON).
    #[arg(long, short = 'c', env = "NODEBIND_CONFIG")]
    pub config: PathBuf,
    /// Id this caller runs as.
    #[arg(long, short = 'n')]
    pub node: u32,
    /// Configured service name.
    pub service: String,
    /// Message to send.
    pub message: String,
    /// Send without waiting for a reply.
    #[arg(long, conflicts_with = "async_reply")]
    pub oneway: bool,
    /// Use the asynchronous method.
    #[arg(long = "async")]
    pub async_reply: bool,
    /// Connect and reply deadline (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct NodesArgs {
    /// Node configuration file (JSON).
    #[arg(long, short = 'c', env = "NODEBIND_CONFIG")]
    pub config: PathBuf,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Parse `5s`, `500ms` or a bare number of seconds.
pub fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = if let Some(num) = input.strip_suffix("ms") {
        (num, true)
    } else if let Some(num) = input.strip_suffix('s') {
        (num, false)
    } else {
        (input, false)
    };

    let value: u64 = number
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;

    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_duration_seconds() {
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn parse_duration_millis() {
        assert_eq!(parse_duration("150ms").unwrap(), Duration::from_millis(150));
    }

    #[test]
    fn parse_duration_invalid() {
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("bad").is_err());
        assert!(parse_duration("  ").is_err());
    }
}
