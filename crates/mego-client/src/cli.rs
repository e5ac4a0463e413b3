//! Command-line interface definition.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// mego - RPC and pub/sub over WebSocket
#[derive(Debug, Parser)]
#[command(name = "mego")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, short, env = "MEGO_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Server URL, overrides the configuration file
    #[arg(long, env = "MEGO_URL", global = true)]
    pub url: Option<String>,

    /// Response timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a demo server exposing Sum, Echo, Chat and Upload
    Serve {
        /// Address to listen on, overrides the configuration file
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Emit JSON logs
        #[arg(long)]
        json_logs: bool,
    },

    /// Call a method and print its result as JSON
    Call {
        /// Method name
        method: String,

        /// Parameters as JSON, e.g. '[3, 4]'
        params: Option<String>,
    },

    /// Upload a file to a method
    Upload {
        /// Method name
        method: String,

        /// File to upload
        path: PathBuf,

        /// File field name (defaults to File1)
        #[arg(long)]
        field: Option<String>,

        /// Send the file in parts with next/abort flow control
        #[arg(long)]
        chunked: bool,

        /// Bytes per part, overrides the configuration file
        #[arg(long)]
        chunk_size: Option<usize>,
    },

    /// Subscribe to a channel and print every event
    Listen {
        /// Event name
        event: String,

        /// Channel name
        channel: String,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Dump current configuration
    Dump,

    /// Show configuration file path
    Path,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_call_with_params() {
        let cli = Cli::try_parse_from(["mego", "-vv", "call", "Sum", "[3, 4]"]).unwrap();
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Command::Call { method, params } => {
                assert_eq!(method, "Sum");
                assert_eq!(params.as_deref(), Some("[3, 4]"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn parses_chunked_upload() {
        let cli = Cli::try_parse_from([
            "mego",
            "upload",
            "Upload",
            "video.mp4",
            "--chunked",
            "--chunk-size",
            "4096",
            "--url",
            "ws://10.0.0.1:5000",
        ])
        .unwrap();
        assert_eq!(cli.url.as_deref(), Some("ws://10.0.0.1:5000"));
        match cli.command {
            Command::Upload {
                chunked,
                chunk_size,
                field,
                ..
            } => {
                assert!(chunked);
                assert_eq!(chunk_size, Some(4096));
                assert!(field.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
