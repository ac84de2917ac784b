//! Ferry control CLI.
//!
//! Thin operational front-end over the daemon's wire contract: liveness
//! probes, health/metrics/pool views, on-demand cleanup, graceful shutdown,
//! and a raw `call` escape hatch for driving any whitelisted capability.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use ferry_proto::{BridgeClient, ParamMap, socket_path};

/// Ferry bridge daemon control CLI
#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Control CLI for the ferry bridge daemon")]
#[command(version)]
#[command(after_help = "\
Examples:
  ferry ping                      Check daemon liveness
  ferry health                    Pass/warn/fail per subsystem
  ferry performance               Latency and throughput counters
  ferry connections               Live handles in the pool
  ferry cleanup                   Evict stale handles now
  ferry call crypto new '{\"key\": \"s3cret\", \"cipher\": \"AES\"}'
  ferry shutdown                  Stop the daemon gracefully
")]
struct Cli {
    /// Custom socket path (defaults to `$FERRY_SOCKET`, then
    /// `$XDG_RUNTIME_DIR/ferry.sock`)
    #[arg(long, value_name = "PATH", global = true)]
    socket_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check daemon liveness via test.ping
    Ping,

    /// Derived health view (pool saturation, error rate, resource age)
    Health,

    /// Latency/throughput summary
    Performance,

    /// Full metrics snapshot including the per-module breakdown
    Metrics,

    /// Daemon counters and last cleanup summary
    Stats,

    /// Live handles in the pool
    Connections,

    /// Evict stale handles now and report what went
    Cleanup,

    /// Request a graceful daemon shutdown
    Shutdown,

    /// Call any whitelisted capability with raw JSON params
    Call {
        /// Capability namespace (e.g. database, crypto)
        module: String,
        /// Operation name inside the module
        function: String,
        /// Parameters as a JSON object (defaults to empty)
        params: Option<String>,
    },
}

fn parse_params(raw: Option<&str>) -> Result<ParamMap> {
    let Some(raw) = raw else {
        return Ok(ParamMap::new());
    };
    let value: serde_json::Value =
        serde_json::from_str(raw).context("params must be valid JSON")?;
    match value {
        serde_json::Value::Object(map) => Ok(map),
        _ => bail!("params must be a JSON object"),
    }
}

async fn run(cli: Cli) -> Result<()> {
    let client = BridgeClient::new(cli.socket_path.unwrap_or_else(socket_path));

    let (module, function, params) = match &cli.command {
        Commands::Ping => ("test", "ping", ParamMap::new()),
        Commands::Health => ("system", "health", ParamMap::new()),
        Commands::Performance => ("system", "performance", ParamMap::new()),
        Commands::Metrics => ("system", "metrics", ParamMap::new()),
        Commands::Stats => ("system", "stats", ParamMap::new()),
        Commands::Connections => ("system", "connections", ParamMap::new()),
        Commands::Cleanup => ("system", "cleanup", ParamMap::new()),
        Commands::Shutdown => ("system", "shutdown", ParamMap::new()),
        Commands::Call {
            module,
            function,
            params,
        } => (
            module.as_str(),
            function.as_str(),
            parse_params(params.as_deref())?,
        ),
    };

    let response = client
        .call(module, function, params)
        .await
        .with_context(|| format!("cannot reach daemon at {}", client.socket_path().display()))?;

    if response.success {
        let result = response.result.unwrap_or(serde_json::Value::Null);
        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    } else {
        let error = response
            .error
            .unwrap_or_else(|| "daemon returned failure without an error".to_string());
        bail!("{module}.{function} failed: {error}");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_params_defaults_empty() {
        assert!(parse_params(None).unwrap().is_empty());
    }

    #[test]
    fn test_parse_params_object() {
        let params = parse_params(Some(r#"{"key": "value", "n": 3}"#)).unwrap();
        assert_eq!(params["key"], "value");
        assert_eq!(params["n"], 3);
    }

    #[test]
    fn test_parse_params_rejects_non_object() {
        assert!(parse_params(Some("[1, 2]")).is_err());
        assert!(parse_params(Some("not json")).is_err());
    }

    #[test]
    fn test_cli_parses_call_command() {
        let cli = Cli::parse_from(["ferry", "call", "crypto", "new", r#"{"key": "k"}"#]);
        match cli.command {
            Commands::Call {
                module, function, ..
            } => {
                assert_eq!(module, "crypto");
                assert_eq!(function, "new");
            }
            _ => panic!("expected call command"),
        }
    }

    #[test]
    fn test_cli_parses_socket_override() {
        let cli = Cli::parse_from(["ferry", "--socket-path", "/tmp/x.sock", "ping"]);
        assert_eq!(cli.socket_path, Some(PathBuf::from("/tmp/x.sock")));
    }
}
