//! # CLI Interface
//!
//! Command-line argument structure for `sqrl-node`, built with `clap`
//! derive. Three subcommands: `run`, `status`, and `version`.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// SQRL authentication server.
///
/// Serves the SQRL challenge-response protocol over HTTP: mints login
/// nuts for page rendering, handles the authentication endpoint, and
/// exposes a session-status poll for login pages, plus Prometheus metrics.
#[derive(Parser, Debug)]
#[command(
    name = "sqrl-node",
    about = "SQRL authentication server",
    version,
    propagate_version = true
)]
pub struct SqrlNodeCli {
    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the authentication server.
    Run(RunArgs),
    /// Query the health endpoint of a running server.
    Status(StatusArgs),
    /// Print version information and exit.
    Version,
}

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Port for the HTTP API.
    #[arg(long, env = "SQRL_LISTEN_PORT", default_value_t = 8080)]
    pub listen_port: u16,

    /// Port for the Prometheus metrics endpoint.
    #[arg(long, env = "SQRL_METRICS_PORT", default_value_t = 8081)]
    pub metrics_port: u16,

    /// Data directory for persistent storage.
    ///
    /// Created on first run if it does not exist. Ignored with
    /// `--ephemeral`.
    #[arg(long, short = 'd', env = "SQRL_DATA_DIR", default_value = "./sqrl-data")]
    pub data_dir: PathBuf,

    /// Keep all state in memory. Everything is lost on restart; useful for
    /// development and demos.
    #[arg(long)]
    pub ephemeral: bool,

    /// Use the stateless nut scheme: round state travels inside the
    /// encrypted token instead of a server-side nonce table.
    #[arg(long, env = "SQRL_STATELESS")]
    pub stateless: bool,

    /// The key domain presented to clients, e.g. `example.com` or
    /// `example.com/app`.
    #[arg(long, env = "SQRL_DOMAIN", default_value = "localhost")]
    pub domain: String,

    /// Server-relative path of the authentication endpoint.
    #[arg(long, env = "SQRL_AUTH_PATH", default_value = "/sqrl/auth")]
    pub auth_path: String,

    /// Accept insecure transport (`qrl://` URLs). Only for development.
    #[arg(long)]
    pub insecure: bool,

    /// Refuse account creation by unknown identity keys.
    #[arg(long)]
    pub disallow_anon: bool,

    /// Nut expiry in minutes.
    #[arg(long, env = "SQRL_NONCE_MAX_AGE", default_value_t = 5)]
    pub nonce_max_age: i64,

    /// Secret salt keying nut generation and the stateless token cipher.
    ///
    /// **Set this in production.** The default exists so development
    /// servers start without ceremony, and it is logged loudly.
    #[arg(long, env = "SQRL_NONCE_SALT", default_value = "change-me")]
    pub nonce_salt: String,

    /// Server friendly name shown on the client's confirmation screen.
    #[arg(long, env = "SQRL_FRIENDLY_NAME", default_value = "SQRL Server")]
    pub friendly_name: String,

    /// Log output format: "pretty" or "json".
    #[arg(long, env = "SQRL_LOG_FORMAT", default_value = "pretty")]
    pub log_format: String,
}

/// Arguments for the `status` subcommand.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    /// Base URL of the running server.
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    pub url: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli_structure() {
        // Ensures the derive macros produce a valid CLI definition.
        SqrlNodeCli::command().debug_assert();
    }

    #[test]
    fn test_run_defaults() {
        let cli = SqrlNodeCli::parse_from(["sqrl-node", "run"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.listen_port, 8080);
        assert!(!args.stateless);
        assert!(!args.insecure);
        assert_eq!(args.auth_path, "/sqrl/auth");
    }
}
