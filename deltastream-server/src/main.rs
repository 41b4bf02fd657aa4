//! Standalone delta server.
//!
//! Command line arguments and environment variables are handled by clap;
//! `RUST_LOG` sets the log filter (default `info`).

use clap::Parser;
use deltastream::server::{DeltaServer, ServerConfig};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Sequencing server for collaborative documents over WebSocket
#[derive(Parser, Debug, Clone)]
#[command(name = "deltastream-server")]
#[command(about = "Sequencing server for collaborative documents over WebSocket")]
struct Args {
    /// Address to listen on
    #[arg(env = "DELTASTREAM_BIND")]
    bind: Option<String>,

    /// Maximum concurrently joined clients per document
    #[arg(long, env = "DELTASTREAM_MAX_CLIENTS")]
    max_clients: Option<usize>,

    /// Seconds a new socket has to send its Connect frame
    #[arg(long, env = "DELTASTREAM_CONNECT_TIMEOUT")]
    connect_timeout_secs: Option<u64>,
}

impl Args {
    /// Overlay the given values on the default server configuration.
    fn into_config(self) -> ServerConfig {
        let mut config = ServerConfig::default();
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(max_clients) = self.max_clients {
            config.sequencer.max_clients = max_clients;
        }
        if let Some(secs) = self.connect_timeout_secs {
            config.connect_timeout_secs = secs;
        }
        config
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Args::parse().into_config();
    log::info!(
        "Starting delta server on {} (max {} clients per document)",
        config.bind_addr,
        config.sequencer.max_clients
    );

    DeltaServer::new(config).run().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_values_keep_defaults() {
        let config = Args {
            bind: None,
            max_clients: None,
            connect_timeout_secs: None,
        }
        .into_config();
        let defaults = ServerConfig::default();
        assert_eq!(config.bind_addr, defaults.bind_addr);
        assert_eq!(config.sequencer.max_clients, defaults.sequencer.max_clients);
        assert_eq!(config.connect_timeout_secs, defaults.connect_timeout_secs);
    }

    #[test]
    fn test_arguments_override_defaults() {
        let args = Args::try_parse_from([
            "deltastream-server",
            "0.0.0.0:9000",
            "--max-clients",
            "8",
            "--connect-timeout-secs",
            "2",
        ])
        .unwrap();
        let config = args.into_config();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.sequencer.max_clients, 8);
        assert_eq!(config.connect_timeout_secs, 2);
    }

    #[test]
    fn test_invalid_client_limit_rejected() {
        let result = Args::try_parse_from(["deltastream-server", "--max-clients", "many"]);
        assert!(result.is_err());
    }
}
