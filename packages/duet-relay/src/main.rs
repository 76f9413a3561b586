//! Duet relay server binary.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use duet_relay::{app, RelayConfig, RelayState};

// ── CLI Arguments ─────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "duet-relay", version, about = "Duet video-call signaling relay")]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0", env = "RELAY_HOST")]
    host: String,

    /// Port to listen on
    #[arg(short, long, default_value_t = 9001, env = "RELAY_PORT")]
    port: u16,

    /// JSON file with the user directory served at /api/users
    #[arg(long, default_value = "data/users.json", env = "USERS_FILE")]
    users_file: PathBuf,

    /// Allowed CORS origins (comma-separated). Empty allows any origin.
    #[arg(long, env = "ALLOWED_ORIGINS", value_delimiter = ',')]
    allowed_origins: Vec<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// ── Entry Point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(args.log_json);

    let config = RelayConfig {
        host: args.host,
        port: args.port,
        users_file: args.users_file,
        allowed_origins: args
            .allowed_origins
            .into_iter()
            .filter(|origin| !origin.trim().is_empty())
            .collect(),
    };

    let addr = config.bind_addr();
    let state = RelayState::from_config(config);

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = addr.as_str(), error = %e, "Failed to bind address");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!("Duet relay server starting on {}", addr);

    let served = axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await;

    match served {
        Ok(()) => {
            tracing::info!("Duet relay server stopped");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Server error");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "duet_relay=info,tower_http=info".into());

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_args() {
        let args = Args::parse_from(["duet-relay"]);
        assert_eq!(args.port, 9001);
        assert_eq!(args.host, "0.0.0.0");
        assert!(args.allowed_origins.is_empty());
        assert!(!args.log_json);
    }

    #[test]
    fn test_origin_list_is_split() {
        let args = Args::parse_from([
            "duet-relay",
            "--allowed-origins",
            "http://localhost:3000,http://localhost:3001",
        ]);
        assert_eq!(args.allowed_origins.len(), 2);
    }
}
