//! # Courier Server
//!
//! Presence-aware direct messaging server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! courier
//!
//! # Run with custom config
//! courier --config /path/to/courier.toml
//!
//! # Run with environment variables
//! COURIER_PORT=8080 COURIER_AUTH__JWT_SECRET=... courier
//!
//! # Add a user to the directory
//! courier add-user alice alice@example.com
//! ```

mod api;
mod auth;
mod config;
mod handlers;
mod metrics;

use anyhow::{bail, Context, Result};
use courier_store::{MessageStore, SqliteStore};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// What the binary was asked to do.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Serve,
    AddUser { username: String, email: String },
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    config: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: impl IntoIterator<Item = String>) -> Result<Args> {
    let mut config = None;
    let mut positional = Vec::new();
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config = Some(PathBuf::from(path));
            }
            flag if flag.starts_with('-') => bail!("Unknown option: {flag}"),
            _ => positional.push(arg),
        }
    }

    let command = match positional.as_slice() {
        [] => Command::Serve,
        [cmd, username, email] if cmd == "add-user" => Command::AddUser {
            username: username.clone(),
            email: email.clone(),
        },
        [cmd, ..] if cmd == "add-user" => bail!("Usage: courier add-user <username> <email>"),
        [other, ..] => bail!("Unknown command: {other}"),
    };

    Ok(Args { config, command })
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "courier=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = parse_args(std::env::args().skip(1))?;

    // Load configuration
    let config = config::Config::load(args.config.as_deref())?;

    let store = SqliteStore::open(config.store_path())
        .with_context(|| format!("Failed to open store at {}", config.store.path))?;

    match args.command {
        Command::AddUser { username, email } => {
            let user = store
                .create_user(&username, &email)
                .await
                .with_context(|| format!("Failed to add user {username}"))?;
            tracing::info!(user = %user.id, username = %user.username, "User added");
            println!("{}", user.id);
        }
        Command::Serve => {
            config.validate()?;
            tracing::info!("Starting Courier server on {}:{}", config.host, config.port);

            // Initialize metrics
            metrics::init_metrics();

            // Start the server
            handlers::run_server(config, Arc::new(store)).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_no_args_serves() {
        assert_eq!(
            args(&[]).unwrap(),
            Args {
                config: None,
                command: Command::Serve
            }
        );
    }

    #[test]
    fn test_config_flag() {
        let parsed = args(&["--config", "/etc/courier.toml"]).unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("/etc/courier.toml")));
        assert_eq!(parsed.command, Command::Serve);
        assert!(args(&["--config"]).is_err());
    }

    #[test]
    fn test_add_user() {
        let parsed = args(&["add-user", "alice", "alice@example.com", "-c", "c.toml"]).unwrap();
        assert_eq!(
            parsed.command,
            Command::AddUser {
                username: "alice".into(),
                email: "alice@example.com".into()
            }
        );
        assert!(args(&["add-user", "alice"]).is_err());
    }

    #[test]
    fn test_unknown_input() {
        assert!(args(&["serve-forever"]).is_err());
        assert!(args(&["--verbose"]).is_err());
    }
}
