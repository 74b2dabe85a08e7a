//! gatewayctl
//!
//! Command-line front for device-authenticated gateway calls.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use gateway_client::config::Config;
use gateway_client::identity::{load_or_create_device_identity, DeviceAuthStore};
use gateway_client::{invoke, CallOptions};

/// gatewayctl - call gateway methods with a device identity.
#[derive(Parser, Debug)]
#[command(name = "gatewayctl")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Call a gateway method and print its payload
    Call {
        /// Method name, e.g. `status`
        method: String,

        /// JSON parameters
        #[arg(long, default_value = "{}")]
        params: String,

        /// Wait past an "accepted" acknowledgement for the final response
        #[arg(long)]
        expect_final: bool,

        /// Call deadline in milliseconds (defaults to the configured timeout)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },

    /// Show this device's identity, creating it if needed
    Identity,

    /// List cached device tokens (values are never printed)
    Tokens {
        /// Remove the cached token for this role
        #[arg(long, value_name = "ROLE")]
        clear: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = match &cli.config {
        Some(config_path) => Config::load(config_path)?,
        None => Config::load_default()?,
    };

    // Apply environment variable overrides
    config.apply_env_overrides();

    // Validate configuration
    config.validate()?;

    // Initialize tracing
    let filter = if cli.verbose {
        "debug".to_string()
    } else {
        config.client.log_level.to_lowercase()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Call {
            method,
            params,
            expect_final,
            timeout_ms,
        } => {
            let params: serde_json::Value =
                serde_json::from_str(&params).context("--params must be valid JSON")?;
            let mut options = CallOptions::new().with_expect_final(expect_final);
            if let Some(timeout_ms) = timeout_ms {
                options = options.with_timeout_ms(timeout_ms);
            }

            let payload = invoke(&config, &method, params, options).await?;
            println!("{}", serde_json::to_string_pretty(&payload)?);
        }
        Commands::Identity => {
            let identity = load_or_create_device_identity(&config.client.state_dir)?;
            println!("Device ID:  {}", identity.device_id());
            println!("Public key: {}", identity.public_key_base64url());
            println!("State dir:  {}", config.client.state_dir.display());
        }
        Commands::Tokens { clear } => {
            let identity = load_or_create_device_identity(&config.client.state_dir)?;
            let store = DeviceAuthStore::new(&config.client.state_dir);

            if let Some(role) = clear {
                let removed = store
                    .clear(identity.device_id(), &role)
                    .with_context(|| format!("Failed to clear token for role {}", role))?;
                if removed {
                    println!("Cleared token for role {}", role);
                } else {
                    println!("No cached token for role {}", role);
                }
                return Ok(());
            }

            let entries = store.load_all(identity.device_id());
            if entries.is_empty() {
                println!("No cached device tokens.");
            } else {
                println!("{:<16} {:<16} SCOPES", "ROLE", "UPDATED (ms)");
                for entry in entries {
                    println!(
                        "{:<16} {:<16} {}",
                        entry.role,
                        entry.updated_at_ms,
                        entry.scopes.join(",")
                    );
                }
            }
        }
    }

    Ok(())
}
