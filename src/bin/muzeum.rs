use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use muzeum::{Gateway, GatewayConfig, ca};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Artifact registry gateway.
///
/// Terminates TLS with certificates signed by a local CA and mirrors
/// upstream package repositories through a local cache.
#[derive(Parser, Debug)]
#[command(name = "muzeum")]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a root CA certificate and key, written to stdout as PEM.
    Ca {
        #[arg(long, default_value = "muzeum")]
        common_name: String,
    },
    /// Run the gateway.
    Server {
        /// Path to the configuration file (YAML).
        #[arg(short = 'c', long, default_value = "config.yaml")]
        config: PathBuf,

        /// Plain HTTP listen address, overriding the config file.
        #[arg(long)]
        http: Option<String>,

        /// TLS listen address, overriding the config file.
        #[arg(long)]
        https: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    match Args::parse().command {
        Command::Ca { common_name } => {
            let mut stdout = std::io::stdout().lock();
            ca::generate(&mut stdout, &common_name).context("failed to generate CA")?;
            stdout.flush()?;
        }
        Command::Server {
            config,
            http,
            https,
        } => {
            let mut gateway_config = GatewayConfig::load(&config)
                .with_context(|| format!("failed to load config from {:?}", config))?;
            if let Some(http) = http {
                gateway_config.listen.http = http;
            }
            if let Some(https) = https {
                gateway_config.listen.https = https;
            }
            Gateway::new(gateway_config).run().await?;
        }
    }

    Ok(())
}
