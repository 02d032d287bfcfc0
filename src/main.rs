//! lifesync-server - Sync, scheduling and habit-insight backend for LifeSync
//!
//! Reconciles task and habit changes from multiple devices, builds daily
//! schedules with help from a local inference server, and mines habit
//! completion logs for insights.

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

mod api;
mod config;
mod db;
mod intake;
mod llm;
mod models;
mod notify;
mod patterns;
mod schedule;
mod sync;

use config::Config;
use llm::{DisabledGenerator, OllamaGenerator, TextGenerator};

#[derive(Parser)]
#[command(name = "lifesync-server")]
#[command(about = "Sync, scheduling and habit-insight backend for LifeSync")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the server
    Serve {
        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind address (overrides config)
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a new API token
    Token {
        /// User the token acts as (required when generating)
        #[arg(short, long)]
        user: Option<String>,

        /// Name/label for the token
        #[arg(short, long)]
        name: Option<String>,

        /// List all configured tokens
        #[arg(long)]
        list: bool,

        /// Revoke a token by name
        #[arg(long)]
        revoke: Option<String>,

        /// Config file path
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Initialize a new config file
    Init {
        /// Output path for config file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("lifesync_server=info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, bind } => {
            let mut cfg = if let Some(path) = config {
                Config::load_from(&path)?
            } else {
                Config::load()?
            };

            if let Some(p) = port {
                cfg.server.port = p;
            }
            if let Some(b) = bind {
                cfg.server.bind = b;
            }

            run_server(cfg).await
        }

        Commands::Token {
            user,
            name,
            list,
            revoke,
            config,
        } => {
            let config_path = match config {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if list {
                if !config_path.exists() {
                    println!("No config file found at {}", config_path.display());
                    println!("Run 'lifesync-server init' to create one.");
                    return Ok(());
                }

                let cfg = Config::load_from(&config_path)?;
                if cfg.tokens.is_empty() {
                    println!("No tokens configured.");
                    println!(
                        "Generate one with: lifesync-server token --user <user-id> --name <device-name>"
                    );
                } else {
                    println!("Configured tokens:");
                    println!();
                    for token in &cfg.tokens {
                        let hash_preview: String = token.token_hash.chars().take(20).collect();
                        println!("  {} ({}) - {}...", token.name, token.user_id, hash_preview);
                    }
                }
                return Ok(());
            }

            if let Some(token_name) = revoke {
                if !config_path.exists() {
                    println!("No config file found at {}", config_path.display());
                    return Ok(());
                }

                let mut cfg = Config::load_from(&config_path)?;
                let original_len = cfg.tokens.len();
                cfg.tokens.retain(|t| t.name != token_name);

                if cfg.tokens.len() == original_len {
                    println!("Token '{}' not found.", token_name);
                } else {
                    cfg.save_to(&config_path)?;
                    println!("Revoked token '{}'.", token_name);
                }
                return Ok(());
            }

            let Some(user_id) = user.filter(|u| !u.trim().is_empty()) else {
                bail!("--user is required when generating a token");
            };

            let token = generate_token();
            let label = name.unwrap_or_else(|| "default".to_string());
            let token_hash = config::hash_token(&token)?;

            if config_path.exists() {
                let mut cfg = Config::load_from(&config_path)?;

                if cfg.tokens.iter().any(|t| t.name == label) {
                    println!(
                        "Token '{}' already exists. Use --revoke first to replace it.",
                        label
                    );
                    return Ok(());
                }

                cfg.tokens.push(config::TokenConfig {
                    name: label.clone(),
                    user_id: user_id.clone(),
                    token_hash,
                });
                cfg.save_to(&config_path)?;

                println!("Generated API token '{}' for user '{}'\n", label, user_id);
                println!("Token: {}\n", token);
                println!("Send it as: Authorization: Bearer {}", token);
            } else {
                println!("Generated API token '{}' for user '{}':\n", label, user_id);
                println!("Token: {}\n", token);
                println!("Add this to your server's config.toml:\n");
                println!("  [[tokens]]");
                println!("  name = \"{}\"", label);
                println!("  user_id = \"{}\"", user_id);
                println!("  token_hash = \"{}\"\n", token_hash);
            }
            println!("Save this token now - it cannot be retrieved later!");

            Ok(())
        }

        Commands::Init { output } => {
            let path = output.unwrap_or_else(|| PathBuf::from("config.toml"));
            let cfg = Config::default();
            cfg.save_to(&path)?;

            println!("Created config file: {}", path.display());
            println!();
            println!("Next steps:");
            println!("  1. Generate a token: lifesync-server token --user <user-id> --name my-device");
            println!(
                "  2. Start the server: lifesync-server serve --config {}",
                path.display()
            );

            Ok(())
        }
    }
}

async fn run_server(config: Config) -> Result<()> {
    let db = db::Database::open(&config.database.path).context("Failed to open database")?;

    let generator: Arc<dyn TextGenerator> = if config.llm.enabled {
        Arc::new(OllamaGenerator::from_config(&config.llm))
    } else {
        Arc::new(DisabledGenerator)
    };
    tracing::info!(
        generator = generator.name(),
        model = %config.llm.model,
        "Text generation configured"
    );

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let state = api::AppState::new(db, config, generator);
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(%addr, "lifesync-server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

fn generate_token() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let bytes: [u8; 32] = rng.random();

    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

    let token_body: String = bytes
        .iter()
        .map(|b| ALPHABET[(*b as usize) % ALPHABET.len()] as char)
        .collect();

    format!("ls_{}", token_body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_are_prefixed_and_unique() {
        let a = generate_token();
        let b = generate_token();
        assert!(a.starts_with("ls_"));
        assert_eq!(a.len(), 3 + 32);
        assert_ne!(a, b);
    }

    #[test]
    fn generated_token_round_trips_through_config() {
        let token = generate_token();
        let mut cfg = Config::default();
        cfg.tokens.push(config::TokenConfig {
            name: "laptop".to_string(),
            user_id: "alice".to_string(),
            token_hash: config::hash_token(&token).unwrap(),
        });
        assert_eq!(cfg.resolve_token(&token), Some("alice"));
        assert_eq!(cfg.resolve_token("ls_other"), None);
    }
}
