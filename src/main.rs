//! CLI entry point for the IPMSG engine.
//!
//! This binary provides a command-line interface for the engine library,
//! supporting key generation, configuration management, passphrase hashing,
//! and running the messenger on the LAN.

use anyhow::Result;
use clap::{Parser, Subcommand};
use ipmsg_engine::{
    app::{load_key_ring, ConsoleObserver, JsonObserver},
    crypto::{asymmetric::public_key_to_hex, PassphraseHash},
    engine::EngineObserver,
    utils::{IpmsgConfig, DEFAULT_CONFIG_FILE},
    App,
};
use log::{error, info};
use sha2::{Digest, Sha256};
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

/// Passphrase source for non-interactive runs
const PASSPHRASE_ENV: &str = "IPMSG_PASSPHRASE";

/// IPMSG engine - serverless LAN messaging with optional encryption
#[derive(Parser)]
#[command(name = "ipmsg")]
#[command(about = "An IP Messenger compatible LAN messenger")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(author = env!("CARGO_PKG_AUTHORS"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-error output)
    #[arg(short, long)]
    quiet: bool,

    /// Data directory for keys and the lock file
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the messenger
    Run {
        /// UDP port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Display name
        #[arg(short, long)]
        nickname: Option<String>,
        /// Disable encryption
        #[arg(long)]
        no_crypto: bool,
        /// Read commands from stdin
        #[arg(short, long)]
        interactive: bool,
        /// Print events as JSON lines instead of text
        #[arg(long)]
        json: bool,
    },
    /// Generate and inspect RSA keys
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Generate and validate configuration files
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Passphrase protection for private keys
    Passphrase {
        #[command(subcommand)]
        action: PassphraseCommands,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Create any missing key slots
    Generate,
    /// Show the public keys and their fingerprints
    Show {
        /// Output format (fingerprint, hex)
        #[arg(short, long, default_value = "fingerprint")]
        format: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Generate a default configuration file
    Generate {
        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        file: Option<PathBuf>,
    },
    /// Show current configuration
    Show {
        /// Print as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum PassphraseCommands {
    /// Print a `$10$` hash for `crypto.passphrase_hash`
    Hash,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = IpmsgConfig::load(cli.config.as_deref())?;

    // Initialize logging
    setup_logging(cli.verbose, cli.quiet, &config.logging.level);

    // Override data directory if provided
    if let Some(data_dir) = cli.data_dir {
        config.storage.keys_dir = data_dir.join("keys");
        config.storage.lock_file = data_dir.join("ipmsg.lock");
        config.storage.data_dir = data_dir;
    }

    match cli.command {
        Commands::Run {
            port,
            nickname,
            no_crypto,
            interactive,
            json,
        } => {
            let overrides = RunOverrides {
                port,
                nickname,
                no_crypto,
            };
            handle_run_command(overrides, interactive, json, config).await
        }
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Passphrase { action } => handle_passphrase_commands(action),
    }
}

fn setup_logging(verbose: u8, quiet: bool, configured: &str) {
    let log_level = if quiet {
        "error"
    } else {
        match verbose {
            0 => configured,
            1 => "debug",
            _ => "trace",
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp_secs()
        .init();
}

/// Command-line overrides for `run`
struct RunOverrides {
    port: Option<u16>,
    nickname: Option<String>,
    no_crypto: bool,
}

async fn handle_run_command(
    overrides: RunOverrides,
    interactive: bool,
    json: bool,
    mut config: IpmsgConfig,
) -> Result<()> {
    // Override config with command line options
    if let Some(port) = overrides.port {
        config.network.port = port;
    }
    if let Some(nickname) = overrides.nickname {
        config.identity.nickname = nickname;
    }
    if overrides.no_crypto {
        config.crypto.enabled = false;
    }
    config.validate()?;

    info!("Port: {}", config.network.port);
    info!("Broadcast: {:?}", config.network.broadcast_addresses);

    let passphrase = if config.crypto.enabled {
        read_passphrase(&config)?
    } else {
        None
    };

    let observer: Arc<dyn EngineObserver> = if json {
        Arc::new(JsonObserver)
    } else {
        Arc::new(ConsoleObserver)
    };
    let app = match App::with_observer(config, passphrase, observer).await {
        Ok(app) => app,
        Err(e) => {
            if e.is_fatal_at_startup() {
                error!("Cannot load keys: {e}");
            }
            return Err(e.into());
        }
    };
    app.run_with_console(interactive).await?;
    Ok(())
}

fn handle_key_commands(action: KeyCommands, config: &IpmsgConfig) -> Result<()> {
    config.ensure_directories()?;
    let passphrase = read_passphrase(config)?;
    let ring = load_key_ring(config, passphrase.as_deref())?;

    match action {
        KeyCommands::Generate => {
            println!("✓ Keys ready in {}", config.storage.keys_dir.display());
            for size in ring.sizes() {
                println!("  {size}");
            }
        }
        KeyCommands::Show { format } => {
            for size in ring.sizes() {
                let Some(key) = ring.key(size) else { continue };
                let (e, n) = public_key_to_hex(&key.to_public_key());
                match format.as_str() {
                    "fingerprint" => {
                        let digest = Sha256::digest(format!("{e}-{n}").as_bytes());
                        println!("{size}: SHA256:{}", hex::encode(digest));
                    }
                    "hex" => println!("{size}: {e}-{n}"),
                    _ => return Err(anyhow::anyhow!("Unsupported format: {}", format)),
                }
            }
        }
    }
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &IpmsgConfig) -> Result<()> {
    match action {
        ConfigCommands::Generate { output } => {
            let default_config = IpmsgConfig::default();
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

            default_config.save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                IpmsgConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(config)?);
            } else {
                println!("{}", config.to_toml_string()?);
            }
        }
    }
    Ok(())
}

fn handle_passphrase_commands(action: PassphraseCommands) -> Result<()> {
    match action {
        PassphraseCommands::Hash => {
            let first = prompt("New passphrase: ")?;
            let second = prompt("Repeat passphrase: ")?;
            if first != second {
                return Err(anyhow::anyhow!("Passphrases do not match"));
            }
            println!("{}", PassphraseHash::new(&first));
        }
    }
    Ok(())
}

/// Passphrase from the environment, or a prompt when a hash is configured
fn read_passphrase(config: &IpmsgConfig) -> Result<Option<String>> {
    if let Ok(passphrase) = std::env::var(PASSPHRASE_ENV) {
        return Ok(Some(passphrase));
    }
    if config.crypto.passphrase_hash.is_none() {
        return Ok(None);
    }
    prompt("Key passphrase: ").map(Some)
}

fn prompt(label: &str) -> Result<String> {
    print!("{label}");
    std::io::stdout().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}
