//! CLI entry point for the secure-session core.
//!
//! This binary manages local keys, profiles, prekey bundles and
//! configuration, and runs a local two-party demo conversation over
//! file-backed ratchet stores.

use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine};
use clap::{Parser, Subcommand};
use log::{info, warn};
use p2p_secure_session::{
    crypto::{ChatKeyPair, IdentityKeyPair, KeyManager, KeyMaterialProvider, PreKeyStore, Profile},
    session::{FileKeyStore, RatchetCodec, SecureSession},
    utils::{logging, SessionConfig, DEFAULT_CONFIG_FILE},
    Message,
};
use rand::seq::SliceRandom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const IDENTITY_KEY_FILE: &str = "identity.key";
const CHAT_KEY_FILE: &str = "chat.key";

/// Secure-session core: X3DH handshakes and ratcheted, signed messages
#[derive(Parser)]
#[command(name = "session-core")]
#[command(about = "Secure-session core for peer-to-peer messaging")]
#[command(version = env!("CARGO_PKG_VERSION"))]
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

    /// Data directory for keys and ratchet stores
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate and show local keys
    Keys {
        #[command(subcommand)]
        action: KeyCommands,
    },
    /// Sign and print a profile for the local keys
    Profile {
        /// Display name
        #[arg(short, long)]
        name: String,
        /// Location
        #[arg(short, long, default_value = "")]
        location: String,
        /// Image reference
        #[arg(short, long, default_value = "")]
        image: String,
    },
    /// Publish a prekey bundle for the local keys
    Prekeys {
        /// Number of one-time prekeys to generate
        #[arg(short, long)]
        count: Option<usize>,
    },
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigCommands,
    },
    /// Run a local conversation between two parties
    Demo {
        /// Number of ordinary messages to send
        #[arg(short, long, default_value = "3")]
        messages: usize,
        /// Deliver messages in random order
        #[arg(long)]
        shuffle: bool,
    },
}

#[derive(Subcommand)]
enum KeyCommands {
    /// Generate new identity and chat keys
    Generate {
        /// Overwrite existing keys
        #[arg(short, long)]
        force: bool,
    },
    /// Show the local public keys
    Show {
        /// Output format (hex, base64)
        #[arg(short, long, default_value = "hex")]
        format: String,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Write a default configuration file
    Init {
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
    Show,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = SessionConfig::load(cli.config.as_deref())?;
    logging::init(&config.logging, cli.verbose, cli.quiet);

    if let Some(data_dir) = cli.data_dir {
        config.storage.ratchet_store_file = data_dir.join(p2p_secure_session::defaults::DEFAULT_RATCHET_STORE_FILE);
        config.storage.data_dir = data_dir;
    }

    match cli.command {
        Commands::Keys { action } => handle_key_commands(action, &config),
        Commands::Profile {
            name,
            location,
            image,
        } => handle_profile_command(&name, &location, &image, &config),
        Commands::Prekeys { count } => handle_prekeys_command(count, &config),
        Commands::Config { action } => handle_config_commands(action, &config),
        Commands::Demo { messages, shuffle } => handle_demo_command(messages, shuffle, &config),
    }
}

fn handle_key_commands(action: KeyCommands, config: &SessionConfig) -> Result<()> {
    let keys_dir = config.storage.data_dir.join("keys");

    match action {
        KeyCommands::Generate { force } => {
            let identity_path = keys_dir.join(IDENTITY_KEY_FILE);
            if identity_path.exists() && !force {
                return Err(anyhow::anyhow!(
                    "Keys already exist. Use --force to overwrite."
                ));
            }

            config.ensure_directories()?;
            std::fs::create_dir_all(&keys_dir)?;

            let identity = IdentityKeyPair::generate();
            let chat = ChatKeyPair::generate();
            std::fs::write(&identity_path, hex::encode(identity.secret_key_bytes()))?;
            std::fs::write(keys_dir.join(CHAT_KEY_FILE), hex::encode(chat.secret_bytes()))?;

            info!("Generated keys in {}", keys_dir.display());
            println!("✓ Keys generated successfully");
            println!("  Identity: {}", hex::encode(identity.public_key_bytes()));
            println!("  Chat:     {}", hex::encode(chat.public_key()));
        }
        KeyCommands::Show { format } => {
            let manager = load_key_manager(&keys_dir)?;
            let identity = manager.identity_public_key()?;
            let chat = manager.chat_key_pair()?.public_key();

            let encode = |bytes: &[u8]| -> Result<String> {
                match format.as_str() {
                    "hex" => Ok(hex::encode(bytes)),
                    "base64" => Ok(general_purpose::STANDARD.encode(bytes)),
                    _ => Err(anyhow::anyhow!("Unsupported format: {}", format)),
                }
            };
            println!("Identity: {}", encode(&identity)?);
            println!("Chat:     {}", encode(&chat)?);
        }
    }
    Ok(())
}

fn handle_profile_command(name: &str, location: &str, image: &str, config: &SessionConfig) -> Result<()> {
    let manager = load_key_manager(&config.storage.data_dir.join("keys"))?;
    let profile = Profile::sign(name, location, image, &manager)?;
    if !profile.signatures_valid()? {
        return Err(anyhow::anyhow!("Freshly signed profile failed verification"));
    }
    println!("{}", serde_json::to_string_pretty(&profile)?);
    Ok(())
}

fn handle_prekeys_command(count: Option<usize>, config: &SessionConfig) -> Result<()> {
    let manager = load_key_manager(&config.storage.data_dir.join("keys"))?;
    let chat = manager.chat_key_pair()?;

    let mut prekeys = PreKeyStore::with_max_signed_age(config.crypto.signed_prekey_max_age);
    prekeys.generate_signed_pre_key(&chat);
    prekeys.generate_one_time_pre_keys(count.unwrap_or(config.crypto.prekey_count));

    let bundle = prekeys.publish_bundle(&chat)?;
    println!("{}", bundle.to_json()?);
    Ok(())
}

fn handle_config_commands(action: ConfigCommands, config: &SessionConfig) -> Result<()> {
    match action {
        ConfigCommands::Init { output } => {
            let output_path = output.unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
            SessionConfig::default().save(&output_path)?;
            println!("✓ Configuration generated: {}", output_path.display());
        }
        ConfigCommands::Validate { file } => {
            let config_to_validate = if let Some(path) = file {
                SessionConfig::from_file(path)?
            } else {
                config.clone()
            };

            config_to_validate.validate()?;
            println!("✓ Configuration is valid");
        }
        ConfigCommands::Show => {
            println!("{}", config.to_toml_string()?);
        }
    }
    Ok(())
}

fn handle_demo_command(count: usize, shuffle: bool, config: &SessionConfig) -> Result<()> {
    let demo_dir = config.storage.data_dir.join("demo");
    std::fs::create_dir_all(&demo_dir)
        .with_context(|| format!("creating {}", demo_dir.display()))?;

    let alice_keys = Arc::new(KeyManager::generate());
    let bob_keys = Arc::new(KeyManager::generate());
    let alice = SecureSession::from_config(
        Arc::clone(&alice_keys),
        FileKeyStore::open(demo_dir.join("alice.bin"))?,
        &config.crypto,
    );
    let bob = SecureSession::new(
        Arc::clone(&bob_keys),
        FileKeyStore::open(demo_dir.join("bob.bin"))?,
        RatchetCodec::new(config.crypto.max_skip),
    );

    let bob_chat = bob_keys.chat_key_pair()?;
    let mut prekeys = PreKeyStore::with_max_signed_age(config.crypto.signed_prekey_max_age);
    prekeys.generate_signed_pre_key(&bob_chat);
    prekeys.generate_one_time_pre_keys(config.crypto.min_one_time_prekeys.max(1));
    let bundle = prekeys.publish_bundle(&bob_chat)?;

    let (init, alice_secret) = alice.initiate(&bundle)?;
    let init = deliver(&init)?;
    let bob_secret = bob.accept(&init, &mut prekeys)?;
    println!("✓ Handshake complete");

    let mut outbox = Vec::with_capacity(count);
    for i in 1..=count {
        outbox.push((i, alice.send(&alice_secret, format!("message {i}").as_bytes())?));
    }
    if shuffle {
        outbox.shuffle(&mut rand::thread_rng());
    }

    let sender = alice_keys.identity_public_key()?;
    for (i, message) in outbox {
        let message = deliver(&message)?;
        let plaintext = bob.receive(&bob_secret, &message, Some(&sender))?;
        println!(
            "  #{i} key={} counter={} -> {}",
            hex::encode(&message.ratchet.header.dh[..4]),
            message.ratchet.header.message_counter,
            String::from_utf8_lossy(&plaintext)
        );
    }

    let reply = deliver(&bob.send(&bob_secret, b"got them all")?)?;
    let bob_identity = bob_keys.identity_public_key()?;
    let plaintext = alice.receive(&alice_secret, &reply, Some(&bob_identity))?;
    println!("✓ Reply: {}", String::from_utf8_lossy(&plaintext));

    let next = deliver(&alice.send(&alice_secret, b"fresh keys")?)?;
    let plaintext = bob.receive(&bob_secret, &next, Some(&sender))?;
    println!(
        "✓ Ratcheted: key={} previous chain={} -> {}",
        hex::encode(&next.ratchet.header.dh[..4]),
        next.ratchet.header.previous_chain_length,
        String::from_utf8_lossy(&plaintext)
    );

    let leftover = bob.store().message_key_count();
    if leftover > 0 {
        warn!("{} skipped message keys left in store", leftover);
    }
    Ok(())
}

/// Send a message through its JSON wire form
fn deliver(message: &Message) -> Result<Message> {
    let json = message.to_wire_json()?;
    info!("wire: {}", json);
    Ok(Message::from_wire_json(&json)?)
}

fn load_key_manager(keys_dir: &Path) -> Result<KeyManager> {
    let read_hex = |file: &str| -> Result<Vec<u8>> {
        let path = keys_dir.join(file);
        let content = std::fs::read_to_string(&path).with_context(|| {
            format!(
                "reading {} (run `session-core keys generate` first)",
                path.display()
            )
        })?;
        hex::decode(content.trim()).with_context(|| format!("decoding {}", path.display()))
    };

    let identity = IdentityKeyPair::from_secret_bytes(&read_hex(IDENTITY_KEY_FILE)?)?;
    let chat = ChatKeyPair::from_secret_bytes(&read_hex(CHAT_KEY_FILE)?)?;
    Ok(KeyManager::from_keys(identity, chat))
}
