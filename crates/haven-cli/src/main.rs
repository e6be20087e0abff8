//! Haven CLI
//!
//! Thin wrapper around haven-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show node information
//! haven info
//!
//! # Show your identity
//! haven identity show
//!
//! # Export your public key bundle for other members
//! haven identity export --output alice.keys
//!
//! # Register a channel with known member bundles
//! haven channel create garden-crew --member alice.keys --member bob.keys
//!
//! # Send a message (published immediately)
//! haven send garden-crew "Planted the tomatoes"
//!
//! # Read a channel's history
//! haven history garden-crew
//!
//! # React, edit, delete
//! haven react garden-crew <message_id> 👍
//! haven edit garden-crew <message_id> "Planted the basil"
//! haven delete garden-crew <message_id> --for-everyone
//!
//! # Create an invite for a channel
//! haven invite create garden-crew --name "Garden Crew"
//!
//! # Accept an invite
//! haven invite accept <ticket> --inviter alice.keys
//!
//! # Drop expired messages from every known channel
//! haven sweep
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use haven_core::{
    ChannelId, ChannelMessage, MessageContent, MessageId, MessageKind, Messenger, MessengerConfig,
    PublicKeys, RedbLogStore,
};

/// Haven - encrypted channel messaging
#[derive(Parser)]
#[command(name = "haven")]
#[command(version = "0.1.0")]
#[command(about = "Haven - encrypted channel messaging")]
#[command(
    long_about = "End-to-end encrypted channel messaging over an untrusted append-only log store, using hybrid classical and post-quantum cryptography."
)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.haven/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Identity management
    Identity {
        #[command(subcommand)]
        action: IdentityAction,
    },

    /// Channel management
    Channel {
        #[command(subcommand)]
        action: ChannelAction,
    },

    /// Send a message to a channel
    Send {
        /// Channel reference
        channel: String,
        /// Message content
        content: String,
        /// Message ID this replies to (hex)
        #[arg(short, long)]
        reply_to: Option<String>,
        /// Thread root this belongs to (hex)
        #[arg(short, long)]
        thread: Option<String>,
    },

    /// Show a channel's message history
    History {
        /// Channel reference
        channel: String,
        /// Show only one thread (hex root ID)
        #[arg(short, long)]
        thread: Option<String>,
        /// Number of messages to show (default: all)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Edit one of your own messages
    Edit {
        /// Channel reference
        channel: String,
        /// Message ID (hex)
        message_id: String,
        /// Replacement content
        content: String,
    },

    /// Delete one of your own messages
    Delete {
        /// Channel reference
        channel: String,
        /// Message ID (hex)
        message_id: String,
        /// Also strip the encrypted body from the published log
        #[arg(long)]
        for_everyone: bool,
    },

    /// React to a message
    React {
        /// Channel reference
        channel: String,
        /// Message ID (hex)
        message_id: String,
        /// Reaction symbol (emoji or short text)
        symbol: String,
    },

    /// Publish any locally buffered messages for a channel
    Flush {
        /// Channel reference
        channel: String,
    },

    /// Drop expired messages from every channel in the store
    Sweep,

    /// Invite management
    Invite {
        #[command(subcommand)]
        action: InviteAction,
    },
}

#[derive(Subcommand)]
enum IdentityAction {
    /// Show identity info (user ID and key fingerprint)
    Show,
    /// Export your public key bundle (hex)
    Export {
        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Generate new identity (WARNING: replaces existing)
    Regenerate {
        /// Confirm regeneration (required)
        #[arg(long)]
        force: bool,
    },
}

#[derive(Subcommand)]
enum ChannelAction {
    /// Register a channel with its member key bundles
    Create {
        /// Channel reference
        channel: String,
        /// Member bundle files (from `haven identity export`)
        #[arg(short, long)]
        member: Vec<PathBuf>,
    },
    /// List registered channels
    List,
    /// Show channel details
    Show {
        /// Channel reference
        channel: String,
    },
}

#[derive(Subcommand)]
enum InviteAction {
    /// Create a signed invite ticket for a channel
    Create {
        /// Channel reference
        channel: String,
        /// Human-readable channel name to embed
        #[arg(short, long)]
        name: Option<String>,
    },
    /// Accept an invite ticket
    Accept {
        /// Invite ticket (haven-invite:...)
        ticket: String,
        /// The inviter's public key bundle file
        #[arg(short, long)]
        inviter: PathBuf,
        /// Additional member bundle files
        #[arg(short, long)]
        member: Vec<PathBuf>,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();
}

/// Get the default data directory (~/.haven/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".haven")
        .join("data")
}

/// Parse a message ID from hex string
fn parse_message_id(s: &str) -> Result<MessageId> {
    MessageId::from_hex(s).map_err(|e| anyhow::anyhow!("Invalid message ID '{}': {}", s, e))
}

/// Read a hex-encoded public key bundle from a file
fn read_bundle(path: &PathBuf) -> Result<PublicKeys> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Cannot read bundle file '{}': {}", path.display(), e))?;
    let bytes = hex::decode(text.trim())
        .map_err(|e| anyhow::anyhow!("Invalid hex in '{}': {}", path.display(), e))?;
    PublicKeys::from_bytes(&bytes)
        .map_err(|e| anyhow::anyhow!("Invalid key bundle in '{}': {}", path.display(), e))
}

fn read_bundles(paths: &[PathBuf]) -> Result<Vec<PublicKeys>> {
    paths.iter().map(read_bundle).collect()
}

/// Render one message line for `history`
fn print_message(message: &ChannelMessage) {
    let when = chrono::DateTime::from_timestamp_millis(message.timestamp)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| message.timestamp.to_string());

    let body = match &message.content {
        MessageContent::Text(text) => text.clone(),
        MessageContent::Removed => "(removed)".to_string(),
        MessageContent::Undecryptable => "(cannot decrypt)".to_string(),
        MessageContent::Unverified => "(signature unverified)".to_string(),
    };

    let mut markers = String::new();
    if message.edited {
        markers.push_str(" (edited)");
    }
    if message.is_reply() {
        markers.push_str(" (reply)");
    }
    if message.deleted {
        markers.push_str(" (deleted)");
    }

    println!(
        "  [{}] {} {}: {}{}",
        when,
        message.id,
        message.display_sender(),
        body,
        markers
    );

    if !message.reactions.is_empty() {
        let summary: Vec<String> = message
            .reactions
            .iter()
            .map(|(symbol, actors)| format!("{} {}", symbol, actors.len()))
            .collect();
        println!("      reactions: {}", summary.join("  "));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    std::fs::create_dir_all(&data_dir)?;

    let store = Arc::new(RedbLogStore::open(data_dir.join("store.redb"))?);
    let messenger = Messenger::new(&data_dir, store, MessengerConfig::default())?;

    // Initialize identity on startup so the user ID is always available
    messenger.init_identity()?;

    match cli.command {
        Commands::Info => {
            println!("Haven v0.1.0");
            println!();
            println!("Identity:");
            if let Some(user_id) = messenger.user_id() {
                println!("  User ID: {}", user_id);
            } else {
                println!("  User ID: (not initialized)");
            }
            println!();
            println!("Data directory: {}", messenger.data_dir().display());
            println!("Channels: {}", messenger.list_channels()?.len());
        }

        Commands::Identity { action } => match action {
            IdentityAction::Show => {
                if let Some(user_id) = messenger.user_id() {
                    let bundle = messenger
                        .public_keys()
                        .expect("public keys exist when user_id does");
                    let bytes = bundle.to_bytes();
                    // First 8 bytes of the Ed25519 key as a fingerprint
                    let fingerprint = hex::encode(&bundle.signing().ed25519_bytes()[..8]);

                    println!("Identity:");
                    println!("  User ID: {}", user_id);
                    println!("  Ed25519 fingerprint: {}", fingerprint);
                    println!("  Public bundle size: {} bytes", bytes.len());
                } else {
                    println!("Identity not initialized.");
                }
            }

            IdentityAction::Export { output } => {
                let bundle = messenger
                    .public_keys()
                    .ok_or_else(|| anyhow::anyhow!("Identity not initialized"))?;
                let encoded = hex::encode(bundle.to_bytes());

                match output {
                    Some(path) => {
                        std::fs::write(&path, &encoded)?;
                        println!("Public key bundle written to {}", path.display());
                    }
                    None => println!("{}", encoded),
                }
            }

            IdentityAction::Regenerate { force } => {
                if !force {
                    println!("WARNING: Regenerating identity is IRREVERSIBLE!");
                    println!();
                    println!("This will:");
                    println!("  - Generate a new hybrid keypair");
                    println!("  - Replace your existing identity");
                    println!("  - Make every message sealed for the old keys unreadable");
                    println!();
                    println!("To confirm, run: haven identity regenerate --force");
                } else {
                    messenger.regenerate_identity()?;
                    let user_id = messenger
                        .user_id()
                        .expect("user ID should exist after regeneration");
                    println!("Identity regenerated.");
                    println!("  New user ID: {}", user_id);
                }
            }
        },

        Commands::Channel { action } => match action {
            ChannelAction::Create { channel, member } => {
                let id = ChannelId::new(channel);
                let members = read_bundles(&member)?;
                messenger.register_channel(&id, members)?;

                let count = messenger
                    .channel_members(&id)?
                    .map(|m| m.len())
                    .unwrap_or(0);
                println!("Registered channel: {}", id);
                println!("  Members: {}", count);
            }

            ChannelAction::List => {
                let channels = messenger.list_channels()?;
                if channels.is_empty() {
                    println!("No channels registered.");
                } else {
                    println!("Channels ({}):", channels.len());
                    println!();
                    for channel in channels {
                        println!("  {}", channel);
                    }
                }
            }

            ChannelAction::Show { channel } => {
                let id = ChannelId::new(channel);
                match messenger.channel_members(&id)? {
                    Some(members) => {
                        let messages = messenger.channel_messages(&id).await?;
                        println!("Channel: {}", id);
                        println!("  Members: {}", members.len());
                        for member in &members {
                            println!("    - {}", member.user_id());
                        }
                        println!("  Messages: {}", messages.len());
                    }
                    None => {
                        anyhow::bail!("Channel not registered: {}", id);
                    }
                }
            }
        },

        Commands::Send {
            channel,
            content,
            reply_to,
            thread,
        } => {
            let id = ChannelId::new(channel);
            let reply_to = reply_to.as_deref().map(parse_message_id).transpose()?;
            let thread = thread.as_deref().map(parse_message_id).transpose()?;

            // create_thread drops reply_to, so threaded sends go through
            // send_message with both ids.
            let (kind, thread_id) = match thread {
                Some(parent) => (MessageKind::ThreadReply, Some(parent)),
                None => (MessageKind::Text, None),
            };
            let message_id = messenger
                .send_message(&id, &content, kind, reply_to, thread_id)
                .await?;

            // One-shot process: publish now rather than wait for the timer.
            let published = messenger.flush(&id).await?;

            println!("Sent message to {}", id);
            println!("  ID: {}", message_id);
            println!("  Published: {} message(s)", published);
        }

        Commands::History {
            channel,
            thread,
            limit,
        } => {
            let id = ChannelId::new(channel);
            let messages = match thread {
                Some(root) => {
                    let root = parse_message_id(&root)?;
                    messenger.thread_messages(&id, root).await?
                }
                None => messenger.channel_messages(&id).await?,
            };

            if messages.is_empty() {
                println!("No messages in this channel.");
            } else {
                let start = limit.map_or(0, |n| messages.len().saturating_sub(n));
                println!("Messages ({}):", messages.len());
                println!();
                for message in &messages[start..] {
                    print_message(message);
                }
            }
        }

        Commands::Edit {
            channel,
            message_id,
            content,
        } => {
            let id = ChannelId::new(channel);
            let message_id = parse_message_id(&message_id)?;

            if messenger.edit_message(&id, &message_id, &content).await? {
                println!("Edited message {}", message_id);
            } else {
                anyhow::bail!("Message not edited: not found, deleted, or not yours");
            }
        }

        Commands::Delete {
            channel,
            message_id,
            for_everyone,
        } => {
            let id = ChannelId::new(channel);
            let message_id = parse_message_id(&message_id)?;

            if messenger.delete_message(&id, &message_id, for_everyone).await? {
                let scope = if for_everyone { "for everyone" } else { "locally" };
                println!("Deleted message {} {}", message_id, scope);
            } else {
                anyhow::bail!("Message not deleted: not found, already deleted, or not yours");
            }
        }

        Commands::React {
            channel,
            message_id,
            symbol,
        } => {
            let id = ChannelId::new(channel);
            let message_id = parse_message_id(&message_id)?;

            if messenger.react_to_message(&id, &message_id, &symbol).await? {
                println!("Reacted to {} with {}", message_id, symbol);
            } else {
                println!("Already reacted to {} with {}", message_id, symbol);
            }
        }

        Commands::Flush { channel } => {
            let id = ChannelId::new(channel);
            let published = messenger.flush(&id).await?;
            println!("Published {} message(s) to {}", published, id);
        }

        Commands::Sweep => {
            let stats = messenger.sweep_now().await?;
            println!("Sweep complete.");
            println!("  Channels inspected: {}", stats.channels);
            println!("  Channels rewritten: {}", stats.swept);
            println!("  Messages expired: {}", stats.expired);
            println!("  Failures: {}", stats.failures);
        }

        Commands::Invite { action } => match action {
            InviteAction::Create { channel, name } => {
                let id = ChannelId::new(channel);
                let ticket = messenger.create_invite(&id, name.as_deref())?;

                println!("Invite created:");
                println!();
                println!("{}", ticket);
                println!();
                println!("Share this ticket to invite others to your channel.");
                println!("Valid for: 7 days");
            }

            InviteAction::Accept {
                ticket,
                inviter,
                member,
            } => {
                let inviter = read_bundle(&inviter)?;
                let members = read_bundles(&member)?;

                let invite = messenger.accept_invite(&ticket, &inviter, members)?;
                match &invite.channel_name {
                    Some(name) => println!("Joined channel: {}", name),
                    None => println!("Joined channel: {}", invite.channel),
                }
                println!("  Reference: {}", invite.channel);
                println!("  Invited by: {}", invite.inviter);
            }
        },
    }

    Ok(())
}
