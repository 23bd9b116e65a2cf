//! miknet - Peer-to-peer packet transport
//!
//! Command line front end: run a listening node, or connect to one and send
//! messages.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use miknet::config::{self, Config};
use miknet::network::IpVersion;
use miknet::protocol::{self, Packet, PacketType, HEADER_SIZE, META_SIZE};
use miknet::Node;

/// miknet - Peer-to-peer packet transport
#[derive(Parser)]
#[command(name = "miknet")]
#[command(author = "Miknet Contributors")]
#[command(version = "0.1.0")]
#[command(about = "Send fragmented packets between peers over TCP", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a node and print every event
    Listen {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Listen on IPv6
        #[arg(long)]
        ipv6: bool,

        /// Send every DATA packet back to its peer
        #[arg(long)]
        echo: bool,
    },

    /// Connect to a node and send a message
    Send {
        /// Host to connect to
        #[arg(long)]
        host: String,

        /// Remote port
        #[arg(short, long, default_value_t = protocol::DEFAULT_PORT)]
        port: u16,

        /// Channel to send on
        #[arg(long, default_value_t = 0)]
        channel: u32,

        /// How many times to send the message
        #[arg(long, default_value_t = 1)]
        count: u32,

        /// Seconds without events before giving up
        #[arg(long, default_value_t = 2)]
        idle: u64,

        /// Message text
        message: String,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Listen { port, ipv6, echo } => {
            run_listener(config, port, ipv6, echo)?;
        }
        Commands::Send {
            host,
            port,
            channel,
            count,
            idle,
            message,
        } => {
            run_sender(config, &host, port, channel, count, Duration::from_secs(idle), &message)?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_protocol_info(&config);
        }
    }

    Ok(())
}

/// Run a listening node until the process is killed
fn run_listener(config: Config, port: Option<u16>, ipv6: bool, echo: bool) -> anyhow::Result<()> {
    let mut node_config = config.node;
    if let Some(port) = port {
        node_config.port = port;
    }
    if ipv6 {
        node_config.ip = IpVersion::V6;
    }

    let mut node = Node::create(node_config)?;

    println!("\n========================================");
    println!("  miknet node '{}'", config.general.name);
    println!("========================================");
    println!("  Listening: {}", node.local_addr());
    println!("  Peer slots: {}", node.config().max_peers);
    println!("========================================");
    println!("\nWaiting for peers...\n");

    loop {
        let Some(packet) = node.next_event()? else {
            continue;
        };
        print_packet(&node, &packet);

        if echo && packet.kind == PacketType::Data {
            if let Err(e) = node.send(packet.peer, &packet.payload, packet.channel) {
                tracing::warn!("Echo to {} failed: {}", packet.peer, e);
            }
        }
    }
}

/// Connect, wait for the handshake, send, then print events until idle
fn run_sender(
    config: Config,
    host: &str,
    port: u16,
    channel: u32,
    count: u32,
    idle: Duration,
    message: &str,
) -> anyhow::Result<()> {
    let mut node_config = config.node;
    node_config.port = 0;
    let mut node = Node::create(node_config)?;

    println!("Connecting to {}:{}...", host, port);
    let peer = node.connect((host, port))?;

    let mut last_event = Instant::now();
    let mut sent = false;
    while last_event.elapsed() < idle {
        let Some(packet) = node.next_event()? else {
            continue;
        };
        last_event = Instant::now();
        print_packet(&node, &packet);

        match packet.kind {
            PacketType::Join if packet.peer == peer && !sent => {
                for _ in 0..count {
                    node.send(peer, message.as_bytes(), channel)?;
                }
                sent = true;
                println!("Sent {} message(s) on channel {}", count, channel);
            }
            PacketType::Quit if packet.peer == peer => return Ok(()),
            _ => {}
        }
    }

    if !sent {
        anyhow::bail!("No handshake from {}:{} within {:?}", host, port, idle);
    }
    node.close_peer(peer)?;
    Ok(())
}

fn print_packet(node: &Node, packet: &Packet) {
    let addr = node
        .peer(packet.peer)
        .and_then(|peer| peer.addr())
        .map(|addr| addr.to_string())
        .unwrap_or_else(|| "?".to_string());

    match packet.kind {
        PacketType::Join => println!("+ {} joined ({})", packet.peer, addr),
        PacketType::Quit => println!("- {} left ({})", packet.peer, addr),
        PacketType::Data | PacketType::Error => println!(
            "{} {} channel {} ({} bytes): {}",
            packet.kind,
            packet.peer,
            packet.channel,
            packet.len(),
            String::from_utf8_lossy(&packet.payload)
        ),
    }
}

/// Print protocol information
fn print_protocol_info(config: &Config) {
    println!("miknet Protocol Information");
    println!("===========================\n");

    println!("Frame header: {} bytes", HEADER_SIZE);
    println!("Message metadata: {} bytes", META_SIZE);
    println!("Fragment capacity: {} bytes", config.node.fragment_capacity);
    println!("Max message size: {} bytes", config.node.max_message_size);
    println!("Default port: {}", protocol::DEFAULT_PORT);
    println!("Packet types: JOIN=0 QUIT=1 DATA=2 ERROR=255");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["miknet", "info"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from([
            "miknet", "send", "--host", "127.0.0.1", "--count", "3", "hello",
        ])
        .unwrap();
        match cli.command {
            Commands::Send { count, port, message, .. } => {
                assert_eq!(count, 3);
                assert_eq!(port, protocol::DEFAULT_PORT);
                assert_eq!(message, "hello");
            }
            _ => panic!("expected send"),
        }
    }

    #[test]
    fn test_send_requires_host() {
        assert!(Cli::try_parse_from(["miknet", "send", "hello"]).is_err());
    }
}
