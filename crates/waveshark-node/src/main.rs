//! WaveShark Internet Gateway - operator binary
//!
//! This binary attaches to a WaveShark Communicator and relays messages
//! between its radio area and an encrypted MQTT topic:
//! - Discovers Communicators on USB serial bridges
//! - Publishes `<name> SEND <message>` commands from the radio
//! - Writes messages from other gateways to the radio
//! - Announces itself on the radio periodically

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use waveshark_gateway::{
    listen_only, DeviceHandshake, GatewayConfig, GatewayConfigBuilder, GatewayError,
    MessageCodec, MqttChannel, OperationMode, PortProvider, RelayEngine, SerialPortProvider,
};

#[derive(Parser, Debug)]
#[command(name = "ws-internet-gateway")]
#[command(about = "Bridge a WaveShark Communicator to an encrypted Internet topic")]
#[command(version)]
struct Args {
    /// Messaging topic, example: mFiFocNe
    #[arg(required_unless_present_any = ["list_ports", "config"])]
    topic: Option<String>,

    /// Message encryption key (16 characters), example: TmAAYuFzCkuPxBXu
    #[arg(required_unless_present_any = ["list_ports", "config"])]
    key: Option<String>,

    /// Message encryption IV (16 characters), example: GTGbbsTfViwIoOEI
    #[arg(required_unless_present_any = ["list_ports", "config"])]
    iv: Option<String>,

    /// Append log output to this file
    #[arg(long, short)]
    logfile: Option<PathBuf>,

    /// WaveShark Communicator port
    #[arg(long, short)]
    port: Option<String>,

    /// Announcement interval in seconds, 0 disables announcements (default: 600)
    #[arg(long, short)]
    announce: Option<u64>,

    /// Republish every radio message, not only SEND commands
    #[arg(long)]
    repeat_all: bool,

    /// Only decrypt and log Internet messages, no Communicator
    #[arg(long)]
    listen_only: bool,

    /// Message broker host
    #[arg(long)]
    broker_host: Option<String>,

    /// Message broker port
    #[arg(long)]
    broker_port: Option<u16>,

    /// JSON configuration file; command-line values override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// List serial ports and exit
    #[arg(long)]
    list_ports: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.verbose, args.logfile.as_deref())?;

    if args.list_ports {
        return list_ports();
    }

    let config = build_config(&args)?;
    config.validate()?;
    let codec = MessageCodec::from_config(&config.encryption)?;

    match config.relay.mode {
        OperationMode::Bridge => run_bridge(&config, codec).await,
        OperationMode::ListenOnly => run_listen_only(&config, codec).await,
    }
}

/// Install the fmt subscriber, writing to `logfile` when given
fn init_logging(verbose: bool, logfile: Option<&Path>) -> anyhow::Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let installed = match logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            builder
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .try_init()
        }
        None => builder.try_init(),
    };
    installed.map_err(|e| anyhow::anyhow!("cannot install logger: {}", e))
}

/// Merge the configuration file (if any) with command-line values
fn build_config(args: &Args) -> anyhow::Result<GatewayConfig> {
    let base = match &args.config {
        Some(path) => GatewayConfig::from_json_file(path)
            .with_context(|| format!("cannot load configuration {}", path.display()))?,
        None => GatewayConfig::default(),
    };

    let mut builder = GatewayConfigBuilder::from_config(base.clone());

    if let Some(topic) = &args.topic {
        builder = builder.topic(topic.clone());
    }
    if let (Some(key), Some(iv)) = (&args.key, &args.iv) {
        builder = builder.encryption(key.clone(), iv.clone());
    }
    if let Some(port) = &args.port {
        builder = builder.serial_port(port.clone());
    }
    if let Some(secs) = args.announce {
        builder = builder.announce_interval_secs(secs);
    }
    if args.repeat_all {
        builder = builder.repeat_all(true);
    }
    if args.listen_only {
        builder = builder.mode(OperationMode::ListenOnly);
    }
    if args.broker_host.is_some() || args.broker_port.is_some() {
        builder = builder.broker(
            args.broker_host.clone().unwrap_or(base.broker.host.clone()),
            args.broker_port.unwrap_or(base.broker.port),
        );
    }

    Ok(builder.build())
}

fn list_ports() -> anyhow::Result<()> {
    let config = GatewayConfig::default();
    let ports = SerialPortProvider::new().available_ports()?;

    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let marker = if port.description.contains(&config.serial.descriptor_match) {
            "  [possible WaveShark Communicator]"
        } else {
            ""
        };
        println!("{}  {}{}", port.name, port.description, marker);
    }
    Ok(())
}

async fn run_bridge(config: &GatewayConfig, codec: MessageCodec) -> anyhow::Result<()> {
    info!("WaveShark Internet Gateway starting");

    let provider = SerialPortProvider::from_config(&config.serial);
    let handshake = DeviceHandshake::from_config(provider, config);
    let mut engine = RelayEngine::establish(&handshake, config, codec, || async {
        let channel = MqttChannel::connect(&config.broker).await?;
        info!("Connected to TCP/IP message service");
        Ok::<_, GatewayError>(Arc::new(channel))
    })
    .await?;

    tokio::select! {
        _ = engine.run() => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!(error = %e, "Failed to listen for Ctrl-C");
            }
            info!("Shutting down");
        }
    }

    let stats = engine.stats();
    info!(
        frames = stats.radio_frames,
        published = stats.messages_published,
        delivered = stats.network_delivered,
        echoes = stats.echoes_suppressed,
        errors = stats.iteration_errors,
        "Gateway stopped"
    );
    Ok(())
}

async fn run_listen_only(config: &GatewayConfig, codec: MessageCodec) -> anyhow::Result<()> {
    info!("WaveShark Internet Gateway starting in listen-only mode");

    let channel = MqttChannel::connect(&config.broker).await?;
    listen_only(&channel, codec, &config.qualified_topic()).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "TmAAYuFzCkuPxBXu";
    const IV: &str = "GTGbbsTfViwIoOEI";

    fn parse(extra: &[&str]) -> Args {
        let mut argv = vec!["ws-internet-gateway", "mFiFocNe", KEY, IV];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_positional_arguments() {
        let config = build_config(&parse(&[])).unwrap();

        assert_eq!(config.qualified_topic(), "my/mFiFocNe");
        assert_eq!(config.encryption.key, KEY);
        assert_eq!(config.relay.announce_interval_secs, 600);
        assert_eq!(config.relay.mode, OperationMode::Bridge);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_options_override_defaults() {
        let args = parse(&[
            "-p",
            "COM4",
            "-a",
            "0",
            "--repeat-all",
            "--listen-only",
            "--broker-host",
            "broker.example.org",
        ]);
        let config = build_config(&args).unwrap();

        assert_eq!(config.serial.port.as_deref(), Some("COM4"));
        assert_eq!(config.relay.announce_interval_secs, 0);
        assert!(config.relay.repeat_all);
        assert_eq!(config.relay.mode, OperationMode::ListenOnly);
        assert_eq!(config.broker.host, "broker.example.org");
        assert_eq!(config.broker.port, 1883);
    }

    #[test]
    fn test_topic_required() {
        assert!(Args::try_parse_from(["ws-internet-gateway"]).is_err());
        assert!(Args::try_parse_from(["ws-internet-gateway", "--list-ports"]).is_ok());
    }

    #[test]
    fn test_short_key_rejected() {
        let args = Args::try_parse_from(["ws-internet-gateway", "topic", "short", IV]).unwrap();
        let config = build_config(&args).unwrap();
        assert!(config.validate().is_err());
    }
}
