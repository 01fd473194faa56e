//! Command-line interface for the zigbridge Zigbee to MQTT bridge.

mod shutdown;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use zigbridge_core::config::env_vars;
use zigbridge_core::BridgeConfig;
use zigbridge_devices::{Bridge, MqttBus, SimulatedNetwork, TopicRouter};

/// zigbridge - Bridge a Zigbee mesh network to an MQTT broker.
#[derive(Parser, Debug)]
#[command(name = "zigbridge")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Configuration file (defaults to ./zigbridge.toml when present).
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Run the bridge until interrupted.
    Run,
    /// Validate the configuration and print the effective settings.
    CheckConfig,
    /// List the topic filters the bridge subscribes to.
    Topics,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = BridgeConfig::load(args.config.as_deref()).context("Invalid configuration")?;

    match args.command {
        Command::Run => run_bridge(config).await,
        Command::CheckConfig => check_config(&config),
        Command::Topics => {
            list_topics(&config);
            Ok(())
        }
    }
}

fn init_logging(verbose: bool) {
    // JSON format for production/container environments
    let json_logging = std::env::var(env_vars::LOG_JSON)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_directives = if verbose {
        "zigbridge=debug,rumqttc=info"
    } else {
        "zigbridge=info,rumqttc=warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directives));

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact()
            .init();
    }
}

/// Run the bridge until a signal arrives or a fatal error is reported.
async fn run_bridge(config: BridgeConfig) -> Result<()> {
    let network = Arc::new(SimulatedNetwork::from_config(
        config.network.channel,
        &config.simulator,
    ));
    tracing::info!(
        "Using {} device network ({} seeded devices)",
        config.network.backend,
        config.simulator.devices.len()
    );

    let bus = Arc::new(MqttBus::connect(&config.mqtt));
    let bridge = Bridge::new(&config, bus);
    let mut fatal = bridge
        .take_fatal_receiver()
        .ok_or_else(|| anyhow!("fatal error channel already taken"))?;

    if let Err(e) = bridge.start(network).await {
        bridge.shutdown().await;
        return Err(anyhow!(e).context("Bridge startup failed"));
    }

    let outcome = tokio::select! {
        _ = shutdown::shutdown_signal() => Ok(()),
        Some(err) = fatal.recv() => {
            tracing::error!("Fatal bridge error: {}", err);
            Err(anyhow!(err))
        }
    };

    bridge.shutdown().await;
    outcome
}

fn check_config(config: &BridgeConfig) -> Result<()> {
    let mut shown = config.clone();
    if shown.mqtt.password.is_some() {
        shown.mqtt.password = Some("********".to_string());
    }
    println!("Configuration: OK");
    println!();
    println!("{}", shown.to_toml()?);
    Ok(())
}

fn list_topics(config: &BridgeConfig) {
    let router = TopicRouter::new(config.mqtt.base_topic.as_str());
    for filter in router.subscriptions() {
        println!("{}", filter);
    }
}
