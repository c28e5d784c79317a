use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use helm_console::config::ConsoleConfig;
use helm_console::flow::FlowMonitor;
use helm_console::gateway::{GatewayChannel, GatewayConfig, GatewayRole, StaticTokenStore};
use helm_console::peer::{PeerPool, WebSocketDialer};
use helm_console::subscription::{SubscriptionManager, SubscriptionPlan};

/// Operator console for the robot fleet: attaches to one robot over the
/// gateway and the direct peer channel and streams its flow state.
#[derive(Debug, Parser)]
#[command(name = "helm-console", version)]
struct Cli {
    /// Robot to attach to.
    #[arg(long)]
    robot: String,

    /// Gateway relay URL.
    #[arg(long, env = "HELM_GATEWAY_URL")]
    gateway_url: Option<String>,

    /// Direct peer endpoint base URL.
    #[arg(long, env = "HELM_PEER_URL")]
    peer_url: Option<String>,

    /// Bearer token for the gateway handshake.
    #[arg(long, env = "HELM_TOKEN", hide_env_values = true)]
    token: String,

    /// Topics to mirror from the relay (status, image streams).
    #[arg(long, default_value = "robot.status")]
    topics: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = ConsoleConfig::from_env();
    if let Some(url) = cli.gateway_url {
        config.gateway_url = url;
    }
    if let Some(url) = cli.peer_url {
        config.peer_base_url = url;
    }

    let tokens = StaticTokenStore(cli.token);
    let gateway = GatewayChannel::connect(
        GatewayConfig::new(
            config.gateway_url.clone(),
            config.gateway_realm.clone(),
            GatewayRole::Operator,
        )
        .with_auth_timeout(config.auth_timeout),
        &tokens,
    )
    .await?;
    gateway.subscribe(&cli.topics, &cli.robot)?;
    for topic in &cli.topics {
        // replay cached values so the console is not blank on attach
        gateway.republish(topic, &cli.robot)?;
    }

    let dialer = Arc::new(WebSocketDialer::new(config.peer_base_url.clone()));
    let pool = PeerPool::new(dialer, config.peer_channel_config());
    let handle = pool.acquire(&cli.robot);

    let manager = SubscriptionManager::new(
        Arc::clone(handle.channel()),
        SubscriptionPlan {
            throttle_ms: config.subscribe_throttle_ms,
            ..Default::default()
        },
    )
    .with_delays(config.subscription_settle, config.subscription_pacing);
    manager.arm();

    let monitor = FlowMonitor::spawn_with_extra(handle.channel(), Some(gateway.messages()));
    let mut notifications = monitor.notifications();

    handle.connect().await?;
    info!(robot = %cli.robot, "attached; streaming flow events (ctrl-c to quit)");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = notifications.recv() => match notification {
                Ok(notification) => {
                    info!(
                        flow = notification.flow_id.as_deref().unwrap_or("-"),
                        step = ?notification.step_index,
                        event = notification.event.as_str(),
                        message = notification.message.as_deref().unwrap_or(""),
                        "flow event"
                    );
                }
                Err(err) => {
                    error!(error = %err, "notification stream ended");
                    break;
                }
            },
        }
    }

    manager.disarm();
    handle.disconnect();
    gateway.close();
    Ok(())
}
