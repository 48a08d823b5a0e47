//! Bridge SmartBlind peripherals to HTTP.
//!
//! Scans for blinds, serves each on its own port and announces it over SSDP.

use blind_bridge::config::{BridgeConfig, DeviceConfig, ReconnectPolicy, WriteTarget};
use blind_bridge::utils::DEFAULT_BASE_PORT;
use blind_bridge::{Bridge, DEFAULT_DEVICE_NAME};
use clap::Parser;
use std::net::IpAddr;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "blind-bridge")]
#[command(about = "Bridge Bluetooth LE smart blinds to HTTP, discoverable over SSDP")]
#[command(version)]
struct Cli {
    /// Advertised local name of the peripherals to bridge
    #[arg(long, env = "BLIND_BRIDGE_DEVICE_NAME", default_value = DEFAULT_DEVICE_NAME)]
    device_name: String,

    /// Base added to the last three address hex digits to form each port
    #[arg(long, env = "BLIND_BRIDGE_BASE_PORT", default_value_t = DEFAULT_BASE_PORT)]
    base_port: u16,

    /// Address the HTTP servers listen on
    #[arg(long, env = "BLIND_BRIDGE_BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Host announced in beacon locations (detected when omitted)
    #[arg(long, env = "BLIND_BRIDGE_ADVERTISE_HOST")]
    advertise_host: Option<IpAddr>,

    /// Do not run the SSDP beacon
    #[arg(long)]
    no_beacon: bool,

    /// Default characteristic for /char-write-req, as a UUID or an index
    #[arg(long, env = "BLIND_BRIDGE_WRITE_CHAR", default_value = "4")]
    write_char: WriteTarget,

    /// Connect timeout in milliseconds
    #[arg(long, default_value_t = 10_000)]
    connect_timeout_ms: u64,

    /// Service discovery timeout in milliseconds
    #[arg(long, default_value_t = 15_000)]
    discovery_timeout_ms: u64,

    /// Read and write timeout in milliseconds
    #[arg(long, default_value_t = 5_000)]
    io_timeout_ms: u64,

    /// How long status and description requests wait for discovery, in milliseconds
    #[arg(long, default_value_t = 2_000)]
    status_wait_ms: u64,

    /// First reconnect delay in milliseconds
    #[arg(long, default_value_t = 500)]
    reconnect_initial_ms: u64,

    /// Reconnect delay cap in milliseconds
    #[arg(long, default_value_t = 30_000)]
    reconnect_max_ms: u64,

    /// Reconnect attempts per outage (0 disables reconnecting, unlimited when omitted)
    #[arg(long)]
    reconnect_attempts: Option<u32>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> BridgeConfig {
        BridgeConfig {
            device_name: self.device_name,
            base_port: self.base_port,
            bind_host: self.bind,
            advertise_host: self.advertise_host,
            beacon_enabled: !self.no_beacon,
            write_target: self.write_char,
            device: DeviceConfig {
                connect_timeout: Duration::from_millis(self.connect_timeout_ms),
                discovery_timeout: Duration::from_millis(self.discovery_timeout_ms),
                io_timeout: Duration::from_millis(self.io_timeout_ms),
                status_wait: Duration::from_millis(self.status_wait_ms),
                reconnect: ReconnectPolicy {
                    initial_delay: Duration::from_millis(self.reconnect_initial_ms),
                    max_delay: Duration::from_millis(self.reconnect_max_ms),
                    max_attempts: self.reconnect_attempts,
                },
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("blind_bridge={level}").parse()?),
        )
        .init();

    let bridge = Bridge::new(cli.into_config()).await?;
    bridge.start().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted");

    bridge.shutdown().await?;
    Ok(())
}
