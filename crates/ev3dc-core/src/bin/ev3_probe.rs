//! Probe an EV3 brick: print its firmware, battery and name.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use ev3dc_core::brick::{Brick, ConnectionConfig};
use ev3dc_core::protocol::list_ports;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Serial port the brick is attached to
    #[arg(long, conflicts_with = "brick_id")]
    port: Option<String>,

    /// Brick ID (12 hex digits) used to find the port
    #[arg(long)]
    brick_id: Option<String>,

    /// JSON connection configuration; --port and --brick-id override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// List candidate serial ports and exit
    #[arg(long)]
    list: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.list {
        for port in list_ports() {
            match &port.serial_number {
                Some(serial) => println!("{}\t{}", port.name, serial),
                None => println!("{}", port.name),
            }
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => ConnectionConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ConnectionConfig::default(),
    };
    if let Some(port) = cli.port {
        config.port_name = Some(port);
        config.brick_id = None;
    }
    if let Some(id) = cli.brick_id {
        config.port_name = None;
        config.brick_id = Some(id);
    }
    if config.port_name.is_none() && config.brick_id.is_none() {
        bail!("no brick given; pass --port, --brick-id or --config");
    }

    let brick = Brick::connect(&config).await.context("connecting to brick")?;

    println!("name:      {}", brick.brick_name().await?);
    println!("firmware:  {}", brick.firmware_version().await?);
    println!("hardware:  {}", brick.hardware_version().await?);
    println!("os:        {}", brick.os_version().await?);
    println!("battery:   {:.2} V", brick.battery_voltage().await?);
    println!("current:   {:.3} A", brick.battery_current().await?);
    println!("level:     {} %", brick.battery_percent().await?);

    brick.disconnect().await?;
    Ok(())
}
