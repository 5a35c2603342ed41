// bleman - BLE central session manager CLI
//
// Drives the central manager against a simulated radio environment: scan,
// connect, inspect services, read, write and listen for notifications.

mod config;
mod demo;

use anyhow::{Context, Result};
use bleman_core::{
    event_channel, parse_uuid, short_uuid_string, spawn_central, CentralConfig, CentralEvent,
    CentralHandle, CharacteristicProperties, PeripheralInfo, Service, WriteType,
};
use clap::{Parser, Subcommand};
use colored::*;
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "bleman")]
#[command(about = "BLE central session manager (simulated radio)", long_about = None)]
#[command(version)]
struct Cli {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More logging (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan for peripherals
    Scan {
        #[arg(short, long, default_value = "3")]
        seconds: u64,
        /// Only report peripherals advertising this service (repeatable)
        #[arg(long = "service")]
        services: Vec<String>,
    },
    /// Connect and print the service tree
    Inspect { id: String },
    /// Read a characteristic
    Read {
        id: String,
        service: String,
        characteristic: String,
    },
    /// Write hex bytes to a characteristic
    Write {
        id: String,
        service: String,
        characteristic: String,
        hex: String,
        #[arg(long)]
        no_response: bool,
    },
    /// Subscribe and print notifications
    Listen {
        id: String,
        service: String,
        characteristic: String,
        #[arg(short, long, default_value = "5")]
        count: usize,
    },
    /// Read signal strength
    Rssi { id: String },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration
    Show,
    /// Write a default configuration file
    Init { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    bleman_core::init_logging(filter);

    if let Commands::Config { action } = &cli.command {
        return cmd_config(action, cli.config.as_deref());
    }

    let config = config::load(cli.config.as_deref())?;
    let session = Session::start(config)?;

    let result = match cli.command {
        Commands::Scan { seconds, services } => cmd_scan(&session, seconds, &services, cli.json).await,
        Commands::Inspect { id } => cmd_inspect(&session, &id, cli.json).await,
        Commands::Read {
            id,
            service,
            characteristic,
        } => cmd_read(&session, &id, &service, &characteristic).await,
        Commands::Write {
            id,
            service,
            characteristic,
            hex,
            no_response,
        } => cmd_write(&session, &id, &service, &characteristic, &hex, no_response).await,
        Commands::Listen {
            id,
            service,
            characteristic,
            count,
        } => cmd_listen(&session, &id, &service, &characteristic, count).await,
        Commands::Rssi { id } => cmd_rssi(&session, &id).await,
        Commands::Config { .. } => Ok(()),
    };

    session.central.shutdown().await.ok();
    result
}

/// Central manager plus its simulated stack
struct Session {
    central: CentralHandle,
}

impl Session {
    fn start(config: CentralConfig) -> Result<Self> {
        let (sink, events) = event_channel();
        let platform = Arc::new(demo::world(sink));
        let central = spawn_central(platform, events, config)
            .context("Failed to start central manager")?;
        Ok(Self { central })
    }

    /// Scan briefly so the registry knows `id`, then connect and discover
    async fn attach(&self, id: &str) -> Result<()> {
        let mut events = self.central.events();
        self.central
            .start_scan(vec![], Some(Duration::from_secs(1)))
            .await
            .context("Scan failed")?;
        while let Ok(event) = events.recv().await {
            if event == CentralEvent::ScanStopped {
                break;
            }
        }

        self.central
            .connect(id, None)
            .await
            .with_context(|| format!("Failed to connect to {}", id))?;
        println!("  {} Connected to {}", "✓".green(), id.bright_cyan());

        let services = self
            .central
            .discover_services(id)
            .await
            .context("Service discovery failed")?;
        println!("  {} {} services discovered", "✓".green(), services.len());
        Ok(())
    }
}

fn flags(properties: &CharacteristicProperties) -> String {
    let mut names = Vec::new();
    if properties.read {
        names.push("read");
    }
    if properties.write {
        names.push("write");
    }
    if properties.write_without_response {
        names.push("write-no-rsp");
    }
    if properties.notify {
        names.push("notify");
    }
    if properties.indicate {
        names.push("indicate");
    }
    names.join(", ")
}

fn print_peripheral(info: &PeripheralInfo) {
    let name = info.name.as_deref().unwrap_or("(unnamed)");
    let rssi = info
        .rssi
        .map(|r| format!("{} dBm", r))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {}  {:<12} {:>8}  {}",
        info.id.bright_cyan(),
        name.bold(),
        rssi,
        info.state.to_string().dimmed()
    );
}

fn print_services(services: &[Service]) {
    for service in services {
        println!("  {} {}", "service".yellow(), short_uuid_string(&service.uuid));
        for characteristic in &service.characteristics {
            println!(
                "    {} {} [{}]",
                "└".dimmed(),
                short_uuid_string(&characteristic.uuid),
                flags(&characteristic.properties)
            );
        }
    }
}

async fn cmd_scan(session: &Session, seconds: u64, services: &[String], json: bool) -> Result<()> {
    let filters = services
        .iter()
        .map(|s| parse_uuid(s))
        .collect::<Result<Vec<_>, _>>()
        .context("Invalid service filter")?;

    if !json {
        println!("{}", format!("Scanning for {}s...", seconds).bold());
    }
    let mut events = session.central.events();
    session
        .central
        .start_scan(filters, Some(Duration::from_secs(seconds)))
        .await
        .context("Scan failed")?;

    while let Ok(event) = events.recv().await {
        match event {
            CentralEvent::PeripheralDiscovered(info) if !json => print_peripheral(&info),
            CentralEvent::ScanStopped => break,
            _ => {}
        }
    }

    let found = session.central.discovered_peripherals().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else {
        println!();
        println!("{} peripherals found", found.len());
    }
    Ok(())
}

async fn cmd_inspect(session: &Session, id: &str, json: bool) -> Result<()> {
    session.attach(id).await?;
    let info = session.central.peripheral(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    println!();
    print_peripheral(&info);
    if !info.advertisement.is_empty() {
        println!("  advertisement: {}", info.advertisement.dimmed());
    }
    print_services(&info.services);
    session.central.disconnect(id).await?;
    Ok(())
}

async fn cmd_read(session: &Session, id: &str, service: &str, characteristic: &str) -> Result<()> {
    session.attach(id).await?;
    let value = session
        .central
        .read(id, service, characteristic)
        .await
        .context("Read failed")?;
    println!("{} {}", "value:".bold(), hex::encode(&value));
    session.central.disconnect(id).await?;
    Ok(())
}

async fn cmd_write(
    session: &Session,
    id: &str,
    service: &str,
    characteristic: &str,
    payload: &str,
    no_response: bool,
) -> Result<()> {
    let data = hex::decode(payload.trim_start_matches("0x")).context("Payload is not valid hex")?;
    let write_type = if no_response {
        WriteType::WithoutResponse
    } else {
        WriteType::WithResponse
    };

    session.attach(id).await?;
    session
        .central
        .write(id, service, characteristic, data.clone(), write_type)
        .await
        .context("Write failed")?;
    println!(
        "  {} Wrote {} bytes ({})",
        "✓".green(),
        data.len(),
        write_type
    );
    session.central.disconnect(id).await?;
    Ok(())
}

async fn cmd_listen(
    session: &Session,
    id: &str,
    service: &str,
    characteristic: &str,
    count: usize,
) -> Result<()> {
    session.attach(id).await?;
    let stream = session
        .central
        .subscribe(id, service, characteristic)
        .await
        .context("Subscribe failed")?;
    println!("{}", format!("Listening for {} notifications...", count).bold());

    let mut notifications = stream.take(count);
    while let Some(notification) = notifications.next().await {
        println!(
            "  {} {}",
            notification.characteristic.to_string().dimmed(),
            hex::encode(&notification.value)
        );
    }

    session
        .central
        .unsubscribe(id, service, characteristic)
        .await
        .context("Unsubscribe failed")?;
    session.central.disconnect(id).await?;
    Ok(())
}

async fn cmd_rssi(session: &Session, id: &str) -> Result<()> {
    session.attach(id).await?;
    let rssi = session.central.read_rssi(id).await.context("RSSI read failed")?;
    println!("{} {} dBm", "rssi:".bold(), rssi);
    session.central.disconnect(id).await?;
    Ok(())
}

fn cmd_config(action: &ConfigAction, explicit: Option<&std::path::Path>) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let config = config::load(explicit)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        ConfigAction::Init { path } => {
            config::init(path)?;
            println!("  {} Wrote {}", "✓".green(), path.display());
        }
    }
    Ok(())
}
