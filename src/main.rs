//! padbridge CLI
//!
//! Connects a grid pad controller and logs its hardware events, with a
//! built-in clock for exercising LED playhead rendering without a DAW.

use anyhow::Result;
use clap::Parser;
use colored::*;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use padbridge::config::BridgeConfig;
use padbridge::controller::PadController;
use padbridge::events::EventType;
use padbridge::timing::{InternalClock, SyncState};
use padbridge::transport::{discovery, MidiTransport};

/// Grid controller bridge for step sequencers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "padbridge.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// List available MIDI ports
    #[arg(long)]
    list_ports: bool,

    /// Log step toggles and raw hardware input
    #[arg(long)]
    monitor: bool,

    /// Drive the LEDs from the built-in clock at this tempo
    #[arg(long)]
    bpm: Option<f64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();
    init_logging(&args.log_level)?;

    if args.list_ports {
        list_ports_formatted();
        return Ok(());
    }

    let config = BridgeConfig::load(&args.config).await?;
    info!("Starting padbridge...");

    let controller = PadController::new(
        "pad-0",
        config.clone(),
        Box::new(MidiTransport::new("padbridge")),
    )?;

    if args.monitor {
        controller.add_event_listener(
            EventType::StepToggle,
            Arc::new(|event| {
                info!("{:?}", event.kind);
            }),
        );
        controller.add_event_listener(
            EventType::HardwareInput,
            Arc::new(|event| {
                info!("{:?}", event.kind);
            }),
        );
    }
    controller.add_event_listener(
        EventType::ConnectionChange,
        Arc::new(|event| {
            info!("{:?}", event.kind);
        }),
    );

    controller.connect().await?;
    info!("Grid controller connected");

    let clock = args.bpm.map(InternalClock::new);
    if let Some(clock) = &clock {
        let bpm = args.bpm.unwrap_or(120.0);
        controller.enable_clock_sync(
            SyncState {
                is_playing: true,
                current_step: 0,
                bpm,
                total_steps: config.device.step_count,
            },
            clock,
        );
        clock.start();
        info!("Built-in clock running at {} bpm", bpm);
    } else if args.monitor {
        info!("Monitoring hardware events (ctrl-c to exit)");
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");
    if let Some(clock) = &clock {
        clock.stop();
    }
    controller.disconnect().await;
    info!("padbridge shutdown complete");
    Ok(())
}

fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .init();

    Ok(())
}

fn list_ports_formatted() {
    println!("\n{}", "=== MIDI Input Ports ===".bold().cyan());
    match discovery::list_input_ports("padbridge-scan") {
        Ok(ports) => {
            for (i, name) in ports.iter().enumerate() {
                println!("  {}: {}", i, name.green());
            }
        }
        Err(e) => warn!("Failed to list input ports: {}", e),
    }

    println!("\n{}", "=== MIDI Output Ports ===".bold().cyan());
    match discovery::list_output_ports("padbridge-scan") {
        Ok(ports) => {
            for (i, name) in ports.iter().enumerate() {
                println!("  {}: {}", i, name.green());
            }
        }
        Err(e) => warn!("Failed to list output ports: {}", e),
    }
    println!();
}
