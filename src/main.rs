//! Headless bridge daemon: connect a controller, bind a virtual pad, and
//! keep both alive until Ctrl+C.
//!
//! The graphical configuration UI is a separate frontend; this binary
//! covers the connect-and-play path plus automatic reconnects.

use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{debug, error, info, warn};

use gcpad::ble::protocol::parse_mac;
use gcpad::error::GcError;
use gcpad::events::{EventBus, UiEvent};
use gcpad::pad;
use gcpad::settings::{EmulationMode, Settings, SettingsStore};
use gcpad::slot::SlotRegistry;

#[derive(Parser)]
#[command(
    name = "gcpad",
    about = "GameCube controller to virtual gamepad bridge"
)]
struct Args {
    /// Run without the GUI (this binary is always headless; the flag is
    /// kept for frontend compatibility)
    #[arg(long)]
    headless: bool,

    /// Emulation mode (default: the saved setting)
    #[arg(long, value_enum)]
    mode: Option<ModeArg>,

    /// Connect slot 0 to a wireless controller at this MAC instead of the
    /// USB adapter
    #[arg(long, value_name = "MAC")]
    ble: Option<String>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "xbox360")]
    Xbox360,
    #[value(name = "dolphin_pipe")]
    DolphinPipe,
    #[value(name = "dsu")]
    Dsu,
}

impl From<ModeArg> for EmulationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Xbox360 => EmulationMode::Xbox360,
            ModeArg::DolphinPipe => EmulationMode::DolphinPipe,
            ModeArg::Dsu => EmulationMode::Dsu,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    info!("=== GameCube Controller Bridge ===");
    if !args.headless {
        info!("No GUI bundled with this binary; running headless");
    }

    // Create the Dolphin pipe early so it shows up in Dolphin's device
    // list before emulation starts.
    #[cfg(unix)]
    if let Err(e) = gcpad::pad::pipe::ensure_pipe() {
        warn!("Could not create Dolphin pipe: {e}");
    }

    let store = SettingsStore::new(&std::env::current_dir()?);
    let settings = match store.load() {
        Ok(settings) => settings,
        Err(e) => {
            warn!("{e}; using defaults");
            Settings::default()
        }
    };

    let mode: EmulationMode = args
        .mode
        .map(Into::into)
        .unwrap_or(settings.global.emulation_mode);
    if !pad::is_available(mode) {
        error!("Emulation not available for mode '{mode}'");
        error!("{}", pad::unavailable_reason(mode));
        std::process::exit(1);
    }

    let (events, mut event_rx) = EventBus::new();
    let mut registry = SlotRegistry::new(settings, store, events);

    let ble_target = match &args.ble {
        Some(mac) => Some(parse_mac(mac).ok_or_else(|| {
            anyhow::anyhow!("invalid BLE address '{mac}' (expected AA:BB:CC:DD:EE:FF)")
        })?),
        None => None,
    };

    // Initial connect, retrying until the controller shows up.
    info!("Connecting to GameCube controller...");
    loop {
        let connected = match ble_target {
            Some(addr) => registry.connect_ble(0, addr).is_ok(),
            None => match registry.connect_usb(0).await {
                Ok(()) => true,
                Err(GcError::DeviceNotFound(_)) => false,
                Err(e) => {
                    warn!("{e}");
                    false
                }
            },
        };
        if connected {
            break;
        }
        info!("Controller not found, retrying in 2s... (Ctrl+C to quit)");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = tokio::signal::ctrl_c() => return Ok(()),
        }
    }

    info!("Starting {mode} emulation...");
    if let Err(e) = registry.start_emulation(0, mode) {
        error!("Failed to start emulation: {e}");
        registry.disconnect(0);
        std::process::exit(1);
    }

    info!("Bridge active. Press Ctrl+C to stop.");
    run_supervisor(&mut registry, &mut event_rx).await;

    info!("Shutting down...");
    registry.disconnect(0);
    info!("Done.");
    Ok(())
}

/// Drain core events, driving the reconnect state machine until Ctrl+C.
async fn run_supervisor(
    registry: &mut SlotRegistry,
    event_rx: &mut tokio::sync::mpsc::UnboundedReceiver<UiEvent>,
) {
    loop {
        let event = tokio::select! {
            event = event_rx.recv() => match event {
                Some(event) => event,
                None => return,
            },
            _ = tokio::signal::ctrl_c() => return,
        };

        match event {
            UiEvent::Status { slot, message } => info!("[SLOT {slot}] {message}"),
            UiEvent::Progress { slot, percent } => debug!("[SLOT {slot}] {percent}%"),
            UiEvent::Error { slot, message } => warn!("[SLOT {slot}] {message}"),
            UiEvent::Disconnected { slot } => {
                registry.handle_unexpected_disconnect(slot);
                if !reconnect_loop(registry, slot).await {
                    return;
                }
            }
        }
    }
}

/// Retry a slot every 2 seconds until it streams again. Returns false on
/// Ctrl+C.
async fn reconnect_loop(registry: &mut SlotRegistry, slot: usize) -> bool {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(2)) => {}
            _ = tokio::signal::ctrl_c() => return false,
        }
        if registry.try_reconnect(slot).await {
            info!("[SLOT {slot}] Reconnected");
            return true;
        }
    }
}
