//! HID side of the wired connection.
//!
//! hidapi reads are blocking, so they live on the slot's input-pipeline
//! thread rather than the async side.

use hidapi::{HidApi, HidDevice};
use tracing::{error, info};

use crate::error::{GcError, Result};
use crate::events::EventBus;
use crate::input::WIRED_REPORT_LEN;

/// Poll timeout per read; also bounds how fast the stop flag is observed.
pub const READ_TIMEOUT_MS: i32 = 100;

use super::init::{PRODUCT_ID, VENDOR_ID};

/// Open the adapter's HID interface.
pub fn open(slot: usize, events: &EventBus) -> Result<HidDevice> {
    events.status(slot, "Connecting via HID...");

    let api = HidApi::new().map_err(|e| GcError::Transport(format!("hidapi init: {e}")))?;
    let device = api.open(VENDOR_ID, PRODUCT_ID).map_err(|e| {
        events.status(slot, format!("HID connection failed: {e}"));
        GcError::Transport(format!("HID open {VENDOR_ID:04X}:{PRODUCT_ID:04X}: {e}"))
    })?;
    device
        .set_blocking_mode(true)
        .map_err(|e| GcError::Transport(format!("HID blocking mode: {e}")))?;

    events.status(slot, "Connected via HID");
    events.progress(slot, 100);
    info!("[HID] Device {VENDOR_ID:04X}:{PRODUCT_ID:04X} open");
    Ok(device)
}

/// Result of one polling read.
pub enum ReadOutcome {
    /// A full report arrived.
    Report([u8; WIRED_REPORT_LEN]),
    /// Nothing within the timeout; poll again.
    Timeout,
    /// The device is gone; the caller must disconnect.
    Gone(String),
}

/// Read one report with the standard timeout.
///
/// Short reads are folded into `Timeout` (the adapter occasionally emits
/// truncated frames right after init); any read error means the device
/// was unplugged or the handle revoked.
pub fn read_report(device: &HidDevice) -> ReadOutcome {
    let mut buf = [0u8; WIRED_REPORT_LEN];
    match device.read_timeout(&mut buf, READ_TIMEOUT_MS) {
        Ok(0) => ReadOutcome::Timeout,
        Ok(n) if n < WIRED_REPORT_LEN => ReadOutcome::Timeout,
        Ok(_) => ReadOutcome::Report(buf),
        Err(e) => {
            error!("[HID] Read error: {e}");
            ReadOutcome::Gone(e.to_string())
        }
    }
}
