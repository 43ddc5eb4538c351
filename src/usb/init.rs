//! USB initialization sequence for the wired GameCube adapter (057E:2073).
//!
//! The adapter enumerates as a HID device but stays silent until two
//! reports are written to its bulk OUT endpoint: an initialization report
//! that switches it into input-streaming mode, and an LED report. After
//! that the kernel HID driver takes over and reports are read via hidapi.
//!
//! Per the adapter's quirks, every step between locating the device and
//! opening HID is best-effort: already-configured / already-claimed errors
//! are normal when reconnecting, so failures are reported through the
//! status callback but only a missing device aborts.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{GcError, Result};
use crate::events::EventBus;

pub const VENDOR_ID: u16 = 0x057E;
pub const PRODUCT_ID: u16 = 0x2073;
const USB_INTERFACE: u8 = 1;
const EP_OUT: u8 = 0x02;
const WRITE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Switches the adapter into input-streaming mode.
pub const INIT_REPORT: &[u8] = &[
    0x03, 0x91, 0x00, 0x0D, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF,
];

/// Lights player LED 1.
pub const LED_REPORT: &[u8] = &[
    0x09, 0x91, 0x00, 0x07, 0x00, 0x08, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    0x00,
];

/// Check if the adapter is present on the bus.
pub fn is_device_present() -> bool {
    let Ok(devices) = nusb::list_devices() else {
        return false;
    };
    devices
        .into_iter()
        .any(|d| d.vendor_id() == VENDOR_ID && d.product_id() == PRODUCT_ID)
}

fn find_device() -> Option<nusb::Device> {
    for dev_info in nusb::list_devices().ok()? {
        if dev_info.vendor_id() == VENDOR_ID && dev_info.product_id() == PRODUCT_ID {
            return dev_info.open().ok();
        }
    }
    None
}

/// Run the adapter initialization sequence.
///
/// Progress callbacks fire at 10/30/50/70/90; the HID open that follows
/// reports 100. Only a missing device is fatal here.
pub async fn initialize_adapter(slot: usize, events: &EventBus) -> Result<()> {
    events.status(slot, "Looking for device...");
    events.progress(slot, 10);

    let device = find_device().ok_or_else(|| {
        events.status(slot, "Device not found");
        GcError::DeviceNotFound(format!("{VENDOR_ID:04X}:{PRODUCT_ID:04X}"))
    })?;

    events.status(slot, "Device found");
    events.progress(slot, 30);

    // Already-detached is success on hosts without a kernel driver.
    if let Err(e) = device.detach_kernel_driver(USB_INTERFACE) {
        debug!("[USB] Kernel driver detach (ok to fail): {e}");
    }
    if let Err(e) = device.set_configuration(1) {
        debug!("[USB] Set configuration (ok if already configured): {e}");
    }

    let interface = match device.claim_interface(USB_INTERFACE) {
        Ok(i) => Some(i),
        Err(e) => {
            events.status(slot, format!("Could not claim interface: {e}"));
            warn!("[USB] Claim interface {USB_INTERFACE} failed: {e}");
            None
        }
    };
    events.progress(slot, 50);

    if let Some(interface) = &interface {
        events.status(slot, "Sending initialization data...");
        write_report(interface, INIT_REPORT, slot, events).await;
        events.progress(slot, 70);

        events.status(slot, "Sending LED data...");
        write_report(interface, LED_REPORT, slot, events).await;
    }
    events.progress(slot, 90);

    // Release so the kernel HID driver can bind.
    drop(interface);
    if let Err(e) = device.attach_kernel_driver(USB_INTERFACE) {
        debug!("[USB] Kernel driver reattach (ok to fail): {e}");
    }

    events.status(slot, "USB initialization complete");
    info!("[USB] Adapter initialization complete");
    Ok(())
}

async fn write_report(interface: &nusb::Interface, report: &[u8], slot: usize, events: &EventBus) {
    let write = interface.bulk_out(EP_OUT, report.to_vec());
    match tokio::time::timeout(WRITE_TIMEOUT, write).await {
        Ok(completion) => {
            if let Err(e) = completion.status {
                events.status(slot, format!("USB write failed: {e}"));
                warn!("[USB] Bulk write of report 0x{:02X} failed: {e}", report[0]);
            }
        }
        Err(_) => {
            events.status(slot, "USB write timed out");
            warn!("[USB] Bulk write of report 0x{:02X} timed out", report[0]);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_report_targets_streaming_mode() {
        // Command id + request marker, fixed length field.
        assert_eq!(INIT_REPORT[0], 0x03);
        assert_eq!(INIT_REPORT[1], 0x91);
        assert_eq!(INIT_REPORT.len(), 16);
    }

    #[test]
    fn led_report_lights_player_one() {
        assert_eq!(LED_REPORT[0], 0x09);
        assert_eq!(LED_REPORT[8], 0x01);
        assert_eq!(LED_REPORT.len(), 16);
    }
}
