//! Wired adapter support: USB initialization plus HID report polling.

pub mod hid;
pub mod init;

use crate::error::Result;
use crate::events::EventBus;

/// Full wired connection sequence: USB init, then HID open.
///
/// Mirrors the adapter's requirements: the initialization and LED reports
/// must go out over the bulk endpoint before the HID interface starts
/// streaming input reports.
pub async fn connect(slot: usize, events: &EventBus) -> Result<hidapi::HidDevice> {
    init::initialize_adapter(slot, events).await?;
    hid::open(slot, events)
}
