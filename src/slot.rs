//! Controller slots: per-slot device binding, emulation lifecycle, and the
//! reconnect state machine.
//!
//! Each of the four slots owns its calibrator, its (optional) input
//! pipeline and BLE worker, and the virtual pad it feeds. The registry is
//! driven from the supervisor (or an embedding UI) and never blocks on
//! slot worker threads except during teardown.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::ble::central::{BleWorker, Sw2Config};
use crate::ble::protocol::format_mac;
use crate::calibration::Calibrator;
use crate::error::{GcError, Result};
use crate::events::{EventBus, PadSnapshots};
use crate::pad::{self, VirtualPad};
use crate::pipeline::{FrameSource, InputPipeline, SharedPad};
use crate::settings::{EmulationMode, Settings, SettingsStore};
use crate::usb;

pub const MAX_SLOTS: usize = 4;

/// BLE notification queue depth; overflow drops frames instead of growing.
const BLE_QUEUE_CAP: usize = 64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    Connecting,
    Streaming,
    Reconnecting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionMode {
    Usb,
    Ble { address: [u8; 6] },
}

/// Last rumble command seen by a slot: a monotonically increasing token
/// plus the motor state, readable from the UI thread.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RumbleState {
    pub token: u32,
    pub on: bool,
}

pub struct ControllerSlot {
    index: usize,
    pub calibrator: Arc<Calibrator>,
    pad: SharedPad,
    state: ConnState,
    mode: Option<ConnectionMode>,
    stop: Arc<AtomicBool>,
    pipeline: Option<InputPipeline>,
    ble_worker: Option<BleWorker>,
    emulating: Option<EmulationMode>,
    rumble: Arc<Mutex<RumbleState>>,
    reconnect_was_emulating: bool,
}

impl ControllerSlot {
    fn new(index: usize, calibrator: Arc<Calibrator>) -> Self {
        Self {
            index,
            calibrator,
            pad: Arc::new(Mutex::new(None)),
            state: ConnState::Disconnected,
            mode: None,
            stop: Arc::new(AtomicBool::new(false)),
            pipeline: None,
            ble_worker: None,
            emulating: None,
            rumble: Arc::new(Mutex::new(RumbleState::default())),
            reconnect_was_emulating: false,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_connected(&self) -> bool {
        self.pipeline.as_ref().is_some_and(InputPipeline::is_running)
    }

    pub fn is_emulating(&self) -> bool {
        self.emulating.is_some()
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn rumble_state(&self) -> RumbleState {
        *self.rumble.lock().unwrap()
    }

    /// Stop the read worker and release the device. Idempotent.
    fn teardown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(pipeline) = self.pipeline.take() {
            pipeline.join();
        }
        if let Some(worker) = self.ble_worker.take() {
            worker.join();
        }
    }
}

pub struct SlotRegistry {
    slots: Vec<ControllerSlot>,
    pub settings: Settings,
    store: SettingsStore,
    events: EventBus,
    pub snapshots: Arc<PadSnapshots>,
    /// HCI adapter index for BLE connections.
    pub ble_adapter: u16,
}

impl SlotRegistry {
    pub fn new(settings: Settings, store: SettingsStore, events: EventBus) -> Self {
        let slots = (0..MAX_SLOTS)
            .map(|i| ControllerSlot::new(i, Arc::new(Calibrator::new(settings.profile(i)))))
            .collect();
        Self {
            slots,
            settings,
            store,
            events,
            snapshots: Arc::new(PadSnapshots::new()),
            ble_adapter: 0,
        }
    }

    pub fn slot(&self, index: usize) -> &ControllerSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut ControllerSlot {
        &mut self.slots[index]
    }

    /// Connect a slot to the wired adapter and start its pipeline.
    pub async fn connect_usb(&mut self, index: usize) -> Result<()> {
        let events = self.events.clone();
        self.slots[index].teardown();
        self.slots[index].state = ConnState::Connecting;

        let device = match usb::connect(index, &events).await {
            Ok(device) => device,
            Err(e) => {
                self.slots[index].state = ConnState::Disconnected;
                return Err(e);
            }
        };

        let slot = &mut self.slots[index];
        slot.stop = Arc::new(AtomicBool::new(false));
        slot.pipeline = Some(InputPipeline::spawn(
            index,
            FrameSource::Hid(device),
            slot.calibrator.clone(),
            slot.pad.clone(),
            events,
            self.snapshots.clone(),
            slot.stop.clone(),
        ));
        slot.mode = Some(ConnectionMode::Usb);
        slot.state = ConnState::Streaming;
        info!("[SLOT] Slot {index} connected over USB");
        Ok(())
    }

    /// Connect a slot to a wireless controller and start its pipeline.
    ///
    /// The BLE worker reports progress through the event bus; a connect
    /// failure surfaces as the slot's disconnect event.
    pub fn connect_ble(&mut self, index: usize, address: [u8; 6]) -> Result<()> {
        let events = self.events.clone();
        self.slots[index].teardown();
        self.slots[index].state = ConnState::Connecting;

        // A known device brings its calibration with it, whatever slot it
        // lands in.
        if let Some(profile) = self.settings.device_profile(&format_mac(address)) {
            self.slots[index].calibrator.set_profile(profile);
        }

        let slot = &mut self.slots[index];
        slot.stop = Arc::new(AtomicBool::new(false));
        let (frame_tx, frame_rx) = mpsc::sync_channel(BLE_QUEUE_CAP);
        slot.ble_worker = Some(BleWorker::spawn(
            Sw2Config {
                adapter: self.ble_adapter,
                target: address,
                slot: index,
            },
            events.clone(),
            frame_tx,
            slot.stop.clone(),
        ));
        slot.pipeline = Some(InputPipeline::spawn(
            index,
            FrameSource::Ble(frame_rx),
            slot.calibrator.clone(),
            slot.pad.clone(),
            events,
            self.snapshots.clone(),
            slot.stop.clone(),
        ));
        slot.mode = Some(ConnectionMode::Ble { address });
        slot.state = ConnState::Streaming;
        info!("[SLOT] Slot {index} connecting to {}", format_mac(address));
        Ok(())
    }

    /// User-initiated disconnect: stop emulation and the read worker.
    pub fn disconnect(&mut self, index: usize) {
        self.stop_emulation(index);
        let slot = &mut self.slots[index];
        slot.teardown();
        slot.state = ConnState::Disconnected;
        slot.mode = None;
        self.events.status(index, "Disconnected");
        self.events.progress(index, 0);
    }

    /// Bind a virtual pad of the given mode to the slot.
    pub fn start_emulation(&mut self, index: usize, mode: EmulationMode) -> Result<()> {
        if !pad::is_available(mode) {
            return Err(GcError::EmulationUnavailable {
                reason: pad::unavailable_reason(mode),
            });
        }

        let mut new_pad: Box<dyn VirtualPad> = pad::create(mode, index)?;
        let rumble = self.slots[index].rumble.clone();
        new_pad.set_rumble_callback(Some(Box::new(move |on| {
            let mut state = rumble.lock().unwrap();
            state.token = state.token.wrapping_add(1);
            state.on = on;
        })));

        *self.slots[index].pad.lock().unwrap() = Some(new_pad);
        self.slots[index].emulating = Some(mode);
        self.events.status(index, format!("{mode} emulation active"));
        Ok(())
    }

    /// Unbind and close the slot's virtual pad. Idempotent.
    pub fn stop_emulation(&mut self, index: usize) {
        let mut guard = self.slots[index].pad.lock().unwrap();
        if let Some(mut pad) = guard.take() {
            let _ = pad.reset();
            pad.close();
        }
        drop(guard);
        self.slots[index].emulating = None;
    }

    /// React to a slot's unexpected disconnect: drop the device, remember
    /// whether it was emulating, and enter the reconnect state.
    pub fn handle_unexpected_disconnect(&mut self, index: usize) {
        let was_emulating = self.slots[index].is_emulating();
        self.stop_emulation(index);
        let slot = &mut self.slots[index];
        slot.teardown();
        slot.reconnect_was_emulating = was_emulating;
        slot.state = ConnState::Reconnecting;
        self.events
            .status(index, "Controller disconnected — reconnecting...");
        self.events.progress(index, 0);
    }

    /// One reconnect attempt for a slot in `Reconnecting`. On success the
    /// previous emulation mode is restored. Returns whether the slot is
    /// streaming again.
    pub async fn try_reconnect(&mut self, index: usize) -> bool {
        let mode = self.slots[index].mode;
        let reconnected = match mode {
            Some(ConnectionMode::Usb) | None => self.connect_usb(index).await.is_ok(),
            Some(ConnectionMode::Ble { address }) => self.connect_ble(index, address).is_ok(),
        };
        if !reconnected {
            return false;
        }

        self.events.status(index, "Reconnected");
        if std::mem::take(&mut self.slots[index].reconnect_was_emulating) {
            let mode = self.settings.global.emulation_mode;
            if let Err(e) = self.start_emulation(index, mode) {
                warn!("[SLOT] Could not resume emulation on slot {index}: {e}");
                self.events.error(index, e.to_string());
            }
        }
        true
    }

    /// Fold the live calibrations back into the settings and write them.
    pub fn save_settings(&mut self) -> Result<()> {
        for index in 0..MAX_SLOTS {
            let profile = self.slots[index].calibrator.profile();
            self.settings.apply_profile(index, &profile);
            if let Some(ConnectionMode::Ble { address }) = self.slots[index].mode {
                self.settings.remember_device(&format_mac(address), &profile);
            }
        }
        self.store.save(&self.settings)
    }
}

impl Drop for SlotRegistry {
    fn drop(&mut self) {
        for index in 0..self.slots.len() {
            self.stop_emulation(index);
            self.slots[index].teardown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn registry() -> (SlotRegistry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = SettingsStore::new(dir.path());
        let (events, _rx) = EventBus::new();
        (SlotRegistry::new(Settings::default(), store, events), dir)
    }

    #[test]
    fn slots_start_disconnected() {
        let (reg, _dir) = registry();
        for i in 0..MAX_SLOTS {
            assert_eq!(reg.slot(i).state(), ConnState::Disconnected);
            assert!(!reg.slot(i).is_connected());
            assert!(!reg.slot(i).is_emulating());
        }
    }

    #[test]
    fn dsu_emulation_binds_and_unbinds() {
        let (mut reg, _dir) = registry();
        reg.start_emulation(0, EmulationMode::Dsu).unwrap();
        assert!(reg.slot(0).is_emulating());

        // Rumble callback feeds the slot's rumble state.
        let before = reg.slot(0).rumble_state();
        {
            let guard = reg.slot(0).pad.lock().unwrap();
            assert!(guard.is_some());
        }
        assert_eq!(before, RumbleState::default());

        reg.stop_emulation(0);
        assert!(!reg.slot(0).is_emulating());
        assert!(reg.slot(0).pad.lock().unwrap().is_none());
        // Stopping twice is fine.
        reg.stop_emulation(0);
    }

    #[cfg(not(windows))]
    #[test]
    fn unavailable_backend_is_rejected_with_reason() {
        let (mut reg, _dir) = registry();
        let err = reg.start_emulation(0, EmulationMode::Xbox360).unwrap_err();
        match err {
            GcError::EmulationUnavailable { reason } => {
                assert!(reason.contains("Windows"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn disconnect_event_enters_reconnecting() {
        let (mut reg, _dir) = registry();
        reg.start_emulation(1, EmulationMode::Dsu).unwrap();
        reg.handle_unexpected_disconnect(1);
        assert_eq!(reg.slot(1).state(), ConnState::Reconnecting);
        assert!(!reg.slot(1).is_emulating());
        assert!(reg.slot(1).reconnect_was_emulating);
    }

    #[test]
    fn save_settings_persists_calibration() {
        let (mut reg, dir) = registry();
        let mut profile = reg.slot(2).calibrator.profile();
        profile.trigger_left.bump = 211.0;
        reg.slot(2).calibrator.set_profile(profile);

        reg.save_settings().unwrap();
        let loaded = SettingsStore::new(dir.path()).load().unwrap();
        assert_eq!(loaded.slots[2].trigger_left_bump, 211.0);
    }
}
