//! Core → UI event plumbing.
//!
//! The core never calls UI code directly: status, progress, and error
//! reports go out as [`UiEvent`]s on an unbounded channel, while the
//! high-rate pad state is published through a coalescing (last-writer-wins)
//! snapshot that the UI polls at its own pace.

use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::calibration::CalibratedSample;

/// Events delivered to the embedding UI / supervisor.
#[derive(Debug, Clone)]
pub enum UiEvent {
    /// Human-readable status line for a slot.
    Status { slot: usize, message: String },
    /// Connection progress, 0-100.
    Progress { slot: usize, percent: u8 },
    /// Non-fatal error report.
    Error { slot: usize, message: String },
    /// The slot's device went away unexpectedly.
    Disconnected { slot: usize },
}

/// Cloneable sender half handed to connection managers and pipelines.
#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<UiEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UiEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn status(&self, slot: usize, message: impl Into<String>) {
        let _ = self.tx.send(UiEvent::Status {
            slot,
            message: message.into(),
        });
    }

    pub fn progress(&self, slot: usize, percent: u8) {
        let _ = self.tx.send(UiEvent::Progress { slot, percent });
    }

    pub fn error(&self, slot: usize, message: impl Into<String>) {
        let _ = self.tx.send(UiEvent::Error {
            slot,
            message: message.into(),
        });
    }

    pub fn disconnected(&self, slot: usize) {
        let _ = self.tx.send(UiEvent::Disconnected { slot });
    }
}

/// Latest calibrated sample per slot, coalesced.
///
/// The pipeline overwrites the slot's cell on every sample; the UI drains
/// it with [`PadSnapshots::pop_if_changed`]. There is deliberately no
/// queue: a slow reader only ever sees the newest state.
pub struct PadSnapshots {
    cells: [Mutex<Cell>; 4],
}

#[derive(Default)]
struct Cell {
    latest: CalibratedSample,
    changed: bool,
}

impl PadSnapshots {
    pub fn new() -> Self {
        Self {
            cells: Default::default(),
        }
    }

    pub fn publish(&self, slot: usize, sample: CalibratedSample) {
        let mut cell = self.cells[slot].lock().unwrap();
        if cell.latest != sample {
            cell.latest = sample;
            cell.changed = true;
        }
    }

    /// Return the newest sample if it changed since the last pop.
    pub fn pop_if_changed(&self, slot: usize) -> Option<CalibratedSample> {
        let mut cell = self.cells[slot].lock().unwrap();
        if cell.changed {
            cell.changed = false;
            Some(cell.latest)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_coalesce() {
        let snaps = PadSnapshots::new();
        assert!(snaps.pop_if_changed(0).is_none());

        let mut s = CalibratedSample::default();
        s.trigger_left = 10;
        snaps.publish(0, s);
        s.trigger_left = 20;
        snaps.publish(0, s);

        // Only the newest survives.
        let popped = snaps.pop_if_changed(0).unwrap();
        assert_eq!(popped.trigger_left, 20);
        assert!(snaps.pop_if_changed(0).is_none());
    }

    #[test]
    fn unchanged_publish_does_not_flag() {
        let snaps = PadSnapshots::new();
        let s = CalibratedSample::default();
        snaps.publish(1, s);
        assert!(snaps.pop_if_changed(1).is_some());
        snaps.publish(1, s);
        assert!(snaps.pop_if_changed(1).is_none());
    }

    #[test]
    fn events_flow_through_bus() {
        let (bus, mut rx) = EventBus::new();
        bus.status(2, "hello");
        bus.progress(2, 50);
        bus.disconnected(2);
        match rx.try_recv().unwrap() {
            UiEvent::Status { slot, message } => {
                assert_eq!(slot, 2);
                assert_eq!(message, "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            rx.try_recv().unwrap(),
            UiEvent::Progress { percent: 50, .. }
        ));
        assert!(matches!(rx.try_recv().unwrap(), UiEvent::Disconnected { slot: 2 }));
    }
}
