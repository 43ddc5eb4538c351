//! Per-slot input pipeline: read raw frames, decode, calibrate, dispatch.
//!
//! Each connected slot runs one of these on its own OS thread. HID mode
//! polls the device with a short timeout; BLE mode drains the slot's
//! bounded notification queue. Decode problems are reported and skipped,
//! transport errors raise the slot's disconnect event and end the worker.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use hidapi::HidDevice;
use tracing::{debug, info};

use crate::calibration::{CalibratedSample, Calibrator};
use crate::events::{EventBus, PadSnapshots};
use crate::input::{self, Button, ButtonSet, RawSample, BLE_REPORT_LEN};
use crate::pad::{PadButton, PadButtonSet, VirtualPad};
use crate::usb::hid::{self, ReadOutcome};

/// The slot's bound virtual pad; swapped by the emulation manager while
/// the pipeline keeps running.
pub type SharedPad = Arc<Mutex<Option<Box<dyn VirtualPad>>>>;

/// A release must persist this many consecutive samples before it is
/// accepted; presses apply immediately.
const RELEASE_DEBOUNCE_SAMPLES: u8 = 2;

pub enum FrameSource {
    Hid(HidDevice),
    Ble(Receiver<[u8; BLE_REPORT_LEN]>),
}

/// Handle on one slot's running read worker.
pub struct InputPipeline {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl InputPipeline {
    pub fn spawn(
        slot: usize,
        source: FrameSource,
        calibrator: Arc<Calibrator>,
        pad: SharedPad,
        events: EventBus,
        snapshots: Arc<PadSnapshots>,
        stop: Arc<AtomicBool>,
    ) -> InputPipeline {
        let thread_stop = stop.clone();
        let handle = std::thread::Builder::new()
            .name(format!("input-{slot}"))
            .spawn(move || {
                run(slot, source, &calibrator, &pad, &events, &snapshots, &thread_stop);
                info!("[SLOT] Input pipeline {slot} stopped");
            })
            .expect("spawn input pipeline");
        InputPipeline {
            stop,
            handle: Some(handle),
        }
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    pub fn join(mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(
    slot: usize,
    mut source: FrameSource,
    calibrator: &Calibrator,
    pad: &SharedPad,
    events: &EventBus,
    snapshots: &PadSnapshots,
    stop: &AtomicBool,
) {
    let mut debounce = Debounce::default();
    let mut pad_buttons = PadButtonSet::default();

    if let Some(what) = calibrator.profile().degeneracy() {
        let e = crate::error::GcError::Calibration(format!(
            "{what} degenerate; falling back to defaults"
        ));
        events.error(slot, e.to_string());
    }

    while !stop.load(Ordering::SeqCst) {
        let raw = match next_sample(&mut source) {
            SampleOutcome::Sample(raw) => raw,
            SampleOutcome::Idle => continue,
            SampleOutcome::Gone(reason) => {
                events.error(slot, format!("Read failed: {reason}"));
                events.disconnected(slot);
                return;
            }
        };

        let mut raw = raw;
        raw.buttons = debounce.apply(raw.buttons);
        let cal = calibrator.process(&raw);

        if let Some(pad) = pad.lock().unwrap().as_mut() {
            if let Err(e) = dispatch(pad.as_mut(), &cal, &mut pad_buttons) {
                // Backend hiccups (e.g. pipe reader detached) are
                // recoverable; the device itself is fine.
                events.error(slot, e.to_string());
            }
        }

        snapshots.publish(slot, cal);
    }
}

enum SampleOutcome {
    Sample(RawSample),
    Idle,
    Gone(String),
}

fn next_sample(source: &mut FrameSource) -> SampleOutcome {
    match source {
        FrameSource::Hid(device) => match hid::read_report(device) {
            ReadOutcome::Report(report) => match input::decode_wired(&report, 0) {
                Some(raw) => SampleOutcome::Sample(raw),
                None => {
                    // Empty port or malformed frame; skip it.
                    debug!("[SLOT] Undecodable wired report");
                    SampleOutcome::Idle
                }
            },
            ReadOutcome::Timeout => SampleOutcome::Idle,
            ReadOutcome::Gone(reason) => SampleOutcome::Gone(reason),
        },
        FrameSource::Ble(queue) => match queue.recv_timeout(Duration::from_millis(100)) {
            Ok(frame) => match input::decode_ble(&frame) {
                Some(raw) => SampleOutcome::Sample(raw),
                None => SampleOutcome::Idle,
            },
            Err(RecvTimeoutError::Timeout) => SampleOutcome::Idle,
            Err(RecvTimeoutError::Disconnected) => {
                SampleOutcome::Gone("BLE worker exited".into())
            }
        },
    }
}

/// Release-side debounce: a press is taken immediately, a release only
/// after it has persisted, which filters contact chatter without adding
/// press latency.
#[derive(Default)]
struct Debounce {
    stable: ButtonSet,
    release_streak: [u8; Button::ALL.len()],
}

impl Debounce {
    fn apply(&mut self, raw: ButtonSet) -> ButtonSet {
        for (i, btn) in Button::ALL.into_iter().enumerate() {
            if raw.get(btn) {
                self.stable.set(btn, true);
                self.release_streak[i] = 0;
            } else if self.stable.get(btn) {
                self.release_streak[i] += 1;
                if self.release_streak[i] >= RELEASE_DEBOUNCE_SAMPLES {
                    self.stable.set(btn, false);
                    self.release_streak[i] = 0;
                }
            }
        }
        self.stable
    }
}

/// Controller buttons → pad vocabulary. The L/R full presses ride on the
/// analog triggers, and the wireless chat button has no pad equivalent.
fn map_buttons(buttons: &ButtonSet) -> PadButtonSet {
    const MAP: [(Button, PadButton); 14] = [
        (Button::A, PadButton::A),
        (Button::B, PadButton::B),
        (Button::X, PadButton::X),
        (Button::Y, PadButton::Y),
        (Button::Start, PadButton::Start),
        (Button::Z, PadButton::RightShoulder),
        (Button::Zl, PadButton::LeftShoulder),
        (Button::DpadUp, PadButton::DpadUp),
        (Button::DpadDown, PadButton::DpadDown),
        (Button::DpadLeft, PadButton::DpadLeft),
        (Button::DpadRight, PadButton::DpadRight),
        (Button::Home, PadButton::Guide),
        (Button::Capture, PadButton::Back),
        (Button::Gr, PadButton::RightThumb),
    ];
    let mut out = PadButtonSet::default();
    for (from, to) in MAP {
        if buttons.get(from) {
            out.set(to, true);
        }
    }
    if buttons.get(Button::Gl) {
        out.set(PadButton::LeftThumb, true);
    }
    out
}

/// Push one calibrated sample into the bound pad.
fn dispatch(
    pad: &mut dyn VirtualPad,
    cal: &CalibratedSample,
    prev: &mut PadButtonSet,
) -> crate::error::Result<()> {
    pad.left_stick(cal.left.0, cal.left.1);
    pad.right_stick(cal.right.0, cal.right.1);
    pad.trigger_left(cal.trigger_left);
    pad.trigger_right(cal.trigger_right);

    let next = map_buttons(&cal.buttons);
    for btn in next.newly_pressed(prev) {
        pad.press(btn);
    }
    for btn in prev.newly_pressed(&next) {
        pad.release(btn);
    }
    *prev = next;

    pad.update()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pad::RumbleCallback;

    #[test]
    fn debounce_press_is_immediate() {
        let mut d = Debounce::default();
        let mut raw = ButtonSet::default();
        raw.set(Button::A, true);
        assert!(d.apply(raw).get(Button::A));
    }

    #[test]
    fn debounce_release_needs_two_samples() {
        let mut d = Debounce::default();
        let mut pressed = ButtonSet::default();
        pressed.set(Button::A, true);
        d.apply(pressed);

        let released = ButtonSet::default();
        // One release sample is chatter.
        assert!(d.apply(released).get(Button::A));
        // The second one sticks.
        assert!(!d.apply(released).get(Button::A));
    }

    #[test]
    fn debounce_chatter_is_filtered() {
        let mut d = Debounce::default();
        let mut pressed = ButtonSet::default();
        pressed.set(Button::Z, true);
        let released = ButtonSet::default();

        d.apply(pressed);
        d.apply(released); // blip
        assert!(d.apply(pressed).get(Button::Z));
        assert!(d.apply(pressed).get(Button::Z));
    }

    #[test]
    fn gc_buttons_land_on_pad_vocabulary() {
        let mut b = ButtonSet::default();
        b.set(Button::Z, true);
        b.set(Button::Home, true);
        b.set(Button::DpadLeft, true);
        let mapped = map_buttons(&b);
        assert!(mapped.get(PadButton::RightShoulder));
        assert!(mapped.get(PadButton::Guide));
        assert!(mapped.get(PadButton::DpadLeft));
        assert!(!mapped.get(PadButton::A));

        // Chat and the trigger clicks map to nothing.
        let mut b = ButtonSet::default();
        b.set(Button::Chat, true);
        b.set(Button::L, true);
        b.set(Button::R, true);
        assert_eq!(map_buttons(&b), PadButtonSet::default());
    }

    #[derive(Default)]
    struct MockPad {
        calls: Vec<String>,
    }

    impl VirtualPad for MockPad {
        fn left_stick(&mut self, x: f64, y: f64) {
            self.calls.push(format!("L{x:.1},{y:.1}"));
        }
        fn right_stick(&mut self, x: f64, y: f64) {
            self.calls.push(format!("R{x:.1},{y:.1}"));
        }
        fn trigger_left(&mut self, value: u8) {
            self.calls.push(format!("TL{value}"));
        }
        fn trigger_right(&mut self, value: u8) {
            self.calls.push(format!("TR{value}"));
        }
        fn press(&mut self, button: PadButton) {
            self.calls.push(format!("press:{button:?}"));
        }
        fn release(&mut self, button: PadButton) {
            self.calls.push(format!("release:{button:?}"));
        }
        fn update(&mut self) -> crate::error::Result<()> {
            self.calls.push("update".into());
            Ok(())
        }
        fn reset(&mut self) -> crate::error::Result<()> {
            Ok(())
        }
        fn close(&mut self) {}
        fn set_rumble_callback(&mut self, _cb: Option<RumbleCallback>) {}
    }

    #[test]
    fn dispatch_sends_state_then_update() {
        let mut pad = MockPad::default();
        let mut prev = PadButtonSet::default();

        let mut cal = CalibratedSample::default();
        cal.left = (1.0, 0.0);
        cal.trigger_left = 204;
        cal.buttons.set(Button::A, true);

        dispatch(&mut pad, &cal, &mut prev).unwrap();
        assert_eq!(
            pad.calls,
            vec!["L1.0,0.0", "R0.0,0.0", "TL204", "TR0", "press:A", "update"]
        );
        assert!(prev.get(PadButton::A));

        // Releasing A emits exactly one release on the next dispatch.
        pad.calls.clear();
        let cal = CalibratedSample::default();
        dispatch(&mut pad, &cal, &mut prev).unwrap();
        assert_eq!(
            pad.calls,
            vec!["L0.0,0.0", "R0.0,0.0", "TL0", "TR0", "release:A", "update"]
        );
    }
}
