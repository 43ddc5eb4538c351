//! Virtual gamepad abstraction.
//!
//! One capability surface, three backends: an Xbox 360 pad through ViGEm
//! (Windows), Dolphin's named-pipe input device (POSIX), and a DSU slot on
//! the shared cemuhook server. The input pipeline only ever talks to
//! `dyn VirtualPad`.

pub mod dsu;
pub mod pipe;
pub mod xbox;

use crate::error::Result;
use crate::settings::EmulationMode;

/// Callback fired when the bound emulator requests rumble.
pub type RumbleCallback = Box<dyn Fn(bool) + Send + Sync>;

/// Xbox-style button vocabulary shared by all backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadButton {
    A,
    B,
    X,
    Y,
    Start,
    Back,
    Guide,
    LeftShoulder,
    RightShoulder,
    LeftThumb,
    RightThumb,
    DpadUp,
    DpadDown,
    DpadLeft,
    DpadRight,
}

impl PadButton {
    pub const ALL: [PadButton; 15] = [
        PadButton::A,
        PadButton::B,
        PadButton::X,
        PadButton::Y,
        PadButton::Start,
        PadButton::Back,
        PadButton::Guide,
        PadButton::LeftShoulder,
        PadButton::RightShoulder,
        PadButton::LeftThumb,
        PadButton::RightThumb,
        PadButton::DpadUp,
        PadButton::DpadDown,
        PadButton::DpadLeft,
        PadButton::DpadRight,
    ];

    fn bit(self) -> u16 {
        1 << (self as u16)
    }
}

/// Set of pressed pad buttons.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PadButtonSet(u16);

impl PadButtonSet {
    pub fn get(&self, btn: PadButton) -> bool {
        self.0 & btn.bit() != 0
    }

    pub fn set(&mut self, btn: PadButton, val: bool) {
        if val {
            self.0 |= btn.bit();
        } else {
            self.0 &= !btn.bit();
        }
    }

    pub fn newly_pressed(&self, other: &PadButtonSet) -> impl Iterator<Item = PadButton> + '_ {
        let diff = self.0 & !other.0;
        PadButton::ALL
            .into_iter()
            .filter(move |b| diff & b.bit() != 0)
    }
}

/// One virtual gamepad bound to a controller slot.
///
/// Sticks are normalized `[-1, 1]` with +Y up; triggers are 0-255. State
/// setters are cheap and only `update()` pushes a frame to the backend.
pub trait VirtualPad: Send {
    fn left_stick(&mut self, x: f64, y: f64);
    fn right_stick(&mut self, x: f64, y: f64);
    fn trigger_left(&mut self, value: u8);
    fn trigger_right(&mut self, value: u8);
    fn press(&mut self, button: PadButton);
    fn release(&mut self, button: PadButton);
    fn update(&mut self) -> Result<()>;
    fn reset(&mut self) -> Result<()>;
    fn close(&mut self);
    fn set_rumble_callback(&mut self, callback: Option<RumbleCallback>);
}

/// Construct the pad backend for `mode` on `slot`.
pub fn create(mode: EmulationMode, slot: usize) -> Result<Box<dyn VirtualPad>> {
    match mode {
        EmulationMode::Xbox360 => Ok(Box::new(xbox::XboxPad::new()?)),
        EmulationMode::DolphinPipe => Ok(Box::new(pipe::PipePad::new()?)),
        EmulationMode::Dsu => Ok(Box::new(dsu::DsuPad::new(slot)?)),
    }
}

/// Whether `mode` can be started on this host.
pub fn is_available(mode: EmulationMode) -> bool {
    match mode {
        EmulationMode::Xbox360 => xbox::is_available(),
        EmulationMode::DolphinPipe => cfg!(unix),
        EmulationMode::Dsu => true,
    }
}

/// Why `mode` is unavailable, for the user-facing error.
pub fn unavailable_reason(mode: EmulationMode) -> String {
    match mode {
        EmulationMode::Xbox360 => xbox::unavailable_reason(),
        EmulationMode::DolphinPipe => {
            "Dolphin pipe emulation needs a POSIX host with FIFO support".into()
        }
        EmulationMode::Dsu => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn button_set_diff() {
        let mut prev = PadButtonSet::default();
        prev.set(PadButton::A, true);
        prev.set(PadButton::Guide, true);
        let mut next = prev;
        next.set(PadButton::Guide, false);
        next.set(PadButton::DpadUp, true);

        let pressed: Vec<_> = next.newly_pressed(&prev).collect();
        assert_eq!(pressed, vec![PadButton::DpadUp]);
        let released: Vec<_> = prev.newly_pressed(&next).collect();
        assert_eq!(released, vec![PadButton::Guide]);
    }

    #[test]
    fn dsu_is_always_available() {
        assert!(is_available(EmulationMode::Dsu));
        assert!(unavailable_reason(EmulationMode::Dsu).is_empty());
    }
}
