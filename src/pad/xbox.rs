//! Xbox 360 virtual pad through the ViGEmBus driver.
//!
//! Only exists on Windows; everywhere else construction fails with
//! `EmulationUnavailable` and the orchestrator reports the reason.

use crate::error::Result;
use crate::pad::{PadButton, RumbleCallback, VirtualPad};

#[cfg(windows)]
mod imp {
    use std::sync::OnceLock;

    use tracing::{debug, info};
    use vigem_client::{Client, TargetId, XButtons, XGamepad, Xbox360Wired};

    use super::*;
    use crate::error::GcError;

    fn button_mask(button: PadButton) -> u16 {
        match button {
            PadButton::A => XButtons::A,
            PadButton::B => XButtons::B,
            PadButton::X => XButtons::X,
            PadButton::Y => XButtons::Y,
            PadButton::Start => XButtons::START,
            PadButton::Back => XButtons::BACK,
            PadButton::Guide => XButtons::GUIDE,
            PadButton::LeftShoulder => XButtons::LB,
            PadButton::RightShoulder => XButtons::RB,
            PadButton::LeftThumb => XButtons::LTHUMB,
            PadButton::RightThumb => XButtons::RTHUMB,
            PadButton::DpadUp => XButtons::UP,
            PadButton::DpadDown => XButtons::DOWN,
            PadButton::DpadLeft => XButtons::LEFT,
            PadButton::DpadRight => XButtons::RIGHT,
        }
    }

    fn axis_to_i16(v: f64) -> i16 {
        (v.clamp(-1.0, 1.0) * 32767.0).round() as i16
    }

    pub struct XboxPad {
        target: Xbox360Wired<Client>,
        gamepad: XGamepad,
        rumble: Option<RumbleCallback>,
    }

    impl XboxPad {
        pub fn new() -> Result<Self> {
            let client = Client::connect().map_err(|e| GcError::EmulationUnavailable {
                reason: format!("ViGEmBus driver not reachable: {e}"),
            })?;
            let mut target = Xbox360Wired::new(client, TargetId::XBOX360_WIRED);
            target
                .plugin()
                .and_then(|_| target.wait_ready())
                .map_err(|e| GcError::EmulationUnavailable {
                    reason: format!("could not plug in virtual pad: {e}"),
                })?;
            info!("[XBOX] Virtual Xbox 360 pad plugged in");
            Ok(Self {
                target,
                gamepad: XGamepad::default(),
                rumble: None,
            })
        }
    }

    impl VirtualPad for XboxPad {
        fn left_stick(&mut self, x: f64, y: f64) {
            self.gamepad.thumb_lx = axis_to_i16(x);
            self.gamepad.thumb_ly = axis_to_i16(y);
        }

        fn right_stick(&mut self, x: f64, y: f64) {
            self.gamepad.thumb_rx = axis_to_i16(x);
            self.gamepad.thumb_ry = axis_to_i16(y);
        }

        fn trigger_left(&mut self, value: u8) {
            self.gamepad.left_trigger = value;
        }

        fn trigger_right(&mut self, value: u8) {
            self.gamepad.right_trigger = value;
        }

        fn press(&mut self, button: PadButton) {
            self.gamepad.buttons.raw |= button_mask(button);
        }

        fn release(&mut self, button: PadButton) {
            self.gamepad.buttons.raw &= !button_mask(button);
        }

        fn update(&mut self) -> Result<()> {
            self.target
                .update(&self.gamepad)
                .map_err(|e| GcError::Transport(format!("vigem update: {e}")))
        }

        fn reset(&mut self) -> Result<()> {
            self.gamepad = XGamepad::default();
            self.update()
        }

        fn close(&mut self) {
            if let Err(e) = self.target.unplug() {
                debug!("[XBOX] Unplug failed: {e}");
            }
        }

        fn set_rumble_callback(&mut self, callback: Option<RumbleCallback>) {
            // TODO: bridge ViGEm force-feedback notifications to the slot
            // rumble once the notification thread is in place.
            self.rumble = callback;
        }
    }

    static AVAILABLE: OnceLock<bool> = OnceLock::new();

    pub fn is_available() -> bool {
        *AVAILABLE.get_or_init(|| Client::connect().is_ok())
    }

    pub fn unavailable_reason() -> String {
        "Xbox 360 emulation needs the ViGEmBus driver (https://github.com/nefarius/ViGEmBus)"
            .into()
    }
}

#[cfg(not(windows))]
mod imp {
    use super::*;
    use crate::error::GcError;

    /// Placeholder so `pad::create` type-checks; construction always fails.
    pub struct XboxPad {
        never: std::convert::Infallible,
    }

    impl XboxPad {
        pub fn new() -> Result<Self> {
            Err(GcError::EmulationUnavailable {
                reason: unavailable_reason(),
            })
        }
    }

    impl VirtualPad for XboxPad {
        fn left_stick(&mut self, _x: f64, _y: f64) {
            match self.never {}
        }
        fn right_stick(&mut self, _x: f64, _y: f64) {
            match self.never {}
        }
        fn trigger_left(&mut self, _value: u8) {
            match self.never {}
        }
        fn trigger_right(&mut self, _value: u8) {
            match self.never {}
        }
        fn press(&mut self, _button: PadButton) {
            match self.never {}
        }
        fn release(&mut self, _button: PadButton) {
            match self.never {}
        }
        fn update(&mut self) -> Result<()> {
            match self.never {}
        }
        fn reset(&mut self) -> Result<()> {
            match self.never {}
        }
        fn close(&mut self) {
            match self.never {}
        }
        fn set_rumble_callback(&mut self, _callback: Option<RumbleCallback>) {
            match self.never {}
        }
    }

    pub fn is_available() -> bool {
        false
    }

    pub fn unavailable_reason() -> String {
        "Xbox 360 emulation is only supported on Windows with the ViGEmBus driver".into()
    }
}

pub use imp::{is_available, unavailable_reason, XboxPad};

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(windows))]
    #[test]
    fn unavailable_off_windows() {
        assert!(!is_available());
        assert!(matches!(
            XboxPad::new(),
            Err(crate::error::GcError::EmulationUnavailable { .. })
        ));
        assert!(unavailable_reason().contains("Windows"));
    }
}
