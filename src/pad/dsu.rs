//! DSU-backed virtual pad: one slot on the shared cemuhook server.
//!
//! DSU button bit layout:
//!   buttons byte 1: Share(0) L3(1) R3(2) Options(3) DUp(4) DRight(5) DDown(6) DLeft(7)
//!   buttons byte 2: L2(0) R2(1) L1(2) R1(3) Triangle(4) Circle(5) Cross(6) Square(7)

use crate::dsu::{DsuServer, PadState};
use crate::error::Result;
use crate::pad::{PadButton, RumbleCallback, VirtualPad};

/// Where a pad button lands in the DSU state: target byte, bit, and the
/// analog-pressure field mirrored to 255 while held.
enum Target {
    Buttons1(u8, Option<fn(&mut PadState) -> &mut u8>),
    Buttons2(u8, Option<fn(&mut PadState) -> &mut u8>),
    Ps,
}

fn target_of(button: PadButton) -> Target {
    match button {
        PadButton::Back => Target::Buttons1(1 << 0, None),
        PadButton::LeftThumb => Target::Buttons1(1 << 1, None),
        PadButton::RightThumb => Target::Buttons1(1 << 2, None),
        PadButton::Start => Target::Buttons1(1 << 3, None),
        PadButton::DpadUp => Target::Buttons1(1 << 4, Some(|s| &mut s.dpad_up)),
        PadButton::DpadRight => Target::Buttons1(1 << 5, Some(|s| &mut s.dpad_right)),
        PadButton::DpadDown => Target::Buttons1(1 << 6, Some(|s| &mut s.dpad_down)),
        PadButton::DpadLeft => Target::Buttons1(1 << 7, Some(|s| &mut s.dpad_left)),
        PadButton::LeftShoulder => Target::Buttons2(1 << 2, Some(|s| &mut s.l1)),
        PadButton::RightShoulder => Target::Buttons2(1 << 3, Some(|s| &mut s.r1)),
        PadButton::Y => Target::Buttons2(1 << 4, Some(|s| &mut s.triangle)),
        PadButton::B => Target::Buttons2(1 << 5, Some(|s| &mut s.circle)),
        PadButton::A => Target::Buttons2(1 << 6, Some(|s| &mut s.cross)),
        PadButton::X => Target::Buttons2(1 << 7, Some(|s| &mut s.square)),
        PadButton::Guide => Target::Ps,
    }
}

/// Normalized `[-1, 1]` to the 0-255 stick domain, center 128.
fn axis_to_byte(v: f64) -> u8 {
    (((v + 1.0) / 2.0) * 255.0).round().clamp(0.0, 255.0) as u8
}

pub struct DsuPad {
    server: Option<DsuServer>,
    slot: usize,
    state: PadState,
}

impl DsuPad {
    pub fn new(slot: usize) -> Result<Self> {
        let server = DsuServer::acquire()?;
        server.set_slot_connected(slot, true);
        Ok(Self {
            server: Some(server),
            slot,
            state: PadState::default(),
        })
    }

    /// The UDP port the shared server is bound to.
    pub fn port(&self) -> Option<u16> {
        self.server.as_ref().map(|s| s.port())
    }

    fn apply(&mut self, button: PadButton, pressed: bool) {
        match target_of(button) {
            Target::Buttons1(bit, pressure) => {
                set_bit(&mut self.state.buttons1, bit, pressed);
                if let Some(field) = pressure {
                    *field(&mut self.state) = if pressed { 255 } else { 0 };
                }
            }
            Target::Buttons2(bit, pressure) => {
                set_bit(&mut self.state.buttons2, bit, pressed);
                if let Some(field) = pressure {
                    *field(&mut self.state) = if pressed { 255 } else { 0 };
                }
            }
            Target::Ps => self.state.ps_button = pressed as u8,
        }
    }
}

fn set_bit(byte: &mut u8, bit: u8, on: bool) {
    if on {
        *byte |= bit;
    } else {
        *byte &= !bit;
    }
}

impl VirtualPad for DsuPad {
    fn left_stick(&mut self, x: f64, y: f64) {
        self.state.lx = axis_to_byte(x);
        // DSU Y axis is positive-down.
        self.state.ly = axis_to_byte(-y);
    }

    fn right_stick(&mut self, x: f64, y: f64) {
        self.state.rx = axis_to_byte(x);
        self.state.ry = axis_to_byte(-y);
    }

    fn trigger_left(&mut self, value: u8) {
        self.state.l_trigger = value;
    }

    fn trigger_right(&mut self, value: u8) {
        self.state.r_trigger = value;
    }

    fn press(&mut self, button: PadButton) {
        self.apply(button, true);
    }

    fn release(&mut self, button: PadButton) {
        self.apply(button, false);
    }

    fn update(&mut self) -> Result<()> {
        if let Some(server) = &self.server {
            server.update_slot(self.slot, &self.state);
        }
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.state = PadState::default();
        self.update()
    }

    fn close(&mut self) {
        if let Some(server) = self.server.take() {
            server.set_rumble_callback(self.slot, None);
            server.set_slot_connected(self.slot, false);
        }
    }

    fn set_rumble_callback(&mut self, callback: Option<RumbleCallback>) {
        if let Some(server) = &self.server {
            server.set_rumble_callback(self.slot, callback);
        }
    }
}

impl Drop for DsuPad {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn neutral_stick_maps_to_128() {
        assert_eq!(axis_to_byte(0.0), 128);
    }

    #[test]
    fn full_deflections_hit_the_rails() {
        assert_eq!(axis_to_byte(1.0), 255);
        assert_eq!(axis_to_byte(-1.0), 0);
    }

    #[test]
    fn dsu_y_axis_is_inverted() {
        let server = DsuServer::acquire().unwrap();
        let mut pad = DsuPad {
            server: Some(server),
            slot: 1,
            state: PadState::default(),
        };
        pad.left_stick(1.0, 0.0);
        assert_eq!((pad.state.lx, pad.state.ly), (255, 128));
        pad.left_stick(0.0, 1.0);
        assert_eq!((pad.state.lx, pad.state.ly), (128, 0));
    }

    #[test]
    fn face_buttons_set_bits_and_pressure() {
        let server = DsuServer::acquire().unwrap();
        let mut pad = DsuPad {
            server: Some(server),
            slot: 1,
            state: PadState::default(),
        };
        pad.press(PadButton::A);
        assert_eq!(pad.state.buttons2 & (1 << 6), 1 << 6);
        assert_eq!(pad.state.cross, 255);
        pad.release(PadButton::A);
        assert_eq!(pad.state.buttons2, 0);
        assert_eq!(pad.state.cross, 0);

        pad.press(PadButton::DpadLeft);
        assert_eq!(pad.state.buttons1 & 0x80, 0x80);
        assert_eq!(pad.state.dpad_left, 255);

        pad.press(PadButton::Guide);
        assert_eq!(pad.state.ps_button, 1);
    }
}
