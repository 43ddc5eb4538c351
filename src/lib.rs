//! Core of the GameCube controller bridge.
//!
//! Turns GameCube-family controllers — the wired USB adapter or the
//! wireless NSO pad over BLE — into virtual gamepads: a cemuhook DSU
//! server, Dolphin's pipe input device, or a ViGEm Xbox 360 pad. The
//! graphical configuration UI lives in a separate crate and drives this
//! one through [`slot::SlotRegistry`] and the [`events`] channels.

pub mod ble;
pub mod calibration;
pub mod dsu;
pub mod error;
pub mod events;
pub mod input;
pub mod pad;
pub mod pipeline;
pub mod settings;
pub mod slot;
pub mod usb;
