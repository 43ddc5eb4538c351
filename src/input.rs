//! Raw frame decoding for both transports.
//!
//! Wired adapter HID report (37 bytes):
//!   [0]        = Report ID (0x21)
//!   [1 + 9*n]  = Port n substructure (9 bytes):
//!     [0]      = Status byte (0x10 = controller attached)
//!     [1]      = Buttons byte 1 (A/B/X/Y + dpad)
//!     [2]      = Buttons byte 2 (Start/Z/R/L)
//!     [3..7]   = LX, LY, RX, RY (raw 0-255, centered near 128)
//!     [7..9]   = LT, RT (raw 0-255)
//!
//! Wireless (SW2 BLE) input report (63 bytes):
//!   [4..8]     = Button bitmap (u32 LE)
//!   [10..13]   = Left stick (12-bit packed X/Y)
//!   [13..16]   = Right stick (12-bit packed X/Y)
//!   [0x3C]     = Left trigger
//!   [0x3D]     = Right trigger
//!
//! BLE stick values are 12-bit; they are reduced to the same 0-255 domain
//! the wired adapter reports so one calibration model covers both.

/// Fixed wired report length: report id + 4 port substructures.
pub const WIRED_REPORT_LEN: usize = 37;
pub const WIRED_REPORT_ID: u8 = 0x21;
const PORT_STRIDE: usize = 9;

/// Fixed wireless report length.
pub const BLE_REPORT_LEN: usize = 63;

/// Status-byte bit set while a controller is plugged into the adapter port.
pub const PORT_ATTACHED: u8 = 0x10;

/// One decoded input sample, transport-independent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RawSample {
    pub buttons: ButtonSet,
    pub left_stick: (u8, u8),
    pub right_stick: (u8, u8),
    pub triggers: (u8, u8),
}

/// Named controller buttons.
///
/// The first twelve exist on every GameCube controller; the rest are only
/// reported by the wireless variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Button {
    A,
    B,
    X,
    Y,
    L,
    R,
    Z,
    Start,
    DpadUp,
    DpadDown,
    DpadLeft,
    DpadRight,
    // Wireless-only.
    Zl,
    Home,
    Capture,
    Chat,
    Gr,
    Gl,
}

impl Button {
    pub const ALL: [Button; 18] = [
        Button::A,
        Button::B,
        Button::X,
        Button::Y,
        Button::L,
        Button::R,
        Button::Z,
        Button::Start,
        Button::DpadUp,
        Button::DpadDown,
        Button::DpadLeft,
        Button::DpadRight,
        Button::Zl,
        Button::Home,
        Button::Capture,
        Button::Chat,
        Button::Gr,
        Button::Gl,
    ];

    /// Stable bit index inside a [`ButtonSet`].
    fn bit(self) -> u32 {
        1 << (self as u32)
    }
}

/// Set of pressed buttons packed into a single word.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ButtonSet(u32);

impl ButtonSet {
    pub fn get(&self, btn: Button) -> bool {
        self.0 & btn.bit() != 0
    }

    pub fn set(&mut self, btn: Button, val: bool) {
        if val {
            self.0 |= btn.bit();
        } else {
            self.0 &= !btn.bit();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Iterate buttons pressed in `self` but not in `other`.
    pub fn newly_pressed(&self, other: &ButtonSet) -> impl Iterator<Item = Button> + '_ {
        let diff = self.0 & !other.0;
        Button::ALL.into_iter().filter(move |b| diff & b.bit() != 0)
    }
}

/// Wired button bit positions: (button, byte offset within port, mask).
const WIRED_BUTTON_MAP: [(Button, usize, u8); 12] = [
    (Button::A, 1, 0x01),
    (Button::B, 1, 0x02),
    (Button::X, 1, 0x04),
    (Button::Y, 1, 0x08),
    (Button::DpadLeft, 1, 0x10),
    (Button::DpadRight, 1, 0x20),
    (Button::DpadDown, 1, 0x40),
    (Button::DpadUp, 1, 0x80),
    (Button::Start, 2, 0x01),
    (Button::Z, 2, 0x02),
    (Button::R, 2, 0x04),
    (Button::L, 2, 0x08),
];

/// Wireless button bitmap positions: (button, mask within the u32).
const BLE_BUTTON_MAP: [(Button, u32); 18] = [
    (Button::A, 0x0000_0001),
    (Button::B, 0x0000_0002),
    (Button::X, 0x0000_0004),
    (Button::Y, 0x0000_0008),
    (Button::R, 0x0000_0010),
    (Button::Z, 0x0000_0020),
    (Button::Start, 0x0000_0040),
    (Button::DpadUp, 0x0000_0100),
    (Button::DpadDown, 0x0000_0200),
    (Button::DpadLeft, 0x0000_0400),
    (Button::DpadRight, 0x0000_0800),
    (Button::L, 0x0000_1000),
    (Button::Zl, 0x0000_2000),
    (Button::Home, 0x0001_0000),
    (Button::Capture, 0x0002_0000),
    (Button::Chat, 0x0004_0000),
    (Button::Gr, 0x0008_0000),
    (Button::Gl, 0x0010_0000),
];

/// Unpack two 12-bit values from 3 bytes (little-endian nibble packing).
fn unpack_12bit(data: &[u8]) -> (u16, u16) {
    let a = (data[0] as u16) | (((data[1] & 0x0F) as u16) << 8);
    let b = ((data[1] >> 4) as u16) | ((data[2] as u16) << 4);
    (a, b)
}

/// Decode one port of a wired adapter report.
///
/// Returns `None` for short reports, wrong report id, or an empty port.
pub fn decode_wired(report: &[u8], port: usize) -> Option<RawSample> {
    if report.len() < WIRED_REPORT_LEN || report[0] != WIRED_REPORT_ID || port > 3 {
        return None;
    }
    let sub = &report[1 + PORT_STRIDE * port..1 + PORT_STRIDE * (port + 1)];
    if sub[0] & PORT_ATTACHED == 0 {
        return None;
    }

    let mut buttons = ButtonSet::default();
    for &(btn, byte, mask) in &WIRED_BUTTON_MAP {
        if sub[byte] & mask != 0 {
            buttons.set(btn, true);
        }
    }

    Some(RawSample {
        buttons,
        left_stick: (sub[3], sub[4]),
        right_stick: (sub[5], sub[6]),
        triggers: (sub[7], sub[8]),
    })
}

/// Decode a wireless (SW2 BLE) input report.
pub fn decode_ble(report: &[u8]) -> Option<RawSample> {
    if report.len() < BLE_REPORT_LEN {
        return None;
    }

    let bitmap = u32::from_le_bytes([report[4], report[5], report[6], report[7]]);
    let mut buttons = ButtonSet::default();
    for &(btn, mask) in &BLE_BUTTON_MAP {
        if bitmap & mask != 0 {
            buttons.set(btn, true);
        }
    }

    let (lx, ly) = unpack_12bit(&report[10..13]);
    let (rx, ry) = unpack_12bit(&report[13..16]);

    Some(RawSample {
        buttons,
        left_stick: ((lx >> 4) as u8, (ly >> 4) as u8),
        right_stick: ((rx >> 4) as u8, (ry >> 4) as u8),
        triggers: (report[0x3C], report[0x3D]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wired_report(status: u8, btn1: u8, btn2: u8, axes: [u8; 6]) -> [u8; WIRED_REPORT_LEN] {
        let mut r = [0u8; WIRED_REPORT_LEN];
        r[0] = WIRED_REPORT_ID;
        r[1] = status;
        r[2] = btn1;
        r[3] = btn2;
        r[4..10].copy_from_slice(&axes);
        r
    }

    #[test]
    fn wired_detached_port_is_none() {
        let r = wired_report(0x00, 0xFF, 0xFF, [128; 6]);
        assert!(decode_wired(&r, 0).is_none());
    }

    #[test]
    fn wired_wrong_report_id_is_none() {
        let mut r = wired_report(PORT_ATTACHED, 0, 0, [128; 6]);
        r[0] = 0x20;
        assert!(decode_wired(&r, 0).is_none());
    }

    #[test]
    fn wired_axes_pass_through() {
        let r = wired_report(PORT_ATTACHED, 0, 0, [10, 20, 30, 40, 50, 60]);
        let s = decode_wired(&r, 0).unwrap();
        assert_eq!(s.left_stick, (10, 20));
        assert_eq!(s.right_stick, (30, 40));
        assert_eq!(s.triggers, (50, 60));
    }

    #[test]
    fn wired_each_button_bit_maps_to_one_button() {
        for &(btn, byte, mask) in &WIRED_BUTTON_MAP {
            let (b1, b2) = if byte == 1 { (mask, 0) } else { (0, mask) };
            let r = wired_report(PORT_ATTACHED, b1, b2, [128; 6]);
            let s = decode_wired(&r, 0).unwrap();
            assert!(s.buttons.get(btn), "{btn:?} not decoded");
            for other in Button::ALL {
                if other != btn {
                    assert!(!s.buttons.get(other), "{btn:?} also set {other:?}");
                }
            }
        }
    }

    #[test]
    fn wired_port_offsets() {
        // Press A on port 2 only.
        let mut r = [0u8; WIRED_REPORT_LEN];
        r[0] = WIRED_REPORT_ID;
        r[1 + 9 * 2] = PORT_ATTACHED;
        r[1 + 9 * 2 + 1] = 0x01;
        assert!(decode_wired(&r, 2).unwrap().buttons.get(Button::A));
        assert!(decode_wired(&r, 0).is_none());
    }

    fn ble_report(bitmap: u32, sticks: [u8; 6], lt: u8, rt: u8) -> [u8; BLE_REPORT_LEN] {
        let mut r = [0u8; BLE_REPORT_LEN];
        r[4..8].copy_from_slice(&bitmap.to_le_bytes());
        r[10..16].copy_from_slice(&sticks);
        r[0x3C] = lt;
        r[0x3D] = rt;
        r
    }

    #[test]
    fn ble_sticks_reduce_to_byte_domain() {
        // 12-bit center 0x800 → byte 0x80.
        let r = ble_report(0, [0x00, 0x08, 0x80, 0x00, 0x08, 0x80], 0, 0);
        let s = decode_ble(&r).unwrap();
        assert_eq!(s.left_stick, (0x80, 0x80));
        assert_eq!(s.right_stick, (0x80, 0x80));
    }

    #[test]
    fn ble_stick_extremes() {
        let r = ble_report(0, [0xFF, 0xFF, 0xFF, 0x00, 0x00, 0x00], 0, 0);
        let s = decode_ble(&r).unwrap();
        assert_eq!(s.left_stick, (0xFF, 0xFF));
        assert_eq!(s.right_stick, (0x00, 0x00));
    }

    #[test]
    fn ble_triggers_and_extended_buttons() {
        let bitmap = 0x0000_2000 | 0x0001_0000 | 0x0010_0000; // ZL + Home + GL
        let r = ble_report(bitmap, [0; 6], 12, 250);
        let s = decode_ble(&r).unwrap();
        assert_eq!(s.triggers, (12, 250));
        assert!(s.buttons.get(Button::Zl));
        assert!(s.buttons.get(Button::Home));
        assert!(s.buttons.get(Button::Gl));
        assert!(!s.buttons.get(Button::A));
    }

    #[test]
    fn ble_short_report_is_none() {
        assert!(decode_ble(&[0u8; 16]).is_none());
    }

    #[test]
    fn newly_pressed_diff() {
        let mut prev = ButtonSet::default();
        prev.set(Button::A, true);
        let mut next = ButtonSet::default();
        next.set(Button::A, true);
        next.set(Button::Z, true);
        let pressed: Vec<_> = next.newly_pressed(&prev).collect();
        assert_eq!(pressed, vec![Button::Z]);
        let released: Vec<_> = prev.newly_pressed(&next).collect();
        assert!(released.is_empty());
    }
}
