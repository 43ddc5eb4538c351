//! SW2 command protocol: framing and fixed constants.
//!
//! This is the protocol of the NSO GameCube wireless controller (and the
//! other Switch 2 era pads), distinct from the original Switch Pro
//! Controller protocol. Commands are written without response to handle
//! 0x0014; the controller acknowledges on notification handle 0x001A.
//!
//! Command frame:
//!   byte 0     command id (0x02 SPI read, 0x09 LED, 0x0C feature, 0x15 pair)
//!   byte 1     0x91 (request)
//!   byte 2     0x01 (interface = BLE)
//!   byte 3     subcommand
//!   byte 4     0x00
//!   byte 5     payload length
//!   bytes 6-7  0x00 0x00
//!   bytes 8…   payload

// Fixed ATT handles.
pub const H_SVC_ENABLE: u16 = 0x0005;
pub const H_INPUT_REPORT: u16 = 0x000A;
pub const H_INPUT_CCCD: u16 = 0x000B;
pub const H_VIBRATION: u16 = 0x0012;
pub const H_CMD_WRITE: u16 = 0x0014;
pub const H_CMD_RESPONSE: u16 = 0x001A;
pub const H_CMD_RESP_CCCD: u16 = 0x001B;

// Command ids.
pub const CMD_SPI_READ: u8 = 0x02;
pub const CMD_SET_LED: u8 = 0x09;
pub const CMD_FEATURE_CTRL: u8 = 0x0C;
pub const CMD_PAIRING: u8 = 0x15;

const REQ_TYPE: u8 = 0x91;
const IFACE_BLE: u8 = 0x01;

// Feature flags for CMD_FEATURE_CTRL.
pub const FEAT_BUTTONS: u8 = 0x01;
pub const FEAT_STICKS: u8 = 0x02;

// SPI flash regions.
pub const SPI_DEVICE_INFO: u32 = 0x0001_3000;
pub const SPI_PAIRING_DATA: u32 = 0x001F_A000;
pub const SPI_LTK: u32 = 0x001F_A01A;

/// Player LED bitmaps, indexed by slot.
pub const LED_MAP: [u8; 8] = [0x01, 0x03, 0x05, 0x06, 0x07, 0x09, 0x0A, 0x0B];

/// Fixed challenge sent as pairing step 2.
const PAIR_CHALLENGE_A: [u8; 16] = [
    0xEA, 0xBD, 0x47, 0x13, 0x89, 0x35, 0x42, 0xC6, 0x79, 0xEE, 0x07, 0xF2, 0x53, 0x2C, 0x6C,
    0x31,
];

/// Fixed challenge sent as pairing step 3.
const PAIR_CHALLENGE_B: [u8; 16] = [
    0x40, 0xB0, 0x8A, 0x5F, 0xCD, 0x1F, 0x9B, 0x41, 0x12, 0x5C, 0xAC, 0xC6, 0x3F, 0x38, 0xA0,
    0x73,
];

/// Frame a command for handle 0x0014.
pub fn build_command(cmd: u8, subcmd: u8, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(8 + payload.len());
    pkt.extend_from_slice(&[
        cmd,
        REQ_TYPE,
        IFACE_BLE,
        subcmd,
        0x00,
        payload.len() as u8,
        0x00,
        0x00,
    ]);
    pkt.extend_from_slice(payload);
    pkt
}

/// SPI flash read: `size` bytes from `addr`.
pub fn build_spi_read(addr: u32, size: u8) -> Vec<u8> {
    let a = addr.to_le_bytes();
    build_command(
        CMD_SPI_READ,
        0x04,
        &[size, 0x7E, 0x00, 0x00, a[0], a[1], a[2], a[3]],
    )
}

/// Player LED command.
pub fn build_led(mask: u8) -> Vec<u8> {
    build_command(
        CMD_SET_LED,
        0x07,
        &[mask, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
    )
}

/// Declare available features (subcommand 0x02).
pub fn build_feature_configure(flags: u8) -> Vec<u8> {
    build_command(CMD_FEATURE_CTRL, 0x02, &[flags, 0x00, 0x00, 0x00])
}

/// Activate features (subcommand 0x04).
pub fn build_feature_enable(flags: u8) -> Vec<u8> {
    build_command(CMD_FEATURE_CTRL, 0x04, &[flags, 0x00, 0x00, 0x00])
}

/// Pairing step 1: host address followed by the same address with its last
/// byte decremented.
pub fn build_pair_step1(host_addr: [u8; 6]) -> Vec<u8> {
    let mut addr_m1 = host_addr;
    addr_m1[5] = addr_m1[5].wrapping_sub(1);
    let mut payload = vec![0x00, 0x02];
    payload.extend_from_slice(&host_addr);
    payload.extend_from_slice(&addr_m1);
    build_command(CMD_PAIRING, 0x01, &payload)
}

/// Pairing step 2: first fixed challenge.
pub fn build_pair_step2() -> Vec<u8> {
    let mut payload = vec![0x00];
    payload.extend_from_slice(&PAIR_CHALLENGE_A);
    build_command(CMD_PAIRING, 0x04, &payload)
}

/// Pairing step 3: second fixed challenge.
pub fn build_pair_step3() -> Vec<u8> {
    let mut payload = vec![0x00];
    payload.extend_from_slice(&PAIR_CHALLENGE_B);
    build_command(CMD_PAIRING, 0x02, &payload)
}

/// Pairing step 4: finalize.
pub fn build_pair_finalize() -> Vec<u8> {
    build_command(CMD_PAIRING, 0x03, &[0x00])
}

/// Command responses echo the command id in byte 0.
pub fn is_response_to(resp: &[u8], cmd: u8) -> bool {
    resp.first() == Some(&cmd)
}

/// SPI read responses carry a 16-byte header before the flash data.
pub fn spi_payload(resp: &[u8]) -> Option<&[u8]> {
    if resp.len() <= 16 {
        return None;
    }
    Some(&resp[16..])
}

/// Parsed 64-byte pairing block from SPI 0x001FA000.
///
/// Layout: host address at 0x08, candidate EDIV at 0x0E (u16 LE) with the
/// Rand following it, LTK at 0x1A-0x29.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PairingBlock {
    pub host_addr: [u8; 6],
    pub ediv: u16,
    pub rand: [u8; 8],
    pub ltk: [u8; 16],
}

pub fn parse_pairing_block(spi: &[u8]) -> Option<PairingBlock> {
    if spi.len() < 0x30 {
        return None;
    }
    Some(PairingBlock {
        host_addr: spi[0x08..0x0E].try_into().ok()?,
        ediv: u16::from_le_bytes([spi[0x0E], spi[0x0F]]),
        rand: spi[0x10..0x18].try_into().ok()?,
        ltk: spi[0x1A..0x2A].try_into().ok()?,
    })
}

/// Parse `AA:BB:CC:DD:EE:FF` into MSB-first bytes.
pub fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut out = [0u8; 6];
    let mut parts = s.split(':');
    for byte in out.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(out)
}

pub fn format_mac(addr: [u8; 6]) -> String {
    addr.map(|b| format!("{b:02X}")).join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_frame_prefix() {
        let cmd = build_command(0x0C, 0x02, &[0x27, 0x00, 0x00, 0x00]);
        assert_eq!(&cmd[..8], &[0x0C, 0x91, 0x01, 0x02, 0x00, 0x04, 0x00, 0x00]);
        assert_eq!(&cmd[8..], &[0x27, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn spi_read_encodes_address_le() {
        let cmd = build_spi_read(SPI_PAIRING_DATA, 0x40);
        assert_eq!(cmd[0], CMD_SPI_READ);
        assert_eq!(cmd[3], 0x04);
        assert_eq!(cmd[5], 0x08); // payload length
        assert_eq!(&cmd[8..12], &[0x40, 0x7E, 0x00, 0x00]);
        // 0x001FA000 little-endian.
        assert_eq!(&cmd[12..16], &[0x00, 0xA0, 0x1F, 0x00]);
    }

    #[test]
    fn led_command_for_slot_zero() {
        let cmd = build_led(LED_MAP[0]);
        assert_eq!(
            cmd,
            vec![0x09, 0x91, 0x01, 0x07, 0x00, 0x08, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn pair_step1_contains_address_and_decrement() {
        let addr = [0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5];
        let cmd = build_pair_step1(addr);
        assert_eq!(cmd[0], CMD_PAIRING);
        assert_eq!(cmd[3], 0x01);
        assert_eq!(cmd[5], 0x0E); // 2 + 6 + 6
        assert_eq!(&cmd[10..16], &addr);
        assert_eq!(&cmd[16..22], &[0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF4]);
    }

    #[test]
    fn pair_step1_wraps_zero_byte() {
        let addr = [0, 0, 0, 0, 0, 0x00];
        let cmd = build_pair_step1(addr);
        assert_eq!(cmd[21], 0xFF);
    }

    #[test]
    fn pair_challenges_are_17_bytes_of_payload() {
        assert_eq!(build_pair_step2()[5], 0x11);
        assert_eq!(build_pair_step3()[5], 0x11);
        assert_eq!(build_pair_finalize()[5], 0x01);
        assert_eq!(build_pair_step2()[3], 0x04);
        assert_eq!(build_pair_step3()[3], 0x02);
        assert_eq!(build_pair_finalize()[3], 0x03);
    }

    #[test]
    fn pairing_block_extraction() {
        let mut spi = vec![0u8; 0x40];
        spi[0x08..0x0E].copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        spi[0x0E] = 0x34;
        spi[0x0F] = 0x12;
        spi[0x10..0x18].copy_from_slice(&[9; 8]);
        for (i, b) in spi[0x1A..0x2A].iter_mut().enumerate() {
            *b = i as u8;
        }

        let block = parse_pairing_block(&spi).unwrap();
        assert_eq!(block.host_addr, [1, 2, 3, 4, 5, 6]);
        assert_eq!(block.ediv, 0x1234);
        assert_eq!(block.rand, [9; 8]);
        assert_eq!(block.ltk[0], 0);
        assert_eq!(block.ltk[15], 15);

        assert!(parse_pairing_block(&spi[..0x20]).is_none());
    }

    #[test]
    fn spi_payload_strips_header() {
        let mut resp = vec![0u8; 20];
        resp[16] = 0xAB;
        assert_eq!(spi_payload(&resp).unwrap()[0], 0xAB);
        assert!(spi_payload(&resp[..16]).is_none());
    }

    #[test]
    fn mac_round_trip() {
        let addr = parse_mac("3C:A9:AB:60:24:BF").unwrap();
        assert_eq!(addr, [0x3C, 0xA9, 0xAB, 0x60, 0x24, 0xBF]);
        assert_eq!(format_mac(addr), "3C:A9:AB:60:24:BF");
        assert!(parse_mac("3C:A9").is_none());
        assert!(parse_mac("zz:00:00:00:00:00").is_none());
    }
}
