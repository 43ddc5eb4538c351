//! Minimal ATT client PDUs.
//!
//! The SW2 protocol uses fixed handles, so there is no discovery here:
//! just MTU exchange, the two write flavors, and handle-value
//! notifications.

pub const OP_ERROR_RSP: u8 = 0x01;
pub const OP_MTU_REQ: u8 = 0x02;
pub const OP_MTU_RSP: u8 = 0x03;
pub const OP_WRITE_REQ: u8 = 0x12;
pub const OP_WRITE_RSP: u8 = 0x13;
pub const OP_NOTIFY: u8 = 0x1B;
pub const OP_WRITE_CMD: u8 = 0x52;

/// Input reports are 63 bytes; the default 23-byte MTU silently loses
/// notifications, so the exchange requests far more than needed.
pub const REQUESTED_MTU: u16 = 512;

pub fn mtu_request(mtu: u16) -> Vec<u8> {
    let mut pdu = vec![OP_MTU_REQ];
    pdu.extend_from_slice(&mtu.to_le_bytes());
    pdu
}

/// Write Request: expects a Write Response.
pub fn write_request(handle: u16, value: &[u8]) -> Vec<u8> {
    let mut pdu = vec![OP_WRITE_REQ];
    pdu.extend_from_slice(&handle.to_le_bytes());
    pdu.extend_from_slice(value);
    pdu
}

/// Write Command: no response (the SW2 command channel).
pub fn write_command(handle: u16, value: &[u8]) -> Vec<u8> {
    let mut pdu = vec![OP_WRITE_CMD];
    pdu.extend_from_slice(&handle.to_le_bytes());
    pdu.extend_from_slice(value);
    pdu
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttPdu {
    MtuResponse(u16),
    WriteResponse,
    Notification { handle: u16, value: Vec<u8> },
    Error { request: u8, handle: u16, code: u8 },
    Other(u8),
}

pub fn parse(data: &[u8]) -> Option<AttPdu> {
    match *data.first()? {
        OP_MTU_RSP => Some(AttPdu::MtuResponse(u16::from_le_bytes([
            *data.get(1)?,
            *data.get(2)?,
        ]))),
        OP_WRITE_RSP => Some(AttPdu::WriteResponse),
        OP_NOTIFY => Some(AttPdu::Notification {
            handle: u16::from_le_bytes([*data.get(1)?, *data.get(2)?]),
            value: data.get(3..)?.to_vec(),
        }),
        OP_ERROR_RSP => Some(AttPdu::Error {
            request: *data.get(1)?,
            handle: u16::from_le_bytes([*data.get(2)?, *data.get(3)?]),
            code: *data.get(4)?,
        }),
        other => Some(AttPdu::Other(other)),
    }
}
