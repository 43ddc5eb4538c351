//! HCI user-channel transport.
//!
//! A raw `AF_BLUETOOTH` socket bound to `HCI_CHANNEL_USER` gives us the
//! adapter exclusively, bypassing bluetoothd (which must not hold the
//! adapter — same requirement as the original tooling). On top of the
//! socket this module frames HCI command/ACL packets and parses the small
//! set of events the central cares about.
//!
//! Wire framing (H4): packets are prefixed with an indicator byte,
//! 0x01 command / 0x02 ACL data / 0x04 event.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;

pub const PKT_COMMAND: u8 = 0x01;
pub const PKT_ACL: u8 = 0x02;
pub const PKT_EVENT: u8 = 0x04;

// L2CAP fixed channels on LE.
pub const CID_ATT: u16 = 0x0004;
pub const CID_SMP: u16 = 0x0006;

const BTPROTO_HCI: libc::c_int = 1;
const HCI_CHANNEL_USER: u16 = 1;

// Opcodes: (OGF << 10) | OCF.
pub const OP_RESET: u16 = 0x0C03;
pub const OP_SET_EVENT_MASK: u16 = 0x0C01;
pub const OP_READ_BD_ADDR: u16 = 0x1009;
pub const OP_DISCONNECT: u16 = 0x0406;
pub const OP_LE_SET_EVENT_MASK: u16 = 0x2001;
pub const OP_LE_SET_SCAN_PARAMS: u16 = 0x200B;
pub const OP_LE_SET_SCAN_ENABLE: u16 = 0x200C;
pub const OP_LE_CREATE_CONN: u16 = 0x200D;
pub const OP_LE_CREATE_CONN_CANCEL: u16 = 0x200E;
pub const OP_LE_START_ENCRYPTION: u16 = 0x2019;

#[repr(C)]
struct SockaddrHci {
    hci_family: libc::sa_family_t,
    hci_dev: u16,
    hci_channel: u16,
}

/// Exclusive user-channel handle on one adapter.
pub struct HciSocket {
    fd: OwnedFd,
}

impl HciSocket {
    pub fn open(dev_id: u16) -> io::Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_BLUETOOTH,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                BTPROTO_HCI,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let addr = SockaddrHci {
            hci_family: libc::AF_BLUETOOTH as libc::sa_family_t,
            hci_dev: dev_id,
            hci_channel: HCI_CHANNEL_USER,
        };
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const SockaddrHci as *const libc::sockaddr,
                std::mem::size_of::<SockaddrHci>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self { fd })
    }

    /// Write one framed packet. Packets are small; a short write is an
    /// error here.
    pub fn send(&self, packet: &[u8]) -> io::Result<()> {
        let n = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                packet.as_ptr() as *const libc::c_void,
                packet.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != packet.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short HCI write"));
        }
        Ok(())
    }

    /// Receive one packet, or `None` on timeout.
    pub fn recv(&self, timeout: Duration) -> io::Result<Option<Vec<u8>>> {
        let mut pfd = libc::pollfd {
            fd: self.fd.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(e);
        }
        if rc == 0 {
            return Ok(None);
        }

        let mut buf = vec![0u8; 1024];
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        buf.truncate(n as usize);
        Ok(Some(buf))
    }
}

// ── Packet builders ─────────────────────────────────────────────────

pub fn command_packet(opcode: u16, params: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(4 + params.len());
    pkt.push(PKT_COMMAND);
    pkt.extend_from_slice(&opcode.to_le_bytes());
    pkt.push(params.len() as u8);
    pkt.extend_from_slice(params);
    pkt
}

/// One complete L2CAP frame in a single ACL packet (our PDUs all fit well
/// inside the minimum LE data length).
pub fn acl_packet(conn_handle: u16, cid: u16, payload: &[u8]) -> Vec<u8> {
    let mut pkt = Vec::with_capacity(9 + payload.len());
    pkt.push(PKT_ACL);
    pkt.extend_from_slice(&(conn_handle & 0x0FFF).to_le_bytes());
    pkt.extend_from_slice(&((payload.len() + 4) as u16).to_le_bytes());
    pkt.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    pkt.extend_from_slice(&cid.to_le_bytes());
    pkt.extend_from_slice(payload);
    pkt
}

pub fn cmd_reset() -> Vec<u8> {
    command_packet(OP_RESET, &[])
}

pub fn cmd_set_event_mask() -> Vec<u8> {
    // Everything on, including LE meta events.
    command_packet(OP_SET_EVENT_MASK, &[0xFF; 8])
}

pub fn cmd_le_set_event_mask() -> Vec<u8> {
    command_packet(OP_LE_SET_EVENT_MASK, &[0xFF, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00])
}

pub fn cmd_le_scan_params() -> Vec<u8> {
    // Active scan, interval 60 ms, window 30 ms, public own address.
    let mut p = Vec::new();
    p.push(0x01);
    p.extend_from_slice(&0x0060u16.to_le_bytes());
    p.extend_from_slice(&0x0030u16.to_le_bytes());
    p.push(0x00);
    p.push(0x00);
    command_packet(OP_LE_SET_SCAN_PARAMS, &p)
}

pub fn cmd_le_scan_enable(enable: bool) -> Vec<u8> {
    command_packet(OP_LE_SET_SCAN_ENABLE, &[enable as u8, 0x00])
}

/// Connection parameters fixed by the SW2 link requirements:
/// interval 15-30 ms, latency 0, supervision timeout 5 s.
pub fn cmd_le_create_connection(peer: [u8; 6], peer_addr_type: u8) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&0x0060u16.to_le_bytes()); // scan interval
    p.extend_from_slice(&0x0030u16.to_le_bytes()); // scan window
    p.push(0x00); // no allow list
    p.push(peer_addr_type);
    p.extend_from_slice(&peer); // LE byte order (LSB first)
    p.push(0x00); // own address type: public
    p.extend_from_slice(&12u16.to_le_bytes()); // interval min: 15 ms / 1.25
    p.extend_from_slice(&24u16.to_le_bytes()); // interval max: 30 ms / 1.25
    p.extend_from_slice(&0u16.to_le_bytes()); // latency
    p.extend_from_slice(&500u16.to_le_bytes()); // supervision: 5 s / 10 ms
    p.extend_from_slice(&0u16.to_le_bytes()); // CE min
    p.extend_from_slice(&0u16.to_le_bytes()); // CE max
    command_packet(OP_LE_CREATE_CONN, &p)
}

pub fn cmd_le_start_encryption(
    conn_handle: u16,
    rand: [u8; 8],
    ediv: u16,
    ltk: [u8; 16],
) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&conn_handle.to_le_bytes());
    p.extend_from_slice(&rand);
    p.extend_from_slice(&ediv.to_le_bytes());
    p.extend_from_slice(&ltk);
    command_packet(OP_LE_START_ENCRYPTION, &p)
}

pub fn cmd_disconnect(conn_handle: u16) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&conn_handle.to_le_bytes());
    p.push(0x13); // remote user terminated
    command_packet(OP_DISCONNECT, &p)
}

// ── Packet parsing ──────────────────────────────────────────────────

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HciEvent {
    CommandComplete {
        opcode: u16,
        status: u8,
        /// Return parameters after the status byte.
        ret: Vec<u8>,
    },
    CommandStatus {
        opcode: u16,
        status: u8,
    },
    DisconnectionComplete {
        handle: u16,
        reason: u8,
    },
    EncryptionChange {
        handle: u16,
        status: u8,
        enabled: bool,
    },
    LeConnectionComplete {
        status: u8,
        handle: u16,
        peer: [u8; 6],
    },
    /// First report of an advertising event: peer address (LE byte order)
    /// and address type.
    LeAdvertisingReport {
        addr: [u8; 6],
        addr_type: u8,
    },
    Other {
        code: u8,
    },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HciPacket {
    Event(HciEvent),
    Acl {
        handle: u16,
        /// Packet-boundary flag: 0b01 = continuation fragment.
        pb: u8,
        data: Vec<u8>,
    },
    Other,
}

pub fn parse_packet(raw: &[u8]) -> Option<HciPacket> {
    match *raw.first()? {
        PKT_EVENT => {
            let code = *raw.get(1)?;
            let len = *raw.get(2)? as usize;
            let params = raw.get(3..3 + len)?;
            Some(HciPacket::Event(parse_event(code, params)?))
        }
        PKT_ACL => {
            if raw.len() < 5 {
                return None;
            }
            let hf = u16::from_le_bytes([raw[1], raw[2]]);
            let len = u16::from_le_bytes([raw[3], raw[4]]) as usize;
            let data = raw.get(5..5 + len)?.to_vec();
            Some(HciPacket::Acl {
                handle: hf & 0x0FFF,
                pb: ((hf >> 12) & 0x3) as u8,
                data,
            })
        }
        _ => Some(HciPacket::Other),
    }
}

fn parse_event(code: u8, p: &[u8]) -> Option<HciEvent> {
    Some(match code {
        0x0E => HciEvent::CommandComplete {
            opcode: u16::from_le_bytes([*p.get(1)?, *p.get(2)?]),
            status: p.get(3).copied().unwrap_or(0),
            ret: p.get(4..).map(<[u8]>::to_vec).unwrap_or_default(),
        },
        0x0F => HciEvent::CommandStatus {
            opcode: u16::from_le_bytes([*p.get(2)?, *p.get(3)?]),
            status: *p.first()?,
        },
        0x05 => HciEvent::DisconnectionComplete {
            handle: u16::from_le_bytes([*p.get(1)?, *p.get(2)?]),
            reason: *p.get(3)?,
        },
        0x08 => HciEvent::EncryptionChange {
            status: *p.first()?,
            handle: u16::from_le_bytes([*p.get(1)?, *p.get(2)?]),
            enabled: *p.get(3)? != 0,
        },
        0x3E => match *p.first()? {
            0x01 => HciEvent::LeConnectionComplete {
                status: *p.get(1)?,
                handle: u16::from_le_bytes([*p.get(2)?, *p.get(3)?]),
                peer: p.get(6..12)?.try_into().ok()?,
            },
            0x02 => HciEvent::LeAdvertisingReport {
                addr_type: *p.get(3)?,
                addr: p.get(4..10)?.try_into().ok()?,
            },
            _ => HciEvent::Other { code },
        },
        other => HciEvent::Other { code: other },
    })
}

/// Reassembles fragmented ACL data into complete L2CAP frames.
#[derive(Default)]
pub struct AclAssembler {
    cid: u16,
    expected: usize,
    buf: Vec<u8>,
}

impl AclAssembler {
    /// Push one ACL fragment; returns `(cid, payload)` when a full L2CAP
    /// frame is available.
    pub fn push(&mut self, pb: u8, data: &[u8]) -> Option<(u16, Vec<u8>)> {
        if pb & 0x1 == 0 {
            // First fragment: starts with the L2CAP header.
            if data.len() < 4 {
                return None;
            }
            self.expected = u16::from_le_bytes([data[0], data[1]]) as usize;
            self.cid = u16::from_le_bytes([data[2], data[3]]);
            self.buf = data[4..].to_vec();
        } else {
            self.buf.extend_from_slice(data);
        }

        if self.buf.len() >= self.expected {
            let mut out = std::mem::take(&mut self.buf);
            out.truncate(self.expected);
            self.expected = 0;
            Some((self.cid, out))
        } else {
            None
        }
    }
}
