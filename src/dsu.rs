//! DSU (cemuhook) protocol server.
//!
//! UDP input server compatible with Dolphin, Cemu, Yuzu, Ryujinx, and other
//! emulators speaking the cemuhook DSU protocol.
//!
//! Packet header (16 bytes):
//!   [0..4]   Magic: "DSUS" server→client, "DSUC" client→server
//!   [4..6]   Protocol version 1001 (u16 LE)
//!   [6..8]   Payload length (u16 LE)
//!   [8..12]  CRC32 over the whole packet with this field zeroed (u32 LE)
//!   [12..16] Server/client id (u32 LE)
//!
//! The server is process-wide: every DSU virtual pad holds a refcounted
//! handle and the listener stops when the last handle is dropped.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

pub const BASE_PORT: u16 = 26760;
const MAX_PORT_ATTEMPTS: u16 = 5;
const PROTOCOL_VERSION: u16 = 1001;
const HEADER_SIZE: usize = 16;

const MSG_VERSION: u32 = 0x0010_0000;
const MSG_PORTS: u32 = 0x0010_0001;
const MSG_DATA: u32 = 0x0010_0002;

const MODEL_DS4: u8 = 2;
const CONN_TYPE_USB: u8 = 1;
const BATTERY_FULL: u8 = 0x05;

/// Clients stop receiving pad data this long after their last request.
const SUBSCRIBER_TTL: Duration = Duration::from_secs(5);
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// On-wire pad state for one slot, neutral-initialized.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PadState {
    pub buttons1: u8,
    pub buttons2: u8,
    pub ps_button: u8,
    pub touch_button: u8,
    pub lx: u8,
    pub ly: u8,
    pub rx: u8,
    pub ry: u8,
    pub dpad_left: u8,
    pub dpad_down: u8,
    pub dpad_right: u8,
    pub dpad_up: u8,
    pub square: u8,
    pub cross: u8,
    pub circle: u8,
    pub triangle: u8,
    pub r1: u8,
    pub l1: u8,
    pub l_trigger: u8,
    pub r_trigger: u8,
}

impl Default for PadState {
    fn default() -> Self {
        Self {
            buttons1: 0,
            buttons2: 0,
            ps_button: 0,
            touch_button: 0,
            lx: 128,
            ly: 128,
            rx: 128,
            ry: 128,
            dpad_left: 0,
            dpad_down: 0,
            dpad_right: 0,
            dpad_up: 0,
            square: 0,
            cross: 0,
            circle: 0,
            triangle: 0,
            r1: 0,
            l1: 0,
            l_trigger: 0,
            r_trigger: 0,
        }
    }
}

pub type RumbleCallback = Box<dyn Fn(bool) + Send + Sync>;

// ── Packet builders ─────────────────────────────────────────────────

fn build_header(payload_len: usize, server_id: u32) -> Vec<u8> {
    let mut buf = vec![0u8; HEADER_SIZE];
    buf[0..4].copy_from_slice(b"DSUS");
    buf[4..6].copy_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    buf[6..8].copy_from_slice(&(payload_len as u16).to_le_bytes());
    // CRC at [8..12] stays zero until finalize_crc.
    buf[12..16].copy_from_slice(&server_id.to_le_bytes());
    buf
}

/// CRC32 (IEEE) over the full packet with the CRC field held at zero.
fn finalize_crc(packet: &mut [u8]) {
    packet[8..12].fill(0);
    let crc = crc32fast::hash(packet);
    packet[8..12].copy_from_slice(&crc.to_le_bytes());
}

fn build_version_response(server_id: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6);
    payload.extend_from_slice(&MSG_VERSION.to_le_bytes());
    payload.extend_from_slice(&PROTOCOL_VERSION.to_le_bytes());
    let mut packet = build_header(payload.len(), server_id);
    packet.extend_from_slice(&payload);
    finalize_crc(&mut packet);
    packet
}

/// Shared response block: pad id, state, model, connection type, a
/// slot-derived fake MAC, and battery.
fn fill_pad_info(payload: &mut [u8], slot: u8, connected: bool) {
    payload[4] = slot;
    payload[5] = if connected { 0x02 } else { 0x00 };
    payload[6] = MODEL_DS4;
    payload[7] = CONN_TYPE_USB;
    // payload[8..13] stay zero; last MAC byte identifies the slot.
    payload[13] = slot;
    payload[14] = BATTERY_FULL;
}

fn build_port_info(server_id: u32, slot: u8, connected: bool) -> Vec<u8> {
    let mut payload = vec![0u8; 16];
    payload[0..4].copy_from_slice(&MSG_PORTS.to_le_bytes());
    fill_pad_info(&mut payload, slot, connected);
    let mut packet = build_header(payload.len(), server_id);
    packet.extend_from_slice(&payload);
    finalize_crc(&mut packet);
    packet
}

/// Pad data payload layout (84 bytes, offsets relative to payload start):
///    0- 3: message type
///    4-14: shared pad info
///      15: active flag
///   16-19: packet number (u32 LE)
///      20: buttons byte 1 (Share, L3, R3, Options, dpad)
///      21: buttons byte 2 (L2, R2, L1, R1, face buttons)
///      22: PS button, 23: touch button
///   24-27: sticks LX, LY, RX, RY
///   28-39: analog pressure (dpad, face, shoulders, triggers)
///   40-51: touch points (zeroed, not applicable)
///   52-59: motion timestamp (u64 LE microseconds)
///   60-83: accelerometer + gyro (zeroed, not applicable)
fn build_pad_data(
    server_id: u32,
    slot: u8,
    connected: bool,
    counter: u32,
    state: &PadState,
    timestamp_us: u64,
) -> Vec<u8> {
    let mut payload = vec![0u8; 84];
    payload[0..4].copy_from_slice(&MSG_DATA.to_le_bytes());
    fill_pad_info(&mut payload, slot, connected);
    payload[15] = connected as u8;
    payload[16..20].copy_from_slice(&counter.to_le_bytes());

    payload[20] = state.buttons1;
    payload[21] = state.buttons2;
    payload[22] = state.ps_button;
    payload[23] = state.touch_button;

    payload[24] = state.lx;
    payload[25] = state.ly;
    payload[26] = state.rx;
    payload[27] = state.ry;

    payload[28] = state.dpad_left;
    payload[29] = state.dpad_down;
    payload[30] = state.dpad_right;
    payload[31] = state.dpad_up;
    payload[32] = state.square;
    payload[33] = state.cross;
    payload[34] = state.circle;
    payload[35] = state.triangle;
    payload[36] = state.r1;
    payload[37] = state.l1;
    payload[38] = state.r_trigger;
    payload[39] = state.l_trigger;

    payload[52..60].copy_from_slice(&timestamp_us.to_le_bytes());

    let mut packet = build_header(payload.len(), server_id);
    packet.extend_from_slice(&payload);
    finalize_crc(&mut packet);
    packet
}

fn prune_expired(subscribers: &mut HashMap<SocketAddr, Instant>, now: Instant) {
    subscribers.retain(|_, expiry| *expiry >= now);
}

// ── Server ──────────────────────────────────────────────────────────

struct SlotShared {
    connected: bool,
    state: PadState,
}

struct Shared {
    server_id: u32,
    port: u16,
    sock: UdpSocket,
    running: AtomicBool,
    slots: Mutex<[SlotShared; 4]>,
    // Single writer per slot, so a plain atomic is enough.
    counters: [AtomicU32; 4],
    subscribers: Mutex<HashMap<SocketAddr, Instant>>,
    rumble: Mutex<[Option<RumbleCallback>; 4]>,
}

struct Inner {
    shared: Arc<Shared>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.listener.lock().unwrap().take() {
            let _ = handle.join();
        }
        info!("[DSU] Server stopped");
    }
}

/// Refcounted handle to the process-wide DSU server.
///
/// [`DsuServer::acquire`] starts the listener on first use and returns a
/// handle; the listener shuts down when the last handle drops.
#[derive(Clone)]
pub struct DsuServer {
    inner: Arc<Inner>,
}

static ACTIVE: Mutex<Weak<Inner>> = Mutex::new(Weak::new());

impl DsuServer {
    pub fn acquire() -> io::Result<DsuServer> {
        let mut registry = ACTIVE.lock().unwrap();
        if let Some(inner) = registry.upgrade() {
            return Ok(DsuServer { inner });
        }

        let shared = Arc::new(Shared::bind()?);
        let listener_shared = shared.clone();
        let listener = std::thread::Builder::new()
            .name("dsu-listener".into())
            .spawn(move || listen_loop(&listener_shared))
            .map_err(io::Error::other)?;

        let inner = Arc::new(Inner {
            shared,
            listener: Mutex::new(Some(listener)),
        });
        *registry = Arc::downgrade(&inner);
        Ok(DsuServer { inner })
    }

    pub fn port(&self) -> u16 {
        self.inner.shared.port
    }

    pub fn set_slot_connected(&self, slot: usize, connected: bool) {
        let mut slots = self.inner.shared.slots.lock().unwrap();
        slots[slot].connected = connected;
        if !connected {
            slots[slot].state = PadState::default();
            self.inner.shared.counters[slot].store(0, Ordering::Relaxed);
        }
    }

    /// Register the rumble callback for a slot.
    ///
    /// The DSU rumble ingress format is not decoded yet; the registry exists
    /// so backends can already wire their callbacks.
    pub fn set_rumble_callback(&self, slot: usize, callback: Option<RumbleCallback>) {
        self.inner.shared.rumble.lock().unwrap()[slot] = callback;
    }

    /// Invoke a slot's registered rumble callback. The listener will call
    /// this once the rumble ingress is decoded; until then backends drive
    /// it directly.
    pub fn notify_rumble(&self, slot: usize, on: bool) {
        if let Some(cb) = &self.inner.shared.rumble.lock().unwrap()[slot] {
            cb(on);
        }
    }

    /// Push new state for a slot and stream it to all live subscribers.
    pub fn update_slot(&self, slot: usize, state: &PadState) {
        let shared = &self.inner.shared;
        let (connected, state) = {
            let mut slots = shared.slots.lock().unwrap();
            slots[slot].state = *state;
            (slots[slot].connected, slots[slot].state)
        };
        let counter = shared.counters[slot].fetch_add(1, Ordering::Relaxed) + 1;
        let packet = build_pad_data(
            shared.server_id,
            slot as u8,
            connected,
            counter,
            &state,
            unix_micros(),
        );

        let now = Instant::now();
        let mut subscribers = shared.subscribers.lock().unwrap();
        prune_expired(&mut subscribers, now);
        for addr in subscribers.keys() {
            // Per-subscriber send failures are not our problem.
            let _ = shared.sock.send_to(&packet, addr);
        }
    }
}

impl Shared {
    fn bind() -> io::Result<Shared> {
        let mut bound = None;
        for offset in 0..MAX_PORT_ATTEMPTS {
            let port = BASE_PORT + offset;
            match UdpSocket::bind(("127.0.0.1", port)) {
                Ok(sock) => {
                    bound = Some((sock, port));
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => continue,
                Err(e) => return Err(e),
            }
        }
        let Some((sock, port)) = bound else {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!(
                    "no free DSU port in {}-{}",
                    BASE_PORT,
                    BASE_PORT + MAX_PORT_ATTEMPTS - 1
                ),
            ));
        };
        sock.set_read_timeout(Some(RECV_TIMEOUT))?;
        info!("[DSU] Listening on 127.0.0.1:{port}");

        let server_id = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as u32;

        Ok(Shared {
            server_id,
            port,
            sock,
            running: AtomicBool::new(true),
            slots: Mutex::new(std::array::from_fn(|_| SlotShared {
                connected: false,
                state: PadState::default(),
            })),
            counters: Default::default(),
            subscribers: Mutex::new(HashMap::new()),
            rumble: Mutex::new(Default::default()),
        })
    }
}

fn unix_micros() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn listen_loop(shared: &Shared) {
    let mut buf = [0u8; 1024];
    let mut seen: std::collections::HashSet<SocketAddr> = std::collections::HashSet::new();

    while shared.running.load(Ordering::SeqCst) {
        let (len, addr) = match shared.sock.recv_from(&mut buf) {
            Ok(r) => r,
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut =>
            {
                continue
            }
            Err(e) => {
                if shared.running.load(Ordering::SeqCst) {
                    warn!("[DSU] recv error: {e}");
                }
                continue;
            }
        };

        let data = &buf[..len];
        if data.len() < HEADER_SIZE || &data[0..4] != b"DSUC" {
            continue;
        }
        if seen.insert(addr) {
            info!("[DSU] Client connected from {addr}");
        }

        let msg_type = if data.len() >= HEADER_SIZE + 4 {
            u32::from_le_bytes([data[16], data[17], data[18], data[19]])
        } else {
            0
        };

        match msg_type {
            MSG_VERSION => {
                let resp = build_version_response(shared.server_id);
                let _ = shared.sock.send_to(&resp, addr);
            }
            MSG_PORTS => handle_port_request(shared, data, addr),
            MSG_DATA => {
                let mut subscribers = shared.subscribers.lock().unwrap();
                subscribers.insert(addr, Instant::now() + SUBSCRIBER_TTL);
            }
            other => debug!("[DSU] Unknown message type {other:#010X} from {addr}"),
        }
    }
}

fn handle_port_request(shared: &Shared, data: &[u8], addr: SocketAddr) {
    if data.len() < 24 {
        return;
    }
    let num_pads = u32::from_le_bytes([data[20], data[21], data[22], data[23]]) as usize;
    let slots = shared.slots.lock().unwrap();
    for i in 0..num_pads.min(4) {
        let Some(&slot) = data.get(24 + i) else { break };
        if let Some(entry) = slots.get(slot as usize) {
            let resp = build_port_info(shared.server_id, slot, entry.connected);
            let _ = shared.sock.send_to(&resp, addr);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check_crc(packet: &[u8]) -> bool {
        let stored = u32::from_le_bytes([packet[8], packet[9], packet[10], packet[11]]);
        let mut copy = packet.to_vec();
        copy[8..12].fill(0);
        crc32fast::hash(&copy) == stored
    }

    #[test]
    fn version_response_layout() {
        let packet = build_version_response(0xDEAD_BEEF);
        assert_eq!(packet.len(), 22);
        assert_eq!(&packet[0..4], b"DSUS");
        assert_eq!(u16::from_le_bytes([packet[4], packet[5]]), 1001);
        assert_eq!(u16::from_le_bytes([packet[6], packet[7]]), 6);
        assert_eq!(
            u32::from_le_bytes([packet[12], packet[13], packet[14], packet[15]]),
            0xDEAD_BEEF
        );
        assert_eq!(
            u32::from_le_bytes([packet[16], packet[17], packet[18], packet[19]]),
            MSG_VERSION
        );
        // Max supported protocol version in the payload.
        assert_eq!(u16::from_le_bytes([packet[20], packet[21]]), 1001);
        assert!(check_crc(&packet));
    }

    #[test]
    fn port_info_layout() {
        let packet = build_port_info(1, 2, true);
        assert_eq!(packet.len(), HEADER_SIZE + 16);
        let payload = &packet[HEADER_SIZE..];
        assert_eq!(payload[4], 2); // pad id
        assert_eq!(payload[5], 0x02); // connected
        assert_eq!(payload[6], MODEL_DS4);
        assert_eq!(payload[7], CONN_TYPE_USB);
        assert_eq!(payload[13], 2); // fake MAC low byte
        assert_eq!(payload[14], BATTERY_FULL);
        assert!(check_crc(&packet));

        let disconnected = build_port_info(1, 0, false);
        assert_eq!(disconnected[HEADER_SIZE + 5], 0x00);
    }

    #[test]
    fn pad_data_neutral_sticks_are_centered() {
        let state = PadState::default();
        let packet = build_pad_data(7, 0, true, 1, &state, 42);
        assert_eq!(packet.len(), HEADER_SIZE + 84);
        let payload = &packet[HEADER_SIZE..];
        assert_eq!(&payload[24..28], &[128, 128, 128, 128]);
        assert_eq!(payload[15], 1);
        assert_eq!(
            u32::from_le_bytes([payload[16], payload[17], payload[18], payload[19]]),
            1
        );
        assert_eq!(
            u64::from_le_bytes(payload[52..60].try_into().unwrap()),
            42
        );
        assert!(check_crc(&packet));
    }

    #[test]
    fn pad_data_buttons_and_triggers() {
        let mut state = PadState::default();
        state.buttons1 = 0x10; // dpad up bit
        state.buttons2 = 0x40; // cross bit
        state.cross = 255;
        state.l_trigger = 204;
        state.r_trigger = 11;
        let packet = build_pad_data(7, 3, true, 99, &state, 0);
        let payload = &packet[HEADER_SIZE..];
        assert_eq!(payload[20], 0x10);
        assert_eq!(payload[21], 0x40);
        assert_eq!(payload[33], 255); // cross pressure
        assert_eq!(payload[38], 11); // R2 analog
        assert_eq!(payload[39], 204); // L2 analog
        assert!(check_crc(&packet));
    }

    #[test]
    fn crc_detects_corruption() {
        let mut packet = build_version_response(1);
        assert!(check_crc(&packet));
        packet[20] ^= 0xFF;
        assert!(!check_crc(&packet));
    }

    #[test]
    fn subscribers_expire_after_ttl() {
        let mut subs = HashMap::new();
        let now = Instant::now();
        let a: SocketAddr = "127.0.0.1:1001".parse().unwrap();
        let b: SocketAddr = "127.0.0.1:1002".parse().unwrap();
        subs.insert(a, now + SUBSCRIBER_TTL);
        subs.insert(b, now - Duration::from_millis(1));

        prune_expired(&mut subs, now);
        assert!(subs.contains_key(&a));
        assert!(!subs.contains_key(&b));

        // After the TTL window the remaining one goes too.
        prune_expired(&mut subs, now + SUBSCRIBER_TTL + Duration::from_millis(1));
        assert!(subs.is_empty());
    }

    #[test]
    fn server_refcount_lifecycle() {
        let first = DsuServer::acquire().expect("bind");
        let port = first.port();
        let second = DsuServer::acquire().expect("second handle");
        // Both handles see the same listener.
        assert_eq!(second.port(), port);

        first.set_slot_connected(0, true);
        let mut state = PadState::default();
        state.lx = 255;
        first.update_slot(0, &state);

        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        first.set_rumble_callback(0, Some(Box::new(move |on| flag.store(on, Ordering::SeqCst))));
        first.notify_rumble(0, true);
        assert!(fired.load(Ordering::SeqCst));

        drop(first);
        // Still alive through the second handle.
        second.update_slot(0, &PadState::default());
        drop(second);

        // A fresh acquire starts a new listener (same or nearby port).
        let third = DsuServer::acquire().expect("restart");
        assert!(third.port() >= BASE_PORT && third.port() < BASE_PORT + MAX_PORT_ATTEMPTS);
    }
}
