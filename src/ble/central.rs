//! SW2 central: scan, connect, secure the link, run the proprietary
//! handshake, then stream input notifications into the slot's frame queue.
//!
//! Two threads per connection: a reader that parses HCI traffic and routes
//! it (input notifications → frame queue, command responses → their own
//! channel, everything else → the sequencer), and the worker thread that
//! drives the connect sequence as plain blocking code. Each command awaits
//! its response channel with a 3 s timeout, which is the native shape of
//! the coroutine-style handshake the protocol was reverse-engineered from.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::ble::att::{self, AttPdu};
use crate::ble::hci::{
    self, AclAssembler, HciEvent, HciPacket, HciSocket, CID_ATT, CID_SMP,
};
use crate::ble::protocol::{self, format_mac};
use crate::ble::smp::{self, LegacyPairing, Outcome};
use crate::error::{GcError, Result};
use crate::events::EventBus;
use crate::input::BLE_REPORT_LEN;

const CMD_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const ENCRYPT_TIMEOUT: Duration = Duration::from_secs(5);
const POLL: Duration = Duration::from_millis(100);

/// Fallback host address when the adapter won't report one.
const FALLBACK_HOST_ADDR: [u8; 6] = [0xF0, 0xF1, 0xF2, 0xF3, 0xF4, 0xF5];

#[derive(Clone, Debug)]
pub struct Sw2Config {
    pub adapter: u16,
    /// Target MAC, MSB-first.
    pub target: [u8; 6],
    pub slot: usize,
}

/// Messages the reader routes to the sequencer.
enum Link {
    Event(HciEvent),
    Att(AttPdu),
    Smp(Vec<u8>),
    /// Socket-level failure; the link is dead.
    Gone(String),
}

/// Handle on a running BLE worker.
pub struct BleWorker {
    handle: Option<JoinHandle<()>>,
}

impl BleWorker {
    /// Spawn the connection worker. Decoded 63-byte reports land in
    /// `frames`; `stop` aborts scanning, the handshake, or streaming.
    pub fn spawn(
        cfg: Sw2Config,
        events: EventBus,
        frames: SyncSender<[u8; BLE_REPORT_LEN]>,
        stop: Arc<AtomicBool>,
    ) -> BleWorker {
        let handle = std::thread::Builder::new()
            .name(format!("ble-worker-{}", cfg.slot))
            .spawn(move || {
                let slot = cfg.slot;
                let user_stop = stop.clone();
                match run_connection(cfg, &events, frames, stop) {
                    Ok(()) => info!("[BLE] Worker for slot {slot} finished"),
                    Err(e) => {
                        warn!("[BLE] Slot {slot}: {e}");
                        events.status(slot, format!("{e}"));
                    }
                }
                if !user_stop.load(Ordering::SeqCst) {
                    events.disconnected(slot);
                }
            })
            .expect("spawn BLE worker");
        BleWorker {
            handle: Some(handle),
        }
    }

    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Buffered receiver so waiting for one message kind never drops another.
struct LinkWaiter {
    rx: Receiver<Link>,
    stash: VecDeque<Link>,
}

impl LinkWaiter {
    fn new(rx: Receiver<Link>) -> Self {
        Self {
            rx,
            stash: VecDeque::new(),
        }
    }

    fn wait(&mut self, timeout: Duration, mut pred: impl FnMut(&Link) -> bool) -> Option<Link> {
        if let Some(pos) = self.stash.iter().position(&mut pred) {
            return self.stash.remove(pos);
        }
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.checked_duration_since(Instant::now())?;
            match self.rx.recv_timeout(left) {
                Ok(msg) if pred(&msg) => return Some(msg),
                Ok(msg) => {
                    self.stash.push_back(msg);
                    // Advertising floods must not pin the stash.
                    while self.stash.len() > 256 {
                        self.stash.pop_front();
                    }
                }
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    fn wait_event(
        &mut self,
        timeout: Duration,
        mut pred: impl FnMut(&HciEvent) -> bool,
    ) -> Option<HciEvent> {
        match self.wait(timeout, |m| matches!(m, Link::Event(e) if pred(e)))? {
            Link::Event(e) => Some(e),
            _ => unreachable!(),
        }
    }
}

struct Sequencer {
    sock: Arc<HciSocket>,
    link: LinkWaiter,
    cmd_resp: Receiver<Vec<u8>>,
    conn_handle: u16,
    encrypted: bool,
}

impl Sequencer {
    fn send(&self, packet: &[u8]) -> Result<()> {
        self.sock
            .send(packet)
            .map_err(|e| GcError::Transport(format!("HCI send: {e}")))
    }

    fn send_att(&self, pdu: &[u8]) -> Result<()> {
        self.send(&hci::acl_packet(self.conn_handle, CID_ATT, pdu))
    }

    fn send_smp(&self, pdu: &[u8]) -> Result<()> {
        self.send(&hci::acl_packet(self.conn_handle, CID_SMP, pdu))
    }

    /// Write Request + wait for the Write Response.
    fn write_handle(&mut self, handle: u16, value: &[u8]) -> Result<()> {
        self.send_att(&att::write_request(handle, value))?;
        let got = self.link.wait(CMD_RESPONSE_TIMEOUT, |m| {
            matches!(
                m,
                Link::Att(AttPdu::WriteResponse) | Link::Att(AttPdu::Error { .. })
            )
        });
        match got {
            Some(Link::Att(AttPdu::WriteResponse)) => Ok(()),
            Some(Link::Att(AttPdu::Error { code, .. })) => Err(GcError::Protocol(format!(
                "write to {handle:#06X} rejected (ATT error {code:#04X})"
            ))),
            _ => Err(GcError::Protocol(format!(
                "write to {handle:#06X} timed out"
            ))),
        }
    }

    /// SW2 command on the command channel + wait for its 0x001A response.
    fn command(&mut self, frame: &[u8], timeout: Duration) -> Option<Vec<u8>> {
        let cmd_id = frame[0];
        if let Err(e) = self.send_att(&att::write_command(protocol::H_CMD_WRITE, frame)) {
            warn!("[BLE] Command {cmd_id:#04X} send failed: {e}");
            return None;
        }
        let deadline = Instant::now() + timeout;
        loop {
            let left = deadline.checked_duration_since(Instant::now())?;
            match self.cmd_resp.recv_timeout(left) {
                Ok(resp) if protocol::is_response_to(&resp, cmd_id) => return Some(resp),
                Ok(resp) => debug!("[BLE] Stray response {:02X?}", resp.first()),
                Err(_) => return None,
            }
        }
    }

    fn start_encryption(&mut self, rand: [u8; 8], ediv: u16, ltk: [u8; 16]) -> bool {
        if self
            .send(&hci::cmd_le_start_encryption(self.conn_handle, rand, ediv, ltk))
            .is_err()
        {
            return false;
        }
        match self.link.wait_event(ENCRYPT_TIMEOUT, |e| {
            matches!(e, HciEvent::EncryptionChange { .. })
        }) {
            Some(HciEvent::EncryptionChange {
                status, enabled, ..
            }) => {
                if status == 0 && enabled {
                    self.encrypted = true;
                }
                self.encrypted
            }
            _ => false,
        }
    }
}

fn run_connection(
    cfg: Sw2Config,
    events: &EventBus,
    frames: SyncSender<[u8; BLE_REPORT_LEN]>,
    stop: Arc<AtomicBool>,
) -> Result<()> {
    let slot = cfg.slot;
    let sock = Arc::new(HciSocket::open(cfg.adapter).map_err(|e| {
        GcError::Transport(format!(
            "open HCI user channel on hci{}: {e} (the adapter must not be held by bluetoothd)",
            cfg.adapter
        ))
    })?);

    // Reader thread: owns packet parsing and routing.
    let (link_tx, link_rx) = mpsc::channel();
    let (cmd_tx, cmd_rx) = mpsc::channel();
    let reader_stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let sock = sock.clone();
        let reader_stop = reader_stop.clone();
        let user_stop = stop.clone();
        let frames = frames.clone();
        std::thread::Builder::new()
            .name(format!("ble-reader-{slot}"))
            .spawn(move || reader_loop(&sock, &reader_stop, &user_stop, &link_tx, &cmd_tx, &frames))
            .expect("spawn BLE reader")
    };

    let result = (|| -> Result<()> {
        let mut seq = Sequencer {
            sock: sock.clone(),
            link: LinkWaiter::new(link_rx),
            cmd_resp: cmd_rx,
            conn_handle: 0,
            encrypted: false,
        };

        // Bring the controller up.
        seq.send(&hci::cmd_reset())?;
        seq.link
            .wait_event(Duration::from_secs(2), |e| {
                matches!(e, HciEvent::CommandComplete { opcode, .. } if *opcode == hci::OP_RESET)
            })
            .ok_or_else(|| GcError::Transport("HCI reset timed out".into()))?;
        seq.send(&hci::cmd_set_event_mask())?;
        seq.send(&hci::cmd_le_set_event_mask())?;

        let host_addr = read_host_address(&mut seq);

        // 1. Scan until the target advertises (or the user gives up).
        events.status(slot, format!("Scanning for {}...", format_mac(cfg.target)));
        events.progress(slot, 10);
        let mut target_le = cfg.target;
        target_le.reverse();
        seq.send(&hci::cmd_le_scan_params())?;
        seq.send(&hci::cmd_le_scan_enable(true))?;
        let addr_type = loop {
            if stop.load(Ordering::SeqCst) {
                let _ = seq.send(&hci::cmd_le_scan_enable(false));
                return Ok(());
            }
            let found = seq.link.wait_event(Duration::from_millis(500), |e| {
                matches!(e, HciEvent::LeAdvertisingReport { addr, .. } if *addr == target_le)
            });
            if let Some(HciEvent::LeAdvertisingReport { addr_type, .. }) = found {
                break addr_type;
            }
        };
        seq.send(&hci::cmd_le_scan_enable(false))?;
        info!("[BLE] Found {}", format_mac(cfg.target));
        events.status(slot, "Controller found, connecting...");
        events.progress(slot, 30);

        // 2. Connect with the required link parameters.
        seq.send(&hci::cmd_le_create_connection(target_le, addr_type))?;
        let conn = seq
            .link
            .wait_event(CONNECT_TIMEOUT, |e| {
                matches!(e, HciEvent::LeConnectionComplete { .. })
            })
            .ok_or_else(|| GcError::Transport("BLE connect timed out".into()))?;
        let HciEvent::LeConnectionComplete { status, handle, .. } = conn else {
            unreachable!()
        };
        if status != 0 {
            return Err(GcError::Transport(format!(
                "BLE connect failed (status {status:#04X})"
            )));
        }
        seq.conn_handle = handle;
        info!("[BLE] Connected, handle {handle:#06X}");
        events.progress(slot, 50);

        // 3. SMP legacy pairing with the controller's required key
        //    distribution. Rejection is tolerated; the SPI LTK path below
        //    covers encryption then.
        let mut pairing = LegacyPairing::new(host_addr, 0x00, target_le, addr_type);
        run_smp_pairing(&mut seq, &mut pairing);

        // 4. MTU exchange; the default MTU cannot carry input reports.
        seq.send_att(&att::mtu_request(att::REQUESTED_MTU))?;
        match seq.link.wait(CMD_RESPONSE_TIMEOUT, |m| {
            matches!(m, Link::Att(AttPdu::MtuResponse(_)))
        }) {
            Some(Link::Att(AttPdu::MtuResponse(mtu))) => debug!("[BLE] MTU {mtu}"),
            _ => warn!("[BLE] MTU exchange timed out"),
        }

        // 5-6. Enable the proprietary service and command responses.
        seq.write_handle(protocol::H_SVC_ENABLE, &[0x01, 0x00])?;
        seq.write_handle(protocol::H_CMD_RESP_CCCD, &[0x01, 0x00])?;
        events.progress(slot, 60);

        // 7. Device info (best effort).
        match seq.command(
            &protocol::build_spi_read(protocol::SPI_DEVICE_INFO, 0x40),
            CMD_RESPONSE_TIMEOUT,
        ) {
            Some(resp) => debug!("[BLE] Device info: {:02X?}", protocol::spi_payload(&resp)),
            None => warn!("[BLE] Device info read timed out, continuing"),
        }

        // 8. Proprietary pairing handshake; timeouts are logged and the
        //    sequence continues.
        events.status(slot, "Pairing...");
        let steps = [
            protocol::build_pair_step1(msb_addr(host_addr)),
            protocol::build_pair_step2(),
            protocol::build_pair_step3(),
            protocol::build_pair_finalize(),
        ];
        for (i, frame) in steps.iter().enumerate() {
            if seq.command(frame, CMD_RESPONSE_TIMEOUT).is_none() {
                warn!("[BLE] Pairing step {} timed out", i + 1);
            }
        }
        events.progress(slot, 70);

        // 9. Pairing block: LTK plus candidate EDIV/Rand.
        let block = seq
            .command(
                &protocol::build_spi_read(protocol::SPI_PAIRING_DATA, 0x40),
                CMD_RESPONSE_TIMEOUT,
            )
            .and_then(|resp| protocol::spi_payload(&resp).and_then(protocol::parse_pairing_block));

        // 10. Encrypt the link if SMP did not already.
        if !seq.encrypted {
            if let Some(block) = block {
                let mut reversed = block.ltk;
                reversed.reverse();
                let attempts: [(&str, [u8; 8], u16, [u8; 16]); 3] = [
                    ("SPI EDIV+Rand", block.rand, block.ediv, block.ltk),
                    ("EDIV=0 Rand=0", [0; 8], 0, block.ltk),
                    ("reversed LTK", [0; 8], 0, reversed),
                ];
                for (label, rand, ediv, ltk) in attempts {
                    if ediv == 0 && rand == [0; 8] && label == "SPI EDIV+Rand" {
                        continue;
                    }
                    debug!("[BLE] Trying encryption with {label}");
                    if seq.start_encryption(rand, ediv, ltk) {
                        info!("[BLE] Link encrypted ({label})");
                        break;
                    }
                }
                if !seq.encrypted {
                    warn!("[BLE] All encryption attempts failed, continuing unencrypted");
                }
            } else {
                warn!("[BLE] No pairing block, continuing unencrypted");
            }
        }
        events.progress(slot, 80);

        // 11. Player LED (best effort).
        if seq
            .command(
                &protocol::build_led(protocol::LED_MAP[slot % protocol::LED_MAP.len()]),
                Duration::from_secs(2),
            )
            .is_none()
        {
            warn!("[BLE] LED command timed out");
        }

        // Declare and enable the input features we consume.
        let feats = protocol::FEAT_BUTTONS | protocol::FEAT_STICKS;
        let _ = seq.command(&protocol::build_feature_configure(feats), Duration::from_secs(2));
        let _ = seq.command(&protocol::build_feature_enable(feats), Duration::from_secs(2));

        // 12. Enable input notifications and silence the command channel;
        //     input does not stream while 0x001B is subscribed.
        seq.write_handle(protocol::H_INPUT_CCCD, &[0x01, 0x00])?;
        seq.write_handle(protocol::H_CMD_RESP_CCCD, &[0x00, 0x00])?;
        events.progress(slot, 100);
        events.status(slot, "Controller connected (BLE)");
        info!("[BLE] Slot {slot} streaming");

        // Streaming: the reader feeds the frame queue; we watch for
        // disconnects and peripheral security requests.
        loop {
            if stop.load(Ordering::SeqCst) {
                let _ = seq.send(&hci::cmd_disconnect(seq.conn_handle));
                return Ok(());
            }
            match seq.link.wait(Duration::from_millis(500), |m| {
                matches!(
                    m,
                    Link::Event(HciEvent::DisconnectionComplete { .. })
                        | Link::Smp(_)
                        | Link::Gone(_)
                )
            }) {
                Some(Link::Event(HciEvent::DisconnectionComplete { reason, .. })) => {
                    return Err(GcError::Transport(format!(
                        "controller disconnected (reason {reason:#04X})"
                    )));
                }
                Some(Link::Gone(e)) => return Err(GcError::Transport(e)),
                Some(Link::Smp(pdu)) if pdu.first() == Some(&smp::SECURITY_REQUEST) => {
                    // Peripheral-initiated security: answer by pairing.
                    debug!("[BLE] Security request, initiating pairing");
                    let req = pairing.initiate();
                    let _ = seq.send_smp(&req);
                    run_smp_pairing(&mut seq, &mut pairing);
                }
                Some(Link::Smp(pdu)) => {
                    let _ = drive_pairing(&mut seq, &mut pairing, &pdu);
                }
                _ => {}
            }
        }
    })();

    reader_stop.store(true, Ordering::SeqCst);
    let _ = reader.join();
    result
}

fn msb_addr(le: [u8; 6]) -> [u8; 6] {
    let mut a = le;
    a.reverse();
    a
}

fn read_host_address(seq: &mut Sequencer) -> [u8; 6] {
    if seq.send(&hci::command_packet(hci::OP_READ_BD_ADDR, &[])).is_err() {
        return FALLBACK_HOST_ADDR;
    }
    let reply = seq.link.wait_event(Duration::from_secs(1), |e| {
        matches!(e, HciEvent::CommandComplete { opcode, .. } if *opcode == hci::OP_READ_BD_ADDR)
    });
    match reply {
        Some(HciEvent::CommandComplete { status: 0, ret, .. }) if ret.len() >= 6 => {
            ret[..6].try_into().unwrap_or(FALLBACK_HOST_ADDR)
        }
        _ => FALLBACK_HOST_ADDR,
    }
}

/// Drive the SMP engine until it settles (success, failure, or timeout).
fn run_smp_pairing(seq: &mut Sequencer, pairing: &mut LegacyPairing) {
    if !pairing.in_progress() {
        let req = pairing.initiate();
        if seq.send_smp(&req).is_err() {
            return;
        }
    }
    let deadline = Instant::now() + Duration::from_secs(10);
    while pairing.in_progress() && Instant::now() < deadline {
        let Some(Link::Smp(pdu)) = seq
            .link
            .wait(CMD_RESPONSE_TIMEOUT, |m| matches!(m, Link::Smp(_)))
        else {
            warn!("[BLE] SMP pairing stalled, continuing without it");
            return;
        };
        if drive_pairing(seq, pairing, &pdu) {
            return;
        }
    }
}

/// Apply one SMP PDU. Returns true when pairing reached a terminal state.
fn drive_pairing(seq: &mut Sequencer, pairing: &mut LegacyPairing, pdu: &[u8]) -> bool {
    match pairing.on_pdu(pdu) {
        Outcome::Send(out) => {
            let _ = seq.send_smp(&out);
            false
        }
        Outcome::Encrypt(stk) => {
            if seq.start_encryption([0; 8], 0, stk) {
                info!("[BLE] Link encrypted via SMP");
                for pdu in pairing.identity_pdus() {
                    let _ = seq.send_smp(&pdu);
                }
                false // key distribution still pending
            } else {
                warn!("[BLE] STK encryption failed");
                true
            }
        }
        Outcome::Bond { ltk, ediv, .. } => {
            debug!("[BLE] Bond received (EDIV {ediv:#06X}, LTK {:02X?}...)", &ltk[..4]);
            true
        }
        Outcome::Failed(code) => {
            // The controller's state machine rejects re-pairing attempts;
            // that is expected and non-fatal.
            debug!("[BLE] SMP pairing failed (reason {code:#04X})");
            true
        }
        Outcome::None => false,
    }
}

fn reader_loop(
    sock: &HciSocket,
    reader_stop: &AtomicBool,
    user_stop: &AtomicBool,
    link: &Sender<Link>,
    cmd_resp: &Sender<Vec<u8>>,
    frames: &SyncSender<[u8; BLE_REPORT_LEN]>,
) {
    let mut asm = AclAssembler::default();
    while !reader_stop.load(Ordering::SeqCst) && !user_stop.load(Ordering::SeqCst) {
        let raw = match sock.recv(POLL) {
            Ok(Some(raw)) => raw,
            Ok(None) => continue,
            Err(e) => {
                let _ = link.send(Link::Gone(format!("HCI socket: {e}")));
                return;
            }
        };
        match hci::parse_packet(&raw) {
            Some(HciPacket::Event(event)) => {
                let _ = link.send(Link::Event(event));
            }
            Some(HciPacket::Acl { pb, data, .. }) => {
                let Some((cid, payload)) = asm.push(pb, &data) else {
                    continue;
                };
                match cid {
                    CID_ATT => route_att(&payload, link, cmd_resp, frames),
                    CID_SMP => {
                        let _ = link.send(Link::Smp(payload));
                    }
                    other => debug!("[BLE] Data on unexpected CID {other:#06X}"),
                }
            }
            _ => {}
        }
    }
}

fn route_att(
    payload: &[u8],
    link: &Sender<Link>,
    cmd_resp: &Sender<Vec<u8>>,
    frames: &SyncSender<[u8; BLE_REPORT_LEN]>,
) {
    match att::parse(payload) {
        Some(AttPdu::Notification { handle, value }) => match handle {
            protocol::H_INPUT_REPORT => {
                if value.len() >= BLE_REPORT_LEN {
                    let mut frame = [0u8; BLE_REPORT_LEN];
                    frame.copy_from_slice(&value[..BLE_REPORT_LEN]);
                    // Bounded queue: drop the frame rather than grow.
                    let _ = frames.try_send(frame);
                }
            }
            protocol::H_CMD_RESPONSE => {
                let _ = cmd_resp.send(value);
            }
            other => debug!("[BLE] Notification on {other:#06X} ({} bytes)", value.len()),
        },
        Some(pdu) => {
            let _ = link.send(Link::Att(pdu));
        }
        None => {}
    }
}
