//! Security Manager: LE Legacy "Just Works" pairing as initiator.
//!
//! The controller rejects LE Secure Connections and the standard
//! bidirectional key distribution; the pairing request must offer
//! initiator-key-dist = identity and responder-key-dist = encryption.
//! TK is zero (Just Works), the STK comes out of the c1/s1 confirm-value
//! functions, and the bonded LTK arrives from the peripheral after the
//! link is encrypted with the STK.
//!
//! All 128-bit quantities are little-endian byte arrays as they appear on
//! the wire; `e()` flips to big-endian around the AES core.

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use rand::RngCore;

// SMP PDU codes.
pub const PAIRING_REQUEST: u8 = 0x01;
pub const PAIRING_RESPONSE: u8 = 0x02;
pub const PAIRING_CONFIRM: u8 = 0x03;
pub const PAIRING_RANDOM: u8 = 0x04;
pub const PAIRING_FAILED: u8 = 0x05;
pub const ENCRYPTION_INFORMATION: u8 = 0x06;
pub const MASTER_IDENTIFICATION: u8 = 0x07;
pub const IDENTITY_INFORMATION: u8 = 0x08;
pub const IDENTITY_ADDRESS_INFORMATION: u8 = 0x09;
pub const SECURITY_REQUEST: u8 = 0x0B;

const IO_NO_INPUT_NO_OUTPUT: u8 = 0x03;
const AUTH_BONDING: u8 = 0x01;
const MAX_KEY_SIZE: u8 = 0x10;
const KEY_DIST_ENC: u8 = 0x01;
const KEY_DIST_ID: u8 = 0x02;

/// The fixed pairing-request feature exchange (body, code included).
pub const PAIRING_REQUEST_PDU: [u8; 7] = [
    PAIRING_REQUEST,
    IO_NO_INPUT_NO_OUTPUT,
    0x00, // no OOB
    AUTH_BONDING,
    MAX_KEY_SIZE,
    KEY_DIST_ID,  // initiator distributes identity only
    KEY_DIST_ENC, // responder distributes encryption only
];

/// AES-128 `e(key, plaintext)` over little-endian arrays.
fn e(key: &[u8; 16], data: &[u8; 16]) -> [u8; 16] {
    let mut k = *key;
    let mut d = *data;
    k.reverse();
    d.reverse();
    let cipher = Aes128::new(GenericArray::from_slice(&k));
    let mut block = GenericArray::clone_from_slice(&d);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; 16];
    out.copy_from_slice(&block);
    out.reverse();
    out
}

fn xor(a: &[u8; 16], b: &[u8; 16]) -> [u8; 16] {
    let mut out = [0u8; 16];
    for i in 0..16 {
        out[i] = a[i] ^ b[i];
    }
    out
}

/// p1 = pres || preq || rat || iat (iat in the least significant octet).
fn build_p1(preq: &[u8; 7], pres: &[u8; 7], iat: u8, rat: u8) -> [u8; 16] {
    let mut p1 = [0u8; 16];
    p1[0] = iat;
    p1[1] = rat;
    p1[2..9].copy_from_slice(preq);
    p1[9..16].copy_from_slice(pres);
    p1
}

/// p2 = zero-padding || ia || ra (ra in the least significant octets).
/// Addresses are little-endian as on the HCI wire.
fn build_p2(ia: &[u8; 6], ra: &[u8; 6]) -> [u8; 16] {
    let mut p2 = [0u8; 16];
    p2[0..6].copy_from_slice(ra);
    p2[6..12].copy_from_slice(ia);
    p2
}

/// Confirm-value function c1 (Core Vol 3 Part H, 2.2.3).
#[allow(clippy::too_many_arguments)]
pub fn c1(
    k: &[u8; 16],
    r: &[u8; 16],
    preq: &[u8; 7],
    pres: &[u8; 7],
    iat: u8,
    rat: u8,
    ia: &[u8; 6],
    ra: &[u8; 6],
) -> [u8; 16] {
    let p1 = build_p1(preq, pres, iat, rat);
    let p2 = build_p2(ia, ra);
    e(k, &xor(&e(k, &xor(r, &p1)), &p2))
}

/// Key-generation function s1: STK from the two pairing randoms.
pub fn s1(k: &[u8; 16], r1: &[u8; 16], r2: &[u8; 16]) -> [u8; 16] {
    let mut r = [0u8; 16];
    r[0..8].copy_from_slice(&r2[0..8]);
    r[8..16].copy_from_slice(&r1[0..8]);
    e(k, &r)
}

/// What the driver must do after feeding a PDU to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// Send this SMP PDU.
    Send(Vec<u8>),
    /// Phase 2 complete: encrypt the link with this STK (EDIV=0, Rand=0).
    Encrypt([u8; 16]),
    /// The peripheral distributed its bond: LTK + EDIV/Rand.
    Bond {
        ltk: [u8; 16],
        ediv: u16,
        rand: [u8; 8],
    },
    /// Pairing failed with this reason code.
    Failed(u8),
    /// Nothing to do.
    None,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    WaitResponse,
    WaitConfirm,
    WaitRandom,
    KeyDistribution,
}

/// Initiator-side pairing engine. Pure PDU-in / action-out, so the
/// transport loop stays trivial and the exchange is testable.
pub struct LegacyPairing {
    phase: Phase,
    preq: [u8; 7],
    pres: [u8; 7],
    mrand: [u8; 16],
    sconfirm: [u8; 16],
    ia: [u8; 6],
    iat: u8,
    ra: [u8; 6],
    rat: u8,
    pending_ltk: Option<[u8; 16]>,
}

impl LegacyPairing {
    /// `ia`/`ra` are the initiator/responder addresses in HCI (LE) byte
    /// order with their address types.
    pub fn new(ia: [u8; 6], iat: u8, ra: [u8; 6], rat: u8) -> Self {
        let mut mrand = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut mrand);
        Self {
            phase: Phase::Idle,
            preq: PAIRING_REQUEST_PDU,
            pres: [0; 7],
            mrand,
            sconfirm: [0; 16],
            ia,
            iat,
            ra,
            rat,
            pending_ltk: None,
        }
    }

    /// Kick off pairing; returns the Pairing Request PDU to send.
    pub fn initiate(&mut self) -> Vec<u8> {
        self.phase = Phase::WaitResponse;
        self.preq.to_vec()
    }

    pub fn in_progress(&self) -> bool {
        !matches!(self.phase, Phase::Idle)
    }

    /// Feed one received SMP PDU.
    pub fn on_pdu(&mut self, pdu: &[u8]) -> Outcome {
        let Some(&code) = pdu.first() else {
            return Outcome::None;
        };
        match (code, self.phase) {
            (PAIRING_FAILED, _) => {
                self.phase = Phase::Idle;
                Outcome::Failed(pdu.get(1).copied().unwrap_or(0))
            }
            (PAIRING_RESPONSE, Phase::WaitResponse) => {
                let Ok(pres) = pdu[..7.min(pdu.len())].try_into() else {
                    return Outcome::Failed(0x0A);
                };
                self.pres = pres;
                self.phase = Phase::WaitConfirm;
                let tk = [0u8; 16]; // Just Works
                let mconfirm = c1(
                    &tk, &self.mrand, &self.preq, &self.pres, self.iat, self.rat, &self.ia,
                    &self.ra,
                );
                let mut out = vec![PAIRING_CONFIRM];
                out.extend_from_slice(&mconfirm);
                Outcome::Send(out)
            }
            (PAIRING_CONFIRM, Phase::WaitConfirm) => {
                if pdu.len() < 17 {
                    return Outcome::Failed(0x0A);
                }
                self.sconfirm.copy_from_slice(&pdu[1..17]);
                self.phase = Phase::WaitRandom;
                let mut out = vec![PAIRING_RANDOM];
                out.extend_from_slice(&self.mrand);
                Outcome::Send(out)
            }
            (PAIRING_RANDOM, Phase::WaitRandom) => {
                if pdu.len() < 17 {
                    return Outcome::Failed(0x0A);
                }
                let mut srand = [0u8; 16];
                srand.copy_from_slice(&pdu[1..17]);
                let tk = [0u8; 16];
                let check = c1(
                    &tk, &srand, &self.preq, &self.pres, self.iat, self.rat, &self.ia, &self.ra,
                );
                if check != self.sconfirm {
                    self.phase = Phase::Idle;
                    // Confirm value mismatch.
                    return Outcome::Failed(0x04);
                }
                self.phase = Phase::KeyDistribution;
                Outcome::Encrypt(s1(&tk, &srand, &self.mrand))
            }
            (ENCRYPTION_INFORMATION, Phase::KeyDistribution) => {
                if pdu.len() >= 17 {
                    let mut ltk = [0u8; 16];
                    ltk.copy_from_slice(&pdu[1..17]);
                    self.pending_ltk = Some(ltk);
                }
                Outcome::None
            }
            (MASTER_IDENTIFICATION, Phase::KeyDistribution) => {
                let Some(ltk) = self.pending_ltk.take() else {
                    return Outcome::None;
                };
                if pdu.len() < 11 {
                    return Outcome::None;
                }
                let ediv = u16::from_le_bytes([pdu[1], pdu[2]]);
                let mut rand = [0u8; 8];
                rand.copy_from_slice(&pdu[3..11]);
                self.phase = Phase::Idle;
                Outcome::Bond { ltk, ediv, rand }
            }
            _ => Outcome::None,
        }
    }

    /// Our side of key distribution: a zero IRK plus our identity address.
    /// Sent once the STK-encrypted link is up.
    pub fn identity_pdus(&self) -> Vec<Vec<u8>> {
        let mut identity = vec![IDENTITY_INFORMATION];
        identity.extend_from_slice(&[0u8; 16]);

        let mut addr = vec![IDENTITY_ADDRESS_INFORMATION, self.iat];
        addr.extend_from_slice(&self.ia);

        vec![identity, addr]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_request_offers_asymmetric_key_distribution() {
        assert_eq!(PAIRING_REQUEST_PDU[5], 0x02); // initiator: identity
        assert_eq!(PAIRING_REQUEST_PDU[6], 0x01); // responder: encryption
        assert_eq!(PAIRING_REQUEST_PDU[1], 0x03); // NoInputNoOutput
        assert_eq!(PAIRING_REQUEST_PDU[3], 0x01); // bonding, no MITM, no SC
    }

    #[test]
    fn e_is_deterministic_and_key_dependent() {
        let k1 = [1u8; 16];
        let k2 = [2u8; 16];
        let d = [7u8; 16];
        assert_eq!(e(&k1, &d), e(&k1, &d));
        assert_ne!(e(&k1, &d), e(&k2, &d));
        assert_ne!(e(&k1, &d), d);
    }

    #[test]
    fn p1_packs_request_types_in_low_octets() {
        let preq = [1, 2, 3, 4, 5, 6, 7];
        let pres = [8, 9, 10, 11, 12, 13, 14];
        let p1 = build_p1(&preq, &pres, 0xAA, 0xBB);
        assert_eq!(p1[0], 0xAA);
        assert_eq!(p1[1], 0xBB);
        assert_eq!(&p1[2..9], &preq);
        assert_eq!(&p1[9..16], &pres);
    }

    #[test]
    fn p2_packs_responder_address_low() {
        let ia = [0x11; 6];
        let ra = [0x22; 6];
        let p2 = build_p2(&ia, &ra);
        assert_eq!(&p2[0..6], &ra);
        assert_eq!(&p2[6..12], &ia);
        assert_eq!(&p2[12..16], &[0, 0, 0, 0]);
    }

    #[test]
    fn c1_depends_on_every_input() {
        let k = [0u8; 16];
        let r = [0x55u8; 16];
        let preq = PAIRING_REQUEST_PDU;
        let pres = [2, 3, 0, 1, 16, 2, 1];
        let ia = [1, 2, 3, 4, 5, 6];
        let ra = [6, 5, 4, 3, 2, 1];

        let base = c1(&k, &r, &preq, &pres, 0, 0, &ia, &ra);
        assert_eq!(base, c1(&k, &r, &preq, &pres, 0, 0, &ia, &ra));

        let mut r2 = r;
        r2[0] ^= 1;
        assert_ne!(base, c1(&k, &r2, &preq, &pres, 0, 0, &ia, &ra));
        assert_ne!(base, c1(&k, &r, &preq, &pres, 1, 0, &ia, &ra));
        assert_ne!(base, c1(&k, &r, &preq, &pres, 0, 0, &ra, &ia));
    }

    #[test]
    fn s1_combines_low_halves() {
        let k = [0u8; 16];
        let mut r1 = [0u8; 16];
        let mut r2 = [0u8; 16];
        r1[0..8].copy_from_slice(&[1; 8]);
        r2[0..8].copy_from_slice(&[2; 8]);

        let base = s1(&k, &r1, &r2);
        // The high halves must not matter.
        r1[8..16].copy_from_slice(&[9; 8]);
        r2[8..16].copy_from_slice(&[9; 8]);
        assert_eq!(base, s1(&k, &r1, &r2));

        // The low halves must.
        r1[0] ^= 1;
        assert_ne!(base, s1(&k, &r1, &r2));
    }

    /// Drive two engines against each other far enough to check the
    /// initiator's confirm/random exchange is self-consistent.
    #[test]
    fn pairing_exchange_reaches_encryption() {
        let ia = [1, 2, 3, 4, 5, 6];
        let ra = [9, 8, 7, 6, 5, 4];
        let mut initiator = LegacyPairing::new(ia, 0, ra, 0);

        let preq = initiator.initiate();
        assert_eq!(preq, PAIRING_REQUEST_PDU.to_vec());
        assert!(initiator.in_progress());

        // Peripheral accepts with its own feature set.
        let pres = [PAIRING_RESPONSE, 0x03, 0x00, 0x01, 0x10, 0x02, 0x01];
        let Outcome::Send(confirm) = initiator.on_pdu(&pres) else {
            panic!("expected confirm");
        };
        assert_eq!(confirm[0], PAIRING_CONFIRM);
        assert_eq!(confirm.len(), 17);

        // Peripheral computes its confirm over srand; emulate it.
        let srand_val = [0x42u8; 16];
        let tk = [0u8; 16];
        let pres_arr: [u8; 7] = pres;
        let sconfirm = c1(
            &tk,
            &srand_val,
            &PAIRING_REQUEST_PDU,
            &pres_arr,
            0,
            0,
            &ia,
            &ra,
        );
        let mut sconfirm_pdu = vec![PAIRING_CONFIRM];
        sconfirm_pdu.extend_from_slice(&sconfirm);
        let Outcome::Send(mrand_pdu) = initiator.on_pdu(&sconfirm_pdu) else {
            panic!("expected random");
        };
        assert_eq!(mrand_pdu[0], PAIRING_RANDOM);

        let mut srand_pdu = vec![PAIRING_RANDOM];
        srand_pdu.extend_from_slice(&srand_val);
        let Outcome::Encrypt(stk) = initiator.on_pdu(&srand_pdu) else {
            panic!("expected STK");
        };

        // STK must match what the peripheral would derive.
        let mut mrand_val = [0u8; 16];
        mrand_val.copy_from_slice(&mrand_pdu[1..17]);
        assert_eq!(stk, s1(&tk, &srand_val, &mrand_val));

        // Key distribution: LTK then EDIV/Rand.
        let mut enc_info = vec![ENCRYPTION_INFORMATION];
        enc_info.extend_from_slice(&[0xAB; 16]);
        assert_eq!(initiator.on_pdu(&enc_info), Outcome::None);

        let mut master_ident = vec![MASTER_IDENTIFICATION, 0x34, 0x12];
        master_ident.extend_from_slice(&[0xCD; 8]);
        let Outcome::Bond { ltk, ediv, rand } = initiator.on_pdu(&master_ident) else {
            panic!("expected bond");
        };
        assert_eq!(ltk, [0xAB; 16]);
        assert_eq!(ediv, 0x1234);
        assert_eq!(rand, [0xCD; 8]);
        assert!(!initiator.in_progress());
    }

    #[test]
    fn wrong_confirm_fails_pairing() {
        let mut initiator = LegacyPairing::new([1; 6], 0, [2; 6], 0);
        initiator.initiate();
        let pres = [PAIRING_RESPONSE, 0x03, 0x00, 0x01, 0x10, 0x02, 0x01];
        initiator.on_pdu(&pres);

        let mut bogus_confirm = vec![PAIRING_CONFIRM];
        bogus_confirm.extend_from_slice(&[0x11; 16]);
        initiator.on_pdu(&bogus_confirm);

        let mut srand = vec![PAIRING_RANDOM];
        srand.extend_from_slice(&[0x22; 16]);
        assert_eq!(initiator.on_pdu(&srand), Outcome::Failed(0x04));
        assert!(!initiator.in_progress());
    }

    #[test]
    fn identity_pdus_carry_our_address() {
        let pairing = LegacyPairing::new([1, 2, 3, 4, 5, 6], 0, [0; 6], 0);
        let pdus = pairing.identity_pdus();
        assert_eq!(pdus.len(), 2);
        assert_eq!(pdus[0][0], IDENTITY_INFORMATION);
        assert_eq!(pdus[0].len(), 17);
        assert_eq!(pdus[1][0], IDENTITY_ADDRESS_INFORMATION);
        assert_eq!(&pdus[1][2..8], &[1, 2, 3, 4, 5, 6]);
    }
}
