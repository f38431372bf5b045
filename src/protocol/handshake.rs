//! RTMP handshake
//!
//! ```text
//! Client                                   Server
//!   |------- C0 (1 byte: version 0x03) --->|
//!   |------- C1 (1536 bytes) ------------->|
//!   |<------ S0 S1 S2 ---------------------|
//!   |------- C2 (discarded) -------------->|
//! ```
//!
//! Flash-era clients embed an HMAC-SHA256 digest inside C1 at an offset
//! derived from four bytes of the packet. The server locates the digest by
//! trying the two known offset schemes ("format 1" keyed on bytes 8..12,
//! "format 2" keyed on bytes 772..776); whichever digest verifies selects
//! the response scheme. If neither verifies the peer is a plain client and
//! S1/S2 simply echo C1. All digest comparisons are constant-time.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

use crate::protocol::constants::{HANDSHAKE_SIZE, RTMP_VERSION};

type HmacSha256 = Hmac<Sha256>;

const DIGEST_SIZE: usize = 32;

/// Plain client: echo C1 back as S1 and S2
pub const FORMAT_SIMPLE: u8 = 0;
/// Digest at offset derived from bytes 8..12
pub const FORMAT_DIGEST_LOW: u8 = 1;
/// Digest at offset derived from bytes 772..776
pub const FORMAT_DIGEST_HIGH: u8 = 2;

const GENUINE_FP: &[u8] = b"Genuine Adobe Flash Player 001";
const GENUINE_FMS: &[u8] = b"Genuine Adobe Flash Media Server 001";

/// Fixed suffix appended to the FMS constant when signing S2
const RANDOM_CRUD: [u8; 32] = [
    0xf0, 0xee, 0xc2, 0x4a, 0x80, 0x68, 0xbe, 0xe8, 0x2e, 0x00, 0xd0, 0xd1, 0x02, 0x9e, 0x7e,
    0x57, 0x6e, 0xec, 0x5d, 0x2d, 0x29, 0x80, 0x6f, 0xab, 0x93, 0xb8, 0xe6, 0x36, 0xcf, 0xeb,
    0x31, 0xae,
];

fn fms_key_with_crud() -> Vec<u8> {
    let mut key = GENUINE_FMS.to_vec();
    key.extend_from_slice(&RANDOM_CRUD);
    key
}

fn hmac_sha256(key: &[u8], message: &[u8]) -> [u8; DIGEST_SIZE] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(message);
    mac.finalize().into_bytes().into()
}

/// Digest offset in the low scheme: `(b0+b1+b2+b3) % 728 + 12` over bytes 8..12
pub fn digest_offset_low(sig: &[u8]) -> usize {
    let sum: usize = sig[8..12].iter().map(|b| *b as usize).sum();
    (sum % 728) + 12
}

/// Digest offset in the high scheme: `(b0+b1+b2+b3) % 728 + 776` over bytes 772..776
pub fn digest_offset_high(sig: &[u8]) -> usize {
    let sum: usize = sig[772..776].iter().map(|b| *b as usize).sum();
    (sum % 728) + 776
}

/// The 1504 bytes of C1/S1 with the digest region cut out
fn message_without_digest(sig: &[u8], offset: usize) -> Vec<u8> {
    let mut msg = Vec::with_capacity(HANDSHAKE_SIZE - DIGEST_SIZE);
    msg.extend_from_slice(&sig[..offset]);
    msg.extend_from_slice(&sig[offset + DIGEST_SIZE..]);
    msg
}

fn digest_matches(sig: &[u8], offset: usize, key: &[u8]) -> bool {
    let msg = message_without_digest(sig, offset);
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(&msg);
    // verify_slice compares in constant time
    mac.verify_slice(&sig[offset..offset + DIGEST_SIZE]).is_ok()
}

/// Detect which handshake variant the client sent in C1
pub fn detect_client_format(client_sig: &[u8]) -> u8 {
    if digest_matches(client_sig, digest_offset_high(client_sig), GENUINE_FP) {
        return FORMAT_DIGEST_HIGH;
    }
    if digest_matches(client_sig, digest_offset_low(client_sig), GENUINE_FP) {
        return FORMAT_DIGEST_LOW;
    }
    FORMAT_SIMPLE
}

/// Build S1: zero timestamp + version tag + random bytes, with the server
/// digest embedded at the offset mirroring the client's scheme
fn generate_s1(format: u8) -> Vec<u8> {
    let mut sig = vec![0u8; HANDSHAKE_SIZE];
    sig[4..8].copy_from_slice(&[1, 2, 3, 4]);
    rand::thread_rng().fill_bytes(&mut sig[8..]);

    let offset = if format == FORMAT_DIGEST_LOW {
        digest_offset_low(&sig)
    } else {
        digest_offset_high(&sig)
    };

    let digest = hmac_sha256(GENUINE_FMS, &message_without_digest(&sig, offset));
    sig[offset..offset + DIGEST_SIZE].copy_from_slice(&digest);
    sig
}

/// Build S2: random bytes signed with a key derived from the client's
/// challenge digest
fn generate_s2(format: u8, client_sig: &[u8]) -> Vec<u8> {
    let challenge_offset = if format == FORMAT_DIGEST_LOW {
        digest_offset_low(client_sig)
    } else {
        digest_offset_high(client_sig)
    };
    let challenge = &client_sig[challenge_offset..challenge_offset + DIGEST_SIZE];

    let mut s2 = vec![0u8; HANDSHAKE_SIZE];
    rand::thread_rng().fill_bytes(&mut s2[..HANDSHAKE_SIZE - DIGEST_SIZE]);

    let key = hmac_sha256(&fms_key_with_crud(), challenge);
    let signature = hmac_sha256(&key, &s2[..HANDSHAKE_SIZE - DIGEST_SIZE]);
    s2[HANDSHAKE_SIZE - DIGEST_SIZE..].copy_from_slice(&signature);
    s2
}

/// Build the complete S0+S1+S2 response for a received C1
pub fn generate_s0s1s2(client_sig: &[u8]) -> Vec<u8> {
    let format = detect_client_format(client_sig);

    let mut response = Vec::with_capacity(1 + 2 * HANDSHAKE_SIZE);
    response.push(RTMP_VERSION);

    if format == FORMAT_SIMPLE {
        tracing::debug!("using plain echo handshake");
        response.extend_from_slice(client_sig);
        response.extend_from_slice(client_sig);
    } else {
        tracing::debug!(format, "using digest handshake");
        response.extend_from_slice(&generate_s1(format));
        response.extend_from_slice(&generate_s2(format, client_sig));
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a C1 the way a digest-capable client would
    fn make_client_sig(format: u8) -> Vec<u8> {
        let mut sig = vec![0u8; HANDSHAKE_SIZE];
        rand::thread_rng().fill_bytes(&mut sig[..]);

        let offset = if format == FORMAT_DIGEST_LOW {
            digest_offset_low(&sig)
        } else {
            digest_offset_high(&sig)
        };
        let digest = hmac_sha256(GENUINE_FP, &message_without_digest(&sig, offset));
        sig[offset..offset + DIGEST_SIZE].copy_from_slice(&digest);
        sig
    }

    #[test]
    fn test_offset_bounds() {
        // Both schemes must keep the 32-byte digest inside the packet
        let mut sig = vec![0xFFu8; HANDSHAKE_SIZE];
        assert!(digest_offset_low(&sig) + DIGEST_SIZE <= 772);
        assert!(digest_offset_high(&sig) + DIGEST_SIZE <= HANDSHAKE_SIZE);

        sig[8..12].copy_from_slice(&[0, 0, 0, 0]);
        sig[772..776].copy_from_slice(&[0, 0, 0, 0]);
        assert_eq!(digest_offset_low(&sig), 12);
        assert_eq!(digest_offset_high(&sig), 776);
    }

    #[test]
    fn test_detect_low_format() {
        let sig = make_client_sig(FORMAT_DIGEST_LOW);
        assert_eq!(detect_client_format(&sig), FORMAT_DIGEST_LOW);
    }

    #[test]
    fn test_detect_high_format() {
        let sig = make_client_sig(FORMAT_DIGEST_HIGH);
        assert_eq!(detect_client_format(&sig), FORMAT_DIGEST_HIGH);
    }

    #[test]
    fn test_detect_plain_client() {
        let mut sig = vec![0u8; HANDSHAKE_SIZE];
        rand::thread_rng().fill_bytes(&mut sig[..]);
        // Overwhelmingly unlikely that random bytes form a valid digest
        assert_eq!(detect_client_format(&sig), FORMAT_SIMPLE);
    }

    #[test]
    fn test_plain_response_echoes_c1() {
        let mut sig = vec![0u8; HANDSHAKE_SIZE];
        rand::thread_rng().fill_bytes(&mut sig[..]);

        let response = generate_s0s1s2(&sig);
        assert_eq!(response.len(), 1 + 2 * HANDSHAKE_SIZE);
        assert_eq!(response[0], RTMP_VERSION);
        assert_eq!(&response[1..1 + HANDSHAKE_SIZE], &sig[..]);
        assert_eq!(&response[1 + HANDSHAKE_SIZE..], &sig[..]);
    }

    #[test]
    fn test_digest_response_s1_verifies() {
        let sig = make_client_sig(FORMAT_DIGEST_LOW);
        let response = generate_s0s1s2(&sig);
        assert_eq!(response.len(), 1 + 2 * HANDSHAKE_SIZE);
        assert_eq!(response[0], RTMP_VERSION);

        // S1 must carry a valid FMS digest at the mirrored offset
        let s1 = &response[1..1 + HANDSHAKE_SIZE];
        let offset = digest_offset_low(s1);
        assert!(digest_matches(s1, offset, GENUINE_FMS));
    }

    #[test]
    fn test_s2_signature_binds_challenge() {
        let sig = make_client_sig(FORMAT_DIGEST_HIGH);
        let response = generate_s0s1s2(&sig);
        let s2 = &response[1 + HANDSHAKE_SIZE..];

        let challenge_offset = digest_offset_high(&sig);
        let challenge = &sig[challenge_offset..challenge_offset + DIGEST_SIZE];
        let key = hmac_sha256(&fms_key_with_crud(), challenge);
        let expected = hmac_sha256(&key, &s2[..HANDSHAKE_SIZE - DIGEST_SIZE]);
        assert_eq!(&s2[HANDSHAKE_SIZE - DIGEST_SIZE..], &expected[..]);
    }
}
