//! Wire format.
//!
//! Request, 49 bytes:
//!
//! ```text
//! nonce[24] || seal( timestamp[8] || type[1] ) || tag[16]
//! ```
//!
//! Response, 67 bytes:
//!
//! ```text
//! nonce[24] || seal( timestamp[8] || type[1] || addr[16] || port[2] ) || tag[16]
//! ```
//!
//! Packets are sealed with XChaCha20-Poly1305 under a pre-shared key, with a random nonce
//! and no associated data. Integers are big-endian, the timestamp is unix epoch seconds and
//! the address is in IPv6 form (IPv4 is mapped).

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Tag, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, PacketError, Result};

mod client;
mod server;
pub use client::Client;
pub use server::Server;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 24;
pub const TAG_SIZE: usize = 16;

const HEADER_SIZE: usize = 8 + 1;
pub(crate) const REQUEST_PLAINTEXT_SIZE: usize = HEADER_SIZE;
pub(crate) const RESPONSE_PLAINTEXT_SIZE: usize = HEADER_SIZE + 16 + 2;

/// random nonce + unix epoch timestamp + type + AEAD tag
pub const REQUEST_PACKET_SIZE: usize = NONCE_SIZE + REQUEST_PLAINTEXT_SIZE + TAG_SIZE;

/// random nonce + unix epoch timestamp + type + IP + port + AEAD tag
pub const RESPONSE_PACKET_SIZE: usize = NONCE_SIZE + RESPONSE_PLAINTEXT_SIZE + TAG_SIZE;

/// Maximum allowed difference in seconds between a received timestamp and system time.
pub const MAX_EPOCH_DIFF: i64 = 30;

pub const MAX_TIME_DIFF: Duration = Duration::from_secs(MAX_EPOCH_DIFF as u64);

/// How long a nonce must be remembered, covering the freshness window of both peers.
pub const REPLAY_WINDOW_DURATION: Duration = Duration::from_secs(2 * MAX_EPOCH_DIFF as u64);

pub type Nonce = [u8; NONCE_SIZE];

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Request = 0,
    Response = 1,
}

/// Checks the big-endian unix epoch timestamp against system time.
pub fn check_unix_epoch_timestamp(b: [u8; 8]) -> std::result::Result<(), PacketError> {
    check_timestamp(b, unix_now())
}

pub(crate) fn check_timestamp(b: [u8; 8], now: i64) -> std::result::Result<(), PacketError> {
    let timestamp = u64::from_be_bytes(b) as i64;
    let diff = timestamp.wrapping_sub(now);
    if !(-MAX_EPOCH_DIFF..=MAX_EPOCH_DIFF).contains(&diff) {
        return Err(PacketError::BadTimestamp {
            timestamp,
            now,
            diff,
        });
    }
    Ok(())
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn new_cipher(psk: &[u8]) -> Result<XChaCha20Poly1305> {
    XChaCha20Poly1305::new_from_slice(psk).map_err(|_| Error::InvalidKeyLength(psk.len()))
}

fn put_header(plaintext: &mut [u8], now: i64, msg_type: MessageType) {
    plaintext[..8].copy_from_slice(&(now as u64).to_be_bytes());
    plaintext[8] = msg_type as u8;
}

/// Validates the decrypted header, timestamp first, then the message type.
fn check_header(
    plaintext: &[u8],
    now: i64,
    expected: MessageType,
) -> std::result::Result<(), PacketError> {
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&plaintext[..8]);
    check_timestamp(ts, now)?;
    check_message_type(plaintext, expected)
}

fn check_message_type(plaintext: &[u8], expected: MessageType) -> std::result::Result<(), PacketError> {
    if plaintext[8] != expected as u8 {
        return Err(PacketError::BadMessageType {
            got: plaintext[8],
            expected: expected as u8,
        });
    }
    Ok(())
}

/// Generates a random nonce and seals the plaintext region of `packet` in place.
fn seal(cipher: &XChaCha20Poly1305, packet: &mut [u8]) {
    let (nonce, rest) = packet.split_at_mut(NONCE_SIZE);
    rand::thread_rng().fill_bytes(nonce);

    let (plaintext, tag) = rest.split_at_mut(rest.len() - TAG_SIZE);
    // plaintext is at most a few dozen bytes, far below the cipher's limit
    let t = cipher
        .encrypt_in_place_detached(XNonce::from_slice(nonce), &[], plaintext)
        .expect("plaintext length within cipher limit");
    tag.copy_from_slice(&t);
}

/// Opens `packet` into a fresh buffer. `packet` must be exactly `NONCE_SIZE + N + TAG_SIZE` long.
///
/// Nothing is returned unless the tag verifies.
fn open<const N: usize>(
    cipher: &XChaCha20Poly1305,
    packet: &[u8],
) -> std::result::Result<[u8; N], PacketError> {
    let (nonce, rest) = packet.split_at(NONCE_SIZE);
    let (ciphertext, tag) = rest.split_at(rest.len() - TAG_SIZE);

    let mut plaintext = [0u8; N];
    plaintext.copy_from_slice(ciphertext);
    cipher
        .decrypt_in_place_detached(
            XNonce::from_slice(nonce),
            &[],
            &mut plaintext,
            Tag::from_slice(tag),
        )
        .map_err(|_| PacketError::AuthenticationFailed)?;

    Ok(plaintext)
}

fn put_addr(plaintext: &mut [u8], addr: SocketAddr) {
    let ip = match addr.ip() {
        IpAddr::V4(ip) => ip.to_ipv6_mapped(),
        IpAddr::V6(ip) => ip,
    };
    plaintext[HEADER_SIZE..HEADER_SIZE + 16].copy_from_slice(&ip.octets());
    plaintext[HEADER_SIZE + 16..HEADER_SIZE + 18].copy_from_slice(&addr.port().to_be_bytes());
}

fn get_addr(plaintext: &[u8]) -> SocketAddr {
    let mut ip = [0u8; 16];
    ip.copy_from_slice(&plaintext[HEADER_SIZE..HEADER_SIZE + 16]);
    let port = u16::from_be_bytes([plaintext[HEADER_SIZE + 16], plaintext[HEADER_SIZE + 17]]);
    SocketAddr::new(Ipv6Addr::from(ip).to_canonical(), port)
}
