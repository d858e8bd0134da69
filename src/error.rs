//! Error types.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Reasons a packet is rejected by the codec.
///
/// Each variant is produced by exactly one validation step.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("bad packet size: {0}")]
    BadPacketSize(usize),
    #[error("repeated nonce")]
    RepeatedNonce,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("time offset too large: {timestamp} - {now} (now) = {diff}")]
    BadTimestamp { timestamp: i64, now: i64, diff: i64 },
    #[error("bad message type: {got}, expected {expected}")]
    BadMessageType { got: u8, expected: u8 },
}

/// Faults reported by the OS alongside a received datagram.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("packet truncated")]
    Truncated,
    #[error("out-of-band data received")]
    OutOfBand,
}

#[derive(Error, Debug)]
pub enum AttemptErrorKind {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// A failed attempt surfaced by a client session.
#[derive(Debug)]
pub struct AttemptError {
    pub message: &'static str,
    pub peer: Option<SocketAddr>,
    pub packet_len: usize,
    pub kind: AttemptErrorKind,
}

impl AttemptError {
    pub fn new<E: Into<AttemptErrorKind>>(
        message: &'static str,
        peer: Option<SocketAddr>,
        packet_len: usize,
        err: E,
    ) -> Self {
        Self {
            message,
            peer,
            packet_len,
            kind: err.into(),
        }
    }
}

impl fmt::Display for AttemptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, peer address: ", self.message)?;
        match self.peer {
            Some(addr) => write!(f, "{}", addr)?,
            None => f.write_str("invalid")?,
        }
        write!(f, ", packet length: {}: {}", self.packet_len, self.kind)
    }
}

impl std::error::Error for AttemptError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.kind)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid pre-shared key length: {0}, expected 32")]
    InvalidKeyLength(usize),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error(transparent)]
    Attempt(#[from] AttemptError),
    #[error("deadline exceeded")]
    DeadlineExceeded,
    #[error("config: {0}")]
    Config(String),
    #[error("already started")]
    AlreadyStarted,
}

pub type Result<T> = std::result::Result<T, Error>;
