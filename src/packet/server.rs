use chacha20poly1305::XChaCha20Poly1305;
use std::net::SocketAddr;

use super::{
    check_message_type, check_timestamp, new_cipher, open, put_addr, put_header, seal, unix_now,
    MessageType, Nonce, PacketError, NONCE_SIZE, REPLAY_WINDOW_DURATION, REQUEST_PACKET_SIZE,
    REQUEST_PLAINTEXT_SIZE, RESPONSE_PACKET_SIZE,
};
use crate::error::Result;
use crate::nonce::NonceCache;

/// Validates request packets and generates responses.
///
/// Owns the replay cache, so a single instance must serve a single receive loop.
pub struct Server {
    cipher: XChaCha20Poly1305,
    nonces: NonceCache<Nonce>,
}

impl Server {
    pub fn new(psk: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: new_cipher(psk)?,
            nonces: NonceCache::new(REPLAY_WINDOW_DURATION),
        })
    }

    /// Validates `req` and writes a response carrying `client_addr` into `resp`.
    ///
    /// `client_addr` must be the source address observed by the transport.
    pub fn handle(
        &mut self,
        client_addr: SocketAddr,
        req: &[u8],
        resp: &mut [u8; RESPONSE_PACKET_SIZE],
    ) -> std::result::Result<(), PacketError> {
        self.handle_at(client_addr, req, resp, unix_now())
    }

    pub(crate) fn handle_at(
        &mut self,
        client_addr: SocketAddr,
        req: &[u8],
        resp: &mut [u8; RESPONSE_PACKET_SIZE],
        now: i64,
    ) -> std::result::Result<(), PacketError> {
        if req.len() != REQUEST_PACKET_SIZE {
            return Err(PacketError::BadPacketSize(req.len()));
        }

        let mut nonce: Nonce = [0; NONCE_SIZE];
        nonce.copy_from_slice(&req[..NONCE_SIZE]);
        if !self.nonces.check(&nonce) {
            return Err(PacketError::RepeatedNonce);
        }

        let plaintext = open::<REQUEST_PLAINTEXT_SIZE>(&self.cipher, req)?;

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&plaintext[..8]);
        check_timestamp(ts, now)?;

        // trusted from here on, even if the type turns out wrong
        self.nonces.add(nonce);

        check_message_type(&plaintext, MessageType::Request)?;

        put_header(&mut resp[NONCE_SIZE..], now, MessageType::Response);
        put_addr(&mut resp[NONCE_SIZE..], client_addr);
        seal(&self.cipher, resp);

        Ok(())
    }

    pub fn cached_nonces(&self) -> usize {
        self.nonces.len()
    }
}
