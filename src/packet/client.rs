use chacha20poly1305::XChaCha20Poly1305;
use std::net::SocketAddr;

use super::{
    check_header, get_addr, new_cipher, open, put_header, seal, unix_now, MessageType,
    PacketError, NONCE_SIZE, REQUEST_PACKET_SIZE, RESPONSE_PACKET_SIZE, RESPONSE_PLAINTEXT_SIZE,
};
use crate::error::Result;

/// Generates request packets and parses response packets.
#[derive(Clone)]
pub struct Client {
    cipher: XChaCha20Poly1305,
}

impl Client {
    pub fn new(psk: &[u8]) -> Result<Self> {
        Ok(Self {
            cipher: new_cipher(psk)?,
        })
    }

    /// Writes a fresh request packet into `req`.
    pub fn put_request(&self, req: &mut [u8; REQUEST_PACKET_SIZE]) {
        self.put_request_at(req, unix_now())
    }

    pub(crate) fn put_request_at(&self, req: &mut [u8; REQUEST_PACKET_SIZE], now: i64) {
        put_header(&mut req[NONCE_SIZE..], now, MessageType::Request);
        seal(&self.cipher, req);
    }

    /// Parses a response packet and returns the address the server observed.
    pub fn parse_response(&self, resp: &[u8]) -> std::result::Result<SocketAddr, PacketError> {
        self.parse_response_at(resp, unix_now())
    }

    pub(crate) fn parse_response_at(
        &self,
        resp: &[u8],
        now: i64,
    ) -> std::result::Result<SocketAddr, PacketError> {
        if resp.len() != RESPONSE_PACKET_SIZE {
            return Err(PacketError::BadPacketSize(resp.len()));
        }

        let plaintext = open::<RESPONSE_PLAINTEXT_SIZE>(&self.cipher, resp)?;
        check_header(&plaintext, now, MessageType::Response)?;

        Ok(get_addr(&plaintext))
    }
}
