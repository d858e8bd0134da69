use log;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};
use std::time::Instant;

use crate::config::ServerConfig;
use crate::conn::{is_deadline_exceeded, Transport, UdpTransport};
use crate::error::{Error, Result};
use crate::packet::{self, REQUEST_PACKET_SIZE, RESPONSE_PACKET_SIZE};

/// Udp discovery server
///
/// answers every valid request with the source address and port the request arrived from.
pub struct Server<T: Transport = UdpTransport> {
    transport: Option<Arc<T>>,
    handler: Option<packet::Server>,
    worker: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(listen_addr: &str, psk: &[u8]) -> Result<Self> {
        let handler = packet::Server::new(psk)?;
        let transport = UdpTransport::bind(listen_addr, None)?;
        Ok(Self::with_transport(transport, handler))
    }

    pub fn from_config(config: &ServerConfig) -> Result<Self> {
        Self::new(&config.listen_address, &config.psk)
    }
}

impl<T: Transport> Server<T> {
    pub fn with_transport(transport: T, handler: packet::Server) -> Self {
        Self {
            transport: Some(Arc::new(transport)),
            handler: Some(handler),
            worker: None,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match self.transport {
            Some(ref t) => Ok(t.local_addr()?),
            None => Err(Error::Io(std::io::ErrorKind::NotConnected.into())),
        }
    }

    /// Spawns the receive loop.
    pub fn start(&mut self) -> Result<()> {
        let (transport, handler) = match (self.transport.as_ref(), self.handler.take()) {
            (Some(t), Some(h)) => (t.clone(), h),
            _ => return Err(Error::AlreadyStarted),
        };

        self.worker = Some(spawn(move || Self::recv(transport, handler)));
        Ok(())
    }

    /// Stops the receive loop, waits for it to exit, then closes the socket.
    ///
    /// If the loop can not be interrupted the server is left running, so `stop` may be retried.
    pub fn stop(&mut self) -> Result<()> {
        let transport = match self.transport {
            Some(ref t) => t,
            None => return Ok(()),
        };

        if self.worker.is_some() {
            transport.set_read_deadline(Some(Instant::now()))?;
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        self.transport = None;
        Ok(())
    }

    fn recv(transport: Arc<T>, mut handler: packet::Server) {
        let mut req = [0u8; REQUEST_PACKET_SIZE];
        let mut resp = [0u8; RESPONSE_PACKET_SIZE];

        loop {
            let (n, client_addr, flags) = match transport.recv_from(&mut req) {
                Ok(r) => r,
                Err(e) if is_deadline_exceeded(&e) => break,
                Err(e) => {
                    log::warn!("failed to receive packet: {}", e);
                    continue;
                }
            };

            if let Err(e) = flags.check() {
                log::warn!(
                    "failed to receive packet, client address: {}, packet length: {}: {}",
                    client_addr,
                    n,
                    e
                );
                continue;
            }

            if let Err(e) = handler.handle(client_addr, &req[..n], &mut resp) {
                log::warn!(
                    "failed to handle request, client address: {}, packet length: {}: {}",
                    client_addr,
                    n,
                    e
                );
                continue;
            }

            if let Err(e) = transport.send_to(&resp, client_addr) {
                log::warn!(
                    "failed to send response, client address: {}, packet length: {}: {}",
                    client_addr,
                    n,
                    e
                );
                continue;
            }

            log::info!("handled request, client address: {}", client_addr);
        }

        log::debug!("server stopped");
    }
}

impl<T: Transport> Drop for Server<T> {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{deadline_exceeded, DeliveryFlags};
    use crate::packet::KEY_SIZE;
    use std::net::UdpSocket;
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;

    const PSK: [u8; KEY_SIZE] = [0u8; KEY_SIZE];

    fn start_server() -> (Server, SocketAddr) {
        let mut s = Server::new("127.0.0.1:0", &PSK).unwrap();
        s.start().unwrap();
        let addr = s.local_addr().unwrap();
        (s, addr)
    }

    #[test]
    fn test_reply_carries_observed_addr() {
        let (mut s, server_addr) = start_server();
        let codec = packet::Client::new(&PSK).unwrap();

        let sk = UdpSocket::bind("127.0.0.1:0").unwrap();
        sk.set_read_timeout(Some(Duration::from_secs(5))).unwrap();

        let mut req = [0u8; REQUEST_PACKET_SIZE];
        codec.put_request(&mut req);
        sk.send_to(&req, server_addr).unwrap();

        let mut buf = [0u8; 128];
        let (n, from) = sk.recv_from(&mut buf).unwrap();
        assert_eq!(from, server_addr);
        assert_eq!(n, RESPONSE_PACKET_SIZE);
        assert_eq!(codec.parse_response(&buf[..n]).unwrap(), sk.local_addr().unwrap());

        s.stop().unwrap();
    }

    #[test]
    fn test_ignores_invalid_and_replayed() {
        let (mut s, server_addr) = start_server();
        let codec = packet::Client::new(&PSK).unwrap();

        let sk = UdpSocket::bind("127.0.0.1:0").unwrap();
        sk.set_read_timeout(Some(Duration::from_millis(200))).unwrap();

        let mut req = [0u8; REQUEST_PACKET_SIZE];
        codec.put_request(&mut req);
        sk.send_to(&req, server_addr).unwrap();
        let mut buf = [0u8; 128];
        sk.recv_from(&mut buf).unwrap();

        // replay, garbage, wrong key: no replies
        sk.send_to(&req, server_addr).unwrap();
        sk.send_to(b"hello", server_addr).unwrap();
        packet::Client::new(&[9u8; KEY_SIZE])
            .unwrap()
            .put_request(&mut req);
        sk.send_to(&req, server_addr).unwrap();
        assert!(sk.recv_from(&mut buf).is_err());

        // still serving
        codec.put_request(&mut req);
        sk.send_to(&req, server_addr).unwrap();
        sk.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let (n, _) = sk.recv_from(&mut buf).unwrap();
        assert_eq!(n, RESPONSE_PACKET_SIZE);

        s.stop().unwrap();
    }

    #[test]
    fn test_stop() {
        let (mut s, _) = start_server();
        s.stop().unwrap();
        assert!(s.local_addr().is_err());
        s.stop().unwrap();
        assert!(matches!(s.start(), Err(Error::AlreadyStarted)));
    }

    /// Refuses the first deadline, then behaves.
    struct StubbornTransport {
        state: Mutex<(bool, Option<Instant>)>,
        cond: Condvar,
    }

    impl Transport for StubbornTransport {
        fn send_to(&self, buf: &[u8], _target: SocketAddr) -> std::io::Result<usize> {
            Ok(buf.len())
        }

        fn recv_from(
            &self,
            _buf: &mut [u8],
        ) -> std::io::Result<(usize, SocketAddr, DeliveryFlags)> {
            let mut state = self.state.lock().unwrap();
            while !state.1.is_some_and(|d| d <= Instant::now()) {
                state = self.cond.wait(state).unwrap();
            }
            Err(deadline_exceeded())
        }

        fn set_read_deadline(&self, deadline: Option<Instant>) -> std::io::Result<()> {
            let mut state = self.state.lock().unwrap();
            if !state.0 {
                state.0 = true;
                return Err(std::io::ErrorKind::Other.into());
            }
            state.1 = deadline;
            self.cond.notify_all();
            Ok(())
        }

        fn local_addr(&self) -> std::io::Result<SocketAddr> {
            Ok("127.0.0.1:1".parse().unwrap())
        }
    }

    #[test]
    fn test_stop_retry_after_failure() {
        let t = StubbornTransport {
            state: Mutex::new((false, None)),
            cond: Condvar::new(),
        };
        let mut s = Server::with_transport(t, packet::Server::new(&PSK).unwrap());
        s.start().unwrap();

        assert!(s.stop().is_err());
        assert!(s.worker.is_some());
        assert!(s.local_addr().is_ok());

        s.stop().unwrap();
        assert!(s.worker.is_none());
        assert!(s.local_addr().is_err());
    }

    #[test]
    fn test_start_twice() {
        let (mut s, _) = start_server();
        assert!(matches!(s.start(), Err(Error::AlreadyStarted)));
    }
}
