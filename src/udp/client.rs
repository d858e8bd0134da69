use log;
use std::net::SocketAddr;
use std::sync::mpsc::{self, sync_channel, Receiver, RecvError, SyncSender};
use std::sync::Arc;
use std::thread::{spawn, JoinHandle};
use std::time::{Duration, Instant};

use crate::cancel::CancelToken;
use crate::config::ClientConfig;
use crate::conn::{is_deadline_exceeded, Transport, UdpTransport};
use crate::error::{AttemptError, Error, Result};
use crate::packet::{self, REQUEST_PACKET_SIZE, RESPONSE_PACKET_SIZE};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_ONESHOT_ATTEMPTS: u32 = 5;

/// Result of one exchange attempt: the address the server observed, or what went wrong.
pub type Outcome = std::result::Result<SocketAddr, AttemptError>;

/// Outcomes of a running session, in the order they happened.
///
/// The stream ends once the session has fully stopped. Dropping it stops the session.
pub struct Outcomes {
    rx: Receiver<Outcome>,
    session: CancelToken,
}

impl Outcomes {
    /// Blocks for the next outcome, fails once the session has stopped.
    pub fn recv(&self) -> std::result::Result<Outcome, RecvError> {
        self.rx.recv()
    }

    pub fn iter(&self) -> mpsc::Iter<'_, Outcome> {
        self.rx.iter()
    }
}

impl Iterator for Outcomes {
    type Item = Outcome;

    fn next(&mut self) -> Option<Outcome> {
        self.rx.recv().ok()
    }
}

impl Drop for Outcomes {
    fn drop(&mut self) {
        self.session.cancel();
    }
}

/// Asks a server which address and port it sees our traffic coming from.
///
/// # example
/// ```no_run
/// use opdt::{udp::Client, CancelToken};
/// use std::time::Duration;
///
/// let c = Client::new("192.0.2.1:20220".parse().unwrap(), "", &[0u8; 32]).unwrap();
/// let addr = c.get(&CancelToken::new(), Duration::from_secs(1), 3).unwrap();
/// println!("{}", addr);
/// ```
pub struct Client<T: Transport = UdpTransport> {
    server_addr: SocketAddr,
    transport: Arc<T>,
    handler: Arc<packet::Client>,
}

impl Client {
    /// bind to `bind_addr` (empty for any) and use `psk` to talk to `server_addr`.
    pub fn new(server_addr: SocketAddr, bind_addr: &str, psk: &[u8]) -> Result<Self> {
        let handler = packet::Client::new(psk)?;
        let transport = UdpTransport::bind(bind_addr, Some(server_addr))?;
        Ok(Self::with_transport(server_addr, transport, handler))
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Self::new(config.server_address, &config.bind_address, &config.psk)
    }
}

impl<T: Transport> Client<T> {
    pub fn with_transport(server_addr: SocketAddr, transport: T, handler: packet::Client) -> Self {
        Self {
            server_addr,
            transport: Arc::new(transport),
            handler: Arc::new(handler),
        }
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.transport.local_addr()?)
    }

    /// Sends requests every `interval` (0 for default) until `cancel` fires or the returned
    /// [`Outcomes`] is dropped.
    ///
    /// The stream closes only after the read deadline has been forced and both the sending and
    /// receiving threads have exited.
    pub fn run(&self, cancel: &CancelToken, interval: Duration) -> Result<Outcomes> {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };

        self.transport.set_read_deadline(None)?;

        let session = cancel.child();
        let (tx, rx) = sync_channel(0);

        let sender = self.spawn_send(tx.clone(), session.clone(), interval);
        let receiver = self.spawn_recv(tx.clone(), session.clone());

        let transport = self.transport.clone();
        let cancel = session.clone();
        spawn(move || {
            cancel.wait();
            if let Err(e) = transport.set_read_deadline(Some(Instant::now())) {
                log::warn!("failed to set read deadline: {}", e);
            }
            let _ = sender.join();
            let _ = receiver.join();
            log::debug!("client session stopped");
            // last sender, the stream closes here
            drop(tx);
        });

        Ok(Outcomes { rx, session })
    }

    /// Tries up to `attempts` (0 for default) times and returns the first discovered address.
    ///
    /// Gives up after `interval * attempts` with the last error seen, or
    /// [`Error::DeadlineExceeded`] if nothing came back at all. A product too large to represent
    /// means no deadline, so only `cancel` ends the attempts.
    pub fn get(&self, cancel: &CancelToken, interval: Duration, attempts: u32) -> Result<SocketAddr> {
        let interval = if interval.is_zero() {
            DEFAULT_INTERVAL
        } else {
            interval
        };
        let attempts = if attempts == 0 {
            DEFAULT_ONESHOT_ATTEMPTS
        } else {
            attempts
        };

        let cancel = match interval.checked_mul(attempts) {
            Some(timeout) => cancel.child_with_timeout(timeout),
            None => cancel.child(),
        };
        let outcomes = self.run(&cancel, interval)?;

        let mut last_err = None;
        while let Ok(outcome) = outcomes.recv() {
            match outcome {
                Ok(addr) => {
                    // wait for the session to wind down, so a later run starts clean
                    cancel.cancel();
                    for _ in outcomes {}
                    return Ok(addr);
                }
                Err(e) => {
                    log::debug!("{}", e);
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.map_or(Error::DeadlineExceeded, Error::Attempt))
    }

    /// Closes the socket. Sessions still running keep it open until they stop.
    pub fn close(self) {}

    fn spawn_send(
        &self,
        tx: SyncSender<Outcome>,
        cancel: CancelToken,
        interval: Duration,
    ) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let handler = self.handler.clone();
        let server_addr = self.server_addr;

        spawn(move || {
            let mut req = [0u8; REQUEST_PACKET_SIZE];

            loop {
                handler.put_request(&mut req);

                if let Err(e) = transport.send_to(&req, server_addr) {
                    let err = AttemptError::new(
                        "failed to send request",
                        Some(server_addr),
                        REQUEST_PACKET_SIZE,
                        e,
                    );
                    if tx.send(Err(err)).is_err() {
                        return;
                    }
                }

                if cancel.wait_timeout(interval) {
                    return;
                }
            }
        })
    }

    fn spawn_recv(&self, tx: SyncSender<Outcome>, cancel: CancelToken) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let handler = self.handler.clone();

        spawn(move || {
            let mut resp = [0u8; RESPONSE_PACKET_SIZE];

            loop {
                let outcome = match transport.recv_from(&mut resp) {
                    Err(e) if is_deadline_exceeded(&e) => return,
                    Err(e) => Err(AttemptError::new("failed to receive packet", None, 0, e)),
                    Ok((n, peer, flags)) => match flags.check() {
                        Err(e) => Err(AttemptError::new("failed to receive packet", Some(peer), n, e)),
                        Ok(()) => handler.parse_response(&resp[..n]).map_err(|e| {
                            AttemptError::new("failed to parse response", Some(peer), n, e)
                        }),
                    },
                };

                let ok = outcome.is_ok();
                if tx.send(outcome).is_err() {
                    return;
                }

                if ok && cancel.is_cancelled() {
                    return;
                }
            }
        })
    }
}
