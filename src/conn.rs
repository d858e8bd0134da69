//! UDP transport with cancellable reads.
//!
//! Reads block until a datagram arrives or the read deadline passes. Setting the deadline
//! wakes any blocked reader, so moving it into the past is how sessions and listeners
//! are shut down: the reader sees [`is_deadline_exceeded`] and exits.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use socket2::{Domain, MaybeUninitSlice, Protocol, SockAddr, Socket, Type};
use std::io::{self, Error, ErrorKind};
use std::mem::MaybeUninit;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::AsFd;
use std::os::unix::net::UnixDatagram;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::DeliveryError;

/// Delivery indicators the OS reported for a received datagram.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeliveryFlags {
    pub truncated: bool,
    pub out_of_band: bool,
}

impl DeliveryFlags {
    pub fn check(self) -> Result<(), DeliveryError> {
        if self.truncated {
            return Err(DeliveryError::Truncated);
        }
        if self.out_of_band {
            return Err(DeliveryError::OutOfBand);
        }
        Ok(())
    }
}

/// Datagram socket as seen by client sessions and server listeners.
pub trait Transport: Send + Sync + 'static {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Blocks until a datagram is received. Fails with [`ErrorKind::TimedOut`] once the
    /// read deadline has passed.
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, DeliveryFlags)>;

    /// `None` clears the deadline. Blocked readers re-evaluate the new deadline immediately.
    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

pub fn deadline_exceeded() -> Error {
    Error::new(ErrorKind::TimedOut, "read deadline exceeded")
}

/// Whether a receive error was caused by the read deadline rather than a real fault.
pub fn is_deadline_exceeded(err: &Error) -> bool {
    err.kind() == ErrorKind::TimedOut
}

pub struct UdpTransport {
    socket: Socket,
    v6: bool,
    read_deadline: Mutex<Option<Instant>>,
    waker_rx: UnixDatagram,
    waker_tx: UnixDatagram,
}

impl UdpTransport {
    /// bind to `local_addr`.
    ///
    /// An empty address picks the wildcard address of `peer`'s family (IPv6 if there is no peer).
    /// `:port` binds a dual-stack socket on all addresses.
    pub fn bind(local_addr: &str, peer: Option<SocketAddr>) -> io::Result<Self> {
        let (addr, dual_stack) = Self::resolve_bind_addr(local_addr, peer)?;

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        if dual_stack {
            socket.set_only_v6(false)?;
        }
        socket.bind(&addr.into())?;
        Self::from_socket(socket)
    }

    pub fn from_socket(socket: Socket) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let v6 = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| Error::new(ErrorKind::Other, "not an inet socket"))?
            .is_ipv6();

        let (waker_rx, waker_tx) = UnixDatagram::pair()?;
        waker_rx.set_nonblocking(true)?;
        waker_tx.set_nonblocking(true)?;

        Ok(Self {
            socket,
            v6,
            read_deadline: Mutex::new(None),
            waker_rx,
            waker_tx,
        })
    }

    fn resolve_bind_addr(local_addr: &str, peer: Option<SocketAddr>) -> io::Result<(SocketAddr, bool)> {
        if local_addr.is_empty() {
            let ip = match peer {
                Some(SocketAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                _ => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            };
            return Ok((SocketAddr::new(ip, 0), peer.is_none()));
        }

        if let Some(port) = local_addr.strip_prefix(':') {
            let port = port
                .parse()
                .map_err(|_| Error::new(ErrorKind::InvalidInput, "invalid port"))?;
            return Ok((SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), port), true));
        }

        let addr = local_addr
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| Error::new(ErrorKind::Other, "no addr"))?;
        Ok((addr, false))
    }

    fn read_deadline(&self) -> Option<Instant> {
        *self.read_deadline.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn drain_waker(&self) {
        let mut buf = [0u8; 16];
        while self.waker_rx.recv(&mut buf).is_ok() {}
    }

    /// Waits for the socket to become readable. Returns false if woken for any other reason.
    fn wait_readable(&self, deadline: Option<Instant>) -> io::Result<bool> {
        let timeout = match deadline {
            Some(d) => {
                let now = Instant::now();
                if d <= now {
                    return Err(deadline_exceeded());
                }
                PollTimeout::try_from(d - now).unwrap_or(PollTimeout::MAX)
            }
            None => PollTimeout::NONE,
        };

        let mut fds = [
            PollFd::new(self.socket.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.waker_rx.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, timeout) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(false),
            Err(e) => return Err(e.into()),
        }

        let ready = |fd: &PollFd| fd.revents().is_some_and(|r| !r.is_empty());
        if ready(&fds[1]) {
            self.drain_waker();
            return Ok(false);
        }
        Ok(ready(&fds[0]))
    }

    fn wait_writable(&self) -> io::Result<()> {
        let mut fds = [PollFd::new(self.socket.as_fd(), PollFlags::POLLOUT)];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) | Err(Errno::EINTR) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn try_recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, DeliveryFlags)> {
        // SAFETY: recv only writes initialized bytes into the buffer, which is already initialized.
        let uninit = unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let mut bufs = [MaybeUninitSlice::new(uninit)];
        let (n, flags, addr) = self.socket.recv_from_vectored(&mut bufs)?;

        let addr = addr
            .as_socket()
            .ok_or_else(|| Error::new(ErrorKind::Other, "invalid source address"))?;
        let flags = DeliveryFlags {
            truncated: flags.is_truncated(),
            out_of_band: flags.is_out_of_band(),
        };

        Ok((n, addr, flags))
    }

    fn target_addr(&self, target: SocketAddr) -> SockAddr {
        match target {
            SocketAddr::V4(v4) if self.v6 => {
                SocketAddr::new(IpAddr::V6(v4.ip().to_ipv6_mapped()), v4.port()).into()
            }
            _ => target.into(),
        }
    }
}

impl Transport for UdpTransport {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        let target = self.target_addr(target);
        loop {
            match self.socket.send_to(buf, &target) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.wait_writable()?;
                }
                r => return r,
            }
        }
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, DeliveryFlags)> {
        loop {
            if !self.wait_readable(self.read_deadline())? {
                continue;
            }

            match self.try_recv(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::Interrupted => {
                    continue
                }
                r => return r,
            }
        }
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) -> io::Result<()> {
        *self.read_deadline.lock().unwrap_or_else(|e| e.into_inner()) = deadline;

        match self.waker_tx.send(&[1]) {
            Err(e) if e.kind() != ErrorKind::WouldBlock => Err(e),
            _ => Ok(()),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| Error::new(ErrorKind::Other, "not an inet socket"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_send_recv() {
        let a = UdpTransport::bind("127.0.0.1:0", None).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0", None).unwrap();

        a.send_to(b"hello", b.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 16];
        let (n, from, flags) = b.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
        assert!(flags.check().is_ok());
    }

    #[test]
    fn test_truncated() {
        let a = UdpTransport::bind("127.0.0.1:0", None).unwrap();
        let b = UdpTransport::bind("127.0.0.1:0", None).unwrap();

        a.send_to(&[0u8; 32], b.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 8];
        let (_, _, flags) = b.recv_from(&mut buf).unwrap();
        assert_eq!(flags.check(), Err(DeliveryError::Truncated));
    }

    #[test]
    fn test_deadline_unblocks_reader() {
        let t = Arc::new(UdpTransport::bind("127.0.0.1:0", None).unwrap());

        let r = {
            let t = t.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 16];
                t.recv_from(&mut buf)
            })
        };

        thread::sleep(Duration::from_millis(50));
        t.set_read_deadline(Some(Instant::now())).unwrap();

        let err = r.join().unwrap().unwrap_err();
        assert!(is_deadline_exceeded(&err));

        // deadline sticks until cleared
        let mut buf = [0u8; 16];
        assert!(is_deadline_exceeded(&t.recv_from(&mut buf).unwrap_err()));

        t.set_read_deadline(None).unwrap();
        t.send_to(b"again", t.local_addr().unwrap()).unwrap();
        let (n, _, _) = t.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"again");
    }

    #[test]
    fn test_future_deadline() {
        let t = UdpTransport::bind("127.0.0.1:0", None).unwrap();
        t.set_read_deadline(Some(Instant::now() + Duration::from_millis(30)))
            .unwrap();

        let start = Instant::now();
        let mut buf = [0u8; 16];
        assert!(is_deadline_exceeded(&t.recv_from(&mut buf).unwrap_err()));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_bind_addr() {
        let v4: SocketAddr = "192.0.2.1:53".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:53".parse().unwrap();

        let (addr, dual) = UdpTransport::resolve_bind_addr("", Some(v4)).unwrap();
        assert_eq!(addr, "0.0.0.0:0".parse().unwrap());
        assert!(!dual);

        let (addr, _) = UdpTransport::resolve_bind_addr("", Some(v6)).unwrap();
        assert_eq!(addr, "[::]:0".parse().unwrap());

        let (addr, dual) = UdpTransport::resolve_bind_addr(":20220", None).unwrap();
        assert_eq!(addr, "[::]:20220".parse().unwrap());
        assert!(dual);

        assert!(UdpTransport::resolve_bind_addr(":x", None).is_err());
    }
}
