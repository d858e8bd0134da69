//!Observed port discovery over authenticated UDP.
//!
//!A host behind NAT (such as a home gateway) can not tell which public address and port its
//!outgoing UDP traffic is mapped to. Only someone on the other side of the NAT can see that.
//!
//!## How opdt works
//!Run a server on a publicly reachable address and give its pre-shared key to the clients.
//!
//!A client keeps sending small authenticated requests to the server. The server replies to each
//!valid request with the source address and port it observed for that datagram, which is exactly
//!what the NAT mapped the client to. The address is always taken from the socket, never from the
//!request itself.
//!
//!Packets are sealed with XChaCha20-Poly1305 and carry a timestamp, so a server only accepts
//!requests within 30 seconds of its own clock. Nonces of accepted requests are remembered for
//!60 seconds, so a captured request can not be replayed.
//!
//!Clock adjustments on either side are not accounted for. If the wall clock steps backwards,
//!a request older than the nonce retention may pass the freshness check again.
//!
//!## Feature flags
//!Both halves are built by default. A program that only discovers its own address needs just
//!the `client` feature:
//!
//!```toml
//!opdt = { version = "0.1", default-features=false, features=["client"]}
//!```
//!
//!- `client`: udp client session
//!- `server`: udp server

mod cancel;
pub mod config;
pub mod conn;
pub mod error;
pub mod nonce;
pub mod packet;
pub mod udp;

pub use cancel::CancelToken;
pub use error::{Error, Result};
