//! UDP discovery.
//!
//! use `Client` to learn the address a server observes for this host.
//!
//! use `Server` to answer clients.

#[cfg(feature = "client")]
mod client;
#[cfg(feature = "client")]
pub use client::{Client, Outcome, Outcomes, DEFAULT_INTERVAL, DEFAULT_ONESHOT_ATTEMPTS};

#[cfg(feature = "server")]
mod server;
#[cfg(feature = "server")]
pub use server::Server;
