//! A reverse port-forwarding tunnel.
//!
//! An internet-facing [`server::Server`] accepts long-lived control
//! connections from [`client::Client`]s running inside private networks. For
//! each authenticated client it binds public TCP ports and relays every
//! connection accepted on them, multiplexed over the single control link, to
//! a backend address the client dials locally.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod server;
pub mod shared;
