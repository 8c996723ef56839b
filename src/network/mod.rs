//! Network Module
//!
//! TCP ingress, peer relays and the blocking client.
//!
//! ## Architecture
//! - Single non-blocking acceptor thread, one thread per connection
//! - Dispatch workers drain router-to-manager traffic
//! - Pooled outbound connections to peer hosts with bounded retry

mod client;
mod connection;
mod manager;
mod pool;

pub use client::Client;
pub use connection::Connection;
pub use manager::{ConnectionManager, ControlPlane};
pub use pool::{Backoff, ConnectionPool, PeerConnection, PoolOptions};
