//! Transport abstraction for Dispersy.
//!
//! The engine only ever sends: incoming datagrams are handed to
//! [`Dispersy::on_incoming_packets`](crate::Dispersy::on_incoming_packets)
//! by whoever owns the socket. Sending is synchronous and best-effort, like
//! UDP.
//!
//! # Example
//!
//! ```ignore
//! let transport = MockTransport::new();
//! transport.send(address, &[packet])?;
//! assert_eq!(transport.sent().len(), 1);
//! ```

mod mock;

pub use mock::MockTransport;

use std::net::SocketAddr;

use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Send failed.
    #[error("send to {address} failed: {reason}")]
    SendFailed {
        /// Destination.
        address: SocketAddr,
        /// Why it failed.
        reason: String,
    },

    /// The transport was closed.
    #[error("transport closed")]
    Closed,
}

/// Outgoing datagram channel.
pub trait Transport: Send + Sync {
    /// Send each packet to `address` as its own datagram.
    fn send(&self, address: SocketAddr, packets: &[Vec<u8>]) -> Result<(), TransportError>;
}
