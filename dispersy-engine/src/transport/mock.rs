//! Mock transport for testing.
//!
//! Captures sent datagrams for verification and can be told to fail.

use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{Transport, TransportError};

/// Mock transport for testing.
///
/// Clones share the same record, so a test can keep one handle while the
/// engine owns another.
#[derive(Debug, Default, Clone)]
pub struct MockTransport {
    inner: Arc<Mutex<MockTransportInner>>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    closed: bool,
    sent: Vec<(SocketAddr, Vec<u8>)>,
    fail_next_send: Option<String>,
}

impl MockTransport {
    /// Create a new mock transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every datagram sent so far, in order.
    pub fn sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        self.inner.lock().sent.clone()
    }

    /// Datagrams sent to one address.
    pub fn sent_to(&self, address: SocketAddr) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .sent
            .iter()
            .filter(|(to, _)| *to == address)
            .map(|(_, packet)| packet.clone())
            .collect()
    }

    /// Get the last datagram that was sent.
    pub fn last_sent(&self) -> Option<(SocketAddr, Vec<u8>)> {
        self.inner.lock().sent.last().cloned()
    }

    /// Remove and return everything sent so far.
    pub fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    /// Cause the next send() to fail with the given error.
    pub fn fail_next_send(&self, error: &str) {
        self.inner.lock().fail_next_send = Some(error.to_string());
    }

    /// Refuse every further send.
    pub fn close(&self) {
        self.inner.lock().closed = true;
    }

    /// Clear all state.
    pub fn reset(&self) {
        *self.inner.lock() = MockTransportInner::default();
    }
}

impl Transport for MockTransport {
    fn send(&self, address: SocketAddr, packets: &[Vec<u8>]) -> Result<(), TransportError> {
        let mut inner = self.inner.lock();

        if inner.closed {
            return Err(TransportError::Closed);
        }

        // Check for forced failure
        if let Some(reason) = inner.fail_next_send.take() {
            return Err(TransportError::SendFailed { address, reason });
        }

        for packet in packets {
            inner.sent.push((address, packet.clone()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    #[test]
    fn mock_transport_records_each_packet() {
        let transport = MockTransport::new();
        transport
            .send(addr(1), &[b"one".to_vec(), b"two".to_vec()])
            .unwrap();
        transport.send(addr(2), &[b"three".to_vec()]).unwrap();

        let sent = transport.sent();
        assert_eq!(sent.len(), 3);
        assert_eq!(sent[0], (addr(1), b"one".to_vec()));
        assert_eq!(transport.sent_to(addr(2)), vec![b"three".to_vec()]);
    }

    #[test]
    fn last_sent_returns_most_recent() {
        let transport = MockTransport::new();
        assert!(transport.last_sent().is_none());
        transport.send(addr(1), &[b"first".to_vec()]).unwrap();
        transport.send(addr(1), &[b"second".to_vec()]).unwrap();
        assert_eq!(transport.last_sent(), Some((addr(1), b"second".to_vec())));
    }

    #[test]
    fn forced_send_failure() {
        let transport = MockTransport::new();
        transport.fail_next_send("buffer full");

        let result = transport.send(addr(1), &[b"data".to_vec()]);
        assert!(matches!(result, Err(TransportError::SendFailed { .. })));

        // Next send should work
        transport.send(addr(1), &[b"data".to_vec()]).unwrap();
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn closed_transport_refuses() {
        let transport = MockTransport::new();
        transport.close();
        assert!(matches!(
            transport.send(addr(1), &[b"x".to_vec()]),
            Err(TransportError::Closed)
        ));
    }

    #[test]
    fn clone_shares_state_and_take_drains() {
        let transport = MockTransport::new();
        let handle = transport.clone();
        transport.send(addr(1), &[b"x".to_vec()]).unwrap();
        assert_eq!(handle.take_sent().len(), 1);
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn reset_clears_all() {
        let transport = MockTransport::new();
        transport.send(addr(1), &[b"x".to_vec()]).unwrap();
        transport.close();
        transport.reset();
        assert!(transport.sent().is_empty());
        transport.send(addr(1), &[b"y".to_vec()]).unwrap();
    }
}
