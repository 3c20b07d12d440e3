//! The transport seam.
//!
//! The engine consumes a small, stable interface from the point-to-point
//! transport: an outbound control-message send built from 2-4
//! concatenated parts, asynchronous bulk (DMA-like) transmit/receive
//! primitives, and a release call returning a received message's storage
//! to the transport. Everything the transport wants to tell us comes
//! back through a single [`TransportEvent`] callback, delivered to the
//! service's [`EventSink`](crate::service::EventSink).

use crate::error::Result;

/// A received control message, owned by the transport until released.
///
/// The token identifies the transport-side buffer so the transport can
/// recycle it; the engine copies what it needs and releases the message
/// as early as possible to keep the transport's flow-control window
/// open.
#[derive(Debug)]
pub struct InboundMessage {
    data: Vec<u8>,
    token: u64,
}

impl InboundMessage {
    /// Wrap a received message. Called by the transport adapter.
    pub fn new(data: Vec<u8>, token: u64) -> Self {
        Self { data, token }
    }

    /// The raw message bytes, header included.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The transport-side buffer token.
    #[inline]
    pub fn token(&self) -> u64 {
        self.token
    }
}

/// Interface consumed from the transport adapter.
///
/// The transport must guarantee in-order, reliable delivery of control
/// messages; the engine adds no reliability layer of its own.
pub trait Transport: Send + Sync {
    /// Transmit one control message composed of the concatenation of
    /// `parts` (header, primary payload, optional secondary payload).
    fn send_control(&self, parts: &[&[u8]]) -> Result<()>;

    /// Queue an asynchronous bulk transmit of `data`. Completion is
    /// reported through [`TransportEvent::BulkTransmitDone`].
    fn queue_bulk_transmit(&self, data: &[u8]) -> Result<()>;

    /// Queue an asynchronous bulk receive of exactly `len` bytes.
    /// Completion delivers the bytes through
    /// [`TransportEvent::BulkReceiveDone`], or
    /// [`TransportEvent::BulkReceiveAborted`] on peer teardown.
    fn queue_bulk_receive(&self, len: usize) -> Result<()>;

    /// Return a received message's storage to the transport.
    fn release_inbound(&self, msg: InboundMessage);
}

/// Events delivered by the transport adapter.
#[derive(Debug)]
pub enum TransportEvent {
    /// A control message arrived.
    MessageAvailable(InboundMessage),
    /// An outbound bulk transfer completed.
    BulkTransmitDone,
    /// An outbound bulk transfer was aborted.
    BulkTransmitAborted,
    /// An inbound bulk transfer completed with the received bytes.
    BulkReceiveDone(Vec<u8>),
    /// An inbound bulk transfer was aborted; the peer is tearing down.
    BulkReceiveAborted,
    /// A peer connected to a listening endpoint.
    PeerOpened,
    /// The peer closed the connection.
    PeerClosed,
}
