#![allow(dead_code)]

//! In-process loopback transport for driving two service contexts
//! against each other.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use corpc::{EventSink, InboundMessage, Result, Transport, TransportEvent};

/// One endpoint of a loopback link. Control messages sent here appear
/// at the peer's event sink; bulk transmits land in the peer's inbound
/// bulk queue for its next bulk receive to pick up.
pub struct Loopback {
    sink: Mutex<Option<EventSink>>,
    peer: Mutex<Option<Arc<Loopback>>>,
    bulk_in: Mutex<VecDeque<Vec<u8>>>,
    abort_bulk: AtomicBool,
    next_token: AtomicU64,
    outstanding: AtomicUsize,
}

impl Loopback {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            sink: Mutex::new(None),
            peer: Mutex::new(None),
            bulk_in: Mutex::new(VecDeque::new()),
            abort_bulk: AtomicBool::new(false),
            next_token: AtomicU64::new(1),
            outstanding: AtomicUsize::new(0),
        })
    }

    /// Two endpoints wired to each other.
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let a = Self::new();
        let b = Self::new();
        *a.peer.lock() = Some(b.clone());
        *b.peer.lock() = Some(a.clone());
        (a, b)
    }

    /// An endpoint with no peer: everything sent into it vanishes, so
    /// calls never get responses.
    pub fn black_hole() -> Arc<Self> {
        Self::new()
    }

    pub fn attach(&self, sink: EventSink) {
        *self.sink.lock() = Some(sink);
    }

    /// Simulate the peer tearing the connection down.
    pub fn drop_peer(&self) {
        self.deliver(TransportEvent::PeerClosed);
    }

    /// Make subsequent bulk receives on this endpoint abort.
    pub fn set_abort_bulk(&self, abort: bool) {
        self.abort_bulk.store(abort, Ordering::SeqCst);
    }

    /// Received control messages not yet released back to us.
    pub fn outstanding_inbound(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    fn deliver(&self, event: TransportEvent) {
        let sink = self.sink.lock().clone();
        if let Some(sink) = sink {
            sink.deliver(event);
        }
    }
}

/// Handle to a loopback endpoint carrying the `Transport` impl. The
/// trait lives in the library, so the test crate needs its own type to
/// implement it on.
pub struct Endpoint(pub Arc<Loopback>);

impl Transport for Endpoint {
    fn send_control(&self, parts: &[&[u8]]) -> Result<()> {
        let peer = self.0.peer.lock().clone();
        let Some(peer) = peer else { return Ok(()) };
        let mut data = Vec::new();
        for part in parts {
            data.extend_from_slice(part);
        }
        let token = peer.next_token.fetch_add(1, Ordering::SeqCst);
        peer.outstanding.fetch_add(1, Ordering::SeqCst);
        peer.deliver(TransportEvent::MessageAvailable(InboundMessage::new(
            data, token,
        )));
        Ok(())
    }

    fn queue_bulk_transmit(&self, data: &[u8]) -> Result<()> {
        let peer = self.0.peer.lock().clone();
        if let Some(peer) = peer {
            peer.bulk_in.lock().push_back(data.to_vec());
        }
        self.0.deliver(TransportEvent::BulkTransmitDone);
        Ok(())
    }

    fn queue_bulk_receive(&self, len: usize) -> Result<()> {
        if self.0.abort_bulk.load(Ordering::SeqCst) {
            self.0.deliver(TransportEvent::BulkReceiveAborted);
            return Ok(());
        }
        // The sender may still be queueing its half; wait for it.
        let deadline = Instant::now() + Duration::from_secs(2);
        let bytes = loop {
            if let Some(bytes) = self.0.bulk_in.lock().pop_front() {
                break bytes;
            }
            assert!(Instant::now() < deadline, "bulk data never arrived");
            std::thread::sleep(Duration::from_millis(1));
        };
        assert_eq!(bytes.len(), len, "bulk transfer length mismatch");
        self.0.deliver(TransportEvent::BulkReceiveDone(bytes));
        Ok(())
    }

    fn release_inbound(&self, _msg: InboundMessage) {
        self.0.outstanding.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Poll `cond` until it holds, panicking after two seconds.
pub fn wait_until(cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        std::thread::sleep(Duration::from_millis(1));
    }
}
