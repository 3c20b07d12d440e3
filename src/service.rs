//! The service context: lifecycle, dispatch thread, call correlation,
//! command execution, and the bulk-buffer entry points.
//!
//! One [`Service`] wraps one side of the link. A dedicated dispatch
//! thread drains the inbound queue, routing responses to the wait slot
//! whose xid they carry and executing commands through the registered
//! handler table. Callers block until their response arrives; a caller
//! that happens to be the dispatch thread itself pumps the queue while
//! it waits, which is what makes nested call chains across the link
//! make progress instead of deadlocking.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use parking_lot::{Condvar, Mutex};

use crate::config::{HandlerEntry, ServiceConfig};
use crate::error::{Error, Result};
use crate::marshal::{self, DecodedXfer, XferPlan};
use crate::message::{FunctionId, MsgHdr, FN_RESPONSE, MAX_PAYLOAD_SIZE, MSG_HDR_SIZE};
use crate::slot::{CallOutcome, ScratchPool, WaitTable, MAX_WAITING, SCRATCH_POOL_SIZE};
use crate::transport::{InboundMessage, Transport, TransportEvent};

/// Inbound queue depth at which a warning is logged. The queue is
/// unbounded; sustained depth here means the dispatch thread is not
/// keeping up.
const QUEUE_WARN_DEPTH: usize = 128;

/// Lifecycle of a service context. States only ever advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Lifecycle {
    /// Accepting calls and commands.
    Normal = 0,
    /// A bulk transfer was aborted; new calls are rejected but the
    /// dispatch thread keeps pumping so in-flight calls can finish.
    BulkAborted = 1,
    /// The peer closed; the dispatch thread is winding down.
    PeerClosed = 2,
    /// Local shutdown was requested.
    ShutdownRequested = 3,
}

impl Lifecycle {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Lifecycle::Normal,
            1 => Lifecycle::BulkAborted,
            2 => Lifecycle::PeerClosed,
            _ => Lifecycle::ShutdownRequested,
        }
    }
}

/// What arrives on the dispatch queue.
enum Inbound {
    Msg(InboundMessage),
    Quit,
}

/// Outcome of one pump iteration.
enum Flow {
    Handled,
    Empty,
    Quit,
}

/// Completion of an inbound bulk transfer.
enum BulkRx {
    Done(Vec<u8>),
    Aborted,
}

/// Hands one bulk-receive completion from the event sink to the
/// handler blocked in `receive_buffer`. At most one inbound bulk
/// transfer is in flight at a time; command execution is serialized on
/// the dispatch thread.
struct BulkGate {
    slot: Mutex<Option<BulkRx>>,
    avail: Condvar,
}

impl BulkGate {
    fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            avail: Condvar::new(),
        }
    }

    fn complete(&self, rx: BulkRx) {
        *self.slot.lock() = Some(rx);
        self.avail.notify_one();
    }

    fn wait(&self) -> BulkRx {
        let mut slot = self.slot.lock();
        loop {
            if let Some(rx) = slot.take() {
                return rx;
            }
            self.avail.wait(&mut slot);
        }
    }
}

struct Inner {
    name: String,
    transport: Box<dyn Transport>,
    handlers: Vec<Option<HandlerEntry>>,
    on_thread_start: Option<Box<dyn Fn(&Service) + Send + Sync>>,
    on_destroy: Option<Box<dyn Fn() + Send + Sync>>,
    on_peer_opened: Option<Box<dyn Fn(&Service) + Send + Sync>>,
    slot_retry_limit: usize,
    slot_retry_tick: Duration,
    state: AtomicU8,
    inbound_tx: Sender<Inbound>,
    inbound_rx: Receiver<Inbound>,
    wait: Mutex<WaitTable>,
    // One condvar per wait slot, all used with the `wait` mutex, so a
    // response wakes exactly the caller it belongs to.
    slot_wake: Vec<Condvar>,
    wait_avail: Condvar,
    scratch: Mutex<ScratchPool>,
    // Reused response buffers for copied handlers. Nested calls from
    // handlers can hold several at once, so this grows on demand
    // instead of being a single static buffer.
    resp_pool: Mutex<Vec<Vec<u8>>>,
    bulk_rx: BulkGate,
    // Serializes control-plus-bulk send pairs so two bulk sends cannot
    // interleave on the transport.
    send_lock: Mutex<()>,
    dispatch_thread: OnceLock<ThreadId>,
    join: Mutex<Option<JoinHandle<()>>>,
}

/// One side of the link. Cheap to clone; all clones share the context.
#[derive(Clone)]
pub struct Service {
    inner: Arc<Inner>,
}

/// The transport adapter's half of the context: the callback surface
/// that feeds [`TransportEvent`]s into the service.
#[derive(Clone)]
pub struct EventSink {
    inner: Arc<Inner>,
}

impl Service {
    /// Open a service context over `transport` and start its dispatch
    /// thread.
    pub fn open(transport: Box<dyn Transport>, config: ServiceConfig) -> Result<Service> {
        let (inbound_tx, inbound_rx) = crossbeam_channel::unbounded();
        let slot_wake = (0..MAX_WAITING).map(|_| Condvar::new()).collect();
        let inner = Arc::new(Inner {
            name: config.name,
            transport,
            handlers: config.handlers,
            on_thread_start: config.on_thread_start,
            on_destroy: config.on_destroy,
            on_peer_opened: config.on_peer_opened,
            slot_retry_limit: config.slot_retry_limit,
            slot_retry_tick: config.slot_retry_tick,
            state: AtomicU8::new(Lifecycle::Normal as u8),
            inbound_tx,
            inbound_rx,
            wait: Mutex::new(WaitTable::new()),
            slot_wake,
            wait_avail: Condvar::new(),
            scratch: Mutex::new(ScratchPool::new()),
            resp_pool: Mutex::new(Vec::new()),
            bulk_rx: BulkGate::new(),
            send_lock: Mutex::new(()),
            dispatch_thread: OnceLock::new(),
            join: Mutex::new(None),
        });
        let service = Service { inner };
        let task = service.clone();
        let handle = thread::Builder::new()
            .name(service.inner.name.clone())
            .spawn(move || task.dispatch_task())
            .map_err(Error::Io)?;
        *service.inner.join.lock() = Some(handle);
        Ok(service)
    }

    /// The event callback surface to hand to the transport adapter.
    pub fn event_sink(&self) -> EventSink {
        EventSink {
            inner: self.inner.clone(),
        }
    }

    /// Name of this service context.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state.
    pub fn state(&self) -> Lifecycle {
        Lifecycle::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Whether the calling thread is this context's dispatch thread.
    pub fn is_dispatch_thread(&self) -> bool {
        matches!(self.inner.dispatch_thread.get(), Some(id) if *id == thread::current().id())
    }

    /// Calls currently holding a wait slot.
    pub fn waiting_calls(&self) -> usize {
        self.inner.wait.lock().in_use()
    }

    /// Idle scratch buffers in the inbound-command pool.
    pub fn free_scratch_buffers(&self) -> usize {
        self.inner.scratch.lock().free_count()
    }

    /// Issue a call and wait for the response, copying as much of it as
    /// fits into `resp`. Returns the full response length; a return
    /// value larger than `resp.len()` means the copy was truncated.
    pub fn call(&self, func: FunctionId, payload: &[u8], resp: &mut [u8]) -> Result<usize> {
        self.call_ex(func, payload, &[], None, Some(resp))
    }

    /// Issue a call without waiting for a response. The remote handler
    /// must not send one.
    pub fn call_one_way(&self, func: FunctionId, payload: &[u8]) -> Result<()> {
        self.call_ex(func, payload, &[], None, None).map(|_| ())
    }

    /// Issue a call carrying a data buffer, marshalled inline or over
    /// the bulk channel depending on its size. `desc` travels first in
    /// the control message, followed by the transfer descriptor.
    ///
    /// Returns `Ok(Some(len))` with the response length when `resp` is
    /// supplied, `Ok(None)` for a one-way pass.
    pub fn pass_buffer(
        &self,
        func: FunctionId,
        desc: &[u8],
        data: &[u8],
        resp: Option<&mut [u8]>,
    ) -> Result<Option<usize>> {
        if self.state() != Lifecycle::Normal {
            return Err(Error::ServiceUnavailable);
        }
        let plan = marshal::plan(data);
        let mut xfer = [0u8; marshal::XFER_MAX_SIZE];
        let n = marshal::encode(&plan, &mut xfer);
        let want = resp.is_some();
        let len = match plan {
            XferPlan::Bulk { middle, .. } => {
                self.call_ex(func, desc, &xfer[..n], Some(middle), resp)?
            }
            _ => self.call_ex(func, desc, &xfer[..n], None, resp)?,
        };
        Ok(want.then_some(len))
    }

    /// Reconstruct a buffer from a received transfer descriptor,
    /// completing the bulk transfer if one is in flight. Intended to be
    /// called from a command handler with the descriptor portion of the
    /// request payload.
    ///
    /// On abort the destination holds zero valid bytes.
    pub fn receive_buffer(&self, xfer: &[u8], dest: &mut [u8]) -> Result<usize> {
        if self.state() != Lifecycle::Normal {
            return Err(Error::ServiceUnavailable);
        }
        match marshal::decode(xfer)? {
            DecodedXfer::Empty => Ok(0),
            DecodedXfer::Inline(data) => {
                if dest.len() < data.len() {
                    return Err(Error::BufferTooSmall {
                        required: data.len(),
                        available: dest.len(),
                    });
                }
                dest[..data.len()].copy_from_slice(data);
                Ok(data.len())
            }
            DecodedXfer::Bulk {
                total_len,
                prologue,
                trailer,
            } => {
                if dest.len() < total_len {
                    return Err(Error::BufferTooSmall {
                        required: total_len,
                        available: dest.len(),
                    });
                }
                let middle_len = total_len - prologue.len() - trailer.len();
                self.inner.transport.queue_bulk_receive(middle_len)?;
                match self.inner.bulk_rx.wait() {
                    BulkRx::Aborted => Err(Error::TransferAborted),
                    BulkRx::Done(bytes) => {
                        if bytes.len() != middle_len {
                            return Err(Error::Protocol("bulk transfer length mismatch"));
                        }
                        dest[..prologue.len()].copy_from_slice(prologue);
                        dest[prologue.len()..prologue.len() + middle_len].copy_from_slice(&bytes);
                        dest[prologue.len() + middle_len..total_len].copy_from_slice(trailer);
                        Ok(total_len)
                    }
                }
            }
        }
    }

    /// Shut the context down and join the dispatch thread. Blocked
    /// callers are woken with `ServiceUnavailable`. Safe to call from a
    /// handler; the join is skipped on the dispatch thread itself.
    pub fn close(&self) {
        self.force_quit(Lifecycle::ShutdownRequested);
        if self.is_dispatch_thread() {
            // A handler closing its own context cannot join its own
            // thread. The handle stays parked so the owning thread's
            // close() still gets to sequence teardown.
            return;
        }
        let handle = self.inner.join.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    fn raise_state(&self, to: Lifecycle) {
        self.inner.state.fetch_max(to as u8, Ordering::AcqRel);
    }

    /// Advance the state, poke the dispatch thread, and wake every
    /// blocked caller with a shutdown outcome.
    fn force_quit(&self, to: Lifecycle) {
        self.raise_state(to);
        let _ = self.inner.inbound_tx.send(Inbound::Quit);
        let mut wait = self.inner.wait.lock();
        for idx in wait.force_wake() {
            self.inner.slot_wake[idx].notify_one();
        }
        drop(wait);
        self.inner.wait_avail.notify_all();
    }

    fn fatal(&self, e: &Error) {
        log::error!("{}: dispatch stopped: {}", self.inner.name, e);
        self.force_quit(Lifecycle::ShutdownRequested);
    }

    fn dispatch_task(self) {
        let _ = self.inner.dispatch_thread.set(thread::current().id());
        if let Some(hook) = &self.inner.on_thread_start {
            hook(&self);
        }
        while self.state() < Lifecycle::PeerClosed {
            match self.process_one(true) {
                Ok(Flow::Quit) => break,
                Ok(_) => {}
                Err(e) => {
                    self.fatal(&e);
                    break;
                }
            }
        }
        log::debug!("{}: dispatch thread exiting", self.inner.name);
        if let Some(hook) = &self.inner.on_destroy {
            hook();
        }
    }

    /// Take one message off the inbound queue and dispatch it.
    fn process_one(&self, block: bool) -> Result<Flow> {
        let inbound = if block {
            match self.inner.inbound_rx.recv() {
                Ok(m) => m,
                Err(_) => return Ok(Flow::Quit),
            }
        } else {
            match self.inner.inbound_rx.try_recv() {
                Ok(m) => m,
                Err(TryRecvError::Empty) => return Ok(Flow::Empty),
                Err(TryRecvError::Disconnected) => return Ok(Flow::Quit),
            }
        };
        let msg = match inbound {
            Inbound::Msg(msg) => msg,
            Inbound::Quit => return Ok(Flow::Quit),
        };
        let hdr = match MsgHdr::from_bytes(msg.data()) {
            Ok(hdr) => hdr,
            Err(e) => {
                self.inner.transport.release_inbound(msg);
                return Err(e);
            }
        };
        if hdr.is_response() {
            let routed = self.route_response(hdr.xid, &msg.data()[MSG_HDR_SIZE..]);
            self.inner.transport.release_inbound(msg);
            routed?;
        } else {
            // Copy the command into a scratch buffer and release the
            // transport's storage before executing: the handler may
            // itself call across the link and pump further messages.
            let mut scratch = match self.inner.scratch.lock().take() {
                Some(buf) => buf,
                None => {
                    self.inner.transport.release_inbound(msg);
                    return Err(Error::Protocol("scratch buffer pool exhausted"));
                }
            };
            scratch.extend_from_slice(&msg.data()[MSG_HDR_SIZE..]);
            self.inner.transport.release_inbound(msg);
            let executed = self.execute(hdr.func, hdr.xid, &mut scratch);
            self.inner.scratch.lock().give(scratch);
            executed?;
        }
        Ok(Flow::Handled)
    }

    /// Copy a response payload into the slot waiting on its xid and
    /// wake that caller.
    fn route_response(&self, xid: u32, payload: &[u8]) -> Result<()> {
        let mut wait = self.inner.wait.lock();
        let idx = wait
            .find_by_xid(xid)
            .ok_or(Error::Protocol("response for a call nobody is waiting on"))?;
        let slot = wait.slot_mut(idx);
        slot.resp.clear();
        slot.resp.extend_from_slice(payload);
        slot.outcome = Some(CallOutcome::Response);
        self.inner.slot_wake[idx].notify_one();
        Ok(())
    }

    /// Run the handler for an inbound command and send its response,
    /// if any, correlated by the command's xid.
    fn execute(&self, func: u32, xid: u32, scratch: &mut Vec<u8>) -> Result<()> {
        let entry = self
            .inner
            .handlers
            .get(func as usize)
            .and_then(|h| h.as_ref())
            .ok_or(Error::Protocol("command for an unregistered function id"))?;
        match entry {
            HandlerEntry::Copied(f) => {
                let mut resp = self.take_resp_buf();
                let rlen = f(self, scratch, &mut resp);
                let sent = if rlen > MAX_PAYLOAD_SIZE {
                    Err(Error::Protocol("handler overran the response buffer"))
                } else if rlen > 0 {
                    self.transmit(FN_RESPONSE, xid, &resp[..rlen], None)
                } else {
                    Ok(())
                };
                self.give_resp_buf(resp);
                sent?;
            }
            HandlerEntry::InPlace(f) => {
                let req_len = scratch.len();
                scratch.resize(MAX_PAYLOAD_SIZE, 0);
                let rlen = f(self, scratch, req_len);
                if rlen > MAX_PAYLOAD_SIZE {
                    return Err(Error::Protocol("handler overran the response buffer"));
                }
                if rlen > 0 {
                    self.transmit(FN_RESPONSE, xid, &scratch[..rlen], None)?;
                }
            }
        }
        Ok(())
    }

    fn take_resp_buf(&self) -> Vec<u8> {
        self.inner
            .resp_pool
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; MAX_PAYLOAD_SIZE])
    }

    fn give_resp_buf(&self, buf: Vec<u8>) {
        let mut pool = self.inner.resp_pool.lock();
        if pool.len() < SCRATCH_POOL_SIZE {
            pool.push(buf);
        }
    }

    fn transmit(&self, func: u32, xid: u32, payload: &[u8], payload2: Option<&[u8]>) -> Result<()> {
        let hdr = MsgHdr::new(func, xid).to_bytes();
        match payload2 {
            Some(p2) => self.inner.transport.send_control(&[&hdr, payload, p2]),
            None => self.inner.transport.send_control(&[&hdr, payload]),
        }
    }

    /// Claim a wait slot and assign its xid under one lock acquisition.
    ///
    /// When the table is full, non-dispatch callers sleep on the
    /// slot-freed condvar in retry-tick slices; the dispatch thread
    /// instead drains its own queue between attempts so the responses
    /// that free slots can actually arrive.
    fn reserve_slot(&self) -> Result<(usize, u32)> {
        let mut wait = self.inner.wait.lock();
        let mut attempts = 0usize;
        let idx = loop {
            if self.state() >= Lifecycle::PeerClosed {
                return Err(Error::ServiceUnavailable);
            }
            if let Some(idx) = wait.claim() {
                break idx;
            }
            attempts += 1;
            if attempts >= self.inner.slot_retry_limit {
                log::warn!("{}: no wait slot freed after {} attempts", self.inner.name, attempts);
                return Err(Error::ResourceExhausted);
            }
            if self.is_dispatch_thread() {
                drop(wait);
                if let Err(e) = self.pump_pending() {
                    self.fatal(&e);
                    return Err(Error::ServiceUnavailable);
                }
                thread::sleep(Duration::from_millis(1));
                wait = self.inner.wait.lock();
            } else {
                let _ = self
                    .inner
                    .wait_avail
                    .wait_for(&mut wait, self.inner.slot_retry_tick);
            }
        };
        let xid = wait.alloc_xid();
        wait.slot_mut(idx).xid = xid;
        Ok((idx, xid))
    }

    /// Drain the inbound queue without blocking.
    fn pump_pending(&self) -> Result<()> {
        loop {
            match self.process_one(false)? {
                Flow::Handled => {}
                Flow::Empty | Flow::Quit => return Ok(()),
            }
        }
    }

    /// The full call path: reserve, send, wait, finalize.
    fn call_ex(
        &self,
        func: FunctionId,
        payload: &[u8],
        payload2: &[u8],
        bulk: Option<&[u8]>,
        resp: Option<&mut [u8]>,
    ) -> Result<usize> {
        assert_ne!(func.0, FN_RESPONSE, "function id 0 is the response tag");
        let size = payload.len() + payload2.len();
        if size > MAX_PAYLOAD_SIZE {
            return Err(Error::MessageTooLarge {
                size,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        if self.state() != Lifecycle::Normal {
            return Err(Error::ServiceUnavailable);
        }
        let (slot_idx, xid) = if resp.is_some() {
            let (idx, xid) = self.reserve_slot()?;
            (Some(idx), xid)
        } else {
            // One-way calls still burn an xid so command streams stay
            // distinguishable in traces.
            (None, self.inner.wait.lock().alloc_xid())
        };
        let sent = if let Some(bulk_data) = bulk {
            // Control message and bulk data must hit the transport as
            // an adjacent pair.
            let _guard = self.inner.send_lock.lock();
            self.transmit(func.0, xid, payload, Some(payload2))
                .and_then(|()| self.inner.transport.queue_bulk_transmit(bulk_data))
        } else if payload2.is_empty() {
            self.transmit(func.0, xid, payload, None)
        } else {
            self.transmit(func.0, xid, payload, Some(payload2))
        };
        let idx = match slot_idx {
            Some(idx) => idx,
            None => return sent.map(|()| 0),
        };
        if let Err(e) = sent {
            let mut wait = self.inner.wait.lock();
            wait.release(idx);
            drop(wait);
            self.inner.wait_avail.notify_all();
            return Err(e);
        }
        if self.is_dispatch_thread() {
            // Pump our own queue until the response lands. This is
            // where a handler calling back across the link keeps the
            // whole conversation moving.
            loop {
                if self.inner.wait.lock().slot(idx).outcome.is_some() {
                    break;
                }
                if self.state() >= Lifecycle::PeerClosed {
                    break;
                }
                match self.process_one(true) {
                    Ok(Flow::Quit) => break,
                    Ok(_) => {}
                    Err(e) => {
                        self.fatal(&e);
                        break;
                    }
                }
            }
        } else {
            let mut wait = self.inner.wait.lock();
            while wait.slot(idx).outcome.is_none() {
                self.inner.slot_wake[idx].wait(&mut wait);
            }
        }
        let mut wait = self.inner.wait.lock();
        let outcome = wait.slot(idx).outcome.unwrap_or(CallOutcome::Shutdown);
        let result = match outcome {
            CallOutcome::Response => {
                let total = wait.slot(idx).resp.len();
                if let Some(buf) = resp {
                    let n = total.min(buf.len());
                    buf[..n].copy_from_slice(&wait.slot(idx).resp[..n]);
                }
                Ok(total)
            }
            CallOutcome::Shutdown => Err(Error::ServiceUnavailable),
        };
        wait.release(idx);
        drop(wait);
        self.inner.wait_avail.notify_all();
        result
    }
}

impl EventSink {
    fn service(&self) -> Service {
        Service {
            inner: self.inner.clone(),
        }
    }

    /// Deliver one transport event. Called by the transport adapter
    /// from whatever context it runs callbacks in; never blocks on the
    /// dispatch thread's work.
    pub fn deliver(&self, event: TransportEvent) {
        match event {
            TransportEvent::MessageAvailable(msg) => {
                let depth = self.inner.inbound_tx.len();
                if depth >= QUEUE_WARN_DEPTH && depth % QUEUE_WARN_DEPTH == 0 {
                    log::warn!("{}: inbound queue depth {}", self.inner.name, depth);
                }
                let _ = self.inner.inbound_tx.send(Inbound::Msg(msg));
            }
            TransportEvent::BulkTransmitDone => {
                log::trace!("{}: bulk transmit complete", self.inner.name);
            }
            TransportEvent::BulkTransmitAborted => {
                log::warn!("{}: bulk transmit aborted", self.inner.name);
            }
            TransportEvent::BulkReceiveDone(bytes) => {
                self.inner.bulk_rx.complete(BulkRx::Done(bytes));
            }
            TransportEvent::BulkReceiveAborted => {
                self.service().raise_state(Lifecycle::BulkAborted);
                self.inner.bulk_rx.complete(BulkRx::Aborted);
            }
            TransportEvent::PeerOpened => match &self.inner.on_peer_opened {
                Some(hook) => hook(&self.service()),
                None => log::error!("{}: unexpected peer open", self.inner.name),
            },
            TransportEvent::PeerClosed => {
                let svc = self.service();
                if svc.state() < Lifecycle::PeerClosed {
                    log::info!("{}: peer closed", self.inner.name);
                    svc.force_quit(Lifecycle::PeerClosed);
                }
            }
        }
    }
}
