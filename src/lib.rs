//! corpc: a synchronous RPC bridge between two processors over a
//! point-to-point message transport.
//!
//! A call is a pair of asynchronous messages correlated by a
//! transaction id: a command carrying a function id and payload, and a
//! response carrying the result back to the waiting caller. Each side
//! of the link runs one dispatch thread that drains the inbound queue,
//! routing responses to the wait slot holding their xid and executing
//! commands through a registered handler table. A caller that is
//! itself the dispatch thread pumps the queue while it waits, so
//! nested call chains across the link make progress instead of
//! deadlocking. Large data buffers bypass the control channel: an
//! aligned middle travels as a bulk (DMA-friendly) transfer while the
//! unaligned edges ride inside the control message.
//!
//! Module map:
//!
//! - [`service`]: the context, its lifecycle, dispatch, and the call
//!   and bulk-buffer entry points
//! - [`config`]: builder for handlers, hooks, and retry tuning
//! - [`transport`]: the seam a transport adapter implements
//! - [`message`]: control-message framing
//! - [`marshal`]: inline/bulk buffer marshalling
//! - [`slot`]: wait slots and the scratch-buffer pool
//! - [`error`]: the error taxonomy

pub mod config;
pub mod error;
pub mod marshal;
pub mod message;
pub mod service;
pub mod slot;
pub mod transport;

pub use config::{Handler, InPlaceHandler, ServiceConfig, MAX_FUNCTIONS};
pub use error::{Error, Result};
pub use marshal::{BULK_ALIGN, MAX_INLINE};
pub use message::{
    FunctionId, MsgHdr, FN_RESPONSE, MAX_MSG_SIZE, MAX_PAYLOAD_SIZE, MSG_HDR_SIZE,
};
pub use service::{EventSink, Lifecycle, Service};
pub use slot::{MAX_WAITING, SCRATCH_POOL_SIZE};
pub use transport::{InboundMessage, Transport, TransportEvent};
