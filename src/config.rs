//! Service configuration.

use std::time::Duration;

use crate::message::{FunctionId, FN_RESPONSE};
use crate::service::Service;

/// Size of the function-id table. Ids are small dense integers, so the
/// table is a fixed array rather than a map.
pub const MAX_FUNCTIONS: usize = 64;

/// Command handler. Receives the request payload and writes the
/// response into `resp`, returning the number of response bytes, or 0
/// for no response.
pub type Handler = Box<dyn Fn(&Service, &[u8], &mut [u8]) -> usize + Send + Sync>;

/// Zero-copy command handler. Receives the scratch buffer holding the
/// request (already grown to full payload capacity) and the request
/// length, rewrites it in place into the response, and returns the
/// response length, or 0 for no response.
pub type InPlaceHandler = Box<dyn Fn(&Service, &mut [u8], usize) -> usize + Send + Sync>;

pub(crate) enum HandlerEntry {
    Copied(Handler),
    InPlace(InPlaceHandler),
}

/// Configuration for a [`Service`], built with `with_*` methods.
///
/// ```no_run
/// use corpc::{FunctionId, ServiceConfig};
///
/// let config = ServiceConfig::new("codec.host")
///     .with_handler(FunctionId(3), |_svc, req, resp| {
///         resp[..req.len()].copy_from_slice(req);
///         req.len()
///     });
/// ```
pub struct ServiceConfig {
    /// Name of the service, used for the dispatch thread and logging.
    pub name: String,
    /// Attempts to claim a wait slot before giving up.
    pub slot_retry_limit: usize,
    /// Pause between wait-slot claim attempts.
    pub slot_retry_tick: Duration,
    pub(crate) handlers: Vec<Option<HandlerEntry>>,
    pub(crate) on_thread_start: Option<Box<dyn Fn(&Service) + Send + Sync>>,
    pub(crate) on_destroy: Option<Box<dyn Fn() + Send + Sync>>,
    pub(crate) on_peer_opened: Option<Box<dyn Fn(&Service) + Send + Sync>>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        let mut handlers = Vec::with_capacity(MAX_FUNCTIONS);
        handlers.resize_with(MAX_FUNCTIONS, || None);
        Self {
            name: name.into(),
            slot_retry_limit: 250,
            slot_retry_tick: Duration::from_millis(10),
            handlers,
            on_thread_start: None,
            on_destroy: None,
            on_peer_opened: None,
        }
    }

    /// Register a handler for `id`.
    ///
    /// Panics if `id` is the response tag, out of table range, or
    /// already registered.
    pub fn with_handler<F>(mut self, id: FunctionId, f: F) -> Self
    where
        F: Fn(&Service, &[u8], &mut [u8]) -> usize + Send + Sync + 'static,
    {
        self.set(id, HandlerEntry::Copied(Box::new(f)));
        self
    }

    /// Register a zero-copy handler for `id`, for operations whose
    /// response is a cheap in-place rewrite of the request.
    pub fn with_in_place_handler<F>(mut self, id: FunctionId, f: F) -> Self
    where
        F: Fn(&Service, &mut [u8], usize) -> usize + Send + Sync + 'static,
    {
        self.set(id, HandlerEntry::InPlace(Box::new(f)));
        self
    }

    /// Override the wait-slot retry budget. The defaults give callers
    /// about 2.5 seconds of backpressure before `ResourceExhausted`.
    pub fn with_slot_retry(mut self, limit: usize, tick: Duration) -> Self {
        self.slot_retry_limit = limit;
        self.slot_retry_tick = tick;
        self
    }

    /// Hook run on the dispatch thread before it starts pumping.
    pub fn on_thread_start<F>(mut self, f: F) -> Self
    where
        F: Fn(&Service) + Send + Sync + 'static,
    {
        self.on_thread_start = Some(Box::new(f));
        self
    }

    /// Hook run on the dispatch thread after it stops, as the last act
    /// of the context.
    pub fn on_destroy<F>(mut self, f: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_destroy = Some(Box::new(f));
        self
    }

    /// Hook run when a peer connects to a listening endpoint.
    pub fn on_peer_opened<F>(mut self, f: F) -> Self
    where
        F: Fn(&Service) + Send + Sync + 'static,
    {
        self.on_peer_opened = Some(Box::new(f));
        self
    }

    fn set(&mut self, id: FunctionId, entry: HandlerEntry) {
        assert_ne!(id.0, FN_RESPONSE, "function id 0 is the response tag");
        assert!(
            (id.0 as usize) < MAX_FUNCTIONS,
            "function id {} out of range",
            id
        );
        assert!(
            self.handlers[id.0 as usize].is_none(),
            "handler for {} registered twice",
            id
        );
        self.handlers[id.0 as usize] = Some(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let config = ServiceConfig::new("svc");
        assert_eq!(config.name, "svc");
        assert_eq!(config.slot_retry_limit, 250);
        assert_eq!(config.slot_retry_tick, Duration::from_millis(10));
        assert!(config.handlers.iter().all(|h| h.is_none()));
    }

    #[test]
    fn test_builder_overrides() {
        let config = ServiceConfig::new("svc")
            .with_slot_retry(10, Duration::from_millis(2))
            .with_handler(FunctionId(5), |_, _, _| 0);
        assert_eq!(config.slot_retry_limit, 10);
        assert_eq!(config.slot_retry_tick, Duration::from_millis(2));
        assert!(config.handlers[5].is_some());
    }

    #[test]
    #[should_panic(expected = "registered twice")]
    fn test_duplicate_registration_panics() {
        let _ = ServiceConfig::new("svc")
            .with_handler(FunctionId(5), |_, _, _| 0)
            .with_handler(FunctionId(5), |_, _, _| 0);
    }

    #[test]
    #[should_panic(expected = "response tag")]
    fn test_response_tag_rejected() {
        let _ = ServiceConfig::new("svc").with_handler(FunctionId(0), |_, _, _| 0);
    }
}
