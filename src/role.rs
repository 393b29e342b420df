//! A named service a peer offers. Each event name maps to an ordered
//! chain of handlers; the empty event name `""` is a catch-all that runs
//! before event-specific handlers of the same kind.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::context::{MessageHandler, ReaderRequestHandler, RequestHandler, WriterRequestHandler};

const CATCH_ALL: &str = "";

struct MiddlewareMap<H: Clone> {
    handlers: RwLock<HashMap<String, Vec<H>>>,
}

impl<H: Clone> MiddlewareMap<H> {
    fn new() -> Self {
        Self { handlers: RwLock::new(HashMap::new()) }
    }

    fn add(&self, event: &str, handler: H) {
        self.handlers
            .write()
            .unwrap()
            .entry(event.to_owned())
            .or_default()
            .push(handler);
    }

    /// Catch-all handlers first, then event-specific ones.
    fn chain_for(&self, event: &str) -> Vec<H> {
        let guard = self.handlers.read().unwrap();
        let mut chain = guard.get(CATCH_ALL).cloned().unwrap_or_default();
        if event != CATCH_ALL {
            if let Some(specific) = guard.get(event) {
                chain.extend(specific.iter().cloned());
            }
        }
        chain
    }
}

pub struct Role {
    pub name: String,
    active: std::sync::atomic::AtomicBool,
    messages: MiddlewareMap<MessageHandler>,
    requests: MiddlewareMap<RequestHandler>,
    reader_requests: MiddlewareMap<ReaderRequestHandler>,
    writer_requests: MiddlewareMap<WriterRequestHandler>,
}

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: std::sync::atomic::AtomicBool::new(true),
            messages: MiddlewareMap::new(),
            requests: MiddlewareMap::new(),
            reader_requests: MiddlewareMap::new(),
            writer_requests: MiddlewareMap::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, std::sync::atomic::Ordering::Release);
    }

    pub fn on_message(&self, event: &str, handler: MessageHandler) {
        self.messages.add(event, handler);
    }

    pub fn on_request(&self, event: &str, handler: RequestHandler) {
        self.requests.add(event, handler);
    }

    pub fn on_reader_request(&self, event: &str, handler: ReaderRequestHandler) {
        self.reader_requests.add(event, handler);
    }

    pub fn on_writer_request(&self, event: &str, handler: WriterRequestHandler) {
        self.writer_requests.add(event, handler);
    }

    pub fn message_chain(&self, event: &str) -> Vec<MessageHandler> {
        self.messages.chain_for(event)
    }

    pub fn request_chain(&self, event: &str) -> Vec<RequestHandler> {
        self.requests.chain_for(event)
    }

    pub fn reader_request_chain(&self, event: &str) -> Vec<ReaderRequestHandler> {
        self.reader_requests.chain_for(event)
    }

    pub fn writer_request_chain(&self, event: &str) -> Vec<WriterRequestHandler> {
        self.writer_requests.chain_for(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn catch_all_runs_before_event_specific() {
        let role = Role::new("echo");
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let o1 = order.clone();
        role.on_message(
            "",
            Arc::new(move |_ctx| {
                o1.lock().unwrap().push("catch-all");
                Box::pin(async {})
            }),
        );
        let o2 = order.clone();
        role.on_message(
            "test",
            Arc::new(move |_ctx| {
                o2.lock().unwrap().push("specific");
                Box::pin(async {})
            }),
        );
        let chain = role.message_chain("test");
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn active_flag_defaults_true_and_toggles() {
        let role = Role::new("echo");
        assert!(role.is_active());
        role.set_active(false);
        assert!(!role.is_active());
    }

    #[test]
    fn handler_count_is_independent_per_event() {
        let counter = Arc::new(AtomicUsize::new(0));
        let role = Role::new("echo");
        let c = counter.clone();
        role.on_request(
            "a",
            Arc::new(move |_ctx| {
                c.fetch_add(1, Ordering::SeqCst);
                Box::pin(async {})
            }),
        );
        assert_eq!(role.request_chain("a").len(), 1);
        assert_eq!(role.request_chain("b").len(), 0);
    }
}
