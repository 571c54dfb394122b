use crate::domain_model::RealtimeMessage;
use crate::logger::*;
use dashmap::DashMap;
use std::sync::Arc;

/// Consumer of one kind of inbound realtime message.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: &RealtimeMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(&RealtimeMessage) + Send + Sync,
{
    fn handle(&self, message: &RealtimeMessage) {
        self(message)
    }
}

/// Routes inbound messages to the handlers registered for their `type`.
#[derive(Default)]
pub struct MessageRouter {
    handlers: DashMap<String, Vec<Arc<dyn MessageHandler>>>,
}

impl MessageRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        self.handlers.entry(kind.into()).or_default().push(handler);
    }

    pub fn on<F>(&self, kind: impl Into<String>, f: F)
    where
        F: Fn(&RealtimeMessage) + Send + Sync + 'static,
    {
        self.register(kind, Arc::new(f));
    }

    pub fn handles(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Hand `message` to its handlers. Returns `false` (after logging) when
    /// nothing is registered for its type.
    pub fn dispatch(&self, message: &RealtimeMessage) -> bool {
        // handlers run outside the map lock so they may register others
        let handlers = match self.handlers.get(&message.kind) {
            Some(handlers) => handlers.value().clone(),
            None => {
                debug!(kind = %message.kind, "no handler for realtime message, dropped");
                return false;
            }
        };
        for handler in handlers {
            handler.handle(message);
        }
        true
    }

    /// Parse one text frame and dispatch it. Malformed frames are logged and
    /// dropped.
    pub fn dispatch_text(&self, text: &str) -> bool {
        match serde_json::from_str::<RealtimeMessage>(text) {
            Ok(message) => self.dispatch(&message),
            Err(e) => {
                warn!(error = %e, "malformed realtime message dropped");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn routes_by_type() {
        let router = MessageRouter::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        router.on("order_update", move |m: &RealtimeMessage| {
            assert_eq!(m.data["id"], 9);
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(router.dispatch_text(r#"{"type":"order_update","data":{"id":9}}"#));
        assert!(!router.dispatch_text(r#"{"type":"mystery","data":{}}"#));
        assert!(!router.dispatch_text("not json"));
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_handler_of_a_type_runs() {
        let router = MessageRouter::new();
        let seen = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let counter = seen.clone();
            router.on("notification", move |_: &RealtimeMessage| {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert!(router.handles("notification"));
        router.dispatch_text(r#"{"type":"notification","data":null}"#);
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }
}
