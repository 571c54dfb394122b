use super::{MessageHandler, MessageRouter};
use crate::domain_model::{Notification, NotificationLevel, RealtimeMessage};
use crate::logger::*;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;

pub const NOTIFICATION: &str = "notification";
pub const UPDATE_KINDS: [&str; 3] = ["payment_update", "order_update", "merchant_update"];

const DEFAULT_CAPACITY: usize = 100;
const FEED_CAP: usize = 64;

/// Notifications received over the realtime channel, newest first.
pub struct NotificationStore {
    items: Mutex<VecDeque<Notification>>,
    capacity: usize,
    feed: broadcast::Sender<Notification>,
}

impl Default for NotificationStore {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl NotificationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(FEED_CAP);
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            feed,
        }
    }

    /// Register on `router` for `notification` and every update kind.
    pub fn install(self: &Arc<Self>, router: &MessageRouter) {
        router.register(NOTIFICATION, self.clone());
        for kind in UPDATE_KINDS {
            router.register(kind, self.clone());
        }
    }

    pub fn push(&self, notification: Notification) {
        {
            let mut items = self.items();
            items.push_front(notification.clone());
            items.truncate(self.capacity);
        }
        let _ = self.feed.send(notification);
    }

    pub fn list(&self) -> Vec<Notification> {
        self.items().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items().is_empty()
    }

    pub fn clear(&self) {
        self.items().clear();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.feed.subscribe()
    }

    fn items(&self) -> MutexGuard<'_, VecDeque<Notification>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Turn an inbound message into a notification, if it describes one.
pub fn notification_from(message: &RealtimeMessage) -> Option<Notification> {
    if message.kind == NOTIFICATION {
        return match serde_json::from_value::<Notification>(message.data.clone()) {
            Ok(mut notification) => {
                notification.data = message.data.clone();
                notification.received_at = Utc::now();
                Some(notification)
            }
            Err(e) => {
                warn!(error = %e, "unreadable notification payload dropped");
                None
            }
        };
    }

    if UPDATE_KINDS.contains(&message.kind.as_str()) {
        return Some(Notification {
            level: NotificationLevel::Info,
            title: message.kind.replacen('_', " ", 1).to_uppercase(),
            message: message.data.to_string(),
            data: message.data.clone(),
            received_at: Utc::now(),
        });
    }

    None
}

impl MessageHandler for NotificationStore {
    fn handle(&self, message: &RealtimeMessage) {
        if let Some(notification) = notification_from(message) {
            debug!(title = %notification.title, "notification received");
            self.push(notification);
        }
    }
}
