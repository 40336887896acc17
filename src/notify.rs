use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

/// Events a slow subscriber may fall behind by before the channel drops them.
const FEED_DEPTH: usize = 256;

/// Per-tutor transition feed. The notification service (and any wire client
/// that asked to listen) subscribes here to observe booking lifecycle events
/// as they are applied.
pub struct NotifyHub {
    feeds: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            feeds: DashMap::new(),
        }
    }

    /// Subscribe to a tutor's events, creating the feed on first use.
    pub fn subscribe(&self, tutor_id: Ulid) -> broadcast::Receiver<Event> {
        self.feeds
            .entry(tutor_id)
            .or_insert_with(|| broadcast::channel(FEED_DEPTH).0)
            .subscribe()
    }

    /// Publish an event. No-op if nobody is listening.
    pub fn send(&self, tutor_id: Ulid, event: &Event) {
        if let Some(feed) = self.feeds.get(&tutor_id) {
            let _ = feed.send(event.clone());
        }
    }
}
