//! In-memory event history
//!
//! Events are grouped into named buckets, one per component. The escalation
//! engine reads reboot events from the `os` bucket and failure events from
//! the component's own bucket.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::debug;

use crate::api::Event;

/// Bucket holding reboot history
pub const OS_BUCKET: &str = "os";

/// Event name recorded once per boot
pub const REBOOT_EVENT_NAME: &str = "reboot";

/// Time-ordered events of a single component
pub struct EventBucket {
    name: String,
    events: RwLock<Vec<Event>>,
}

impl EventBucket {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            events: RwLock::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Insert an event, keeping the bucket sorted by time
    pub fn insert(&self, event: Event) {
        let mut events = self.events.write();
        let pos = events.partition_point(|e| e.time <= event.time);
        events.insert(pos, event);
    }

    /// Find a stored event with the same time, name, type and message
    pub fn find(&self, event: &Event) -> Option<Event> {
        self.events
            .read()
            .iter()
            .find(|e| {
                e.time == event.time
                    && e.name == event.name
                    && e.event_type == event.event_type
                    && e.message == event.message
            })
            .cloned()
    }

    /// Events at or after `since`, oldest first
    pub fn get(&self, since: DateTime<Utc>) -> Vec<Event> {
        let events = self.events.read();
        let start = events.partition_point(|e| e.time < since);
        events[start..].to_vec()
    }

    /// Most recent event, if any
    pub fn latest(&self) -> Option<Event> {
        self.events.read().last().cloned()
    }

    /// Drop events strictly older than `before`, returning how many were removed
    pub fn purge(&self, before: DateTime<Utc>) -> usize {
        let mut events = self.events.write();
        let cut = events.partition_point(|e| e.time < before);
        events.drain(..cut);
        cut
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }
}

/// Named event buckets shared by all components
#[derive(Default)]
pub struct EventStore {
    buckets: RwLock<HashMap<String, Arc<EventBucket>>>,
}

impl EventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bucket for `name`, created on first use
    pub fn bucket(&self, name: &str) -> Arc<EventBucket> {
        if let Some(bucket) = self.buckets.read().get(name) {
            return bucket.clone();
        }
        self.buckets
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EventBucket::new(name)))
            .clone()
    }

    /// Reboot events at or after `since`, oldest first
    pub fn reboot_events(&self, since: DateTime<Utc>) -> Vec<Event> {
        self.bucket(OS_BUCKET)
            .get(since)
            .into_iter()
            .filter(|e| e.name == REBOOT_EVENT_NAME)
            .collect()
    }

    /// Purge every bucket, returning the total number of events removed
    pub fn purge_all(&self, before: DateTime<Utc>) -> usize {
        let buckets: Vec<_> = self.buckets.read().values().cloned().collect();
        let purged = buckets.iter().map(|b| b.purge(before)).sum();
        if purged > 0 {
            debug!(purged, before = %before, "Purged expired events");
        }
        purged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::EventType;
    use chrono::{Duration, TimeZone};

    fn at(minutes: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minutes)
    }

    fn event(name: &str, minutes: i64) -> Event {
        Event::new("disk", at(minutes), name, EventType::Critical, "")
    }

    #[test]
    fn test_bucket_keeps_time_order() {
        let store = EventStore::new();
        let bucket = store.bucket("disk");
        bucket.insert(event("c", 30));
        bucket.insert(event("a", 10));
        bucket.insert(event("b", 20));

        let names: Vec<_> = bucket.get(at(0)).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert_eq!(bucket.latest().unwrap().name, "c");
        assert_eq!(bucket.len(), 3);
    }

    #[test]
    fn test_get_since_is_inclusive() {
        let bucket = EventStore::new().bucket("disk");
        bucket.insert(event("a", 10));
        bucket.insert(event("b", 20));

        let events = bucket.get(at(20));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].name, "b");
        assert!(bucket.get(at(21)).is_empty());
    }

    #[test]
    fn test_find() {
        let bucket = EventStore::new().bucket("disk");
        let stored = event("a", 10);
        bucket.insert(stored.clone());

        assert_eq!(bucket.find(&stored), Some(stored));
        assert!(bucket.find(&event("a", 11)).is_none());
    }

    #[test]
    fn test_same_bucket_is_shared() {
        let store = EventStore::new();
        store.bucket("disk").insert(event("a", 0));
        assert_eq!(store.bucket("disk").len(), 1);
        assert!(store.bucket("gpu").is_empty());
    }

    #[test]
    fn test_purge() {
        let store = EventStore::new();
        store.bucket("disk").insert(event("a", 10));
        store.bucket("disk").insert(event("b", 20));
        store.bucket("gpu").insert(event("c", 5));

        assert_eq!(store.purge_all(at(20)), 2);
        let remaining = store.bucket("disk").get(at(0));
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "b");
        assert!(store.bucket("gpu").is_empty());
    }

    #[test]
    fn test_reboot_events_filtered_by_name() {
        let store = EventStore::new();
        let os = store.bucket(OS_BUCKET);
        os.insert(Event::new(OS_BUCKET, at(0), REBOOT_EVENT_NAME, EventType::Warning, ""));
        os.insert(Event::new(OS_BUCKET, at(5), "kernel_panic", EventType::Fatal, ""));
        os.insert(Event::new(OS_BUCKET, at(10), REBOOT_EVENT_NAME, EventType::Warning, ""));

        let reboots = store.reboot_events(at(0));
        assert_eq!(reboots.len(), 2);
        assert!(reboots.iter().all(|e| e.name == REBOOT_EVENT_NAME));
        assert_eq!(store.reboot_events(at(1)).len(), 1);
    }
}
