//! Shared last-value store for all acquired tags.
//!
//! Every acquisition loop writes into one [`TagStore`]; readers get a
//! consistent snapshot and per-tag change callbacks. Quality is partly
//! derived at read time: a value older than the freshness window is reported
//! [`Quality::Stale`] no matter what the writer stamped, so a device that
//! silently stops updating cannot keep presenting its last reading as live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{Duration, Utc};
use tracing::warn;

use domain::{Quality, TagValue, Value};

/// Callback invoked after a tag value changes. Errors are logged, never
/// propagated to the writer.
pub type Subscriber = Arc<dyn Fn(&str, &TagValue) -> anyhow::Result<()> + Send + Sync>;

pub struct TagStore {
    values: Mutex<HashMap<String, TagValue>>,
    subscribers: Mutex<HashMap<String, Vec<Subscriber>>>,
    freshness_window: Duration,
}

impl TagStore {
    pub fn new(freshness_window: Duration) -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
            freshness_window,
        }
    }

    pub fn freshness_window(&self) -> Duration {
        self.freshness_window
    }

    /// Store a fresh reading and notify subscribers.
    ///
    /// Callbacks run on the writer's task after the map lock is released, so
    /// a slow subscriber delays its own device loop but never blocks readers.
    pub fn write(&self, name: &str, value: Value, quality: Quality, source: &str) {
        let tag_value = TagValue::new(value, quality, source);
        self.values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), tag_value.clone());
        self.notify(name, &tag_value);
    }

    /// Downgrade a tag's quality in place, keeping the last value and its
    /// original timestamp.
    pub fn set_quality(&self, name: &str, quality: Quality) {
        let updated = {
            let mut values = self.values.lock().unwrap_or_else(PoisonError::into_inner);
            match values.get_mut(name) {
                Some(v) if v.quality != quality => {
                    v.quality = quality;
                    Some(v.clone())
                }
                _ => None,
            }
        };
        if let Some(tag_value) = updated {
            self.notify(name, &tag_value);
        }
    }

    /// Current value of one tag, with staleness derived against the
    /// freshness window.
    pub fn read(&self, name: &str) -> Option<TagValue> {
        let value = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()?;
        Some(self.derive(value))
    }

    /// Snapshot of every tag, taken under one lock so readers never observe
    /// half of a poll cycle applied.
    pub fn read_all(&self) -> HashMap<String, TagValue> {
        let values = self
            .values
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        values
            .into_iter()
            .map(|(name, value)| (name, self.derive(value)))
            .collect()
    }

    /// Register a callback for one tag's changes.
    pub fn subscribe(&self, name: &str, subscriber: Subscriber) {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .push(subscriber);
    }

    fn derive(&self, mut value: TagValue) -> TagValue {
        if value.age(Utc::now()) > self.freshness_window {
            value.quality = Quality::Stale;
        }
        value
    }

    fn notify(&self, name: &str, value: &TagValue) {
        let subscribers = {
            let map = self
                .subscribers
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            map.get(name).cloned().unwrap_or_default()
        };
        for subscriber in subscribers {
            if let Err(e) = subscriber(name, value) {
                warn!(tag = %name, "subscriber failed: {e:#}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn store() -> TagStore {
        TagStore::new(Duration::seconds(15))
    }

    #[test]
    fn test_write_then_read() {
        let store = store();
        store.write("speed", Value::Float(150.0), Quality::Good, "plc-1");

        let value = store.read("speed").unwrap();
        assert_eq!(value.value, Value::Float(150.0));
        assert_eq!(value.quality, Quality::Good);
        assert_eq!(value.source, "plc-1");
        assert!(store.read("missing").is_none());
    }

    #[test]
    fn test_old_value_reads_stale() {
        let store = TagStore::new(Duration::milliseconds(10));
        store.write("speed", Value::Int(10), Quality::Good, "plc-1");
        std::thread::sleep(std::time::Duration::from_millis(30));

        let value = store.read("speed").unwrap();
        assert_eq!(value.quality, Quality::Stale);
        // Last value survives the downgrade
        assert_eq!(value.value, Value::Int(10));
    }

    #[test]
    fn test_stale_outranks_stored_bad() {
        let store = TagStore::new(Duration::milliseconds(10));
        store.write("speed", Value::Int(10), Quality::Bad, "plc-1");
        std::thread::sleep(std::time::Duration::from_millis(30));
        assert_eq!(store.read("speed").unwrap().quality, Quality::Stale);
    }

    #[test]
    fn test_set_quality_keeps_value_and_timestamp() {
        let store = store();
        store.write("speed", Value::Int(42), Quality::Good, "plc-1");
        let before = store.read("speed").unwrap();

        store.set_quality("speed", Quality::Bad);
        let after = store.read("speed").unwrap();
        assert_eq!(after.quality, Quality::Bad);
        assert_eq!(after.value, Value::Int(42));
        assert_eq!(after.timestamp, before.timestamp);

        // No entry, no panic
        store.set_quality("missing", Quality::Bad);
    }

    #[test]
    fn test_subscriber_sees_writes_and_quality_changes() {
        let store = store();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        store.subscribe(
            "speed",
            Arc::new(move |name, value| {
                assert_eq!(name, "speed");
                assert_eq!(value.source, "plc-1");
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        store.write("speed", Value::Int(1), Quality::Good, "plc-1");
        store.set_quality("speed", Quality::Bad);
        // Same quality again is not a change
        store.set_quality("speed", Quality::Bad);
        store.write("other", Value::Int(2), Quality::Good, "plc-2");

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_subscriber_does_not_poison_writes() {
        let store = store();
        store.subscribe(
            "speed",
            Arc::new(|_, _| anyhow::bail!("sink unavailable")),
        );
        store.write("speed", Value::Int(1), Quality::Good, "plc-1");
        assert_eq!(store.read("speed").unwrap().value, Value::Int(1));
    }

    #[test]
    fn test_snapshot_contains_all_tags() {
        let store = store();
        store.write("a", Value::Int(1), Quality::Good, "plc-1");
        store.write("b", Value::Int(2), Quality::Good, "plc-2");

        let snapshot = store.read_all();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot["a"].value, Value::Int(1));
        assert_eq!(snapshot["b"].source, "plc-2");
    }

    #[test]
    fn test_snapshot_consistent_under_concurrent_writers() {
        let store = Arc::new(TagStore::new(Duration::seconds(60)));

        let writers: Vec<_> = (0..4)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        store.write(
                            &format!("tag-{w}"),
                            Value::Int(i),
                            Quality::Good,
                            &format!("writer-{w}"),
                        );
                    }
                })
            })
            .collect();

        // Every entry of every snapshot was written before the snapshot
        // completed, never after
        for _ in 0..50 {
            let snapshot = store.read_all();
            let taken = Utc::now();
            for (name, value) in &snapshot {
                assert!(value.timestamp <= taken, "{name} stamped after snapshot");
                assert_eq!(value.quality, Quality::Good);
                assert!(matches!(value.value, Value::Int(i) if (0..200).contains(&i)));
            }
        }

        for writer in writers {
            writer.join().unwrap();
        }
        assert_eq!(store.read_all().len(), 4);
    }
}
