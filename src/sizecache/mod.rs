use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;

/// Staleness cutoff after which a window is always refreshed.
const STALE_AFTER_MS: i64 = 60_000;

/// Result set handed to the cache by query-path instrumentation.
///
/// The shape is resolved once at the call boundary: either an ordered list
/// of documents or a keyed map, never re-inspected per element.
#[derive(Debug, Clone, Copy)]
pub enum ResultSet<'a> {
    Documents(&'a [Value]),
    Keyed(&'a serde_json::Map<String, Value>),
}

impl ResultSet<'_> {
    fn len(&self) -> usize {
        match self {
            Self::Documents(docs) => docs.len(),
            Self::Keyed(map) => map.len(),
        }
    }

    /// One representative element: the first document, or the first value
    /// in the map's iteration order.
    fn representative(&self) -> Option<&Value> {
        match self {
            Self::Documents(docs) => docs.first(),
            Self::Keyed(map) => map.values().next(),
        }
    }
}

/// Rolling window of measured byte sizes for one query fingerprint.
#[derive(Debug)]
struct SampleWindow {
    max_samples: usize,
    samples: Vec<u64>,
    last_updated: i64,
}

impl SampleWindow {
    fn new(max_samples: usize) -> Self {
        Self {
            max_samples,
            samples: Vec::new(),
            last_updated: 0,
        }
    }

    /// Appends a measurement, evicting the oldest sample on overflow.
    fn push(&mut self, size: u64, now_ms: i64) {
        self.samples.push(size);
        self.last_updated = now_ms;

        if self.samples.len() > self.max_samples {
            self.samples.remove(0);
        }
    }

    /// Median of the recorded samples; 0 when the window is empty.
    fn median(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }

        let mut sorted = self.samples.clone();
        sorted.sort_unstable();

        let mid = sorted.len() / 2;
        if sorted.len() % 2 == 0 {
            (sorted[mid - 1] + sorted[mid]) as f64 / 2.0
        } else {
            sorted[mid] as f64
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// Estimates serialized result sizes for repeated queries without paying a
/// measurement on every call.
///
/// Entries live in an LRU-bounded map keyed by the canonical query
/// fingerprint. Whether a call re-measures is decided by a composite score
/// that favors refreshing under-filled or stale windows and spare CPU, and
/// suppresses measurement when the window is full, fresh and the process is
/// busy.
pub struct SizeCache {
    entries: Mutex<LruCache<String, SampleWindow>>,
    max_samples: usize,
    /// Load signal from the CPU sampler, stored as f64 bits.
    cpu_load: AtomicU64,
}

impl SizeCache {
    /// Creates a cache bounded at `max_entries` fingerprints of
    /// `max_samples` measurements each.
    pub fn new(max_entries: usize, max_samples: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            max_samples,
            cpu_load: AtomicU64::new(0f64.to_bits()),
        }
    }

    /// Updates the CPU load signal (0-100) used by the refresh heuristic.
    pub fn set_cpu_load(&self, pct: f64) {
        self.cpu_load.store(pct.to_bits(), Ordering::Relaxed);
    }

    /// Current CPU load signal.
    pub fn cpu_load(&self) -> f64 {
        f64::from_bits(self.cpu_load.load(Ordering::Relaxed))
    }

    /// Number of fingerprints currently cached.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache holds no fingerprints.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Canonical fingerprint of a query's identifying parameters. Equal
    /// tuples always serialize to the same bytes.
    pub fn cache_key(collection: &str, query: &Value, options: &Value) -> String {
        serde_json::to_string(&(collection, query, options)).unwrap_or_default()
    }

    /// Returns the estimated serialized byte size of one document in the
    /// result set, measuring only when the refresh heuristic calls for it.
    ///
    /// Never fails: empty input yields 0 and an unserializable document
    /// skips the refresh until a later call.
    pub fn get_size(
        &self,
        collection: &str,
        query: &Value,
        options: &Value,
        data: &ResultSet<'_>,
    ) -> f64 {
        if data.len() == 0 {
            return 0.0;
        }

        let key = Self::cache_key(collection, query, options);
        let now_ms = chrono::Utc::now().timestamp_millis();

        // One lock span covers lookup, the refresh decision and the sample
        // append, so concurrent callers cannot double- or drop-measure.
        let mut entries = self.entries.lock();

        if !entries.contains(&key) {
            entries.put(key.clone(), SampleWindow::new(self.max_samples));
        }

        let cpu_load = self.cpu_load();
        let Some(entry) = entries.get_mut(&key) else {
            return 0.0;
        };

        if needs_update(entry, cpu_load, now_ms) {
            if let Some(doc) = data.representative() {
                if let Ok(bytes) = serde_json::to_vec(doc) {
                    entry.push(bytes.len() as u64, now_ms);
                }
            }
        }

        entry.median()
    }
}

impl std::fmt::Debug for SizeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SizeCache")
            .field("entries", &self.len())
            .field("max_samples", &self.max_samples)
            .field("cpu_load", &self.cpu_load())
            .finish()
    }
}

/// Composite refresh score: mean of three terms, each clamped to 1 -
/// window under-fill, staleness and spare CPU headroom.
fn refresh_score(entry: &SampleWindow, cpu_load: f64, now_ms: i64) -> f64 {
    let terms = [
        (entry.max_samples - entry.len()) as f64 / entry.max_samples as f64,
        (now_ms - entry.last_updated) as f64 / STALE_AFTER_MS as f64,
        (100.0 - cpu_load) / 100.0,
    ];

    terms.iter().map(|s| s.min(1.0)).sum::<f64>() / terms.len() as f64
}

fn needs_update(entry: &SampleWindow, cpu_load: f64, now_ms: i64) -> bool {
    if entry.samples.is_empty() {
        return true;
    }

    if now_ms - entry.last_updated > STALE_AFTER_MS {
        return true;
    }

    refresh_score(entry, cpu_load, now_ms) > 0.5
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn now_ms() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn full_fresh_window(max_samples: usize) -> SampleWindow {
        let mut window = SampleWindow::new(max_samples);
        let now = now_ms();
        for i in 0..max_samples {
            window.push(i as u64 + 1, now);
        }
        window
    }

    #[test]
    fn test_median_even_count() {
        let mut window = SampleWindow::new(10);
        for v in [1, 3, 5, 7] {
            window.push(v, 0);
        }
        assert_eq!(window.median(), 4.0);
    }

    #[test]
    fn test_median_odd_count() {
        let mut window = SampleWindow::new(10);
        for v in [1, 3, 5] {
            window.push(v, 0);
        }
        assert_eq!(window.median(), 3.0);
    }

    #[test]
    fn test_median_unsorted_input() {
        let mut window = SampleWindow::new(10);
        for v in [2, 4, 6, 8, 1, 3, 5, 7] {
            window.push(v, 0);
        }
        assert_eq!(window.median(), 4.5);
    }

    #[test]
    fn test_window_evicts_oldest_on_overflow() {
        let mut window = SampleWindow::new(10);
        for v in 1..=11u64 {
            window.push(v, 0);
        }
        assert_eq!(window.len(), 10);
        assert_eq!(window.samples, vec![2, 3, 4, 5, 6, 7, 8, 9, 10, 11]);
    }

    #[test]
    fn test_cache_key_is_deterministic_and_distinct() {
        let k1 = SizeCache::cache_key("users", &json!({"a": 1}), &json!(null));
        let k2 = SizeCache::cache_key("users", &json!({"a": 1}), &json!(null));
        let k3 = SizeCache::cache_key("users", &json!({"a": 2}), &json!(null));
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }

    #[test]
    fn test_empty_result_set_returns_zero_without_caching() {
        let cache = SizeCache::new(5, 10);
        let size = cache.get_size(
            "users",
            &json!({}),
            &json!(null),
            &ResultSet::Documents(&[]),
        );
        assert_eq!(size, 0.0);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_first_call_measures_and_returns_document_size() {
        let cache = SizeCache::new(5, 10);
        let docs = vec![json!({"name": "ada"})];
        let size = cache.get_size(
            "users",
            &json!({}),
            &json!(null),
            &ResultSet::Documents(&docs),
        );
        let expected = serde_json::to_vec(&docs[0]).expect("serializable").len() as f64;
        assert_eq!(size, expected);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_keyed_result_set_measures_first_value() {
        let cache = SizeCache::new(5, 10);
        let map = json!({"k1": {"name": "ada"}});
        let Value::Object(map) = map else {
            panic!("object literal");
        };
        let size = cache.get_size("users", &json!({}), &json!(null), &ResultSet::Keyed(&map));
        assert!(size > 0.0);
    }

    #[test]
    fn test_full_fresh_window_under_load_suppresses_measurement() {
        let entry = full_fresh_window(10);
        // Full window, fresh, CPU saturated: all three terms are ~0.
        assert!(!needs_update(&entry, 100.0, now_ms()));
        let score = refresh_score(&entry, 100.0, now_ms());
        assert!(score < 0.001, "score={score}");
    }

    #[test]
    fn test_stale_window_always_refreshes() {
        let mut entry = full_fresh_window(10);
        entry.last_updated = now_ms() - STALE_AFTER_MS - 1;
        assert!(needs_update(&entry, 100.0, now_ms()));
    }

    #[test]
    fn test_empty_window_always_refreshes() {
        let entry = SampleWindow::new(10);
        assert!(needs_update(&entry, 100.0, now_ms()));
    }

    #[test]
    fn test_idle_cpu_forces_refresh() {
        // Full and fresh, but an idle process scores 1/3 from the CPU term
        // plus the under-fill of a half-filled window pushes past 0.5.
        let mut entry = SampleWindow::new(10);
        let now = now_ms();
        for i in 0..3 {
            entry.push(i, now);
        }
        assert!(needs_update(&entry, 0.0, now));
    }

    #[test]
    fn test_repeated_calls_under_load_measure_once() {
        let cache = SizeCache::new(5, 3);
        cache.set_cpu_load(100.0);
        let docs = vec![json!({"payload": "x"})];

        // Fill the window; each call may measure while the window is short.
        for _ in 0..10 {
            cache.get_size(
                "users",
                &json!({}),
                &json!(null),
                &ResultSet::Documents(&docs),
            );
        }

        let before = {
            let mut entries = cache.entries.lock();
            let entry = entries.get_mut(&SizeCache::cache_key(
                "users",
                &json!({}),
                &json!(null),
            ));
            entry.expect("entry exists").last_updated
        };

        // Window is now full and fresh at 100% load: further calls must not
        // re-measure within the staleness cutoff.
        for _ in 0..10 {
            cache.get_size(
                "users",
                &json!({}),
                &json!(null),
                &ResultSet::Documents(&docs),
            );
        }

        let after = {
            let mut entries = cache.entries.lock();
            let entry = entries.get_mut(&SizeCache::cache_key(
                "users",
                &json!({}),
                &json!(null),
            ));
            entry.expect("entry exists").last_updated
        };
        assert_eq!(before, after);
    }

    #[test]
    fn test_lru_evicts_least_recently_touched() {
        let cache = SizeCache::new(2, 10);
        cache.set_cpu_load(0.0);
        let docs = vec![json!({"v": 1})];
        let data = ResultSet::Documents(&docs);

        cache.get_size("a", &json!({}), &json!(null), &data);
        cache.get_size("b", &json!({}), &json!(null), &data);
        // Touch "a" so "b" becomes the eviction candidate.
        cache.get_size("a", &json!({}), &json!(null), &data);
        cache.get_size("c", &json!({}), &json!(null), &data);

        let mut entries = cache.entries.lock();
        assert_eq!(entries.len(), 2);
        assert!(entries.contains(&SizeCache::cache_key("a", &json!({}), &json!(null))));
        assert!(!entries.contains(&SizeCache::cache_key("b", &json!({}), &json!(null))));
        assert!(entries.contains(&SizeCache::cache_key("c", &json!({}), &json!(null))));
    }

    #[test]
    fn test_cpu_load_roundtrip() {
        let cache = SizeCache::new(5, 10);
        cache.set_cpu_load(63.5);
        assert_eq!(cache.cpu_load(), 63.5);
    }
}
