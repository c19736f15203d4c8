//! Submission cache: remembers what was last applied per object so unchanged
//! bodies are not re-submitted while the live object is untouched.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

use carto_core::StampedRef;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

impl From<&StampedRef> for CacheKey {
    fn from(r: &StampedRef) -> Self {
        Self {
            api_version: r.api_version.clone(),
            kind: r.kind.clone(),
            namespace: r.namespace.clone().unwrap_or_default(),
            name: r.name.clone(),
        }
    }
}

#[derive(Debug, Clone)]
struct Submission {
    body_hash: String,
    resource_version: String,
    expires: Instant,
}

pub struct SubmissionCache {
    ttl: Duration,
    entries: Mutex<FxHashMap<CacheKey, Submission>>,
}

impl SubmissionCache {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl, entries: Mutex::new(FxHashMap::default()) }
    }

    /// True when `body_hash` was submitted for this object, has not expired,
    /// and nobody has written the object since (`live_rv` matches).
    pub fn unchanged(&self, obj: &StampedRef, body_hash: &str, live_rv: &str) -> bool {
        self.unchanged_at(obj, body_hash, live_rv, Instant::now())
    }

    pub fn unchanged_at(&self, obj: &StampedRef, body_hash: &str, live_rv: &str, now: Instant) -> bool {
        let mut entries = self.entries.lock();
        let key = CacheKey::from(obj);
        match entries.get(&key) {
            Some(s) if s.expires <= now => {
                entries.remove(&key);
                false
            }
            Some(s) => !live_rv.is_empty() && s.body_hash == body_hash && s.resource_version == live_rv,
            None => false,
        }
    }

    pub fn record(&self, obj: &StampedRef, body_hash: String, resource_version: String) {
        self.record_at(obj, body_hash, resource_version, Instant::now());
    }

    /// Expired entries for other objects are evicted on every record.
    pub fn record_at(&self, obj: &StampedRef, body_hash: String, resource_version: String, now: Instant) {
        let entry = Submission { body_hash, resource_version, expires: now + self.ttl };
        let mut entries = self.entries.lock();
        entries.retain(|_, s| s.expires > now);
        entries.insert(CacheKey::from(obj), entry);
    }

    pub fn forget(&self, obj: &StampedRef) {
        self.entries.lock().remove(&CacheKey::from(obj));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Hash of the submitted body; key order in `serde_json` maps is stable.
pub fn body_hash(body: &Value) -> String {
    let bytes = serde_json::to_vec(body).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm() -> StampedRef {
        StampedRef { api_version: "v1".into(), kind: "ConfigMap".into(), namespace: Some("w1".into()), name: "cfg".into() }
    }

    #[test]
    fn same_body_and_version_is_skipped() {
        let cache = SubmissionCache::new(Duration::from_secs(600));
        let h = body_hash(&json!({ "data": { "a": "1" } }));
        assert!(!cache.unchanged(&cm(), &h, "10"));
        cache.record(&cm(), h.clone(), "10".into());
        assert!(cache.unchanged(&cm(), &h, "10"));
    }

    #[test]
    fn live_edit_or_new_body_forces_a_write() {
        let cache = SubmissionCache::new(Duration::from_secs(600));
        let h = body_hash(&json!({ "data": { "a": "1" } }));
        cache.record(&cm(), h.clone(), "10".into());
        assert!(!cache.unchanged(&cm(), &h, "11"));
        assert!(!cache.unchanged(&cm(), &body_hash(&json!({ "data": { "a": "2" } })), "10"));
        assert!(!cache.unchanged(&cm(), &h, ""));
    }

    #[test]
    fn recording_evicts_expired_objects_never_looked_up_again() {
        let cache = SubmissionCache::new(Duration::from_secs(1));
        let h = body_hash(&json!({}));
        let t0 = Instant::now();
        for i in 0..1000 {
            let obj = StampedRef { name: format!("gone-{}", i), ..cm() };
            cache.record_at(&obj, h.clone(), "1".into(), t0);
        }
        assert_eq!(cache.len(), 1000);
        cache.record_at(&cm(), h.clone(), "2".into(), t0 + Duration::from_secs(3600));
        assert_eq!(cache.len(), 1);
        assert!(cache.unchanged_at(&cm(), &h, "2", t0 + Duration::from_secs(3600)));
    }

    #[test]
    fn entries_expire_and_can_be_forgotten() {
        let cache = SubmissionCache::new(Duration::from_secs(5));
        let h = body_hash(&json!({}));
        let t0 = Instant::now();
        cache.record_at(&cm(), h.clone(), "1".into(), t0);
        assert!(cache.unchanged_at(&cm(), &h, "1", t0 + Duration::from_secs(4)));
        assert!(!cache.unchanged_at(&cm(), &h, "1", t0 + Duration::from_secs(6)));
        assert!(cache.is_empty());
        cache.record(&cm(), h, "1".into());
        cache.forget(&cm());
        assert!(cache.is_empty());
    }
}
