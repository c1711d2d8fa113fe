use crate::error::CacheError;
use hickory_proto::op::{Message, MessageType};
use hickory_proto::rr::rdata::A;
use hickory_proto::rr::{Name, RData, Record as DnsRecord};
use serde::Serialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The message every blocked record shares. Built once, never mutated;
/// sinkhole replies are synthesized per-query, so the stored message only
/// matters for dumps.
fn blocked_template() -> &'static Message {
    static TEMPLATE: OnceLock<Message> = OnceLock::new();
    TEMPLATE.get_or_init(|| {
        let name = Name::from_ascii("domain.blocked.").expect("static name");
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.add_answer(DnsRecord::from_rdata(
            name,
            0,
            RData::A(A(Ipv4Addr::UNSPECIFIED)),
        ));
        msg
    })
}

/// Immutable cache entry. "Updating" a record means replacing it in the
/// cache; concurrent readers may hold the same entry, so the message must be
/// cloned before its transaction id is touched.
#[derive(Debug, Clone)]
pub struct Record {
    msg: Message,
    blocked: bool,
    no_expire: bool,
    updated_at: SystemTime,
    expires_at: SystemTime,
}

impl Record {
    fn new(msg: Message, blocked: bool, no_expire: bool, ttl: Duration) -> Self {
        let now = SystemTime::now();
        Self {
            msg,
            blocked,
            no_expire,
            updated_at: now,
            expires_at: now + ttl,
        }
    }

    /// A fresh upstream answer.
    pub fn resolved(msg: Message, ttl: Duration) -> Self {
        Self::new(msg, false, false, ttl)
    }

    /// An answer synthesized from the hosts file.
    pub fn custom(msg: Message, ttl: Duration) -> Self {
        Self::new(msg, false, false, ttl)
    }

    /// A blocklist entry. Never expires, so it cannot be displaced by a
    /// later resolved answer.
    pub fn blocked() -> Self {
        Self::new(blocked_template().clone(), true, true, Duration::ZERO)
    }

    pub fn msg(&self) -> &Message {
        &self.msg
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn no_expire(&self) -> bool {
        self.no_expire
    }

    pub fn updated_at(&self) -> SystemTime {
        self.updated_at
    }

    pub fn expires_at(&self) -> SystemTime {
        self.expires_at
    }

    pub fn expired(&self) -> bool {
        !self.no_expire && self.expires_at < SystemTime::now()
    }
}

/// Concurrent map of domain key to record with a capacity bound
/// (0 = unbounded). First write wins; expired entries are removed lazily on
/// `get`; a full cache rejects new keys instead of evicting.
pub struct RecordCache {
    records: RwLock<HashMap<String, Arc<Record>>>,
    capacity: usize,
}

#[derive(Serialize)]
struct RecordSnapshot {
    blocked: bool,
    no_expire: bool,
    updated_at: u64,
    expires_at: u64,
    answers: Vec<String>,
}

#[derive(Serialize)]
struct CacheSnapshot {
    capacity: usize,
    records: HashMap<String, RecordSnapshot>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            capacity,
        }
    }

    pub fn get(&self, key: &str) -> Result<Arc<Record>, CacheError> {
        let found = self.records.read().unwrap().get(key).cloned();
        let record = found.ok_or(CacheError::KeyMissed)?;
        if record.expired() {
            self.remove(key);
            return Err(CacheError::KeyExpired);
        }
        Ok(record)
    }

    pub fn set(&self, key: &str, record: Record) -> Result<(), CacheError> {
        let mut records = self.records.write().unwrap();
        if self.capacity > 0 && records.len() >= self.capacity {
            return Err(CacheError::Full);
        }
        if records.contains_key(key) {
            return Ok(());
        }
        records.insert(key.to_string(), Arc::new(record));
        Ok(())
    }

    /// Presence only; does not consider expiry.
    pub fn exists(&self, key: &str) -> bool {
        self.records.read().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.records.write().unwrap().remove(key);
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// JSON rendering of the whole map for the admin surface.
    pub fn dump(&self) -> String {
        let records = self
            .records
            .read()
            .unwrap()
            .iter()
            .map(|(key, record)| {
                let snapshot = RecordSnapshot {
                    blocked: record.blocked,
                    no_expire: record.no_expire,
                    updated_at: unix_secs(record.updated_at),
                    expires_at: unix_secs(record.expires_at),
                    answers: record.msg.answers().iter().map(|rr| rr.to_string()).collect(),
                };
                (key.clone(), snapshot)
            })
            .collect();

        let snapshot = CacheSnapshot {
            capacity: self.capacity,
            records,
        };
        serde_json::to_string(&snapshot).unwrap_or_else(|_| "{}".to_string())
    }
}

impl Default for RecordCache {
    fn default() -> Self {
        Self::new()
    }
}

fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::ResponseCode;
    use std::str::FromStr;

    fn make_response(name: &str, ip: Ipv4Addr, ttl: u32) -> Message {
        let mut msg = Message::new();
        msg.set_message_type(MessageType::Response);
        msg.set_response_code(ResponseCode::NoError);
        msg.add_answer(DnsRecord::from_rdata(
            Name::from_str(name).unwrap(),
            ttl,
            RData::A(A(ip)),
        ));
        msg
    }

    fn resolved(ttl: Duration) -> Record {
        Record::resolved(
            make_response("example.com.", Ipv4Addr::new(1, 2, 3, 4), 300),
            ttl,
        )
    }

    #[test]
    fn test_get_missing_key() {
        let cache = RecordCache::new();
        assert_eq!(cache.get("example.com").unwrap_err(), CacheError::KeyMissed);
    }

    #[test]
    fn test_set_and_get() {
        let cache = RecordCache::new();
        cache
            .set("example.com", resolved(Duration::from_secs(60)))
            .unwrap();

        let record = cache.get("example.com").unwrap();
        assert_eq!(record.msg().answers().len(), 1);
        assert!(!record.is_blocked());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_expired_entry_removed_on_get() {
        let cache = RecordCache::new();
        cache
            .set("example.com", resolved(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert_eq!(
            cache.get("example.com").unwrap_err(),
            CacheError::KeyExpired
        );
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_blocked_record_never_expires() {
        let cache = RecordCache::new();
        cache.set("ads.example.com", Record::blocked()).unwrap();
        std::thread::sleep(Duration::from_millis(5));

        let record = cache.get("ads.example.com").unwrap();
        assert!(record.is_blocked());
        assert!(record.no_expire());
        assert!(!record.expired());
    }

    #[test]
    fn test_first_write_wins() {
        let cache = RecordCache::new();
        cache
            .set("example.com", resolved(Duration::from_secs(60)))
            .unwrap();
        let first = cache.get("example.com").unwrap();

        std::thread::sleep(Duration::from_millis(5));
        cache
            .set("example.com", resolved(Duration::from_secs(600)))
            .unwrap();

        let kept = cache.get("example.com").unwrap();
        assert_eq!(kept.updated_at(), first.updated_at());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_capacity_bound_rejects_without_evicting() {
        let cache = RecordCache::with_capacity(2);
        cache.set("a.com", resolved(Duration::from_secs(60))).unwrap();
        cache.set("b.com", resolved(Duration::from_secs(60))).unwrap();

        assert_eq!(
            cache
                .set("c.com", resolved(Duration::from_secs(60)))
                .unwrap_err(),
            CacheError::Full
        );
        assert_eq!(cache.len(), 2);
        assert!(cache.exists("a.com"));
        assert!(cache.exists("b.com"));
        assert!(!cache.exists("c.com"));
    }

    #[test]
    fn test_exists_ignores_expiry() {
        let cache = RecordCache::new();
        cache
            .set("example.com", resolved(Duration::from_millis(1)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(5));

        assert!(cache.exists("example.com"));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let cache = RecordCache::new();
        cache
            .set("example.com", resolved(Duration::from_secs(60)))
            .unwrap();
        cache.remove("example.com");
        cache.remove("example.com");
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_dump_lists_entries() {
        let cache = RecordCache::new();
        cache
            .set("example.com", resolved(Duration::from_secs(60)))
            .unwrap();

        let dump = cache.dump();
        assert!(dump.contains("example.com"));
        assert!(dump.contains("\"blocked\":false"));
    }

    #[test]
    fn test_concurrent_set_and_get() {
        let cache = Arc::new(RecordCache::new());
        let mut handles = Vec::new();

        for worker in 0..8 {
            let cache = Arc::clone(&cache);
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    let key = format!("host-{worker}-{i}.com");
                    cache.set(&key, resolved(Duration::from_secs(60))).unwrap();
                    assert!(cache.get(&key).is_ok());
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(cache.len(), 8 * 50);
    }
}
