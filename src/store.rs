//! The committed key→value map.
//!
//! Holds exactly the state produced by replaying committed log entries in
//! index order. Reads are served from here by the leader; nothing in the
//! store survives the process.

use std::collections::HashMap;

use crate::core::message::LogEntry;

/// In-memory key-value state derived from the committed log prefix.
#[derive(Debug, Default)]
pub struct KvStore {
    data: HashMap<String, String>,
}

impl KvStore {
    pub fn new() -> Self {
        KvStore {
            data: HashMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }

    /// Apply one committed entry. Later entries for the same key simply
    /// overwrite, which is what makes replaying a prefix idempotent.
    pub fn apply(&mut self, entry: &LogEntry) {
        self.data.insert(entry.key.clone(), entry.value.clone());
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: usize, key: &str, value: &str) -> LogEntry {
        LogEntry {
            index,
            term: 1,
            key: key.to_string(),
            value: value.to_string(),
        }
    }

    #[test]
    fn test_apply_and_get() {
        let mut store = KvStore::new();
        store.apply(&entry(0, "foo", "bar"));
        assert_eq!(store.get("foo"), Some("bar"));
        assert_eq!(store.get("missing"), None);
    }

    #[test]
    fn test_later_entry_overwrites() {
        let mut store = KvStore::new();
        store.apply(&entry(0, "k", "1"));
        store.apply(&entry(1, "k", "2"));
        assert_eq!(store.get("k"), Some("2"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replaying_prefix_is_noop() {
        let mut store = KvStore::new();
        let entries = [entry(0, "a", "1"), entry(1, "b", "2"), entry(2, "a", "3")];
        for e in &entries {
            store.apply(e);
        }
        for e in &entries {
            store.apply(e);
        }
        assert_eq!(store.get("a"), Some("3"));
        assert_eq!(store.get("b"), Some("2"));
        assert_eq!(store.len(), 2);
    }
}
