// Key-value persistence
// Storage backends used for credentials (persistent) and one-shot flags (session-scoped)

mod memory;
mod sqlite;

use anyhow::Result;
use std::sync::Arc;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Minimal key-value contract shared by every backend
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;

    /// Read and remove in one step
    ///
    /// Backends with a native atomic form should override this.
    fn take(&self, key: &str) -> Result<Option<String>> {
        let value = self.get(key)?;
        if value.is_some() {
            self.remove(key)?;
        }
        Ok(value)
    }
}

/// View over a backing store that prefixes every key with a namespace
#[derive(Clone)]
pub struct ScopedStore {
    inner: Arc<dyn KeyValueStore>,
    namespace: String,
}

impl ScopedStore {
    pub fn new(inner: Arc<dyn KeyValueStore>, namespace: impl Into<String>) -> Self {
        Self {
            inner,
            namespace: namespace.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.namespace, key)
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.inner.get(&self.key(key))
    }

    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        self.inner.set(&self.key(key), value)
    }

    pub fn remove(&self, key: &str) -> Result<()> {
        self.inner.remove(&self.key(key))
    }

    pub fn take(&self, key: &str) -> Result<Option<String>> {
        self.inner.take(&self.key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scoped_keys_do_not_collide() {
        let backing: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let a = ScopedStore::new(backing.clone(), "a:");
        let b = ScopedStore::new(backing.clone(), "b:");

        a.set("token", "one").unwrap();
        b.set("token", "two").unwrap();

        assert_eq!(a.get("token").unwrap().as_deref(), Some("one"));
        assert_eq!(b.get("token").unwrap().as_deref(), Some("two"));
        assert_eq!(backing.get("a:token").unwrap().as_deref(), Some("one"));
        assert_eq!(backing.get("token").unwrap(), None);
    }

    #[test]
    fn test_take_removes_value() {
        let scoped = ScopedStore::new(Arc::new(MemoryStore::new()), "flags:");
        scoped.set("justSignedUp", "1").unwrap();

        assert_eq!(scoped.take("justSignedUp").unwrap().as_deref(), Some("1"));
        assert_eq!(scoped.take("justSignedUp").unwrap(), None);
        assert_eq!(scoped.get("justSignedUp").unwrap(), None);
    }
}
