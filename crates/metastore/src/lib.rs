//! Embedded persistent key/value store used for file metadata and the
//! replication retry log. One [`MetaStore`] per namespace; sled handles
//! concurrent access internally, so the handle is cheaply cloneable and
//! shared without extra locking.

use std::path::Path;

#[derive(Debug)]
pub enum MetaStoreError {
    EmptyKey,
    Backend(sled::Error),
}

impl std::fmt::Display for MetaStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyKey => write!(f, "key can not be empty"),
            Self::Backend(err) => write!(f, "metastore backend error: {err}"),
        }
    }
}

impl std::error::Error for MetaStoreError {}

impl From<sled::Error> for MetaStoreError {
    fn from(err: sled::Error) -> Self {
        Self::Backend(err)
    }
}

#[derive(Debug, Clone)]
pub struct MetaStore {
    db: sled::Db,
}

impl MetaStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, MetaStoreError> {
        let db = sled::open(path)?;
        Ok(Self { db })
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, MetaStoreError> {
        require_key(key)?;
        Ok(self.db.get(key)?.map(|value| value.to_vec()))
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), MetaStoreError> {
        require_key(key)?;
        self.db.insert(key, value)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> Result<(), MetaStoreError> {
        require_key(key)?;
        self.db.remove(key)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> Result<bool, MetaStoreError> {
        require_key(key)?;
        Ok(self.db.contains_key(key)?)
    }

    /// Full scan, key order. Only meant for small namespaces such as the
    /// replication retry log.
    pub fn entries(&self) -> Result<Vec<(String, Vec<u8>)>, MetaStoreError> {
        let mut entries = Vec::new();
        for item in self.db.iter() {
            let (key, value) = item?;
            entries.push((String::from_utf8_lossy(&key).into_owned(), value.to_vec()));
        }
        Ok(entries)
    }
}

fn require_key(key: &str) -> Result<(), MetaStoreError> {
    if key.is_empty() {
        return Err(MetaStoreError::EmptyKey);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn fresh_store(name: &str) -> (MetaStore, PathBuf) {
        let unique = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = std::env::temp_dir().join(format!("flockfs-{name}-{unique}"));
        let store = MetaStore::open(&path).expect("open metastore");
        (store, path)
    }

    #[test]
    fn put_get_delete_roundtrip() {
        let (store, path) = fresh_store("roundtrip");

        store.put("abc123", b"payload").unwrap();
        assert_eq!(store.get("abc123").unwrap(), Some(b"payload".to_vec()));
        assert!(store.contains("abc123").unwrap());

        store.delete("abc123").unwrap();
        assert_eq!(store.get("abc123").unwrap(), None);
        assert!(!store.contains("abc123").unwrap());

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn empty_keys_are_rejected() {
        let (store, path) = fresh_store("empty-key");

        assert!(matches!(
            store.put("", b"x"),
            Err(MetaStoreError::EmptyKey)
        ));
        assert!(matches!(store.get(""), Err(MetaStoreError::EmptyKey)));
        assert!(matches!(store.delete(""), Err(MetaStoreError::EmptyKey)));

        let _ = std::fs::remove_dir_all(path);
    }

    #[test]
    fn entries_lists_everything() {
        let (store, path) = fresh_store("entries");

        store.put("b@add", b"2").unwrap();
        store.put("a@add", b"1").unwrap();

        let entries = store.entries().unwrap();
        let keys: Vec<&str> = entries.iter().map(|(key, _)| key.as_str()).collect();
        assert_eq!(keys, vec!["a@add", "b@add"]);

        let _ = std::fs::remove_dir_all(path);
    }
}
