use crate::errors::AuthError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use url::Url;

/// Server-side persistence for refresh tokens, keyed by a hash of the
/// access token they belong to. Implementations own their synchronization;
/// `set` overwrites and `delete` tolerates missing keys.
#[async_trait]
pub trait RefreshStore: Send + Sync {
    async fn set(&self, key: &str, value: &str) -> Result<(), AuthError>;
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError>;
    async fn delete(&self, key: &str) -> Result<(), AuthError>;
    async fn close(&self) -> Result<(), AuthError>;
}

/// Stable store key for an access token.
pub(crate) fn hash_key(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Build the store named by `location`; the scheme selects the backend.
pub async fn create_storage(location: &str) -> Result<Arc<dyn RefreshStore>, AuthError> {
    let url = Url::parse(location)
        .map_err(|err| AuthError::Config(format!("the store url is invalid: {err}")))?;
    match url.scheme() {
        "redis" => Ok(Arc::new(RedisStore::new(location).await?)),
        "boltdb" => Ok(Arc::new(SledStore::new(url.path())?)),
        scheme => Err(AuthError::Config(format!("unsupported store: {scheme}"))),
    }
}

/// Redis-backed store over a multiplexed connection manager.
#[derive(Clone)]
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn new(url: &str) -> Result<Self, AuthError> {
        let client =
            redis::Client::open(url).map_err(|err| AuthError::Store(err.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|err| AuthError::Store(err.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl RefreshStore for RedisStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| AuthError::Store(err.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let mut conn = self.manager.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut conn)
            .await
            .map_err(|err| AuthError::Store(err.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), AuthError> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(key)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|err| AuthError::Store(err.to_string()))
    }

    async fn close(&self) -> Result<(), AuthError> {
        // connections are pooled by the manager and shut down with it
        Ok(())
    }
}

/// Embedded store for single-instance deployments, `boltdb://<path>`.
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    pub fn new(path: &str) -> Result<Self, AuthError> {
        let db = sled::open(path).map_err(|err| AuthError::Store(err.to_string()))?;
        Ok(Self { db })
    }

    #[cfg(test)]
    fn temporary() -> Self {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .expect("temporary sled store");
        Self { db }
    }
}

#[async_trait]
impl RefreshStore for SledStore {
    async fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
        self.db
            .insert(key, value.as_bytes())
            .map(|_| ())
            .map_err(|err| AuthError::Store(err.to_string()))
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let value = self
            .db
            .get(key)
            .map_err(|err| AuthError::Store(err.to_string()))?;
        Ok(value.map(|raw| String::from_utf8_lossy(&raw).into_owned()))
    }

    async fn delete(&self, key: &str) -> Result<(), AuthError> {
        self.db
            .remove(key)
            .map(|_| ())
            .map_err(|err| AuthError::Store(err.to_string()))
    }

    async fn close(&self) -> Result<(), AuthError> {
        self.db
            .flush_async()
            .await
            .map(|_| ())
            .map_err(|err| AuthError::Store(err.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory store used by the pipeline tests.
    #[derive(Default)]
    pub(crate) struct MemoryStore {
        entries: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl RefreshStore for MemoryStore {
        async fn set(&self, key: &str, value: &str) -> Result<(), AuthError> {
            self.entries
                .lock()
                .unwrap()
                .insert(key.to_string(), value.to_string());
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
            Ok(self.entries.lock().unwrap().get(key).cloned())
        }

        async fn delete(&self, key: &str) -> Result<(), AuthError> {
            self.entries.lock().unwrap().remove(key);
            Ok(())
        }

        async fn close(&self) -> Result<(), AuthError> {
            Ok(())
        }
    }

    #[test]
    fn test_hash_key_is_stable_and_hex() {
        let first = hash_key("token-a");
        let second = hash_key("token-a");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
        assert_ne!(first, hash_key("token-b"));
    }

    #[actix_web::test]
    async fn test_sled_store_round_trip() {
        let store = SledStore::temporary();
        assert_eq!(store.get("k").await.unwrap(), None);

        store.set("k", "v1").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v1"));

        // set overwrites
        store.set("k", "v2").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v2"));

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);

        // delete tolerates missing keys
        store.delete("k").await.unwrap();
        store.close().await.unwrap();
    }

    #[actix_web::test]
    async fn test_create_storage_rejects_unknown_scheme() {
        let err = create_storage("memcached://localhost").await.err().unwrap();
        assert!(matches!(err, AuthError::Config(_)));
    }
}
