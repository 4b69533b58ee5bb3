//! Database pool.
//!
//! Handlers check a database out for the duration of one request and must
//! pair every checkout with a checkin on all exit paths. The checkin is
//! carried by [`DatabaseGuard`]'s `Drop`, so early returns and panics
//! release the handle too.

use crate::engine::Engine;
use crate::error::EngineError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Checkout wants a writable handle.
pub const DB_WRITABLE: u32 = 1 << 0;

/// Create the database if the endpoint does not exist yet.
pub const DB_SPAWN: u32 = 1 << 1;

/// Pool of per-endpoint index engines.
pub struct DatabasePool {
    databases: Mutex<HashMap<String, Arc<Engine>>>,
    active: AtomicU64,
    total_checkouts: AtomicU64,
}

impl DatabasePool {
    pub fn new() -> Self {
        Self {
            databases: Mutex::new(HashMap::new()),
            active: AtomicU64::new(0),
            total_checkouts: AtomicU64::new(0),
        }
    }

    /// Checks out the database for the first endpoint in the list.
    ///
    /// With `DB_SPAWN` a missing endpoint is created; without it the
    /// checkout fails. The returned guard checks back in when dropped.
    pub fn checkout(
        self: &Arc<Self>,
        endpoints: &[String],
        flags: u32,
    ) -> Result<DatabaseGuard, EngineError> {
        let endpoint = endpoints
            .first()
            .ok_or_else(|| EngineError::EndpointNotFound("<empty>".to_string()))?;

        let engine = {
            let mut databases = self.databases.lock();
            match databases.get(endpoint) {
                Some(engine) => engine.clone(),
                None if flags & DB_SPAWN != 0 => {
                    let engine = Arc::new(Engine::new());
                    databases.insert(endpoint.clone(), engine.clone());
                    engine
                }
                None => return Err(EngineError::EndpointNotFound(endpoint.clone())),
            }
        };

        self.active.fetch_add(1, Ordering::AcqRel);
        self.total_checkouts.fetch_add(1, Ordering::Relaxed);

        Ok(DatabaseGuard {
            pool: self.clone(),
            engine,
            endpoint: endpoint.clone(),
            writable: flags & DB_WRITABLE != 0,
        })
    }

    /// Number of handles currently checked out.
    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// Lifetime checkout count.
    pub fn total_checkouts(&self) -> u64 {
        self.total_checkouts.load(Ordering::Relaxed)
    }

    /// Known endpoints.
    pub fn endpoints(&self) -> Vec<String> {
        self.databases.lock().keys().cloned().collect()
    }

    fn checkin(&self) {
        let previous = self.active.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0);
    }
}

impl Default for DatabasePool {
    fn default() -> Self {
        Self::new()
    }
}

/// A checked-out database handle. Dereferences to the engine for reads;
/// mutations go through [`writable`](Self::writable), which refuses
/// handles checked out without `DB_WRITABLE`.
pub struct DatabaseGuard {
    pool: Arc<DatabasePool>,
    engine: Arc<Engine>,
    endpoint: String,
    writable: bool,
}

impl DatabaseGuard {
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// The engine, for mutating operations.
    pub fn writable(&self) -> Result<&Engine, EngineError> {
        if self.writable {
            Ok(&self.engine)
        } else {
            Err(EngineError::NotWritable)
        }
    }
}

impl Deref for DatabaseGuard {
    type Target = Engine;

    fn deref(&self) -> &Engine {
        &self.engine
    }
}

impl Drop for DatabaseGuard {
    fn drop(&mut self) {
        self.pool.checkin();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_creates_endpoint() {
        let pool = Arc::new(DatabasePool::new());
        let endpoints = vec!["idx/main".to_string()];

        assert!(matches!(
            pool.checkout(&endpoints, 0),
            Err(EngineError::EndpointNotFound(_))
        ));

        let guard = pool.checkout(&endpoints, DB_SPAWN).unwrap();
        assert_eq!(guard.endpoint(), "idx/main");
        drop(guard);

        // Endpoint persists after checkin.
        assert!(pool.checkout(&endpoints, 0).is_ok());
    }

    #[test]
    fn test_checkin_on_drop() {
        let pool = Arc::new(DatabasePool::new());
        let endpoints = vec!["idx".to_string()];
        {
            let _a = pool.checkout(&endpoints, DB_SPAWN).unwrap();
            let _b = pool.checkout(&endpoints, 0).unwrap();
            assert_eq!(pool.active(), 2);
        }
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.total_checkouts(), 2);
    }

    #[test]
    fn test_checkin_on_panic() {
        let pool = Arc::new(DatabasePool::new());
        let endpoints = vec!["idx".to_string()];
        let pool2 = pool.clone();
        let endpoints2 = endpoints.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || {
            let _guard = pool2.checkout(&endpoints2, DB_SPAWN).unwrap();
            panic!("handler failed");
        }));
        assert!(result.is_err());
        assert_eq!(pool.active(), 0);
    }

    #[test]
    fn test_writable_enforced() {
        let pool = Arc::new(DatabasePool::new());
        let endpoints = vec!["idx".to_string()];
        let guard = pool.checkout(&endpoints, DB_SPAWN).unwrap();
        assert!(matches!(guard.writable(), Err(EngineError::NotWritable)));
        drop(guard);

        let guard = pool.checkout(&endpoints, DB_WRITABLE).unwrap();
        assert!(guard.writable().is_ok());
    }

    #[test]
    fn test_shared_engine_state() {
        let pool = Arc::new(DatabasePool::new());
        let endpoints = vec!["idx".to_string()];
        let guard = pool.checkout(&endpoints, DB_WRITABLE | DB_SPAWN).unwrap();
        let doc = crate::Document::from_body("1", crate::JSON_TYPE, br#"{"a":1}"#).unwrap();
        guard.writable().unwrap().index(doc, true).unwrap();
        drop(guard);

        let guard = pool.checkout(&endpoints, 0).unwrap();
        assert_eq!(guard.doc_count(), 1);
    }
}
