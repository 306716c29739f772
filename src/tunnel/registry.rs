//! Process-wide map from identity key to live tunnel. Server side only.

use std::{collections::HashMap, sync::Arc};

use thiserror::Error;
use tokio::sync::Mutex;

use crate::tunnel::tunnel::Tunnel;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("tunnel already exists for this identity")]
    Duplicate,
    #[error("no tunnel registered for this identity")]
    NotFound,
}

#[derive(Default)]
pub struct Registry {
    inner: Mutex<HashMap<String, Arc<Tunnel>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Insert `tunnel` under `key`. Fails if a *different* tunnel already holds the key; the
    /// caller must then fail the new tunnel and leave the incumbent untouched.
    pub async fn insert(&self, key: String, tunnel: Arc<Tunnel>) -> Result<(), RegistryError> {
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(&key) {
            if !Arc::ptr_eq(existing, &tunnel) {
                return Err(RegistryError::Duplicate);
            }
            return Ok(());
        }
        map.insert(key, tunnel);
        Ok(())
    }

    /// Remove `key` only if it still maps to `tunnel`. A rejected duplicate must never evict the
    /// incumbent it lost the race to; idempotent otherwise.
    pub async fn remove_if(&self, key: &str, tunnel: &Arc<Tunnel>) {
        let mut map = self.inner.lock().await;
        if let Some(existing) = map.get(key) {
            if Arc::ptr_eq(existing, tunnel) {
                map.remove(key);
            }
        }
    }

    pub async fn get(&self, key: &str) -> Option<Arc<Tunnel>> {
        self.inner.lock().await.get(key).cloned()
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::tunnel::{Side, Tunnel};
    use std::sync::atomic::AtomicU32;
    use tokio::net::{TcpListener, TcpStream};

    async fn dummy_tunnel() -> Arc<Tunnel> {
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (a, (b, _)) = tokio::join!(TcpStream::connect(addr), async { ln.accept().await.unwrap() });
        let _ = b;
        let (tunnel, _read) = Tunnel::new(Side::Server, a.unwrap(), None, None, Arc::new(AtomicU32::new(1)));
        tunnel
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_key_from_different_tunnel() {
        let reg = Registry::new();
        let t1 = dummy_tunnel().await;
        let t2 = dummy_tunnel().await;

        reg.insert("<AA:10.0.0.5:5900>".into(), t1.clone())
            .await
            .unwrap();
        let err = reg
            .insert("<AA:10.0.0.5:5900>".into(), t2)
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn insert_is_idempotent_for_the_same_tunnel() {
        let reg = Registry::new();
        let t1 = dummy_tunnel().await;
        reg.insert("<AA:10.0.0.5:5900>".into(), t1.clone())
            .await
            .unwrap();
        reg.insert("<AA:10.0.0.5:5900>".into(), t1)
            .await
            .unwrap();
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn remove_if_is_idempotent() {
        let reg = Registry::new();
        let missing = dummy_tunnel().await;
        reg.remove_if("<missing>", &missing).await;
        let t1 = dummy_tunnel().await;
        reg.insert("<k>".into(), t1.clone()).await.unwrap();
        reg.remove_if("<k>", &t1).await;
        reg.remove_if("<k>", &t1).await;
        assert_eq!(reg.len().await, 0);
    }

    #[tokio::test]
    async fn remove_if_leaves_the_incumbent_when_called_by_a_loser() {
        let reg = Registry::new();
        let incumbent = dummy_tunnel().await;
        let loser = dummy_tunnel().await;
        reg.insert("<k>".into(), incumbent.clone()).await.unwrap();
        assert!(reg.insert("<k>".into(), loser.clone()).await.is_err());

        // The loser tearing down must not evict the incumbent it lost the race to.
        reg.remove_if("<k>", &loser).await;
        assert_eq!(reg.len().await, 1);
        assert!(reg.get("<k>").await.is_some());
    }
}
