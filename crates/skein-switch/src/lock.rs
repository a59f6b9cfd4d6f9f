//! Distributed lock service interface and an in-memory implementation.
//!
//! A lock is `(path, name, target)`. Two locks conflict when they share a
//! path, their targets overlap (an empty target covers the whole path) and
//! their names are not a shared pair. A request is granted all-or-nothing.

use crate::error::{Result, SwitchError};
use crate::plan::NodeId;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Lock names
pub mod lock_name {
    /// Blob store in use by a transfer; shared between transfers
    pub const BLOB_BUSY: &str = "busy";
    /// Blob store garbage collection; excludes every transfer
    pub const BLOB_GC: &str = "gc";
    /// Reading one metadata element; shared between readers
    pub const ELEMENT_READ: &str = "element_read";
    /// Writing one metadata element
    pub const ELEMENT_WRITE: &str = "element_write";
    /// Creating one metadata element
    pub const ELEMENT_CREATE: &str = "element_create";
}

const SHARED: &[&str] = &[lock_name::BLOB_BUSY, lock_name::ELEMENT_READ];

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lock {
    pub path: Vec<String>,
    pub name: String,
    pub target: String,
}

impl Lock {
    /// Whether `self` and `other` can be held at the same time
    pub fn compatible_with(&self, other: &Lock) -> bool {
        if self.path != other.path {
            return true;
        }
        let overlap = self.target.is_empty() || other.target.is_empty() || self.target == other.target;
        if !overlap {
            return true;
        }
        self.name == other.name && SHARED.contains(&self.name.as_str())
    }
}

impl fmt::Display for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.path.join("/"), self.name)?;
        if !self.target.is_empty() {
            write!(f, "@{}", self.target)?;
        }
        Ok(())
    }
}

/// Handle on a granted lock request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LockRequestId(pub u64);

impl fmt::Display for LockRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock-{}", self.0)
    }
}

#[async_trait]
pub trait LockService: Send + Sync {
    /// Wait until every lock can be held, then hold them all
    async fn acquire(&self, locks: Vec<Lock>) -> Result<LockRequestId>;

    async fn release(&self, id: LockRequestId) -> Result<()>;
}

/// Collects the locks for one request
#[derive(Debug, Clone, Default)]
pub struct LockRequestBuilder {
    locks: Vec<Lock>,
}

impl LockRequestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Node's blob store is used by a transfer
    pub fn blob_busy(self, node: NodeId) -> Self {
        self.push(blob_path(node), lock_name::BLOB_BUSY, String::new())
    }

    /// Node's blob store is being garbage collected
    pub fn blob_gc(self, node: NodeId) -> Self {
        self.push(blob_path(node), lock_name::BLOB_GC, String::new())
    }

    pub fn package_read_one(self, package_id: i64) -> Self {
        self.push(package_path(), lock_name::ELEMENT_READ, package_id.to_string())
    }

    pub fn package_write_one(self, package_id: i64) -> Self {
        self.push(package_path(), lock_name::ELEMENT_WRITE, package_id.to_string())
    }

    pub fn package_create_one(self, bucket_id: i64, name: &str) -> Self {
        self.push(
            package_path(),
            lock_name::ELEMENT_CREATE,
            format!("{}/{}", bucket_id, name),
        )
    }

    fn push(mut self, path: Vec<String>, name: &str, target: String) -> Self {
        self.locks.push(Lock {
            path,
            name: name.to_string(),
            target,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    pub fn build(self) -> Vec<Lock> {
        self.locks
    }

    pub async fn acquire(self, service: &dyn LockService) -> Result<LockRequestId> {
        service.acquire(self.locks).await
    }
}

fn blob_path(node: NodeId) -> Vec<String> {
    vec!["blob".to_string(), node.0.to_string()]
}

fn package_path() -> Vec<String> {
    vec!["metadata".to_string(), "package".to_string()]
}

#[derive(Default)]
struct Held {
    requests: HashMap<LockRequestId, Vec<Lock>>,
    next_id: u64,
}

/// Lock service for a single process
pub struct MemoryLockService {
    held: Mutex<Held>,
    released: Notify,
    timeout: Duration,
}

impl MemoryLockService {
    pub fn new(timeout: Duration) -> Self {
        Self {
            held: Mutex::new(Held::default()),
            released: Notify::new(),
            timeout,
        }
    }

    /// Number of granted requests not yet released
    pub fn held_requests(&self) -> usize {
        self.held.lock().requests.len()
    }

    fn try_grant(&self, locks: &[Lock]) -> Option<LockRequestId> {
        let mut held = self.held.lock();
        let blocked = held
            .requests
            .values()
            .flatten()
            .any(|h| locks.iter().any(|l| !l.compatible_with(h)));
        if blocked {
            return None;
        }
        let id = LockRequestId(held.next_id);
        held.next_id += 1;
        held.requests.insert(id, locks.to_vec());
        Some(id)
    }
}

impl Default for MemoryLockService {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[async_trait]
impl LockService for MemoryLockService {
    async fn acquire(&self, locks: Vec<Lock>) -> Result<LockRequestId> {
        let wait = async {
            loop {
                let notified = self.released.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if let Some(id) = self.try_grant(&locks) {
                    return id;
                }
                notified.await;
            }
        };
        match tokio::time::timeout(self.timeout, wait).await {
            Ok(id) => {
                debug!(request = %id, locks = locks.len(), "locks acquired");
                Ok(id)
            }
            Err(_) => {
                warn!(locks = locks.len(), "timed out acquiring locks");
                Err(SwitchError::Lock(format!(
                    "timed out acquiring {}",
                    locks
                        .iter()
                        .map(|l| l.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                )))
            }
        }
    }

    async fn release(&self, id: LockRequestId) -> Result<()> {
        let removed = self.held.lock().requests.remove(&id);
        if removed.is_none() {
            return Err(SwitchError::Lock(format!("unknown lock request {}", id)));
        }
        self.released.notify_waiters();
        debug!(request = %id, "locks released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_compatibility() {
        let busy = LockRequestBuilder::new().blob_busy(NodeId(1)).build();
        let gc = LockRequestBuilder::new().blob_gc(NodeId(1)).build();
        let other_gc = LockRequestBuilder::new().blob_gc(NodeId(2)).build();
        assert!(busy[0].compatible_with(&busy[0]));
        assert!(!busy[0].compatible_with(&gc[0]));
        assert!(busy[0].compatible_with(&other_gc[0]));

        let read = LockRequestBuilder::new().package_read_one(5).build();
        let write = LockRequestBuilder::new().package_write_one(5).build();
        let write_other = LockRequestBuilder::new().package_write_one(6).build();
        assert!(read[0].compatible_with(&read[0]));
        assert!(!read[0].compatible_with(&write[0]));
        assert!(write[0].compatible_with(&write_other[0]));
        assert!(!write[0].compatible_with(&write[0]));
    }

    #[tokio::test]
    async fn test_shared_locks_coexist() {
        let service = MemoryLockService::default();
        let a = LockRequestBuilder::new().blob_busy(NodeId(1)).acquire(&service).await.unwrap();
        let b = LockRequestBuilder::new().blob_busy(NodeId(1)).acquire(&service).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(service.held_requests(), 2);
        service.release(a).await.unwrap();
        service.release(b).await.unwrap();
        assert!(service.release(b).await.is_err());
    }

    #[tokio::test]
    async fn test_exclusive_waits_for_release() {
        let service = Arc::new(MemoryLockService::default());
        let busy = LockRequestBuilder::new().blob_busy(NodeId(1)).acquire(service.as_ref()).await.unwrap();

        let gc = {
            let service = service.clone();
            tokio::spawn(async move {
                LockRequestBuilder::new().blob_gc(NodeId(1)).acquire(service.as_ref()).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!gc.is_finished());

        service.release(busy).await.unwrap();
        assert!(gc.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_acquire_timeout() {
        let service = MemoryLockService::new(Duration::from_millis(20));
        let _gc = LockRequestBuilder::new().blob_gc(NodeId(3)).acquire(&service).await.unwrap();
        let err = LockRequestBuilder::new()
            .blob_busy(NodeId(3))
            .acquire(&service)
            .await
            .unwrap_err();
        assert!(matches!(err, SwitchError::Lock(_)));
        assert_eq!(service.held_requests(), 1);
    }
}
