use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::bail;
use ksync_core::{Callbacks, ResourceIdentity};
use tracing::info;

/// One recorded callback invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackCall {
    ObjectAdded { id: ResourceIdentity, object: Vec<u8> },
    ObjectDeleted { id: ResourceIdentity },
    PutObject { id: ResourceIdentity, object: Vec<u8> },
    PatchObject { id: ResourceIdentity, checksum: String, patch: Vec<u8> },
    GetObject { id: ResourceIdentity, base_object: Vec<u8> },
}

/// Simple in-memory sink for tests: records successful calls in order.
#[derive(Default)]
pub struct MockCallbacks {
    calls: Mutex<Vec<CallbackCall>>,
    failures: AtomicUsize,
}

impl MockCallbacks {
    pub fn new() -> Self { Self::default() }

    pub fn calls(&self) -> Vec<CallbackCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn take(&self) -> Vec<CallbackCall> {
        std::mem::take(&mut *self.calls.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Fail the next `n` calls, whatever their kind.
    pub fn fail_next(&self, n: usize) { self.failures.store(n, Ordering::SeqCst); }

    fn record(&self, call: CallbackCall) -> anyhow::Result<()> {
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            bail!("mock transport unavailable");
        }
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).push(call);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Callbacks for MockCallbacks {
    async fn object_added(&self, id: &ResourceIdentity, object: &[u8]) -> anyhow::Result<()> {
        self.record(CallbackCall::ObjectAdded { id: id.clone(), object: object.to_vec() })
    }

    async fn object_deleted(&self, id: &ResourceIdentity) -> anyhow::Result<()> {
        self.record(CallbackCall::ObjectDeleted { id: id.clone() })
    }

    async fn put_object(&self, id: &ResourceIdentity, object: &[u8]) -> anyhow::Result<()> {
        self.record(CallbackCall::PutObject { id: id.clone(), object: object.to_vec() })
    }

    async fn patch_object(&self, id: &ResourceIdentity, checksum: &str, patch: &[u8]) -> anyhow::Result<()> {
        self.record(CallbackCall::PatchObject { id: id.clone(), checksum: checksum.to_string(), patch: patch.to_vec() })
    }

    async fn get_object(&self, id: &ResourceIdentity, base_object: &[u8]) -> anyhow::Result<()> {
        self.record(CallbackCall::GetObject { id: id.clone(), base_object: base_object.to_vec() })
    }
}

/// Sink that only logs; stands in for a transport when none is wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingCallbacks;

#[async_trait::async_trait]
impl Callbacks for LoggingCallbacks {
    async fn object_added(&self, id: &ResourceIdentity, object: &[u8]) -> anyhow::Result<()> {
        info!(id = %id, bytes = object.len(), "object added");
        Ok(())
    }

    async fn object_deleted(&self, id: &ResourceIdentity) -> anyhow::Result<()> {
        info!(id = %id, "object deleted");
        Ok(())
    }

    async fn put_object(&self, id: &ResourceIdentity, object: &[u8]) -> anyhow::Result<()> {
        info!(id = %id, bytes = object.len(), "put object");
        Ok(())
    }

    async fn patch_object(&self, id: &ResourceIdentity, checksum: &str, patch: &[u8]) -> anyhow::Result<()> {
        info!(id = %id, checksum, patch = %String::from_utf8_lossy(patch), "patch object");
        Ok(())
    }

    async fn get_object(&self, id: &ResourceIdentity, base_object: &[u8]) -> anyhow::Result<()> {
        info!(id = %id, base_bytes = base_object.len(), "get object");
        Ok(())
    }
}
