//! ksync adapter boundary.
//!
//! The remote side drives five operations keyed by `(cluster, kind, name)`;
//! [`InClusterAdapter`] routes them to the resource client owning the kind.
//! Callback sinks carry outbound notifications toward the transport.

#![forbid(unsafe_code)]

use ksync_core::{ResourceIdentity, SyncResult};

mod adapter;
mod sinks;

pub use adapter::InClusterAdapter;
pub use sinks::{CallbackCall, LoggingCallbacks, MockCallbacks};

/// Inbound operations from the remote side.
#[async_trait::async_trait]
pub trait Adapter: Send + Sync {
    /// Send the current object to the remote side, as a patch against
    /// `base_object` (or the last transmitted state) where the kind allows it.
    async fn get_object(&self, id: &ResourceIdentity, base_object: &[u8]) -> SyncResult<()>;
    async fn put_object(&self, id: &ResourceIdentity, object: &[u8]) -> SyncResult<()>;
    async fn patch_object(&self, id: &ResourceIdentity, checksum: &str, patch: &[u8]) -> SyncResult<()>;
    async fn delete_object(&self, id: &ResourceIdentity) -> SyncResult<()>;
    async fn verify_object(&self, id: &ResourceIdentity, checksum: &str) -> SyncResult<()>;
}
