//! Cache trait definitions for dependency injection.
//!
//! Keys are opaque strings derived by [`super::key`]; both tiers must be
//! safe for concurrent access from the coordinator and from write-backs
//! scheduled on the work queues. Cache failures never fail a request: `put`
//! is infallible from the pipeline's perspective and implementations are
//! expected to swallow (and log) their own I/O errors.

use crate::container::ImageContainer;

/// In-memory image cache storing decoded containers.
///
/// Lookups happen synchronously on the caller's thread, so `get` must be
/// cheap. A miss is never an error; the memory tier is advisory.
pub trait ImageCache: Send + Sync + 'static {
    /// Returns the cached container for the key.
    fn get(&self, key: &str) -> Option<ImageContainer>;

    /// Stores a container under the key, replacing any existing entry.
    fn put(&self, key: &str, container: ImageContainer);

    /// Removes the entry for the key.
    fn remove(&self, key: &str);

    /// Removes every entry.
    fn remove_all(&self);

    /// True when an entry exists for the key.
    fn contains(&self, key: &str) -> bool;
}

/// On-disk byte cache storing opaque encoded data.
///
/// `get` is called from work-queue operations and may block on I/O. `put`
/// is expected to be cheap: implementations buffer writes internally and
/// flush in the background.
pub trait DataCache: Send + Sync + 'static {
    /// Returns the cached bytes for the key.
    fn get(&self, key: &str) -> Option<Vec<u8>>;

    /// Stores bytes under the key, replacing any existing entry.
    fn put(&self, key: &str, data: &[u8]);

    /// Removes the entry for the key.
    fn remove(&self, key: &str);

    /// Removes every entry.
    fn remove_all(&self);

    /// True when an entry exists for the key.
    fn contains(&self, key: &str) -> bool;
}
