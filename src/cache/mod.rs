//! Content-addressed artifact cache
//!
//! Binary artifacts (and their optional metadata siblings) are cached under
//! a size budget shared by every worker process on the host. The cache id
//! is derived purely from `(scope, content hash)`; eviction favors content
//! the current job just touched over older unreferenced content.
//!
//! Running without a cache directory is fully supported: every lookup is a
//! miss and every mutation a no-op.

pub mod lock;
pub mod store;

pub use lock::ScopedLock;
pub use store::{candidate_for, derive_id, CacheCandidate, CacheEntry, CacheStore, CacheUsage};
