//! Loader-level cache of image requests.
//!
//! Each [`RequestCache`] maps a [`CacheKey`] to the [`CacheEntry`] of the request that serves it.
//! Entries nobody is using are bounded by an [`EvictionQueue`] and aged out by an
//! [`ExpirationTracker`]; entries in use are pinned until their last consumer goes away.

pub mod entry;
pub mod key;
pub mod queue;
pub mod table;
pub mod tracker;

pub use entry::CacheEntry;
pub use key::{CacheKey, IsolationAttributes};
pub use queue::{AgeSizePolicy, EvictionPolicy, EvictionQueue};
pub use table::RequestCache;
pub use tracker::ExpirationTracker;
