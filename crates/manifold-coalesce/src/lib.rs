//! Request coalescing primitives for in-process servers that fan many client
//! calls into fewer backend calls.
//!
//! Four independent building blocks share one discipline — a map of per-key
//! state guarded by short critical sections, timers driving eviction, and
//! non-blocking publication to many waiters over buffered one-shot channels:
//!
//! - [`KeyedMutex`] / [`KeyedRwMutex`]: lazily created async locks per key.
//! - [`SingleFlight`]: at-most-once computation per key with broadcast to
//!   concurrent callers and TTL-bounded result retention.
//! - [`Rendezvous`]: publish a value once, deliver it to any number of
//!   waiters; waits and stored values expire on independent clocks.
//! - [`CompletionMap`]: rendezvous on completion of a keyed transaction
//!   carrying a mutable payload.
//! - [`LoadingCache`]: load-through cache with FIFO capacity eviction,
//!   write/read timeouts and asynchronous unload callbacks.
//!
//! All components are cheaply cloneable handles; clones share state.
//! Constructors that spawn background tasks must run inside a Tokio runtime.

pub mod completion;
pub mod error;
pub mod keyed_mutex;
pub mod loading_cache;
pub mod rendezvous;
pub mod single_flight;

pub use completion::CompletionMap;
pub use error::Error;
pub use keyed_mutex::{KeyedMutex, KeyedRwMutex};
pub use loading_cache::{CacheConfig, LoadingCache};
pub use rendezvous::Rendezvous;
pub use single_flight::SingleFlight;
