//! Cache backends.
//!
//! The in-memory backend holds price memoization entries and pending
//! subscription updates for a single process.

mod in_memory;

pub use in_memory::InMemoryCache;
