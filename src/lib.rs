//! Prefetching, thread-safe streaming layer for paginated annotation-platform APIs
//!
//! This crate is the iteration core of a client SDK for a hosted labeling
//! platform. It does not speak HTTP itself: callers supply a page-fetch
//! capability ([`PageFetcher`]) and, optionally, a record-to-entity
//! conversion, and get back lazy iterators over remote paged resources that
//! can be pipelined with background worker threads.
//!
//! The building blocks:
//!
//! - [`SharedSource`] lets multiple worker threads drain one sequential
//!   iterator with no duplicates or skips.
//! - [`Prefetcher`] runs a transform over source items on worker threads,
//!   buffering results in a bounded queue so slow fetches and slow
//!   consumers do not stall each other.
//! - [`CursorPaginator`] and [`IdentifierPaginator`] walk a remote paged
//!   resource one network call at a time, deserializing raw records into
//!   typed entities as they are yielded.

#![warn(missing_docs)]

pub mod error;
pub mod pagination;
pub mod prefetch;
pub mod source;

// Re-export key types for convenience
pub use error::{Error, Result};
pub use pagination::{
    CursorPaginator, IdentifierPaginator, PageFetcher, QueryParams, RawPage,
};
pub use prefetch::{PrefetchConfig, Prefetcher, Transform};
pub use source::SharedSource;
