//! On-disk indexes for materialized artifacts and the user's own library.
//!
//! [`ArtifactStore`] indexes files the [`Materializer`] has downloaded into
//! the cache directory (audio + cover art). [`local_library::LocalLibrary`]
//! indexes a read-only user-supplied music folder under the same filename
//! normalization rules the original service used, so client lookups that
//! already own a file locally never trigger a network resolution.
//!
//! [`Materializer`]: https://docs.rs/pmomaterializer

pub mod local_library;
pub mod store;

pub use local_library::LocalLibrary;
pub use store::{ArtifactKey, ArtifactStore};
