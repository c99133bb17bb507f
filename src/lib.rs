//! Server side of an out-of-process content-addressed object cache.
//!
//! A host process materializing immutable, hash-named objects delegates
//! cache storage, lookup, reference counting, pinning and eviction to a
//! daemon built from this crate, reached over a local unix or TCP socket.
//! The crate provides the plugin channel ([`protocol`]) and the abstract
//! cache engine port it drives ([`backend`]); concrete durable backends
//! plug in behind [`backend::CacheBackend`].
pub mod backend;
pub mod hash;
pub mod protocol;

pub use backend::{CacheBackend, CacheInfo, Capabilities, ObjectInfo, ObjectType};
pub use hash::{HashAlgorithm, ObjectId};
pub use protocol::{CacheServer, Reply, Request, Status};
