//! The cache engine port.
//!
//! The request dispatcher never touches durable state itself; everything it
//! needs from the underlying cache engine is expressed through the
//! [`CacheBackend`] trait. Implementations own object storage, reference
//! counting, eviction and listing state, and answer every operation with a
//! [`Status`] drawn from the shared protocol enumeration.
//!
//! # Key Components
//!
//! - [`CacheBackend`]: the abstract operations the channel requires.
//! - [`ObjectInfo`] / [`CacheInfo`]: descriptions of single objects and of
//!   the cache as a whole.
//! - [`Capabilities`]: the bit set advertised at handshake, stating which
//!   optional operations the backend implements.
//! - [`registry`](crate::backend::registry): construction of backends by
//!   kind tag.
//! - [`memory`](crate::backend::memory): the in-memory reference backend.
pub mod memory;
pub mod registry;

use bincode::{Decode, Encode};
use bitflags::bitflags;

use crate::hash::ObjectId;
use crate::protocol::Status;

bitflags! {
    /// Optional operations a backend supports, advertised in the handshake
    /// acknowledgement. Clients must not send requests whose capability bit
    /// is unset; if one does anyway, the request is still routed and the
    /// backend answers with a non-OK status.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u64 {
        const REFCOUNT = 1 << 0;
        const SHRINK = 1 << 1;
        const INFO = 1 << 2;
        const LIST = 1 << 3;
        const OBJECT_INFO = 1 << 4;
    }
}

/// Kinds of objects the cache distinguishes.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Regular,
    Catalog,
    Pinned,
    Volatile,
}

/// Description of a single cached object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub object_type: ObjectType,
    /// `None` while the object's store transaction is still in flight.
    pub size: Option<u64>,
    /// Whether the object is currently exempt from eviction.
    pub pinned: bool,
    pub description: String,
}

impl ObjectInfo {
    pub fn new(id: ObjectId) -> Self {
        Self {
            id,
            object_type: ObjectType::Regular,
            size: None,
            pinned: false,
            description: String::new(),
        }
    }
}

/// Aggregate accounting of the cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheInfo {
    /// Total capacity in bytes.
    pub size_bytes: u64,
    pub used_bytes: u64,
    pub pinned_bytes: u64,
    /// True iff the backend cannot be asked to evict down to a target size.
    pub no_shrink: bool,
}

/// Operations the request dispatcher requires from a cache engine.
///
/// All methods run on the channel's supervisor thread; a backend that blocks
/// stalls the whole daemon, so implementations are expected to be prompt or
/// to bring their own threads. Failures are reported as the non-OK [`Status`]
/// carried in `Err`; the dispatcher forwards them to the client verbatim.
pub trait CacheBackend: Send + Sync {
    /// The optional operations this backend implements.
    fn capabilities(&self) -> Capabilities;

    /// Adjusts an object's reference count by `change_by`.
    fn change_refcount(&self, id: &ObjectId, change_by: i64) -> Result<(), Status>;

    /// Looks up type and size of an object.
    fn object_info(&self, id: &ObjectId) -> Result<ObjectInfo, Status>;

    /// Reads object bytes starting at `offset` into `buf`, returning the
    /// number of bytes actually read (short at the end of the object).
    fn pread(&self, id: &ObjectId, offset: u64, buf: &mut [u8]) -> Result<usize, Status>;

    /// Opens a store transaction for `id` under the channel-allocated
    /// `txn_id`.
    fn start_txn(&self, id: &ObjectId, txn_id: u64, info: ObjectInfo) -> Result<(), Status>;

    /// Appends bytes to an open transaction.
    fn write_txn(&self, txn_id: u64, data: &[u8]) -> Result<(), Status>;

    /// Makes the transaction's object visible. The transaction is gone
    /// afterwards, whether or not the commit succeeded.
    fn commit_txn(&self, txn_id: u64) -> Result<(), Status>;

    /// Discards an open transaction and everything written to it.
    fn abort_txn(&self, txn_id: u64) -> Result<(), Status>;

    /// Aggregate cache accounting.
    fn info(&self) -> Result<CacheInfo, Status>;

    /// Evicts unpinned, unreferenced objects until at most `shrink_to` bytes
    /// are used, returning the post-shrink usage. `Err(Status::NoSpace)` if
    /// the target cannot be reached.
    fn shrink(&self, shrink_to: u64) -> Result<u64, Status>;

    /// Opens a listing cursor over all objects of `object_type`.
    fn listing_begin(&self, listing_id: u64, object_type: ObjectType) -> Result<(), Status>;

    /// Yields the next item of a listing, or `Ok(None)` at the end of data.
    /// The cursor stays valid until [`CacheBackend::listing_end`].
    fn listing_next(&self, listing_id: u64) -> Result<Option<ObjectInfo>, Status>;

    /// Releases a listing cursor.
    fn listing_end(&self, listing_id: u64) -> Result<(), Status>;
}
