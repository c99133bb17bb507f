use bincode::{Decode, Encode};

use crate::backend::ObjectType;
use crate::hash::WireHash;

/// Client-to-daemon messages. The variant order is the stable wire tag; new
/// kinds are appended, never reordered.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Request {
    Handshake {
        protocol_version: u32,
    },
    Quit,
    Refcount {
        req_id: u64,
        object_id: WireHash,
        change_by: i64,
    },
    ObjectInfo {
        req_id: u64,
        object_id: WireHash,
    },
    Read {
        req_id: u64,
        object_id: WireHash,
        offset: u64,
        size: u32,
    },
    /// One part of a multi-part store; the object bytes travel in the
    /// frame's attachment. Parts are numbered from 1 and keyed by
    /// `(session_id, req_id)`.
    Store {
        session_id: u64,
        req_id: u64,
        object_id: WireHash,
        part_nr: u32,
        last_part: bool,
        expected_size: Option<u64>,
        object_type: Option<ObjectType>,
        description: Option<String>,
    },
    StoreAbort {
        session_id: u64,
        req_id: u64,
    },
    Info {
        req_id: u64,
    },
    Shrink {
        req_id: u64,
        shrink_to: u64,
    },
    List {
        req_id: u64,
        /// Zero to begin a new listing, else the id returned by the first
        /// reply of the listing being continued.
        listing_id: u64,
        object_type: ObjectType,
    },
}
