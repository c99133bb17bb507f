use bincode::{Decode, Encode};

use crate::backend::ObjectType;
use crate::hash::WireHash;

/// Outcome of a request, shared between the wire schema and the backend
/// port. The channel itself only ever produces `Ok` and `Malformed`; the
/// remaining variants come from the backend and are forwarded verbatim.
#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub enum Status {
    Unknown,
    Ok,
    NoSupport,
    Forbidden,
    NoSpace,
    NoEntry,
    Malformed,
    IoError,
    Corrupted,
    Timeout,
    BadCount,
    OutOfBounds,
    Partial,
}

/// One element of a listing reply.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub struct ListRecord {
    pub hash: WireHash,
    pub pinned: bool,
    pub description: String,
}

/// Daemon-to-client messages. Every request except `Quit` is answered by
/// exactly one reply carrying the request's `req_id`; `Detach` is the one
/// unsolicited kind.
#[derive(Debug, Clone, Encode, Decode, PartialEq, Eq)]
pub enum Reply {
    HandshakeAck {
        status: Status,
        name: String,
        protocol_version: u32,
        max_object_size: u64,
        session_id: u64,
        capabilities: u64,
    },
    Refcount {
        req_id: u64,
        status: Status,
    },
    ObjectInfo {
        req_id: u64,
        status: Status,
        object_type: Option<ObjectType>,
        /// `None` also covers objects whose size is still unknown because
        /// their transaction is in flight.
        size: Option<u64>,
    },
    /// On `Ok` the object bytes travel in the frame's attachment.
    Read {
        req_id: u64,
        status: Status,
    },
    Store {
        req_id: u64,
        status: Status,
        part_nr: u32,
    },
    Info {
        req_id: u64,
        status: Status,
        size_bytes: u64,
        used_bytes: u64,
        pinned_bytes: u64,
        no_shrink: bool,
    },
    Shrink {
        req_id: u64,
        status: Status,
        used_bytes: u64,
    },
    List {
        req_id: u64,
        status: Status,
        listing_id: u64,
        is_last_part: bool,
        records: Vec<ListRecord>,
    },
    Detach,
}
