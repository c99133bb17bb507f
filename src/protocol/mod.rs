//! Client-daemon communication protocol.
//!
//! This module defines the framed protocol spoken between the filesystem
//! client and the cache daemon, the fixed message taxonomy, and the channel
//! machinery that serves it: transport, identifier allocation, the store
//! transaction registry, request dispatch and the I/O supervisor.
//!
//! # Overview
//!
//! A client connects to the daemon's endpoint, performs a handshake to learn
//! the daemon's name, protocol version, attachment ceiling, a fresh session
//! id and the backend's capability mask, and then issues requests: reference
//! count changes, object lookups and reads, multi-part store transactions,
//! cache-wide accounting, eviction, and paginated listings. Object bytes
//! never travel inside messages; they ride as untyped frame attachments
//! bounded by the negotiated maximum object size.
//!
//! # Key Components
//!
//! - [`Request`] / [`Reply`]: the message taxonomy, with [`Status`] as the
//!   shared outcome enumeration.
//! - [`CacheTransport`]: framing, sending and receiving over a connected
//!   stream socket.
//! - [`CacheServer`]: endpoint setup, the supervisor thread and per-message
//!   dispatch into a [`CacheBackend`](crate::backend::CacheBackend).
//!
//! # See Also
//!
//! - [`backend`](crate::backend): the port the dispatcher drives.
mod registry;
mod request;
mod response;
mod server;
mod transport;

pub use request::Request;
pub use response::{ListRecord, Reply, Status};
pub use server::{CacheServer, DEFAULT_MAX_OBJECT_SIZE, PROTOCOL_VERSION, ServerError};
pub use transport::{CacheTransport, ClientStream, SendFlags, TransportError};
