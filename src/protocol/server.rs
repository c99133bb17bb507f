//! The plugin channel: request dispatch and the I/O supervisor.
//!
//! A [`CacheServer`] accepts client connections on a listening endpoint,
//! decodes one request frame at a time, routes it to the cache backend and
//! sends the reply. All socket I/O and all request handling run on a single
//! supervisor thread that also watches a control pipe for detach and
//! terminate signals, so requests from different connections are processed
//! strictly in sequence and replies on one connection are ordered.
//!
//! The endpoint locator accepted by [`CacheServer::listen`] is either
//! `unix=<path>` (socket created with mode 0600) or `tcp=<host>:<port>`.
use std::fs;
use std::io::{self, PipeReader, PipeWriter, Read, Write};
use std::net::{TcpListener, ToSocketAddrs};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixListener;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::signal::{self, SigHandler, Signal};
use nix::sys::socket::{
    self, AddressFamily, Backlog, SockFlag, SockType, SockaddrStorage, UnixAddr, sockopt,
};
use thiserror::Error;

use crate::backend::{CacheBackend, Capabilities, ObjectInfo, ObjectType};
use crate::hash::{ObjectId, WireHash};
use crate::protocol::registry::{IdAllocator, TransactionRegistry, TxnSlot, UniqueRequest};
use crate::protocol::request::Request;
use crate::protocol::response::{ListRecord, Reply, Status};
use crate::protocol::transport::{CacheTransport, ClientStream, SendFlags};

/// Version of the message schema, echoed in every handshake ack.
pub const PROTOCOL_VERSION: u32 = 1;

/// Default ceiling for attachment sizes in both directions.
pub const DEFAULT_MAX_OBJECT_SIZE: usize = 256 * 1024;

/// Approximate payload ceiling of one listing reply; a listing larger than
/// this is paginated across several request/reply pairs.
const LISTING_SIZE: usize = 4_000_000;

const LISTEN_BACKLOG: i32 = 32;

const SIGNAL_DETACH: u8 = b'D';
const SIGNAL_TERMINATE: u8 = b'T';

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid endpoint locator '{0}'")]
    InvalidLocator(String),

    #[error("endpoint setup failed: {0}")]
    Endpoint(#[from] nix::Error),

    #[error("server I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no listening endpoint; call listen() first")]
    NotListening,

    #[error("request processing already running")]
    AlreadyRunning,
}

/// The daemon side of the cache protocol.
///
/// Construction order is `new`, then [`CacheServer::listen`], then
/// [`CacheServer::process_requests`]; afterwards the supervisor thread owns
/// the endpoint and all accepted connections. [`CacheServer::ask_to_detach`]
/// and [`CacheServer::terminate`] may be called from any thread; dropping
/// the server terminates it.
pub struct CacheServer {
    inner: Arc<ServerInner>,
    listener: Option<Listener>,
    ctrl_rx: Option<PipeReader>,
    ctrl_tx: PipeWriter,
    io_thread: Option<thread::JoinHandle<()>>,
}

impl CacheServer {
    pub fn new(name: &str, backend: Arc<dyn CacheBackend>) -> Result<Self, ServerError> {
        let (ctrl_rx, ctrl_tx) = io::pipe()?;
        let capabilities = backend.capabilities();
        Ok(Self {
            inner: Arc::new(ServerInner {
                name: name.to_string(),
                capabilities,
                max_object_size: DEFAULT_MAX_OBJECT_SIZE,
                backend,
                ids: IdAllocator::new(),
                txns: TransactionRegistry::new(),
            }),
            listener: None,
            ctrl_rx: Some(ctrl_rx),
            ctrl_tx,
            io_thread: None,
        })
    }

    /// Overrides the attachment size ceiling. Only callable before
    /// [`CacheServer::process_requests`]; the value is fixed for the
    /// daemon's lifetime afterwards.
    pub fn set_max_object_size(&mut self, size: usize) -> Result<(), ServerError> {
        match Arc::get_mut(&mut self.inner) {
            Some(inner) => {
                inner.max_object_size = size;
                Ok(())
            }
            None => Err(ServerError::AlreadyRunning),
        }
    }

    /// Binds the listening endpoint described by `locator`.
    pub fn listen(&mut self, locator: &str) -> Result<(), ServerError> {
        self.listener = Some(bind_locator(locator)?);
        info!("listening at {locator}");
        Ok(())
    }

    /// Spawns the I/O supervisor thread. `num_workers` is accepted for
    /// forward compatibility; the baseline dispatches every request on the
    /// supervisor thread.
    pub fn process_requests(&mut self, num_workers: usize) -> Result<(), ServerError> {
        if self.io_thread.is_some() {
            return Err(ServerError::AlreadyRunning);
        }
        let listener = self.listener.take().ok_or(ServerError::NotListening)?;
        let ctrl_rx = self.ctrl_rx.take().ok_or(ServerError::AlreadyRunning)?;
        if num_workers > 0 {
            info!("{num_workers} workers requested; dispatch runs on the supervisor thread");
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("quarry-io".to_string())
            .spawn(move || {
                IoSupervisor {
                    inner,
                    listener,
                    ctrl_rx,
                    connections: Vec::new(),
                }
                .run();
            })?;
        self.io_thread = Some(handle);
        Ok(())
    }

    /// Asks the supervisor to broadcast a detach notice to every connected
    /// client. Callable from any thread; the daemon keeps running.
    pub fn ask_to_detach(&self) {
        if let Err(err) = (&self.ctrl_tx).write_all(&[SIGNAL_DETACH]) {
            warn!("failed to signal detach: {err}");
        }
    }

    /// Stops the supervisor, closing every accepted connection and clearing
    /// the transaction registry. Idempotent.
    pub fn terminate(&mut self) {
        if let Some(handle) = self.io_thread.take() {
            if let Err(err) = (&self.ctrl_tx).write_all(&[SIGNAL_TERMINATE]) {
                warn!("failed to signal termination: {err}");
            }
            if handle.join().is_err() {
                warn!("i/o supervisor exited by panic");
            }
        }
    }
}

impl Drop for CacheServer {
    fn drop(&mut self) {
        self.terminate();
    }
}

struct ServerInner {
    name: String,
    capabilities: Capabilities,
    max_object_size: usize,
    backend: Arc<dyn CacheBackend>,
    ids: IdAllocator,
    txns: TransactionRegistry,
}

fn status_of(result: Result<(), Status>) -> Status {
    match result {
        Ok(()) => Status::Ok,
        Err(status) => status,
    }
}

impl ServerInner {
    /// Reads and answers one request frame. Returns false when the
    /// connection must be closed: quit, a failed decode, or an unknown
    /// message (which fails the decode as well).
    fn handle_request(&self, conn: &mut Connection) -> bool {
        let Connection { stream, scratch } = conn;
        let mut transport = CacheTransport::new(stream, SendFlags::IGNORE_FAILURE);
        let (request, att_len) = match transport.recv_frame::<Request>(scratch) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("failed to receive request from connection: {err}");
                return false;
            }
        };

        match request {
            Request::Handshake {
                protocol_version: _,
            } => {
                self.handle_handshake(&mut transport);
                true
            }
            Request::Quit => false,
            Request::Refcount {
                req_id,
                object_id,
                change_by,
            } => {
                self.handle_refcount(&mut transport, req_id, &object_id, change_by);
                true
            }
            Request::ObjectInfo { req_id, object_id } => {
                self.handle_object_info(&mut transport, req_id, &object_id);
                true
            }
            Request::Read {
                req_id,
                object_id,
                offset,
                size,
            } => {
                self.handle_read(&mut transport, scratch, req_id, &object_id, offset, size);
                true
            }
            Request::Store {
                session_id,
                req_id,
                object_id,
                part_nr,
                last_part,
                expected_size,
                object_type,
                description,
            } => {
                self.handle_store(
                    &mut transport,
                    &scratch[..att_len],
                    session_id,
                    req_id,
                    &object_id,
                    part_nr,
                    last_part,
                    expected_size,
                    object_type,
                    description,
                );
                true
            }
            Request::StoreAbort { session_id, req_id } => {
                self.handle_store_abort(&mut transport, session_id, req_id);
                true
            }
            Request::Info { req_id } => {
                self.handle_info(&mut transport, req_id);
                true
            }
            Request::Shrink { req_id, shrink_to } => {
                self.handle_shrink(&mut transport, req_id, shrink_to);
                true
            }
            Request::List {
                req_id,
                listing_id,
                object_type,
            } => {
                self.handle_list(&mut transport, req_id, listing_id, object_type);
                true
            }
        }
    }

    fn send(&self, transport: &mut CacheTransport<'_>, reply: &Reply, attachment: &[u8]) {
        if let Err(err) = transport.send_frame(reply, attachment) {
            debug!("reply not delivered: {err}");
        }
    }

    fn handle_handshake(&self, transport: &mut CacheTransport<'_>) {
        let reply = Reply::HandshakeAck {
            status: Status::Ok,
            name: self.name.clone(),
            protocol_version: PROTOCOL_VERSION,
            max_object_size: self.max_object_size as u64,
            session_id: self.ids.next_session(),
            capabilities: self.capabilities.bits(),
        };
        self.send(transport, &reply, &[]);
    }

    fn handle_refcount(
        &self,
        transport: &mut CacheTransport<'_>,
        req_id: u64,
        object_id: &WireHash,
        change_by: i64,
    ) {
        let status = match ObjectId::try_from(object_id) {
            Ok(id) => status_of(self.backend.change_refcount(&id, change_by)),
            Err(err) => {
                debug!("unparseable object id: {err}");
                Status::Malformed
            }
        };
        self.send(transport, &Reply::Refcount { req_id, status }, &[]);
    }

    fn handle_object_info(
        &self,
        transport: &mut CacheTransport<'_>,
        req_id: u64,
        object_id: &WireHash,
    ) {
        let reply = match ObjectId::try_from(object_id) {
            Err(err) => {
                debug!("unparseable object id: {err}");
                Reply::ObjectInfo {
                    req_id,
                    status: Status::Malformed,
                    object_type: None,
                    size: None,
                }
            }
            Ok(id) => match self.backend.object_info(&id) {
                Ok(info) => Reply::ObjectInfo {
                    req_id,
                    status: Status::Ok,
                    object_type: Some(info.object_type),
                    size: info.size,
                },
                Err(status) => Reply::ObjectInfo {
                    req_id,
                    status,
                    object_type: None,
                    size: None,
                },
            },
        };
        self.send(transport, &reply, &[]);
    }

    fn handle_read(
        &self,
        transport: &mut CacheTransport<'_>,
        scratch: &mut [u8],
        req_id: u64,
        object_id: &WireHash,
        offset: u64,
        size: u32,
    ) {
        let id = match ObjectId::try_from(object_id) {
            Ok(id) if size as usize <= self.max_object_size => id,
            _ => {
                let reply = Reply::Read {
                    req_id,
                    status: Status::Malformed,
                };
                self.send(transport, &reply, &[]);
                return;
            }
        };
        match self.backend.pread(&id, offset, &mut scratch[..size as usize]) {
            Ok(n) => {
                let reply = Reply::Read {
                    req_id,
                    status: Status::Ok,
                };
                self.send(transport, &reply, &scratch[..n]);
            }
            Err(status) => self.send(transport, &Reply::Read { req_id, status }, &[]),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_store(
        &self,
        transport: &mut CacheTransport<'_>,
        data: &[u8],
        session_id: u64,
        req_id: u64,
        object_id: &WireHash,
        part_nr: u32,
        last_part: bool,
        expected_size: Option<u64>,
        object_type: Option<ObjectType>,
        description: Option<String>,
    ) {
        let reply = |status| Reply::Store {
            req_id,
            status,
            part_nr,
        };

        let id = match ObjectId::try_from(object_id) {
            Ok(id) => id,
            Err(err) => {
                debug!("unparseable object id: {err}");
                self.send(transport, &reply(Status::Malformed), &[]);
                return;
            }
        };
        // A part shorter than the ceiling is only legal as the final one.
        if data.len() > self.max_object_size || (data.len() < self.max_object_size && !last_part) {
            self.send(transport, &reply(Status::Malformed), &[]);
            return;
        }

        let key = UniqueRequest { session_id, req_id };
        let txn_id;
        if part_nr == 1 {
            if self.txns.contains(&key) {
                warn!("invalid attempt to restart running transaction");
                self.send(transport, &reply(Status::Malformed), &[]);
                return;
            }
            txn_id = self.ids.next_txn();
            let mut info = ObjectInfo::new(id);
            info.size = expected_size;
            if let Some(object_type) = object_type {
                info.object_type = object_type;
            }
            if let Some(description) = description {
                info.description = description;
            }
            if let Err(status) = self.backend.start_txn(&id, txn_id, info) {
                self.send(transport, &reply(status), &[]);
                return;
            }
            self.txns.insert(
                key,
                TxnSlot {
                    txn_id,
                    next_part: 2,
                },
            );
        } else {
            match self.txns.lookup(&key) {
                None => {
                    warn!("transaction not found");
                    self.send(transport, &reply(Status::Malformed), &[]);
                    return;
                }
                Some(slot) if slot.next_part != part_nr => {
                    warn!(
                        "store part {part_nr} out of order (expected {})",
                        slot.next_part
                    );
                    self.send(transport, &reply(Status::Malformed), &[]);
                    return;
                }
                Some(slot) => txn_id = slot.txn_id,
            }
        }

        if !data.is_empty() {
            if let Err(status) = self.backend.write_txn(txn_id, data) {
                // The registry entry stays: the client decides between
                // retrying this part and aborting.
                self.send(transport, &reply(status), &[]);
                return;
            }
        }

        let status = if last_part {
            let status = status_of(self.backend.commit_txn(txn_id));
            self.txns.erase(&key);
            status
        } else {
            if part_nr > 1 {
                self.txns.advance(&key);
            }
            Status::Ok
        };
        self.send(transport, &reply(status), &[]);
    }

    fn handle_store_abort(&self, transport: &mut CacheTransport<'_>, session_id: u64, req_id: u64) {
        let key = UniqueRequest { session_id, req_id };
        let status = match self.txns.lookup(&key) {
            None => Status::Malformed,
            Some(slot) => {
                let status = status_of(self.backend.abort_txn(slot.txn_id));
                self.txns.erase(&key);
                status
            }
        };
        let reply = Reply::Store {
            req_id,
            status,
            part_nr: 0,
        };
        self.send(transport, &reply, &[]);
    }

    fn handle_info(&self, transport: &mut CacheTransport<'_>, req_id: u64) {
        let (status, info) = match self.backend.info() {
            Ok(info) => (Status::Ok, info),
            Err(status) => (status, Default::default()),
        };
        let reply = Reply::Info {
            req_id,
            status,
            size_bytes: info.size_bytes,
            used_bytes: info.used_bytes,
            pinned_bytes: info.pinned_bytes,
            no_shrink: info.no_shrink,
        };
        self.send(transport, &reply, &[]);
    }

    fn handle_shrink(&self, transport: &mut CacheTransport<'_>, req_id: u64, shrink_to: u64) {
        let (status, used_bytes) = match self.backend.shrink(shrink_to) {
            Ok(used_bytes) => (Status::Ok, used_bytes),
            Err(status) => (status, 0),
        };
        let reply = Reply::Shrink {
            req_id,
            status,
            used_bytes,
        };
        self.send(transport, &reply, &[]);
    }

    fn handle_list(
        &self,
        transport: &mut CacheTransport<'_>,
        req_id: u64,
        listing_id: u64,
        object_type: ObjectType,
    ) {
        let listing_id = if listing_id == 0 {
            let fresh = self.ids.next_listing();
            if let Err(status) = self.backend.listing_begin(fresh, object_type) {
                let reply = Reply::List {
                    req_id,
                    status,
                    listing_id: 0,
                    is_last_part: true,
                    records: Vec::new(),
                };
                self.send(transport, &reply, &[]);
                return;
            }
            fresh
        } else {
            listing_id
        };

        let mut records = Vec::new();
        let mut is_last_part = true;
        let mut status = Status::Ok;
        let mut total_size = 0usize;
        loop {
            match self.backend.listing_next(listing_id) {
                Ok(Some(item)) => {
                    // Approximation of the reply size.
                    total_size += size_of::<ObjectInfo>() + item.description.len();
                    records.push(ListRecord {
                        hash: WireHash::from(&item.id),
                        pinned: item.pinned,
                        description: item.description,
                    });
                    if total_size > LISTING_SIZE {
                        // The client re-issues the request with the same id
                        // for the next page; the cursor stays open.
                        is_last_part = false;
                        break;
                    }
                }
                Ok(None) => {
                    if let Err(end_status) = self.backend.listing_end(listing_id) {
                        debug!("listing {listing_id} did not end cleanly: {end_status:?}");
                    }
                    break;
                }
                Err(err_status) => {
                    status = err_status;
                    break;
                }
            }
        }

        let reply = Reply::List {
            req_id,
            status,
            listing_id,
            is_last_part,
            records,
        };
        self.send(transport, &reply, &[]);
    }
}

struct Connection {
    stream: ClientStream,
    /// Receive buffer for attachments, sized `max_object_size` once per
    /// connection.
    scratch: Vec<u8>,
}

struct IoSupervisor {
    inner: Arc<ServerInner>,
    listener: Listener,
    ctrl_rx: PipeReader,
    connections: Vec<Connection>,
}

fn has_events(pfd: &PollFd<'_>) -> bool {
    pfd.revents().is_some_and(|revents| !revents.is_empty())
}

impl IoSupervisor {
    fn run(mut self) {
        // A client hanging up mid-reply must not kill the daemon. The prior
        // disposition is restored when the supervisor exits.
        let saved_sigpipe = match unsafe { signal::signal(Signal::SIGPIPE, SigHandler::SigIgn) } {
            Ok(previous) => Some(previous),
            Err(err) => {
                warn!("failed to ignore SIGPIPE: {err}");
                None
            }
        };

        'supervise: loop {
            let mut conn_ready = vec![false; self.connections.len()];
            let ctrl_ready;
            let accept_ready;
            {
                let events = PollFlags::POLLIN | PollFlags::POLLPRI;
                let mut watch_fds = Vec::with_capacity(2 + self.connections.len());
                watch_fds.push(PollFd::new(self.ctrl_rx.as_fd(), events));
                watch_fds.push(PollFd::new(self.listener.as_fd(), events));
                for conn in &self.connections {
                    watch_fds.push(PollFd::new(conn.stream.as_fd(), events));
                }

                match poll(&mut watch_fds, PollTimeout::NONE) {
                    Ok(_) => {}
                    Err(Errno::EINTR) => continue 'supervise,
                    Err(err) => {
                        // A wait failure other than EINTR leaves no usable
                        // multiplexer behind.
                        error!("cache channel connection failure: {err}");
                        process::abort();
                    }
                }

                ctrl_ready = has_events(&watch_fds[0]);
                accept_ready = has_events(&watch_fds[1]);
                for (index, pfd) in watch_fds.iter().skip(2).enumerate() {
                    conn_ready[index] = has_events(pfd);
                }
            }

            // Termination or detach.
            if ctrl_ready {
                if self.read_signal() == Some(SIGNAL_DETACH) {
                    self.send_detach_requests();
                    continue;
                }
                if !self.connections.is_empty() {
                    warn!(
                        "terminating cache channel with {} pending connections",
                        self.connections.len()
                    );
                }
                break;
            }

            // New connection.
            if accept_ready {
                match self.listener.accept() {
                    Ok(stream) => {
                        debug!("accepted new client connection");
                        self.connections.push(Connection {
                            stream,
                            scratch: vec![0u8; self.inner.max_object_size],
                        });
                    }
                    Err(err) => warn!("failed to establish connection: {err}"),
                }
            }

            // New requests.
            for index in (0..conn_ready.len()).rev() {
                if conn_ready[index] && !self.inner.handle_request(&mut self.connections[index]) {
                    self.connections.remove(index);
                    debug!("client connection closed");
                }
            }
        }

        // Open transactions are not aborted here; their fate is up to the
        // backend and the next daemon lifecycle.
        self.connections.clear();
        self.inner.txns.clear();

        if let Some(previous) = saved_sigpipe {
            if let Err(err) = unsafe { signal::signal(Signal::SIGPIPE, previous) } {
                warn!("failed to restore SIGPIPE disposition: {err}");
            }
        }
    }

    fn read_signal(&mut self) -> Option<u8> {
        let mut byte = [0u8; 1];
        match self.ctrl_rx.read_exact(&mut byte) {
            Ok(()) => Some(byte[0]),
            Err(err) => {
                error!("control pipe failure: {err}");
                None
            }
        }
    }

    /// Tells every connected client to re-establish its state. Sends are
    /// non-blocking and failures are dropped: a stuck peer cannot delay the
    /// broadcast, at the price of possibly missing its notice.
    fn send_detach_requests(&mut self) {
        for conn in &mut self.connections {
            let mut transport = CacheTransport::new(
                &mut conn.stream,
                SendFlags::IGNORE_FAILURE | SendFlags::NONBLOCK,
            );
            if let Err(err) = transport.send_frame(&Reply::Detach, &[]) {
                debug!("detach request not delivered: {err}");
            }
        }
    }
}

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    fn accept(&self) -> io::Result<ClientStream> {
        match self {
            Listener::Unix(listener) => listener
                .accept()
                .map(|(stream, _)| ClientStream::Unix(stream)),
            Listener::Tcp(listener) => listener
                .accept()
                .map(|(stream, _)| ClientStream::Tcp(stream)),
        }
    }
}

impl AsFd for Listener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Listener::Unix(listener) => listener.as_fd(),
            Listener::Tcp(listener) => listener.as_fd(),
        }
    }
}

fn bind_locator(locator: &str) -> Result<Listener, ServerError> {
    match locator.split_once('=') {
        Some(("unix", path)) => bind_unix(Path::new(path)),
        Some(("tcp", address)) => bind_tcp(address),
        _ => Err(ServerError::InvalidLocator(locator.to_string())),
    }
}

fn bind_unix(path: &Path) -> Result<Listener, ServerError> {
    if path.exists() {
        // A previous daemon run may have left its socket behind.
        fs::remove_file(path)?;
    }
    let fd = socket::socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )?;
    let addr = UnixAddr::new(path)?;
    socket::bind(fd.as_raw_fd(), &addr)?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    socket::listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;
    Ok(Listener::Unix(UnixListener::from(fd)))
}

fn bind_tcp(address: &str) -> Result<Listener, ServerError> {
    let resolved = address
        .to_socket_addrs()
        .map_err(|_| ServerError::InvalidLocator(format!("tcp={address}")))?
        .next()
        .ok_or_else(|| ServerError::InvalidLocator(format!("tcp={address}")))?;
    let family = if resolved.is_ipv4() {
        AddressFamily::Inet
    } else {
        AddressFamily::Inet6
    };
    let fd = socket::socket(family, SockType::Stream, SockFlag::SOCK_CLOEXEC, None)?;
    socket::setsockopt(&fd, sockopt::ReuseAddr, &true)?;
    let addr = SockaddrStorage::from(resolved);
    socket::bind(fd.as_raw_fd(), &addr)?;
    socket::listen(&fd, Backlog::new(LISTEN_BACKLOG)?)?;
    Ok(Listener::Tcp(TcpListener::from(fd)))
}
