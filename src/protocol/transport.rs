//! Framed transport over a connected stream socket.
//!
//! A frame is one typed message followed by an optional untyped attachment:
//! the bincode-encoded message body, a 4-byte big-endian attachment length,
//! and the raw attachment bytes. The message body is self-delimiting, so the
//! receiver consumes exactly one frame per call and nothing beyond it.
//!
//! Attachments are bounded by the negotiated maximum object size: the
//! receiver reads them into a caller-provided buffer of that size and fails
//! the frame if the advertised length does not fit. A failed receive closes
//! the connection.
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;

use bincode::config::{BigEndian, Configuration, Fixint, Limit};
use bincode::{Decode, Encode};
use bitflags::bitflags;
use log::warn;
use thiserror::Error;

/// Upper bound on the encoded message body; listing replies are the largest
/// frames and stay well below this.
const MAX_MSG_SIZE: usize = 8 * 1024 * 1024;

type WireConfig = Configuration<BigEndian, Fixint, Limit<MAX_MSG_SIZE>>;

/// The one bincode configuration both sides of the protocol use.
pub(crate) fn wire_config() -> WireConfig {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
        .with_limit::<MAX_MSG_SIZE>()
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Serialize(#[from] bincode::error::EncodeError),
    #[error("failed to decode message: {0}")]
    Deserialize(#[from] bincode::error::DecodeError),
    #[error("attachment of {size} bytes exceeds the negotiated limit of {limit}")]
    AttachmentTooLarge { size: usize, limit: usize },
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
}

bitflags! {
    /// Send-side behavior of a [`CacheTransport`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SendFlags: u32 {
        /// Log send failures instead of propagating them. Used for replies:
        /// a peer that hung up is pruned by its next failed receive.
        const IGNORE_FAILURE = 1;
        /// Send without blocking. Used only by the detach broadcast so a
        /// stuck client cannot stall shutdown.
        const NONBLOCK = 2;
    }
}

/// A connected client, over either endpoint flavor.
#[derive(Debug)]
pub enum ClientStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl ClientStream {
    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        match self {
            ClientStream::Unix(stream) => stream.set_nonblocking(nonblocking),
            ClientStream::Tcp(stream) => stream.set_nonblocking(nonblocking),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            ClientStream::Unix(stream) => stream.shutdown(how),
            ClientStream::Tcp(stream) => stream.shutdown(how),
        }
    }
}

impl AsFd for ClientStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            ClientStream::Unix(stream) => stream.as_fd(),
            ClientStream::Tcp(stream) => stream.as_fd(),
        }
    }
}

impl Read for ClientStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(stream) => stream.read(buf),
            ClientStream::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for ClientStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ClientStream::Unix(stream) => stream.write(buf),
            ClientStream::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ClientStream::Unix(stream) => stream.flush(),
            ClientStream::Tcp(stream) => stream.flush(),
        }
    }
}

/// Sends and receives frames on one connection.
pub struct CacheTransport<'s> {
    stream: &'s mut ClientStream,
    flags: SendFlags,
    config: WireConfig,
}

impl<'s> CacheTransport<'s> {
    pub fn new(stream: &'s mut ClientStream, flags: SendFlags) -> Self {
        Self {
            stream,
            flags,
            config: wire_config(),
        }
    }

    /// Sends one frame. With [`SendFlags::IGNORE_FAILURE`] a failure is
    /// logged and swallowed; with [`SendFlags::NONBLOCK`] the socket is put
    /// in non-blocking mode for the duration of the send.
    pub fn send_frame<M: Encode>(
        &mut self,
        msg: &M,
        attachment: &[u8],
    ) -> Result<(), TransportError> {
        match self.send_inner(msg, attachment) {
            Ok(()) => Ok(()),
            Err(err) if self.flags.contains(SendFlags::IGNORE_FAILURE) => {
                warn!("dropping outbound frame: {err}");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn send_inner<M: Encode>(&mut self, msg: &M, attachment: &[u8]) -> Result<(), TransportError> {
        let nonblock = self.flags.contains(SendFlags::NONBLOCK);
        if nonblock {
            self.stream.set_nonblocking(true)?;
        }
        let result = self.write_frame(msg, attachment);
        if nonblock {
            if let Err(err) = self.stream.set_nonblocking(false) {
                warn!("failed to restore blocking mode: {err}");
            }
        }
        result
    }

    fn write_frame<M: Encode>(&mut self, msg: &M, attachment: &[u8]) -> Result<(), TransportError> {
        bincode::encode_into_std_write(msg, &mut *self.stream, self.config)?;
        self.stream
            .write_all(&(attachment.len() as u32).to_be_bytes())?;
        self.stream.write_all(attachment)?;
        self.stream.flush()?;
        Ok(())
    }

    /// Receives exactly one frame, placing the attachment into `attachment`
    /// and returning the message together with the attachment length.
    pub fn recv_frame<M: Decode<()>>(
        &mut self,
        attachment: &mut [u8],
    ) -> Result<(M, usize), TransportError> {
        let msg = bincode::decode_from_std_read(&mut *self.stream, self.config)?;
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf)?;
        let att_len = u32::from_be_bytes(len_buf) as usize;
        if att_len > attachment.len() {
            return Err(TransportError::AttachmentTooLarge {
                size: att_len,
                limit: attachment.len(),
            });
        }
        self.stream.read_exact(&mut attachment[..att_len])?;
        Ok((msg, att_len))
    }
}
