//! Byte channels between tool and daemon.
//!
//! Two realizations behind one trait:
//! - **SocketPairTransport**: one end of an AF_UNIX socketpair. Carries
//!   ancillary file descriptors (SCM_RIGHTS), so spawned-process stdio can be
//!   remapped directly.
//! - **RelayedTransport**: any AsyncRead/AsyncWrite pair, e.g. the stdio of a
//!   remote shell session. Cannot carry descriptors — callers must check
//!   [`Transport::supports_fd_passing`] and bake redirection into the command
//!   string instead. Degrading silently is forbidden.

use std::io;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use async_trait::async_trait;
use nix::cmsg_space;
use nix::sys::socket::{
    AddressFamily, ControlMessage, ControlMessageOwned, MsgFlags, SockFlag, SockType, recvmsg,
    sendmsg, socketpair,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest};
use tokio::net::UnixStream;

use crate::error::TransportError;

/// At most stdin/stdout/stderr ride along with a launch request.
pub const MAX_PASSED_FDS: usize = 3;

/// A bidirectional byte channel, optionally able to carry file descriptors.
///
/// All reads are exact: a short read means the peer is gone and the
/// connection is unusable afterwards.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, buf: &[u8]) -> Result<(), TransportError>;

    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Whether [`send_with_fds`](Self::send_with_fds) can actually move
    /// descriptors to the peer. Callers must choose a stdio redirection
    /// strategy based on this up front.
    fn supports_fd_passing(&self) -> bool;

    /// Send `buf` with `fds` attached as ancillary data on its first byte.
    async fn send_with_fds(
        &mut self,
        buf: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> Result<(), TransportError>;

    /// Fill `buf`, collecting up to `max_fds` descriptors attached to its
    /// first byte.
    async fn recv_with_fds(
        &mut self,
        buf: &mut [u8],
        max_fds: usize,
    ) -> Result<Vec<OwnedFd>, TransportError>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        (**self).send(buf).await
    }

    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        (**self).recv_exact(buf).await
    }

    fn supports_fd_passing(&self) -> bool {
        (**self).supports_fd_passing()
    }

    async fn send_with_fds(
        &mut self,
        buf: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> Result<(), TransportError> {
        (**self).send_with_fds(buf, fds).await
    }

    async fn recv_with_fds(
        &mut self,
        buf: &mut [u8],
        max_fds: usize,
    ) -> Result<Vec<OwnedFd>, TransportError> {
        (**self).recv_with_fds(buf, max_fds).await
    }
}

/// Local transport over an AF_UNIX socketpair; supports fd passing.
pub struct SocketPairTransport {
    stream: UnixStream,
}

impl SocketPairTransport {
    /// Create the pair: a ready transport for this process plus the raw fd to
    /// hand to the forked daemon.
    pub fn pair() -> io::Result<(Self, OwnedFd)> {
        let (ours, theirs) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )?;
        Ok((Self::from_owned_fd(ours)?, theirs))
    }

    /// Wrap an inherited control fd (daemon-side bootstrap).
    pub fn from_owned_fd(fd: OwnedFd) -> io::Result<Self> {
        let std_stream = std::os::unix::net::UnixStream::from(fd);
        std_stream.set_nonblocking(true)?;
        Ok(Self {
            stream: UnixStream::from_std(std_stream)?,
        })
    }

    /// Wrap a raw inherited fd. The caller asserts the fd is an open
    /// AF_UNIX stream socket owned by nobody else.
    pub unsafe fn from_control_fd(fd: RawFd) -> io::Result<Self> {
        Self::from_owned_fd(unsafe { OwnedFd::from_raw_fd(fd) })
    }
}

fn map_eof(e: io::Error) -> TransportError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        TransportError::Closed
    } else {
        TransportError::Io(e)
    }
}

#[async_trait]
impl Transport for SocketPairTransport {
    async fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(buf).await.map_err(map_eof)
    }

    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.stream.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) => Err(map_eof(e)),
        }
    }

    fn supports_fd_passing(&self) -> bool {
        true
    }

    async fn send_with_fds(
        &mut self,
        buf: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> Result<(), TransportError> {
        if fds.is_empty() {
            return self.send(buf).await;
        }

        let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        let raw_sock = self.stream.as_raw_fd();

        // Attach the descriptors to the first byte; whatever sendmsg leaves
        // over goes out as plain bytes.
        let sent = self
            .stream
            .async_io(Interest::WRITABLE, || {
                let iov = [io::IoSlice::new(buf)];
                let cmsg = [ControlMessage::ScmRights(&raw_fds)];
                sendmsg::<()>(raw_sock, &iov, &cmsg, MsgFlags::empty(), None)
                    .map_err(io::Error::from)
            })
            .await
            .map_err(map_eof)?;

        if sent < buf.len() {
            self.send(&buf[sent..]).await?;
        }
        Ok(())
    }

    async fn recv_with_fds(
        &mut self,
        buf: &mut [u8],
        max_fds: usize,
    ) -> Result<Vec<OwnedFd>, TransportError> {
        if max_fds == 0 {
            self.recv_exact(buf).await?;
            return Ok(Vec::new());
        }

        let raw_sock = self.stream.as_raw_fd();
        let mut fds = Vec::new();

        let received = self
            .stream
            .async_io(Interest::READABLE, || {
                let mut cmsg_buffer = cmsg_space!([RawFd; MAX_PASSED_FDS]);
                let mut iov = [io::IoSliceMut::new(buf)];
                let msg = recvmsg::<()>(
                    raw_sock,
                    &mut iov,
                    Some(&mut cmsg_buffer),
                    MsgFlags::empty(),
                )
                .map_err(io::Error::from)?;

                for cmsg in msg.cmsgs().map_err(io::Error::from)? {
                    if let ControlMessageOwned::ScmRights(raw) = cmsg {
                        for fd in raw {
                            // Ownership transferred to us by the kernel.
                            fds.push(unsafe { OwnedFd::from_raw_fd(fd) });
                        }
                    }
                }
                Ok(msg.bytes)
            })
            .await
            .map_err(map_eof)?;

        if received == 0 && !buf.is_empty() {
            return Err(TransportError::Closed);
        }
        if received < buf.len() {
            let rest = received;
            self.recv_exact(&mut buf[rest..]).await?;
        }
        if fds.len() > max_fds {
            return Err(TransportError::FdCountMismatch {
                expected: max_fds,
                actual: fds.len(),
            });
        }
        Ok(fds)
    }
}

/// Relayed byte-stream transport (remote shell stdio, test duplexes).
/// No fd passing — requests that carry descriptors are refused outright.
pub struct RelayedTransport<R, W> {
    reader: R,
    writer: W,
}

impl<R, W> RelayedTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self { reader, writer }
    }
}

#[async_trait]
impl<R, W> Transport for RelayedTransport<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        self.writer.write_all(buf).await.map_err(map_eof)?;
        self.writer.flush().await.map_err(map_eof)
    }

    async fn recv_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(e) => Err(map_eof(e)),
        }
    }

    fn supports_fd_passing(&self) -> bool {
        false
    }

    async fn send_with_fds(
        &mut self,
        buf: &[u8],
        fds: &[BorrowedFd<'_>],
    ) -> Result<(), TransportError> {
        if !fds.is_empty() {
            return Err(TransportError::FdPassingUnsupported);
        }
        self.send(buf).await
    }

    async fn recv_with_fds(
        &mut self,
        buf: &mut [u8],
        max_fds: usize,
    ) -> Result<Vec<OwnedFd>, TransportError> {
        if max_fds > 0 {
            return Err(TransportError::FdPassingUnsupported);
        }
        self.recv_exact(buf).await?;
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;

    #[tokio::test]
    async fn socketpair_roundtrips_bytes() {
        let (mut a, b) = SocketPairTransport::pair().unwrap();
        let mut b = SocketPairTransport::from_owned_fd(b).unwrap();

        a.send(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        b.recv_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[tokio::test]
    async fn socketpair_passes_a_descriptor() {
        let (mut a, b) = SocketPairTransport::pair().unwrap();
        let mut b = SocketPairTransport::from_owned_fd(b).unwrap();

        let mut file = tempfile::tempfile().unwrap();
        {
            use std::io::Write;
            writeln!(file, "payload").unwrap();
        }

        a.send_with_fds(b"x", &[file.as_fd()]).await.unwrap();

        let mut buf = [0u8; 1];
        let fds = b.recv_with_fds(&mut buf, 1).await.unwrap();
        assert_eq!(&buf, b"x");
        assert_eq!(fds.len(), 1);

        // The received fd must reference the same open file description.
        use std::io::{Read, Seek};
        let mut received = std::fs::File::from(fds.into_iter().next().unwrap());
        received.rewind().unwrap();
        let mut contents = String::new();
        received.read_to_string(&mut contents).unwrap();
        assert_eq!(contents, "payload\n");
    }

    #[tokio::test]
    async fn relayed_refuses_fd_passing() {
        let (client, server) = tokio::io::duplex(256);
        let (rx, tx) = tokio::io::split(client);
        let mut t = RelayedTransport::new(rx, tx);
        drop(server);

        assert!(!t.supports_fd_passing());

        let file = tempfile::tempfile().unwrap();
        let err = t.send_with_fds(b"x", &[file.as_fd()]).await.unwrap_err();
        assert!(matches!(err, TransportError::FdPassingUnsupported));
    }

    #[tokio::test]
    async fn closed_peer_is_transport_error() {
        let (client, server) = tokio::io::duplex(256);
        let (rx, tx) = tokio::io::split(client);
        let mut t = RelayedTransport::new(rx, tx);
        drop(server);

        let mut buf = [0u8; 4];
        let err = t.recv_exact(&mut buf).await.unwrap_err();
        assert!(matches!(err, TransportError::Closed | TransportError::Io(_)));
    }
}
