// ABOUTME: One request/response exchange with a spawned worker over a dedicated stream.
// ABOUTME: Headers, body, half-close, response read, then close; the close callback fires exactly once.

use std::future::Future;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, IntoRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::socket::{shutdown, Shutdown};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cancel;
use crate::channel;
use crate::error::{ChannelError, SessionError};

/// Transport under a session: a Unix or TCP stream socket.
#[derive(Debug)]
pub enum WorkerStream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl WorkerStream {
    /// Deregister from the runtime and hand back the bare descriptor.
    fn into_owned_fd(self) -> io::Result<OwnedFd> {
        match self {
            WorkerStream::Unix(s) => Ok(s.into_std()?.into()),
            WorkerStream::Tcp(s) => Ok(s.into_std()?.into()),
        }
    }
}

impl AsFd for WorkerStream {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            WorkerStream::Unix(s) => s.as_fd(),
            WorkerStream::Tcp(s) => s.as_fd(),
        }
    }
}

impl AsRawFd for WorkerStream {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            WorkerStream::Unix(s) => s.as_raw_fd(),
            WorkerStream::Tcp(s) => s.as_raw_fd(),
        }
    }
}

impl AsyncRead for WorkerStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
            WorkerStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for WorkerStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            WorkerStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
            WorkerStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Unix(s) => Pin::new(s).poll_flush(cx),
            WorkerStream::Tcp(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            WorkerStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
            WorkerStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

type CloseCallback = Box<dyn FnOnce() + Send>;

/// A single request cycle with a worker.
///
/// Protocol: [`send_headers`](Self::send_headers) first, then any number of
/// [`send_body_block`](Self::send_body_block) calls, then
/// [`shutdown_writer`](Self::shutdown_writer) and read the response. The session
/// owns its stream until [`close_stream`](Self::close_stream) or
/// [`discard_stream`](Self::discard_stream). A worker serves one session at a
/// time; opening a second one before this one is closed can deadlock.
pub struct WorkerSession {
    pid: u32,
    stream: Option<WorkerStream>,
    writer_shut: bool,
    reader_timeout: Option<Duration>,
    writer_timeout: Option<Duration>,
    cancel: CancellationToken,
    on_close: Option<CloseCallback>,
}

impl std::fmt::Debug for WorkerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerSession")
            .field("pid", &self.pid)
            .field("stream", &self.stream)
            .field("writer_shut", &self.writer_shut)
            .finish_non_exhaustive()
    }
}

impl WorkerSession {
    /// Wrap a connected stream. `on_close` runs once when the session is dropped.
    pub fn new(
        pid: u32,
        stream: WorkerStream,
        on_close: impl FnOnce() + Send + 'static,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pid,
            stream: Some(stream),
            writer_shut: false,
            reader_timeout: None,
            writer_timeout: None,
            cancel,
            on_close: Some(Box::new(on_close)),
        }
    }

    /// Pid of the worker on the other end.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// True while the session still owns its stream.
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Descriptor of the owned stream, if any.
    pub fn stream_fd(&self) -> Option<RawFd> {
        self.stream.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Send the request headers as one scalar frame. Must come first.
    ///
    /// `headers` is a sequence of `name NUL value NUL` pairs; see
    /// [`HeaderBlock`](crate::HeaderBlock) for a checked builder.
    pub async fn send_headers(&mut self, headers: &[u8]) -> Result<(), SessionError> {
        let timeout = self.writer_timeout;
        let cancel = self.cancel.clone();
        let stream = self.writer()?;
        let write = async {
            channel::write_scalar(stream, headers)
                .await
                .map_err(|e| channel_write_error("cannot send headers to the request handler", e))
        };
        bounded(&cancel, timeout, write).await
    }

    /// Send a chunk of the request body as-is.
    pub async fn send_body_block(&mut self, block: &[u8]) -> Result<(), SessionError> {
        let timeout = self.writer_timeout;
        let cancel = self.cancel.clone();
        let stream = self.writer()?;
        let write = async {
            channel::write_raw(stream, block)
                .await
                .map_err(|e| channel_write_error("cannot send request body to the request handler", e))
        };
        bounded(&cancel, timeout, write).await
    }

    /// Read some response bytes. `Ok(0)` means the worker closed its side.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, SessionError> {
        let timeout = self.reader_timeout;
        let cancel = self.cancel.clone();
        let stream = self.stream.as_mut().ok_or(SessionError::StreamClosed)?;
        let read = async {
            stream
                .read(buf)
                .await
                .map_err(|e| SessionError::io("cannot read from the request handler", e))
        };
        bounded(&cancel, timeout, read).await
    }

    /// Read the rest of the response until the worker closes its side.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>, SessionError> {
        let mut out = Vec::new();
        let mut buf = [0u8; 8192];
        loop {
            let n = self.read(&mut buf).await?;
            if n == 0 {
                return Ok(out);
            }
            out.extend_from_slice(&buf[..n]);
        }
    }

    /// Reader timeout in milliseconds for each read; 0 disables it.
    pub fn set_reader_timeout(&mut self, millis: u64) {
        self.reader_timeout = timeout_from_millis(millis);
    }

    /// Writer timeout in milliseconds for each write; 0 disables it.
    pub fn set_writer_timeout(&mut self, millis: u64) {
        self.writer_timeout = timeout_from_millis(millis);
    }

    /// Half-close the write side so the worker sees end-of-request.
    pub fn shutdown_writer(&mut self) -> Result<(), SessionError> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        shutdown(stream.as_raw_fd(), Shutdown::Write).map_err(|e| {
            SessionError::io("cannot shutdown the writer stream", io::Error::from(e))
        })?;
        self.writer_shut = true;
        Ok(())
    }

    /// Half-close the read side.
    pub fn shutdown_reader(&mut self) -> Result<(), SessionError> {
        let Some(stream) = &self.stream else {
            return Ok(());
        };
        shutdown(stream.as_raw_fd(), Shutdown::Read).map_err(|e| {
            SessionError::io("cannot shutdown the reader stream", io::Error::from(e))
        })
    }

    /// Close the stream now. Later stream operations fail cleanly; closing
    /// twice is a no-op. An `EIO` from close means written data was lost.
    pub fn close_stream(&mut self) -> Result<(), SessionError> {
        let Some(stream) = self.stream.take() else {
            return Ok(());
        };
        let fd = stream
            .into_owned_fd()
            .map_err(|e| SessionError::io("cannot close the session stream", e))?;
        match nix::unistd::close(fd.into_raw_fd()) {
            Ok(()) => Ok(()),
            Err(Errno::EIO) => Err(SessionError::WriteFailedOnClose(io::Error::from(Errno::EIO))),
            Err(e) => Err(SessionError::io(
                "cannot close the session stream",
                io::Error::from(e),
            )),
        }
    }

    /// Give up ownership of the stream without closing it. The caller gets a
    /// descriptor for the same socket; the session keeps no stream afterwards
    /// and the close callback still fires when it is dropped. If the
    /// descriptor cannot be handed over the session still owns the stream.
    pub fn discard_stream(&mut self) -> Result<OwnedFd, SessionError> {
        let stream = self.stream.as_ref().ok_or(SessionError::StreamClosed)?;
        let fd = stream
            .as_fd()
            .try_clone_to_owned()
            .map_err(|e| SessionError::io("cannot detach the session stream", e))?;
        // Dropping the registered stream only releases this session's handle.
        self.stream = None;
        debug!(pid = self.pid, fd = fd.as_raw_fd(), "Session stream handed to the caller");
        Ok(fd)
    }

    fn writer(&mut self) -> Result<&mut WorkerStream, SessionError> {
        if self.writer_shut {
            return Err(SessionError::WriterClosed);
        }
        self.stream.as_mut().ok_or(SessionError::WriterClosed)
    }
}

impl Drop for WorkerSession {
    fn drop(&mut self) {
        if let Err(e) = self.close_stream() {
            warn!(pid = self.pid, error = %e, "Error closing session stream");
        }
        if let Some(on_close) = self.on_close.take() {
            debug!(pid = self.pid, "Session closed");
            on_close();
        }
    }
}

fn timeout_from_millis(millis: u64) -> Option<Duration> {
    (millis > 0).then(|| Duration::from_millis(millis))
}

fn channel_write_error(context: &str, err: ChannelError) -> SessionError {
    match err {
        ChannelError::Io(source) => SessionError::io(context, source),
        other => SessionError::io(
            context,
            io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
        ),
    }
}

/// Run one stream operation under the session's timeout and cancellation token.
async fn bounded<T>(
    cancel: &CancellationToken,
    timeout: Option<Duration>,
    op: impl Future<Output = Result<T, SessionError>>,
) -> Result<T, SessionError> {
    let timed = async {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .unwrap_or(Err(SessionError::TimedOut)),
            None => op.await,
        }
    };
    cancel::cancellable(cancel, timed)
        .await
        .unwrap_or(Err(SessionError::Cancelled))
}
