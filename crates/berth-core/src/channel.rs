// ABOUTME: Length-prefixed message framing for the spawn-server control channel.
// ABOUTME: Array frames, scalar frames, raw writes, and SCM_RIGHTS descriptor transfer.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};

use nix::sys::socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, Interest};
use tokio::net::UnixStream;

use crate::error::ChannelError;

#[cfg(target_os = "linux")]
const SEND_FLAGS: MsgFlags = MsgFlags::MSG_NOSIGNAL;
#[cfg(not(target_os = "linux"))]
const SEND_FLAGS: MsgFlags = MsgFlags::empty();

#[cfg(target_os = "linux")]
const RECV_FLAGS: MsgFlags = MsgFlags::MSG_CMSG_CLOEXEC;
#[cfg(not(target_os = "linux"))]
const RECV_FLAGS: MsgFlags = MsgFlags::empty();

/// Write an array frame: a big-endian `u16` payload length, then each element
/// followed by a NUL byte.
pub async fn write_array<W, S>(writer: &mut W, items: &[S]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
    S: AsRef<str>,
{
    let mut payload = Vec::new();
    for item in items {
        let item = item.as_ref();
        if item.as_bytes().contains(&0) {
            return Err(ChannelError::InvalidElement(item.to_string()));
        }
        payload.extend_from_slice(item.as_bytes());
        payload.push(0);
    }
    let len = u16::try_from(payload.len()).map_err(|_| ChannelError::FrameTooLarge(payload.len()))?;

    let mut frame = Vec::with_capacity(2 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read an array frame. Returns `None` if the peer closed the channel cleanly
/// before the first byte of the frame.
pub async fn read_array<R>(reader: &mut R) -> Result<Option<Vec<String>>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    if !read_exact_or_eof(reader, &mut header).await? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u16::from_be_bytes(header) as usize];
    read_full(reader, &mut payload).await?;
    decode_array(&payload).map(Some)
}

fn decode_array(payload: &[u8]) -> Result<Vec<String>, ChannelError> {
    let Some((&last, body)) = payload.split_last() else {
        return Ok(Vec::new());
    };
    if last != 0 {
        return Err(ChannelError::Malformed(
            "payload does not end with a NUL byte".to_string(),
        ));
    }
    body.split(|b| *b == 0)
        .map(|element| {
            String::from_utf8(element.to_vec())
                .map_err(|_| ChannelError::Malformed("element is not valid UTF-8".to_string()))
        })
        .collect()
}

/// Write a scalar frame: a big-endian `u32` length followed by the raw payload.
pub async fn write_scalar<W>(writer: &mut W, data: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    let len = u32::try_from(data.len()).map_err(|_| ChannelError::FrameTooLarge(data.len()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read a scalar frame. Returns `None` on a clean close before the length prefix.
pub async fn read_scalar<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    if !read_exact_or_eof(reader, &mut header).await? {
        return Ok(None);
    }
    let mut payload = vec![0u8; u32::from_be_bytes(header) as usize];
    read_full(reader, &mut payload).await?;
    Ok(Some(payload))
}

/// Write bytes without any framing.
pub async fn write_raw<W>(writer: &mut W, data: &[u8]) -> Result<(), ChannelError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Fill `buf` completely. `Ok(false)` means the stream was already at EOF;
/// EOF after a partial read is an error.
async fn read_exact_or_eof<R>(reader: &mut R, buf: &mut [u8]) -> Result<bool, ChannelError>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(ChannelError::UnexpectedEof);
        }
        filled += n;
    }
    Ok(true)
}

async fn read_full<R>(reader: &mut R, buf: &mut [u8]) -> Result<(), ChannelError>
where
    R: AsyncRead + Unpin,
{
    if buf.is_empty() || read_exact_or_eof(reader, buf).await? {
        Ok(())
    } else {
        Err(ChannelError::UnexpectedEof)
    }
}

/// A connected Unix stream speaking the control protocol.
///
/// Reads are unbuffered: a descriptor travels with a single dummy byte, and a
/// buffered reader would swallow that byte and drop the descriptor with it.
#[derive(Debug)]
pub struct MessageChannel {
    stream: UnixStream,
}

impl MessageChannel {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Wrap a blocking std socket. Must be called inside a tokio runtime.
    pub fn from_std(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self::new(UnixStream::from_std(stream)?))
    }

    pub async fn write_array<S: AsRef<str>>(&mut self, items: &[S]) -> Result<(), ChannelError> {
        write_array(&mut self.stream, items).await
    }

    pub async fn read_array(&mut self) -> Result<Option<Vec<String>>, ChannelError> {
        read_array(&mut self.stream).await
    }

    pub async fn write_scalar(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        write_scalar(&mut self.stream, data).await
    }

    pub async fn read_scalar(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        read_scalar(&mut self.stream).await
    }

    pub async fn write_raw(&mut self, data: &[u8]) -> Result<(), ChannelError> {
        write_raw(&mut self.stream, data).await
    }

    /// Transfer a duplicate of `fd` to the peer.
    pub async fn send_fd(&mut self, fd: BorrowedFd<'_>) -> Result<(), ChannelError> {
        let socket = self.stream.as_raw_fd();
        let payload = fd.as_raw_fd();
        loop {
            self.stream.writable().await?;
            match self
                .stream
                .try_io(Interest::WRITABLE, || send_fd_raw(socket, payload))
            {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Receive a descriptor sent with [`send_fd`](Self::send_fd).
    pub async fn recv_fd(&mut self) -> Result<OwnedFd, ChannelError> {
        let socket = self.stream.as_raw_fd();
        loop {
            self.stream.readable().await?;
            match self
                .stream
                .try_io(Interest::READABLE, || recv_fd_raw(socket))
            {
                Ok(Received::Descriptor(fd)) => return Ok(fd),
                Ok(Received::Closed) => return Err(ChannelError::UnexpectedEof),
                Ok(Received::Missing) => return Err(ChannelError::MissingDescriptor),
                Ok(Received::Truncated) => {
                    return Err(ChannelError::Malformed(
                        "descriptor control data was truncated".to_string(),
                    ))
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }
}

enum Received {
    Descriptor(OwnedFd),
    Closed,
    Missing,
    Truncated,
}

fn send_fd_raw(socket: RawFd, fd: RawFd) -> io::Result<()> {
    let dummy = [0u8; 1];
    let iov = [IoSlice::new(&dummy)];
    let fds = [fd];
    let cmsgs = [ControlMessage::ScmRights(&fds)];
    match sendmsg::<()>(socket, &iov, &cmsgs, SEND_FLAGS, None)? {
        0 => Err(io::Error::from(io::ErrorKind::WriteZero)),
        _ => Ok(()),
    }
}

fn recv_fd_raw(socket: RawFd) -> io::Result<Received> {
    let mut dummy = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut dummy)];
    let mut control = nix::cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(socket, &mut iov, Some(&mut control), RECV_FLAGS)?;
    if msg.bytes == 0 {
        return Ok(Received::Closed);
    }
    if msg.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Ok(Received::Truncated);
    }

    let mut received = Vec::new();
    for cmsg in msg.cmsgs()? {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            // SAFETY: the kernel installed these descriptors for this process
            // and nothing else refers to them yet.
            received.extend(fds.into_iter().map(|raw| unsafe { OwnedFd::from_raw_fd(raw) }));
        }
    }
    // Any extra descriptors close on drop.
    Ok(received
        .into_iter()
        .next()
        .map_or(Received::Missing, Received::Descriptor))
}
