// ABOUTME: Error types for the berth-core crate.
// ABOUTME: Separates helper-death faults from application failures and per-session I/O errors.

use std::io;
use thiserror::Error;

/// Errors produced by the control-channel framing layer.
#[derive(Error, Debug)]
pub enum ChannelError {
    /// Underlying socket I/O failed.
    #[error("channel I/O error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the channel in the middle of a frame.
    #[error("channel closed in the middle of a message")]
    UnexpectedEof,

    /// An array frame payload does not fit in the 16-bit length prefix.
    #[error("array message too large ({0} bytes)")]
    FrameTooLarge(usize),

    /// An array element contains the NUL separator.
    #[error("array element contains a NUL byte: {0:?}")]
    InvalidElement(String),

    /// An array frame could not be decoded into strings.
    #[error("malformed array message: {0}")]
    Malformed(String),

    /// A descriptor-passing message arrived without a descriptor.
    #[error("expected a file descriptor but none was received")]
    MissingDescriptor,
}

/// Errors surfaced by [`SpawnSupervisor`](crate::SpawnSupervisor) operations.
#[derive(Error, Debug)]
pub enum SpawnError {
    /// The helper process could not be set up (socket pair, log file, fork/exec).
    #[error("{context}: {source}")]
    Setup {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The helper sent a reply that does not follow the control protocol.
    #[error("the spawn server sent an invalid message: {0}")]
    Protocol(String),

    /// The helper closed the control channel.
    #[error("the spawn server has exited unexpectedly")]
    HelperExited,

    /// Reading from or writing to the control channel failed.
    #[error("{context}: {source}")]
    ControlChannel {
        context: String,
        #[source]
        source: io::Error,
    },

    /// The application itself failed to start. The helper is healthy.
    #[error("{message}")]
    Application { message: String, error_page: String },

    /// A request or reply named something this crate cannot use.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The helper died and the single restart attempt failed too.
    #[error("the spawn server died unexpectedly, and restarting it failed: {restart}")]
    RestartFailed {
        #[source]
        cause: Box<SpawnError>,
        restart: Box<SpawnError>,
    },

    /// The supervisor was shut down before this call.
    #[error("the spawn supervisor has been shut down")]
    Shutdown,

    /// The calling operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,
}

impl SpawnError {
    /// True when the fault means the helper must be considered dead and restarted.
    pub fn is_helper_death(&self) -> bool {
        matches!(
            self,
            SpawnError::Protocol(_) | SpawnError::HelperExited | SpawnError::ControlChannel { .. }
        )
    }

    /// The rendered detail page of an application failure, if this is one.
    pub fn error_page(&self) -> Option<&str> {
        match self {
            SpawnError::Application { error_page, .. } => Some(error_page),
            _ => None,
        }
    }

    pub(crate) fn setup(context: impl Into<String>, source: io::Error) -> Self {
        SpawnError::Setup {
            context: context.into(),
            source,
        }
    }

    /// Prefix the context of a setup failure, leaving other variants untouched.
    pub(crate) fn prepend(self, prefix: &str) -> Self {
        match self {
            SpawnError::Setup { context, source } => SpawnError::Setup {
                context: format!("{prefix}: {context}"),
                source,
            },
            other => other,
        }
    }
}

/// Errors surfaced by a [`WorkerSession`](crate::WorkerSession) or while connecting one.
#[derive(Error, Debug)]
pub enum SessionError {
    /// A write was attempted after the writer side was shut down or the stream closed.
    #[error("cannot write to the request handler because the writer stream has already been closed")]
    WriterClosed,

    /// A read was attempted after the stream was closed or discarded.
    #[error("cannot read from the request handler because the stream has already been closed")]
    StreamClosed,

    /// Socket I/O on the session stream failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    /// Closing the stream reported EIO: buffered data was lost.
    #[error("a write operation on the session stream failed: {0}")]
    WriteFailedOnClose(#[source] io::Error),

    /// The worker's listen address is unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A reader or writer timeout elapsed.
    #[error("session I/O timed out")]
    TimedOut,

    /// The session's cancellation token fired.
    #[error("operation cancelled")]
    Cancelled,
}

impl SessionError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        SessionError::Io {
            context: context.into(),
            source,
        }
    }
}
