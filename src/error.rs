//! Error types surfaced by the Homa core.
//!
//! Grounded on `elvis-core`'s `protocol.rs` (`DemuxError`, `StartError`) and
//! `protocols/socket_api/socket.rs` (`SocketError`): small `thiserror` enums
//! with one variant per condition and no nested causes, since the core never
//! needs to unwrap an inner error for a caller.

use thiserror::Error;

/// The errno-shaped errors `wait_for_message` can hand back to an
/// application thread, per spec §6/§7.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RecvError {
    /// No message was ready and the call was non-blocking.
    #[error("no message ready (EAGAIN)")]
    Again,
    /// A signal arrived while the thread was blocked waiting.
    #[error("interrupted by a signal (EINTR)")]
    Intr,
    /// The caller's arguments don't name a valid RPC to wait on.
    #[error("invalid argument (EINVAL)")]
    Inval,
    /// The socket was shut down while the thread was waiting.
    #[error("socket has shut down (ESHUTDOWN)")]
    Shutdown,
    /// The peer stopped responding and no data ever arrived.
    #[error("timed out waiting for peer (ETIMEDOUT)")]
    TimedOut,
    /// Copying into the user buffer failed.
    #[error("bad address (EFAULT)")]
    Fault,
    /// The user-space buffer pool had no space available.
    #[error("out of memory (ENOMEM)")]
    NoMem,
    /// The id named a socket that isn't connected.
    #[error("not connected (ENOTCONN)")]
    NotConn,
    /// The requested protocol isn't supported on this socket.
    #[error("protocol not supported (EPROTONOSUPPORT)")]
    ProtoNotSupported,
}

impl RecvError {
    /// The negative error code conventionally stored on [`crate::rpc::Rpc::error`].
    pub fn code(self) -> i32 {
        match self {
            RecvError::Again => -1,
            RecvError::Intr => -2,
            RecvError::Inval => -3,
            RecvError::Shutdown => -4,
            RecvError::TimedOut => -5,
            RecvError::Fault => -6,
            RecvError::NoMem => -7,
            RecvError::NotConn => -8,
            RecvError::ProtoNotSupported => -9,
        }
    }

    /// Recovers a `RecvError` from a code produced by [`RecvError::code`].
    /// Any other value (including 0, meaning "no error") returns `None`.
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => RecvError::Again,
            -2 => RecvError::Intr,
            -3 => RecvError::Inval,
            -4 => RecvError::Shutdown,
            -5 => RecvError::TimedOut,
            -6 => RecvError::Fault,
            -7 => RecvError::NoMem,
            -8 => RecvError::NotConn,
            -9 => RecvError::ProtoNotSupported,
            _ => return None,
        })
    }
}

/// Internal dispatch failures. Per §7, "the dispatcher never throws": these
/// are logged and the offending packet is dropped rather than propagated to
/// a caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("malformed packet header: {0}")]
    MalformedHeader(&'static str),
    #[error("unknown packet type {0}")]
    UnknownPacketType(u8),
    #[error("no socket is listening for this packet")]
    NoSocket,
}
