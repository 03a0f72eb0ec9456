//! The user-space buffer pool interface the core consumes during
//! `copy_to_user` (spec §6). Allocation and pool lifecycle are out of
//! scope; the core only needs to copy reassembled bytes out.
//!
//! Grounded on `elvis-core`'s convention of defining a small `Send + Sync`
//! trait for an external collaborator and passing it around as
//! `Arc<dyn Trait>` (see the `Network`/`Pci` split in `network_api.rs`).

use thiserror::Error;

use crate::Message;

/// Failures the buffer pool can report while copying into user memory.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferPoolError {
    #[error("buffer pool exhausted (ENOMEM)")]
    NoSpace,
    #[error("user address faulted (EFAULT)")]
    Fault,
}

/// A user-space buffer pool, consumed by [`crate::rpc::reassembly::Msgin::copy_to_user`].
///
/// `bpage_size` governs how the reassembler chunks its copies; callers that
/// don't care about page alignment can return a large value.
pub trait BufferPool: Send + Sync {
    fn bpage_size(&self) -> usize;

    /// Copies `length` bytes from `message` starting at `src_offset` into
    /// the pool, returning the number of bytes actually copied (which may
    /// be less than `length` at a buffer-pool boundary) or an error.
    fn copy_datagram_iter(
        &self,
        message: &Message,
        src_offset: usize,
        length: usize,
    ) -> Result<usize, BufferPoolError>;
}
