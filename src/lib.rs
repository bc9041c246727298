//! Block-compressed, randomly-seekable gzip container engine.
//!
//! Streams are sequences of independent gzip members, each at most 64 KiB
//! on disk and carrying its own checksum, so any block can be decoded
//! without touching its neighbors. Positions are [`VirtualOffset`]s packing
//! a block's compressed start with an offset into its decompressed payload,
//! and a [`BlockIndex`] side file maps uncompressed offsets onto blocks for
//! random access. Readers and writers start single-threaded and can attach
//! a shared [`ThreadPool`] to move block codec work off the calling thread.

mod block;
mod cache;
mod error;
mod index;
mod pipeline;
mod pool;
mod read;
mod vpos;
mod write;

pub use block::{StreamKind, EOF_BLOCK, MAX_BLOCK_PAYLOAD, MAX_BLOCK_SIZE};
pub use error::{Error, HeaderError, IndexError, MisuseError, Result};
pub use index::{BlockIndex, IndexEntry};
pub use pool::ThreadPool;
pub use read::Reader;
pub use vpos::VirtualOffset;
pub use write::{Writer, WriterBuilder};
