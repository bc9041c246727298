/// Custom Result type for blockgz operations, wrapping the custom [`Error`] type
pub type Result<T> = std::result::Result<T, Error>;

/// The main error type for the blockgz library, encompassing all possible error
/// cases that can occur while reading or writing block-compressed streams.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Errors related to block headers
    #[error("Error processing block header: {0}")]
    HeaderError(#[from] HeaderError),

    /// A decompressed block failed its checksum or size check
    #[error("Block at offset {offset} failed verification: expected {expected:#010x}, found {found:#010x}")]
    ChecksumError {
        offset: u64,
        expected: u32,
        found: u32,
    },

    /// The deflate payload of a block could not be inflated or deflated
    #[error("Error in deflate codec: {0}")]
    CodecError(String),

    /// Errors caused by calling operations on a handle in the wrong mode
    #[error("Handle misuse: {0}")]
    MisuseError(#[from] MisuseError),

    /// Errors related to the random-access index
    #[error("Error processing index: {0}")]
    IndexError(#[from] IndexError),

    /// Standard I/O errors
    #[error("Error with IO: {0}")]
    IoError(#[from] std::io::Error),
}
impl Error {
    /// Checks if the error indicates on-disk corruption of the stream.
    ///
    /// Corruption errors are not recoverable by retrying; callers should
    /// surface them rather than continue reading.
    ///
    /// # Returns
    ///
    /// * `true` for header, checksum, and codec errors
    /// * `false` for all other error types
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::HeaderError(_) | Self::ChecksumError { .. } | Self::CodecError(_)
        )
    }
}

/// Errors specific to parsing and validating block headers
#[derive(thiserror::Error, Debug)]
pub enum HeaderError {
    /// The fixed bytes of the block header do not match the expected values
    ///
    /// # Arguments
    /// * `u64` - The compressed offset at which the bad header starts
    #[error("Invalid block header magic at offset {0}")]
    InvalidMagic(u64),

    /// The header's extra field does not carry a block-size subfield
    #[error("Block header at offset {0} is missing the block-size subfield")]
    MissingBlockSize(u64),

    /// The declared on-disk block size is impossible
    ///
    /// # Arguments
    /// * First `u64` - The compressed offset of the block
    /// * Second `usize` - The declared size
    #[error("Block header at offset {0} declares invalid block size {1}")]
    InvalidBlockSize(u64, usize),

    /// The stream ended in the middle of a block
    ///
    /// # Arguments
    /// * `u64` - The compressed offset of the truncated block
    #[error("Unexpected end of stream inside block at offset {0}")]
    TruncatedBlock(u64),
}

/// Errors caused by using a handle outside its contract
#[derive(thiserror::Error, Debug)]
pub enum MisuseError {
    /// A read operation was called on a handle opened for writing, or vice versa
    #[error("Operation requires a handle opened for {expected}, but this handle is for {actual}")]
    WrongMode {
        expected: &'static str,
        actual: &'static str,
    },

    /// Seeking was requested on a stream that does not support it
    #[error("Cannot seek on a non-blocked stream")]
    UnseekableStream,

    /// An operation was called on a handle after a previous unrecoverable error
    #[error("Handle is in an error state from a previous operation")]
    Poisoned,

    /// A write or flush was attempted after the stream was finished
    #[error("Stream already finished")]
    Finished,

    /// An operation needing the random-access index was called without one
    #[error("No random-access index is available on this handle")]
    MissingIndex,

    /// A position's in-block cursor points past the end of its decoded block
    ///
    /// Raised by seeks whose virtual offset does not name a readable
    /// position, including index entries that disagree with the stream
    #[error("In-block cursor {cursor} exceeds the {length}-byte decoded block")]
    CursorBeyondBlock { cursor: usize, length: usize },
}

/// Errors related to the random-access side-file index
#[derive(thiserror::Error, Debug)]
pub enum IndexError {
    /// The index file declares more entries than it contains
    ///
    /// The first parameter is the declared count, the second the available count
    #[error("Index file truncated: declares {0} entries but holds {1}")]
    Truncated(u64, u64),

    /// The index entries are not strictly increasing
    ///
    /// The parameter is the ordinal of the offending entry
    #[error("Index entries out of order at entry {0}")]
    OutOfOrder(usize),
}
