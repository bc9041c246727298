//! Wire format for one compressed block.
//!
//! Each block is a self-contained gzip member: an 18-byte header whose extra
//! field carries the total on-disk block size, a raw-deflate payload, and an
//! 8-byte footer holding the CRC-32 and byte length of the decompressed
//! payload. Blocks never exceed 65536 bytes on disk, so the on-disk size
//! always fits the 16-bit size subfield.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian};
use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};

use crate::error::{Error, HeaderError, Result};

/// Size of the fixed block header, including the 6-byte extra field.
pub const HEADER_SIZE: usize = 18;

/// Size of the block footer (CRC-32 then decompressed length, both LE).
pub const FOOTER_SIZE: usize = 8;

/// Maximum on-disk size of one block.
pub const MAX_BLOCK_SIZE: usize = 0x10000;

/// Maximum decompressed payload accumulated into one block.
///
/// Leaving 256 bytes of headroom below [`MAX_BLOCK_SIZE`] guarantees that
/// header, footer, and a stored-mode payload always fit on disk even when
/// the data is incompressible.
pub const MAX_BLOCK_PAYLOAD: usize = 0xff00;

/// The canonical terminal block: a block with an empty payload, appended at
/// the end of every finished stream so readers can distinguish a completed
/// stream from a truncated one.
pub const EOF_BLOCK: [u8; 28] = [
    0x1f, 0x8b, 0x08, 0x04, 0x00, 0x00, 0x00, 0x00, 0x00, 0xff, 0x06, 0x00, 0x42, 0x43, 0x02,
    0x00, 0x1b, 0x00, 0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// What kind of stream the engine is looking at, decided from the first
/// bytes at open time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Block-compressed: seekable, cacheable, parallelizable.
    Blocked,
    /// Ordinary (multi-member) gzip without block framing.
    Gzip,
    /// Not compressed at all.
    Plain,
}

impl StreamKind {
    /// Classifies a stream from its leading bytes.
    ///
    /// A blocked stream starts with a gzip header that has the extra-field
    /// flag set and carries the `BC` block-size subfield. A gzip header
    /// without that subfield is ordinary gzip. Anything else, including a
    /// stream shorter than one block header, is plain data.
    #[must_use]
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.len() < 2 || prefix[0] != 0x1f || prefix[1] != 0x8b {
            return Self::Plain;
        }
        if prefix.len() >= HEADER_SIZE
            && prefix[2] == 0x08
            && prefix[3] & 0x04 != 0
            && LittleEndian::read_u16(&prefix[10..12]) >= 6
            && prefix[12] == b'B'
            && prefix[13] == b'C'
            && LittleEndian::read_u16(&prefix[14..16]) == 2
        {
            return Self::Blocked;
        }
        Self::Gzip
    }
}

/// One block read off the wire, still compressed.
#[derive(Debug, Clone)]
pub struct RawBlock {
    /// Compressed offset at which this block starts.
    pub coffset: u64,
    /// The complete on-disk bytes of the block, header and footer included.
    pub data: Vec<u8>,
}

impl RawBlock {
    /// Number of bytes this block occupies on disk.
    #[must_use]
    pub fn size_on_disk(&self) -> usize {
        self.data.len()
    }

    /// Decompressed payload length declared by the footer.
    #[must_use]
    pub fn declared_payload_len(&self) -> u32 {
        let footer = &self.data[self.data.len() - FOOTER_SIZE..];
        LittleEndian::read_u32(&footer[4..8])
    }
}

/// Reads the next complete block starting at `coffset`.
///
/// Returns `Ok(None)` on a clean end of stream at a block boundary. A stream
/// that ends partway through a block yields a [`HeaderError::TruncatedBlock`].
pub fn read_raw_block<R: Read>(reader: &mut R, coffset: u64) -> Result<Option<RawBlock>> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let bsize = parse_block_size(&header, coffset)?;
    let mut data = Vec::with_capacity(bsize);
    data.extend_from_slice(&header);
    data.resize(bsize, 0);
    reader
        .read_exact(&mut data[HEADER_SIZE..])
        .map_err(|e| match e.kind() {
            io::ErrorKind::UnexpectedEof => HeaderError::TruncatedBlock(coffset).into(),
            _ => Error::from(e),
        })?;

    Ok(Some(RawBlock { coffset, data }))
}

/// Validates a block header and extracts the total on-disk block size.
pub fn parse_block_size(header: &[u8; HEADER_SIZE], coffset: u64) -> Result<usize> {
    if header[0] != 0x1f || header[1] != 0x8b || header[2] != 0x08 || header[3] & 0x04 == 0 {
        return Err(HeaderError::InvalidMagic(coffset).into());
    }
    let xlen = LittleEndian::read_u16(&header[10..12]) as usize;
    if xlen < 6 || header[12] != b'B' || header[13] != b'C' {
        // Only the fixed layout with the size subfield leading the extra
        // field is produced by this engine; anything else is foreign.
        return Err(HeaderError::MissingBlockSize(coffset).into());
    }
    if LittleEndian::read_u16(&header[14..16]) != 2 {
        return Err(HeaderError::MissingBlockSize(coffset).into());
    }
    let bsize = LittleEndian::read_u16(&header[16..18]) as usize + 1;
    if bsize < HEADER_SIZE + FOOTER_SIZE {
        return Err(HeaderError::InvalidBlockSize(coffset, bsize).into());
    }
    Ok(bsize)
}

/// Decompresses and verifies one raw block, appending the payload to `out`.
///
/// The footer's CRC-32 and length are both checked against the inflated
/// bytes; a mismatch in either is reported as corruption at the block's
/// compressed offset.
pub fn decode_block(raw: &RawBlock, out: &mut Vec<u8>) -> Result<()> {
    let xlen = LittleEndian::read_u16(&raw.data[10..12]) as usize;
    let payload_start = 12 + xlen;
    let payload_end = raw.data.len() - FOOTER_SIZE;
    if payload_start > payload_end {
        return Err(HeaderError::InvalidBlockSize(raw.coffset, raw.data.len()).into());
    }
    let deflated = &raw.data[payload_start..payload_end];
    let footer = &raw.data[payload_end..];
    let expected_crc = LittleEndian::read_u32(&footer[0..4]);
    let expected_len = LittleEndian::read_u32(&footer[4..8]);

    let start = out.len();
    inflate_raw(deflated, out, expected_len as usize)?;
    let payload = &out[start..];

    if payload.len() != expected_len as usize {
        return Err(Error::ChecksumError {
            offset: raw.coffset,
            expected: expected_len,
            found: payload.len() as u32,
        });
    }
    let found_crc = crc32fast::hash(payload);
    if found_crc != expected_crc {
        return Err(Error::ChecksumError {
            offset: raw.coffset,
            expected: expected_crc,
            found: found_crc,
        });
    }
    Ok(())
}

/// Compresses `payload` into a complete on-disk block appended to `out`.
///
/// Level 0 stores the payload without compression. At other levels the
/// payload is deflated, falling back to stored mode whenever deflate fails
/// to shrink it, so the framed block always fits [`MAX_BLOCK_SIZE`].
pub fn encode_block(payload: &[u8], level: Compression, out: &mut Vec<u8>) -> Result<()> {
    debug_assert!(payload.len() <= MAX_BLOCK_PAYLOAD);

    let mut deflated = Vec::with_capacity(payload.len() + payload.len() / 2 + 64);
    deflate_raw(payload, level, &mut deflated)?;
    if level != Compression::none() && deflated.len() >= payload.len() + stored_overhead(payload) {
        deflated.clear();
        deflate_raw(payload, Compression::none(), &mut deflated)?;
    }

    let bsize = HEADER_SIZE + deflated.len() + FOOTER_SIZE;
    debug_assert!(bsize <= MAX_BLOCK_SIZE);

    let mut header = [0u8; HEADER_SIZE];
    header[0] = 0x1f;
    header[1] = 0x8b;
    header[2] = 0x08;
    header[3] = 0x04;
    // MTIME and XFL stay zero, OS is "unknown".
    header[9] = 0xff;
    LittleEndian::write_u16(&mut header[10..12], 6);
    header[12] = b'B';
    header[13] = b'C';
    LittleEndian::write_u16(&mut header[14..16], 2);
    LittleEndian::write_u16(&mut header[16..18], (bsize - 1) as u16);

    out.extend_from_slice(&header);
    out.extend_from_slice(&deflated);

    let mut footer = [0u8; FOOTER_SIZE];
    LittleEndian::write_u32(&mut footer[0..4], crc32fast::hash(payload));
    LittleEndian::write_u32(&mut footer[4..8], payload.len() as u32);
    out.extend_from_slice(&footer);
    Ok(())
}

/// Worst-case growth of a stored-mode deflate stream over its input.
fn stored_overhead(payload: &[u8]) -> usize {
    // One 5-byte stored-block header per 65535 bytes, plus the final empty
    // stored block emitted on finish.
    5 * (payload.len() / 0xffff + 2)
}

fn deflate_raw(input: &[u8], level: Compression, out: &mut Vec<u8>) -> Result<()> {
    let mut compress = Compress::new(level, false);
    loop {
        if out.capacity() == out.len() {
            out.reserve(1024);
        }
        let status = compress
            .compress_vec(&input[compress.total_in() as usize..], out, FlushCompress::Finish)
            .map_err(|e| Error::CodecError(e.to_string()))?;
        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => out.reserve(4096),
        }
    }
}

fn inflate_raw(input: &[u8], out: &mut Vec<u8>, size_hint: usize) -> Result<()> {
    let mut decompress = Decompress::new(false);
    out.reserve(size_hint.max(64));
    loop {
        let status = decompress
            .decompress_vec(
                &input[decompress.total_in() as usize..],
                out,
                FlushDecompress::Finish,
            )
            .map_err(|e| Error::CodecError(e.to_string()))?;
        match status {
            Status::StreamEnd => return Ok(()),
            Status::Ok | Status::BufError => {
                if out.len() > MAX_BLOCK_SIZE * 2 {
                    // A well-formed block never inflates anywhere near this
                    // far; bail out instead of ballooning on corrupt input.
                    return Err(Error::CodecError(String::from(
                        "block payload inflates beyond the block size bound",
                    )));
                }
                out.reserve(4096);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(payload: &[u8], level: Compression) -> Vec<u8> {
        let mut wire = Vec::new();
        encode_block(payload, level, &mut wire).unwrap();
        assert!(wire.len() <= MAX_BLOCK_SIZE);

        let raw = read_raw_block(&mut Cursor::new(&wire), 0).unwrap().unwrap();
        assert_eq!(raw.size_on_disk(), wire.len());

        let mut out = Vec::new();
        decode_block(&raw, &mut out).unwrap();
        out
    }

    // ==================== Encode/Decode Tests ====================

    #[test]
    fn test_roundtrip_compressible() {
        let payload = vec![b'A'; 10_000];
        assert_eq!(roundtrip(&payload, Compression::default()), payload);
    }

    #[test]
    fn test_roundtrip_empty_payload() {
        assert!(roundtrip(&[], Compression::default()).is_empty());
    }

    #[test]
    fn test_roundtrip_incompressible_falls_back_to_stored() {
        let payload: Vec<u8> = (0..MAX_BLOCK_PAYLOAD).map(|i| (i * 2_654_435_761) as u8).collect();
        let mut wire = Vec::new();
        encode_block(&payload, Compression::best(), &mut wire).unwrap();
        assert!(wire.len() <= MAX_BLOCK_SIZE);

        let raw = read_raw_block(&mut Cursor::new(&wire), 0).unwrap().unwrap();
        let mut out = Vec::new();
        decode_block(&raw, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_level_zero_is_stored() {
        let payload = vec![b'A'; 1000];
        let mut wire = Vec::new();
        encode_block(&payload, Compression::none(), &mut wire).unwrap();
        // Stored mode cannot shrink: the frame must be larger than the payload.
        assert!(wire.len() > payload.len());
        let raw = read_raw_block(&mut Cursor::new(&wire), 0).unwrap().unwrap();
        let mut out = Vec::new();
        decode_block(&raw, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_empty_block_matches_terminal_template() {
        let mut wire = Vec::new();
        encode_block(&[], Compression::default(), &mut wire).unwrap();
        assert_eq!(wire, EOF_BLOCK);
    }

    // ==================== Corruption Tests ====================

    #[test]
    fn test_flipped_payload_bit_fails_checksum() {
        let payload = vec![b'Q'; 5000];
        let mut wire = Vec::new();
        encode_block(&payload, Compression::default(), &mut wire).unwrap();
        let mid = wire.len() / 2;
        wire[mid] ^= 0x01;

        let raw = read_raw_block(&mut Cursor::new(&wire), 0).unwrap().unwrap();
        let mut out = Vec::new();
        let err = decode_block(&raw, &mut out).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_corrupt_footer_crc() {
        let payload = b"hello world".to_vec();
        let mut wire = Vec::new();
        encode_block(&payload, Compression::default(), &mut wire).unwrap();
        let crc_pos = wire.len() - FOOTER_SIZE;
        wire[crc_pos] ^= 0xff;

        let raw = read_raw_block(&mut Cursor::new(&wire), 0).unwrap().unwrap();
        let mut out = Vec::new();
        assert!(matches!(
            decode_block(&raw, &mut out),
            Err(Error::ChecksumError { offset: 0, .. })
        ));
    }

    #[test]
    fn test_bad_magic() {
        let mut wire = EOF_BLOCK.to_vec();
        wire[0] = 0x00;
        let err = read_raw_block(&mut Cursor::new(&wire), 7).unwrap_err();
        assert!(matches!(
            err,
            Error::HeaderError(HeaderError::InvalidMagic(7))
        ));
    }

    #[test]
    fn test_truncated_block() {
        let payload = vec![b'Z'; 4000];
        let mut wire = Vec::new();
        encode_block(&payload, Compression::default(), &mut wire).unwrap();
        wire.truncate(wire.len() - 3);
        let err = read_raw_block(&mut Cursor::new(&wire), 0).unwrap_err();
        assert!(matches!(
            err,
            Error::HeaderError(HeaderError::TruncatedBlock(0))
        ));
    }

    #[test]
    fn test_clean_eof_at_boundary() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_raw_block(&mut cursor, 0).unwrap().is_none());
    }

    // ==================== Detection Tests ====================

    #[test]
    fn test_detect_blocked() {
        assert_eq!(StreamKind::detect(&EOF_BLOCK), StreamKind::Blocked);
    }

    #[test]
    fn test_detect_plain_gzip() {
        // A gzip header without the extra-field flag.
        let header = [0x1f, 0x8b, 0x08, 0x00, 0, 0, 0, 0, 0, 0xff, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(StreamKind::detect(&header), StreamKind::Gzip);
    }

    #[test]
    fn test_detect_plain_data() {
        assert_eq!(StreamKind::detect(b"chr1\t100\t200\n"), StreamKind::Plain);
        assert_eq!(StreamKind::detect(b""), StreamKind::Plain);
        assert_eq!(StreamKind::detect(&[0x1f]), StreamKind::Plain);
    }

    #[test]
    fn test_eof_block_declares_empty_payload() {
        let raw = RawBlock {
            coffset: 0,
            data: EOF_BLOCK.to_vec(),
        };
        assert_eq!(raw.declared_payload_len(), 0);
    }
}
