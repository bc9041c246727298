//! Random-access index over a block-compressed stream.
//!
//! The index records, for each block boundary, the pair of cumulative
//! offsets (uncompressed, compressed) at which the block starts. Given an
//! uncompressed target, a binary search finds the block holding it, and a
//! reader can land there with a single seek plus one block decode.
//!
//! The pair `(0, 0)` for the first block is implicit: it is synthesized in
//! memory and never written to the side file, matching the on-disk count of
//! `N - 1` entries.

use std::io::{self, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::block::{FOOTER_SIZE, HEADER_SIZE};
use crate::error::{Error, IndexError, Result};
use crate::{block, vpos::VirtualOffset};

/// One block boundary: cumulative offsets at which a block starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Cumulative decompressed bytes before this block.
    pub uncompressed: u64,
    /// Compressed offset of the block's first header byte.
    pub compressed: u64,
}

impl IndexEntry {
    /// The virtual offset of this block's first payload byte.
    #[must_use]
    pub fn virtual_offset(&self) -> VirtualOffset {
        VirtualOffset::new(self.compressed, 0)
    }
}

/// Sorted block-boundary index supporting uncompressed-offset seeks.
#[derive(Debug, Clone)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
}

impl Default for BlockIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockIndex {
    /// An index covering only the first block.
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: vec![IndexEntry {
                uncompressed: 0,
                compressed: 0,
            }],
        }
    }

    /// Number of boundaries recorded, the implicit first one included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        // The sentinel is always present.
        false
    }

    /// Iterates the boundaries in stream order.
    pub fn iter(&self) -> impl Iterator<Item = &IndexEntry> {
        self.entries.iter()
    }

    /// Records the boundary of the next block. Boundaries must arrive in
    /// stream order; a duplicate of the last boundary is ignored, which
    /// makes repeated flushes at the same position harmless.
    pub fn push(&mut self, uncompressed: u64, compressed: u64) {
        let last = self.entries[self.entries.len() - 1];
        if compressed <= last.compressed {
            return;
        }
        self.entries.push(IndexEntry {
            uncompressed,
            compressed,
        });
    }

    /// Finds the block containing the uncompressed offset `target`: the
    /// greatest boundary whose uncompressed offset is at most `target`. A
    /// boundary exactly at `target` is selected. Targets beyond the last
    /// boundary resolve to the last block.
    #[must_use]
    pub fn query(&self, target: u64) -> IndexEntry {
        let after = self
            .entries
            .partition_point(|entry| entry.uncompressed <= target);
        self.entries[after - 1]
    }

    /// Builds an index by walking the block headers of an existing stream,
    /// without decompressing any payload. The stream is left positioned at
    /// its end.
    pub fn from_blocked_stream<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        reader.seek(SeekFrom::Start(0))?;
        let mut index = Self::new();
        let mut coffset = 0u64;
        let mut uoffset = 0u64;
        loop {
            let mut header = [0u8; HEADER_SIZE];
            match reader.read_exact(&mut header) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let bsize = block::parse_block_size(&header, coffset)?;
            let body = bsize - HEADER_SIZE - FOOTER_SIZE;
            reader.seek(SeekFrom::Current(body as i64))?;
            let isize = {
                let mut footer = [0u8; FOOTER_SIZE];
                reader.read_exact(&mut footer).map_err(|e| match e.kind() {
                    io::ErrorKind::UnexpectedEof => {
                        Error::from(crate::error::HeaderError::TruncatedBlock(coffset))
                    }
                    _ => Error::from(e),
                })?;
                u64::from(u32::from_le_bytes([footer[4], footer[5], footer[6], footer[7]]))
            };
            coffset += bsize as u64;
            uoffset += isize;
            // The boundary after an empty block is the same uncompressed
            // position, so only data blocks contribute. A target at or past
            // the stream's total length resolves to the final boundary,
            // which positions the reader at the terminal block, hence EOF.
            if isize > 0 {
                index.push(uoffset, coffset);
            }
        }
        Ok(index)
    }

    /// Writes the index side file: the number of non-implicit boundaries as
    /// a little-endian u64, then each boundary as `(compressed,
    /// uncompressed)` little-endian u64 pairs.
    pub fn dump<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_u64::<LittleEndian>((self.entries.len() - 1) as u64)?;
        for entry in &self.entries[1..] {
            writer.write_u64::<LittleEndian>(entry.compressed)?;
            writer.write_u64::<LittleEndian>(entry.uncompressed)?;
        }
        Ok(())
    }

    /// Reads an index side file written by [`BlockIndex::dump`], validating
    /// that boundaries increase strictly in both offsets.
    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let count = reader.read_u64::<LittleEndian>()?;
        let mut index = Self::new();
        for i in 0..count {
            let compressed = read_entry_word(reader, count, i)?;
            let uncompressed = read_entry_word(reader, count, i)?;
            let last = index.entries[index.entries.len() - 1];
            if compressed <= last.compressed || uncompressed <= last.uncompressed {
                return Err(IndexError::OutOfOrder(i as usize + 1).into());
            }
            index.entries.push(IndexEntry {
                uncompressed,
                compressed,
            });
        }
        Ok(index)
    }
}

fn read_entry_word<R: Read>(reader: &mut R, declared: u64, have: u64) -> Result<u64> {
    reader.read_u64::<LittleEndian>().map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => IndexError::Truncated(declared, have).into(),
        _ => Error::from(e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_index() -> BlockIndex {
        let mut index = BlockIndex::new();
        index.push(65536, 20000);
        index.push(131_072, 40000);
        index.push(196_608, 60000);
        index
    }

    // ==================== Query Tests ====================

    #[test]
    fn test_query_first_block() {
        let index = sample_index();
        let entry = index.query(0);
        assert_eq!(entry.compressed, 0);
        let entry = index.query(65535);
        assert_eq!(entry.compressed, 0);
    }

    #[test]
    fn test_query_exact_boundary_is_inclusive() {
        let index = sample_index();
        let entry = index.query(65536);
        assert_eq!(entry.compressed, 20000);
        assert_eq!(entry.uncompressed, 65536);
    }

    #[test]
    fn test_query_interior() {
        let index = sample_index();
        let entry = index.query(131_072 + 17);
        assert_eq!(entry.compressed, 40000);
    }

    #[test]
    fn test_query_past_end_resolves_to_last_block() {
        let index = sample_index();
        let entry = index.query(u64::MAX);
        assert_eq!(entry.compressed, 60000);
    }

    #[test]
    fn test_duplicate_push_ignored() {
        let mut index = sample_index();
        let before = index.len();
        index.push(196_608, 60000);
        assert_eq!(index.len(), before);
    }

    // ==================== Dump/Load Tests ====================

    #[test]
    fn test_dump_load_roundtrip() {
        let index = sample_index();
        let mut wire = Vec::new();
        index.dump(&mut wire).unwrap();
        // Count excludes the implicit first boundary.
        assert_eq!(wire.len(), 8 + 3 * 16);
        assert_eq!(u64::from_le_bytes(wire[0..8].try_into().unwrap()), 3);

        let loaded = BlockIndex::load(&mut Cursor::new(&wire)).unwrap();
        assert_eq!(loaded.len(), index.len());
        assert_eq!(loaded.query(70000), index.query(70000));
    }

    #[test]
    fn test_dump_trivial_index() {
        let index = BlockIndex::new();
        let mut wire = Vec::new();
        index.dump(&mut wire).unwrap();
        assert_eq!(wire, 0u64.to_le_bytes());
    }

    #[test]
    fn test_load_truncated() {
        let index = sample_index();
        let mut wire = Vec::new();
        index.dump(&mut wire).unwrap();
        wire.truncate(wire.len() - 4);
        let err = BlockIndex::load(&mut Cursor::new(&wire)).unwrap_err();
        assert!(matches!(
            err,
            Error::IndexError(IndexError::Truncated(3, 2))
        ));
    }

    #[test]
    fn test_load_out_of_order() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&2u64.to_le_bytes());
        wire.extend_from_slice(&40000u64.to_le_bytes());
        wire.extend_from_slice(&65536u64.to_le_bytes());
        wire.extend_from_slice(&20000u64.to_le_bytes());
        wire.extend_from_slice(&131_072u64.to_le_bytes());
        let err = BlockIndex::load(&mut Cursor::new(&wire)).unwrap_err();
        assert!(matches!(
            err,
            Error::IndexError(IndexError::OutOfOrder(2))
        ));
    }

    // ==================== Retrofit Build Tests ====================

    #[test]
    fn test_from_blocked_stream() {
        use flate2::Compression;

        let mut wire = Vec::new();
        let mut boundaries = vec![(0u64, 0u64)];
        let mut total_u = 0u64;
        for chunk in 0..4u8 {
            let payload = vec![chunk; 30_000];
            crate::block::encode_block(&payload, Compression::default(), &mut wire).unwrap();
            total_u += payload.len() as u64;
            boundaries.push((total_u, wire.len() as u64));
        }
        wire.extend_from_slice(&crate::block::EOF_BLOCK);

        let index = BlockIndex::from_blocked_stream(&mut Cursor::new(&wire)).unwrap();
        assert_eq!(index.len(), 5);
        for (entry, (u, c)) in index.iter().zip(&boundaries) {
            assert_eq!(entry.uncompressed, *u);
            assert_eq!(entry.compressed, *c);
        }
        assert_eq!(index.query(95_000).uncompressed, 90_000);
    }
}
