//! Reader implementation for block-compressed streams.
//!
//! The reader is a cursor over one decompressed block at a time. Sequential
//! reads drain the current block and load the next; seeks jump to a block
//! boundary encoded in a [`VirtualOffset`] and reposition within the
//! decompressed payload. A [`BlockCache`] keeps recently decoded payloads
//! so seek-heavy access does not pay a decode per jump.
//!
//! Streams that are not block-compressed still open: ordinary gzip members
//! are inflated through a streaming decoder and uncompressed input passes
//! straight through, with seeking limited to what the shape of the stream
//! allows.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::mem;
use std::path::Path;
use std::sync::Arc;

use flate2::read::MultiGzDecoder;
use memchr::memchr;
use tracing::warn;

use crate::block::{self, RawBlock, StreamKind, EOF_BLOCK, HEADER_SIZE};
use crate::cache::BlockCache;
use crate::error::{MisuseError, Result};
use crate::index::BlockIndex;
use crate::pipeline::ReadPipeline;
use crate::pool::ThreadPool;
use crate::vpos::VirtualOffset;

/// Single-threaded engine over a blocked stream. Tracks the position of the
/// underlying reader so cache hits do not desynchronize it.
struct DirectEngine<R> {
    inner: R,
    pos: u64,
}

impl<R: Read + Seek> DirectEngine<R> {
    fn read_block_at(&mut self, coffset: u64) -> Result<Option<RawBlock>> {
        if self.pos != coffset {
            self.inner.seek(SeekFrom::Start(coffset))?;
            self.pos = coffset;
        }
        let raw = block::read_raw_block(&mut self.inner, coffset)?;
        if let Some(raw) = &raw {
            self.pos += raw.size_on_disk() as u64;
        }
        Ok(raw)
    }

    /// Checks for the terminal empty block at the end of the stream, then
    /// restores the read position.
    fn probe_eof(&mut self) -> Result<bool> {
        let len = self.inner.seek(SeekFrom::End(0))?;
        let ok = if len >= EOF_BLOCK.len() as u64 {
            self.inner.seek(SeekFrom::End(-(EOF_BLOCK.len() as i64)))?;
            let mut tail = [0u8; EOF_BLOCK.len()];
            self.inner.read_exact(&mut tail)?;
            tail == EOF_BLOCK
        } else {
            false
        };
        self.inner.seek(SeekFrom::Start(self.pos))?;
        Ok(ok)
    }
}

enum Engine<R> {
    /// Blocked stream, decoded inline on the calling thread.
    Direct(DirectEngine<R>),
    /// Blocked stream behind a parallel decode pipeline.
    Threaded(ReadPipeline),
    /// Ordinary gzip, inflated as one sequential stream.
    Gzip(Box<MultiGzDecoder<R>>),
    /// Uncompressed input.
    Plain(R),
    /// Transient state while the stream moves between engines.
    Detached,
}

/// Reader for block-compressed streams.
///
/// Requires `Seek` so the stream kind can be sniffed at open and so virtual
/// offsets can be honored; purely sequential sources can be wrapped in a
/// buffering adapter that provides it.
pub struct Reader<R: Read + Seek> {
    engine: Engine<R>,
    kind: StreamKind,
    /// Decompressed payload of the current block.
    block: Vec<u8>,
    /// Cursor within the current block.
    block_pos: usize,
    /// Compressed start of the current block.
    block_coffset: u64,
    /// Compressed offset at which the next block starts.
    next_coffset: u64,
    /// Whether the last decoded block had an empty payload.
    last_block_empty: bool,
    cache: BlockCache,
    index: Option<BlockIndex>,
    /// Byte position for the non-blocked fallbacks.
    raw_pos: u64,
    /// One-byte lookahead for the non-blocked fallbacks.
    peeked: Option<u8>,
    eof: bool,
}

impl Reader<BufReader<File>> {
    /// Opens a file and sniffs its stream kind.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read + Seek> Reader<R> {
    /// Wraps a stream, deciding from its first bytes whether it is blocked,
    /// ordinary gzip, or plain data.
    pub fn new(mut inner: R) -> Result<Self> {
        let mut prefix = [0u8; HEADER_SIZE];
        let mut filled = 0;
        while filled < prefix.len() {
            let n = inner.read(&mut prefix[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let kind = StreamKind::detect(&prefix[..filled]);
        inner.seek(SeekFrom::Start(0))?;

        let engine = match kind {
            StreamKind::Blocked => Engine::Direct(DirectEngine { inner, pos: 0 }),
            StreamKind::Gzip => Engine::Gzip(Box::new(MultiGzDecoder::new(inner))),
            StreamKind::Plain => Engine::Plain(inner),
        };
        Ok(Self {
            engine,
            kind,
            block: Vec::new(),
            block_pos: 0,
            block_coffset: 0,
            next_coffset: 0,
            last_block_empty: false,
            cache: BlockCache::new(0),
            index: None,
            raw_pos: 0,
            peeked: None,
            eof: false,
        })
    }

    /// The stream kind decided at open.
    #[must_use]
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Whether the stream supports virtual-offset seeking.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        self.kind == StreamKind::Blocked
    }

    /// Sets the byte budget of the decompressed block cache. The cache
    /// starts disabled; a nonzero budget makes repeated seeks into the same
    /// blocks skip their decode.
    pub fn set_cache_size(&mut self, bytes: usize) {
        self.cache.set_budget(bytes);
    }

    /// Reads up to `buf.len()` bytes, crossing block boundaries as needed.
    /// Returns 0 only at end of stream.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.is_blocked() {
            return self.read_fallback(buf);
        }
        let mut filled = 0;
        while filled < buf.len() {
            if !self.ensure_block()? {
                break;
            }
            let avail = &self.block[self.block_pos..];
            let take = avail.len().min(buf.len() - filled);
            buf[filled..filled + take].copy_from_slice(&avail[..take]);
            self.block_pos += take;
            filled += take;
        }
        Ok(filled)
    }

    /// Returns the next byte without consuming it, `None` at end of stream.
    pub fn peek(&mut self) -> Result<Option<u8>> {
        if self.is_blocked() {
            if !self.ensure_block()? {
                return Ok(None);
            }
            return Ok(Some(self.block[self.block_pos]));
        }
        if self.peeked.is_none() {
            let mut byte = [0u8; 1];
            if self.read_fallback(&mut byte)? == 0 {
                return Ok(None);
            }
            // Logically un-read it.
            self.raw_pos -= 1;
            self.peeked = Some(byte[0]);
        }
        Ok(self.peeked)
    }

    /// Appends bytes up to the next `delim` into `buf`, consuming but not
    /// storing the delimiter. A newline delimiter also trims one trailing
    /// carriage return, so CRLF input yields the same lines as LF input.
    /// Returns the line length, or `None` when the stream is exhausted
    /// before any byte is read.
    pub fn getline(&mut self, delim: u8, buf: &mut Vec<u8>) -> Result<Option<usize>> {
        buf.clear();
        let line = if self.is_blocked() {
            self.getline_blocked(delim, buf)?
        } else {
            self.getline_fallback(delim, buf)?
        };
        if line.is_none() {
            return Ok(None);
        }
        if delim == b'\n' && buf.last() == Some(&b'\r') {
            buf.pop();
        }
        Ok(Some(buf.len()))
    }

    fn getline_blocked(&mut self, delim: u8, buf: &mut Vec<u8>) -> Result<Option<usize>> {
        loop {
            if !self.ensure_block()? {
                return Ok(if buf.is_empty() { None } else { Some(buf.len()) });
            }
            let avail = &self.block[self.block_pos..];
            match memchr(delim, avail) {
                Some(at) => {
                    buf.extend_from_slice(&avail[..at]);
                    self.block_pos += at + 1;
                    return Ok(Some(buf.len()));
                }
                None => {
                    buf.extend_from_slice(avail);
                    self.block_pos = self.block.len();
                }
            }
        }
    }

    /// The virtual offset of the next byte to be read. For non-blocked
    /// streams this is the raw byte position.
    #[must_use]
    pub fn tell(&self) -> VirtualOffset {
        if self.is_blocked() {
            VirtualOffset::new(self.block_coffset, self.block_pos as u16)
        } else {
            VirtualOffset::from_raw(self.raw_pos)
        }
    }

    /// Repositions at a virtual offset previously produced by
    /// [`Reader::tell`] or by a writer. On a plain stream the offset is the
    /// raw byte position; ordinary gzip cannot seek at all.
    pub fn seek(&mut self, target: VirtualOffset) -> Result<()> {
        match &mut self.engine {
            Engine::Direct(_) | Engine::Threaded(_) => {}
            Engine::Plain(inner) => {
                inner.seek(SeekFrom::Start(target.raw()))?;
                self.raw_pos = target.raw();
                self.peeked = None;
                self.eof = false;
                return Ok(());
            }
            Engine::Gzip(_) => return Err(MisuseError::UnseekableStream.into()),
            Engine::Detached => return Err(MisuseError::Poisoned.into()),
        }

        let coffset = target.coffset();
        let uoffset = target.uoffset() as usize;
        if coffset == self.block_coffset && !self.block.is_empty() {
            // Same block: just move the cursor.
            if uoffset > self.block.len() {
                return Err(MisuseError::CursorBeyondBlock {
                    cursor: uoffset,
                    length: self.block.len(),
                }
                .into());
            }
            self.block_pos = uoffset;
            return Ok(());
        }
        self.jump_to_block(coffset)?;
        if uoffset == 0 {
            // The block loads lazily on the next read.
            return Ok(());
        }
        if !self.ensure_block()? || self.block_coffset != coffset {
            return Err(MisuseError::CursorBeyondBlock {
                cursor: uoffset,
                length: 0,
            }
            .into());
        }
        if uoffset > self.block.len() {
            return Err(MisuseError::CursorBeyondBlock {
                cursor: uoffset,
                length: self.block.len(),
            }
            .into());
        }
        self.block_pos = uoffset;
        Ok(())
    }

    /// Repositions at an uncompressed offset using the loaded index. A
    /// target past the end of the stream lands at EOF. The cursor into the
    /// queried block must fit its decoded payload; an index that disagrees
    /// with the stream about block extents is reported as
    /// [`MisuseError::CursorBeyondBlock`].
    pub fn useek(&mut self, utarget: u64) -> Result<()> {
        let Some(index) = &self.index else {
            return Err(MisuseError::MissingIndex.into());
        };
        let entry = index.query(utarget);
        self.seek(entry.virtual_offset())?;
        let remaining = utarget - entry.uncompressed;
        if remaining == 0 {
            return Ok(());
        }
        if !self.ensure_block()? {
            // Target beyond the end of the stream: stop at EOF.
            return Ok(());
        }
        if remaining > self.block.len() as u64 {
            return Err(MisuseError::CursorBeyondBlock {
                cursor: remaining as usize,
                length: self.block.len(),
            }
            .into());
        }
        self.block_pos = remaining as usize;
        Ok(())
    }

    /// Whether the underlying stream ends with the terminal empty block.
    /// Non-blocked streams have no terminal marker and report `true`.
    pub fn check_eof(&mut self) -> Result<bool> {
        match &mut self.engine {
            Engine::Direct(engine) => engine.probe_eof(),
            Engine::Threaded(pipeline) => pipeline.check_eof(),
            Engine::Gzip(_) | Engine::Plain(_) => Ok(true),
            Engine::Detached => Err(MisuseError::Poisoned.into()),
        }
    }

    /// Builds the random-access index by scanning the stream's block
    /// headers, leaving the read position untouched. Only available before
    /// a pool is attached.
    pub fn index_build(&mut self) -> Result<()> {
        match &mut self.engine {
            Engine::Direct(engine) => {
                let index = BlockIndex::from_blocked_stream(&mut engine.inner)?;
                engine.inner.seek(SeekFrom::Start(engine.pos))?;
                self.index = Some(index);
                Ok(())
            }
            Engine::Threaded(_) => Err(MisuseError::WrongMode {
                expected: "inline decoding",
                actual: "pipelined decoding",
            }
            .into()),
            _ => Err(MisuseError::UnseekableStream.into()),
        }
    }

    /// Loads an index side file for this stream.
    pub fn index_load<S: Read>(&mut self, src: &mut S) -> Result<()> {
        if !self.is_blocked() {
            return Err(MisuseError::UnseekableStream.into());
        }
        self.index = Some(BlockIndex::load(src)?);
        Ok(())
    }

    /// Writes the currently held index as a side file.
    pub fn index_dump<S: Write>(&self, sink: &mut S) -> Result<()> {
        match &self.index {
            Some(index) => index.dump(sink),
            None => Err(MisuseError::MissingIndex.into()),
        }
    }

    /// The loaded index, if any.
    #[must_use]
    pub fn index(&self) -> Option<&BlockIndex> {
        self.index.as_ref()
    }

    /// Loads the block at `coffset` into the cursor, consulting the cache.
    fn jump_to_block(&mut self, coffset: u64) -> Result<()> {
        self.block.clear();
        self.block_pos = 0;
        self.block_coffset = coffset;
        self.next_coffset = coffset;
        self.eof = false;
        if let Engine::Threaded(pipeline) = &mut self.engine {
            pipeline.seek(coffset)?;
        }
        Ok(())
    }

    /// Makes the cursor point at an unread byte, loading and skipping
    /// blocks as needed. Returns `false` at end of stream.
    fn ensure_block(&mut self) -> Result<bool> {
        while self.block_pos >= self.block.len() {
            if self.eof {
                return Ok(false);
            }
            match &mut self.engine {
                Engine::Direct(engine) => {
                    let coffset = self.next_coffset;
                    if let Some(size) = self.cache.fetch(coffset, &mut self.block) {
                        self.block_pos = 0;
                        self.block_coffset = coffset;
                        self.next_coffset = coffset + size as u64;
                        self.last_block_empty = self.block.is_empty();
                        continue;
                    }
                    match engine.read_block_at(coffset)? {
                        Some(raw) => {
                            self.block.clear();
                            self.block_pos = 0;
                            block::decode_block(&raw, &mut self.block)?;
                            self.block_coffset = coffset;
                            self.next_coffset = coffset + raw.size_on_disk() as u64;
                            self.last_block_empty = self.block.is_empty();
                            self.cache
                                .insert(coffset, &self.block, raw.size_on_disk());
                        }
                        None => {
                            if !self.last_block_empty {
                                warn!(
                                    coffset,
                                    "stream ended without the terminal empty block; possibly truncated"
                                );
                            }
                            self.eof = true;
                            return Ok(false);
                        }
                    }
                }
                Engine::Threaded(pipeline) => match pipeline.next_block()? {
                    Some(decoded) => {
                        self.block = decoded.payload;
                        self.block_pos = 0;
                        self.block_coffset = decoded.coffset;
                        self.next_coffset = decoded.coffset + decoded.size_on_disk as u64;
                    }
                    None => {
                        self.eof = true;
                        return Ok(false);
                    }
                },
                Engine::Gzip(_) | Engine::Plain(_) => unreachable!("fallback engines bypass blocks"),
                Engine::Detached => return Err(MisuseError::Poisoned.into()),
            }
        }
        Ok(true)
    }

    fn read_fallback(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut filled = 0;
        if let Some(byte) = self.peeked.take() {
            buf[0] = byte;
            filled = 1;
            self.raw_pos += 1;
        }
        let n = match &mut self.engine {
            Engine::Gzip(decoder) => decoder.read(&mut buf[filled..])?,
            Engine::Plain(inner) => inner.read(&mut buf[filled..])?,
            _ => 0,
        };
        self.raw_pos += n as u64;
        Ok(filled + n)
    }

    fn getline_fallback(&mut self, delim: u8, buf: &mut Vec<u8>) -> Result<Option<usize>> {
        let mut byte = [0u8; 1];
        loop {
            if self.read_fallback(&mut byte)? == 0 {
                return Ok(if buf.is_empty() { None } else { Some(buf.len()) });
            }
            if byte[0] == delim {
                return Ok(Some(buf.len()));
            }
            buf.push(byte[0]);
        }
    }
}

impl<R: Read + Seek + Send + 'static> Reader<R> {
    /// Moves the stream into a parallel decode pipeline backed by `pool`,
    /// with up to `queue_depth` blocks in flight. A no-op on non-blocked
    /// streams, which have nothing to parallelize.
    pub fn attach_pool(&mut self, pool: &Arc<ThreadPool>, queue_depth: usize) -> Result<()> {
        match mem::replace(&mut self.engine, Engine::Detached) {
            Engine::Direct(engine) => {
                self.engine = Engine::Threaded(ReadPipeline::spawn(
                    engine.inner,
                    self.next_coffset,
                    Arc::clone(pool),
                    queue_depth,
                ));
                Ok(())
            }
            other @ (Engine::Threaded(_) | Engine::Gzip(_) | Engine::Plain(_)) => {
                self.engine = other;
                Ok(())
            }
            Engine::Detached => Err(MisuseError::Poisoned.into()),
        }
    }
}

impl<R: Read + Seek> io::Read for Reader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Reader::read(self, buf).map_err(io::Error::other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::WriterBuilder;
    use std::io::Cursor;

    fn build_stream(payload: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut sink = Vec::new();
        let mut index = Vec::new();
        {
            let mut writer = WriterBuilder::default().build(&mut sink);
            writer.write(payload).unwrap();
            writer.finish().unwrap();
            writer.index_dump(&mut index).unwrap();
        }
        (sink, index)
    }

    // ==================== Sequential Read Tests ====================

    #[test]
    fn test_read_roundtrip_multiple_blocks() {
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 253) as u8).collect();
        let (wire, _) = build_stream(&payload);

        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        assert!(reader.is_blocked());
        let mut out = Vec::new();
        io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn test_read_after_eof_returns_zero() {
        let (wire, _) = build_stream(b"tiny");
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 4);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_peek_does_not_advance() {
        let (wire, _) = build_stream(b"peekaboo");
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        assert_eq!(reader.peek().unwrap(), Some(b'p'));
        assert_eq!(reader.peek().unwrap(), Some(b'p'));
        let mut buf = [0u8; 4];
        reader.read(&mut buf).unwrap();
        assert_eq!(&buf, b"peek");
    }

    #[test]
    fn test_getline() {
        let (wire, _) = build_stream(b"alpha\nbeta\ngamma");
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        let mut line = Vec::new();
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), Some(5));
        assert_eq!(line, b"alpha");
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), Some(4));
        assert_eq!(line, b"beta");
        // Final line has no delimiter.
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), Some(5));
        assert_eq!(line, b"gamma");
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), None);
    }

    #[test]
    fn test_getline_spanning_blocks() {
        let mut payload = vec![b'a'; block::MAX_BLOCK_PAYLOAD + 100];
        payload.push(b'\n');
        payload.extend_from_slice(b"tail");
        let (wire, _) = build_stream(&payload);
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        let mut line = Vec::new();
        assert_eq!(
            reader.getline(b'\n', &mut line).unwrap(),
            Some(block::MAX_BLOCK_PAYLOAD + 100)
        );
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), Some(4));
        assert_eq!(line, b"tail");
    }

    #[test]
    fn test_getline_trims_carriage_return() {
        let (wire, _) = build_stream(b"windows\r\nunix\nlast\r");
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        let mut line = Vec::new();
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), Some(7));
        assert_eq!(line, b"windows");
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), Some(4));
        assert_eq!(line, b"unix");
        // Trimmed even when the stream ends without a newline.
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), Some(4));
        assert_eq!(line, b"last");
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), None);
    }

    #[test]
    fn test_getline_keeps_carriage_return_for_other_delimiters() {
        let (wire, _) = build_stream(b"a\r\tb");
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        let mut line = Vec::new();
        assert_eq!(reader.getline(b'\t', &mut line).unwrap(), Some(2));
        assert_eq!(line, b"a\r");
    }

    // ==================== Tell/Seek Tests ====================

    #[test]
    fn test_tell_monotonic_while_reading() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 97) as u8).collect();
        let (wire, _) = build_stream(&payload);
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();

        let mut last = reader.tell();
        let mut buf = [0u8; 7001];
        while reader.read(&mut buf).unwrap() > 0 {
            let now = reader.tell();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_seek_restores_position() {
        let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 89) as u8).collect();
        let (wire, _) = build_stream(&payload);
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();

        let mut skip = vec![0u8; 80_000];
        io::Read::read_exact(&mut reader, &mut skip).unwrap();
        let mark = reader.tell();
        let mut first = vec![0u8; 1000];
        io::Read::read_exact(&mut reader, &mut first).unwrap();

        reader.seek(mark).unwrap();
        assert_eq!(reader.tell(), mark);
        let mut again = vec![0u8; 1000];
        io::Read::read_exact(&mut reader, &mut again).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_seek_is_idempotent() {
        let payload: Vec<u8> = (0..150_000u32).map(|i| (i % 83) as u8).collect();
        let (wire, _) = build_stream(&payload);
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        let mut skip = vec![0u8; 70_123];
        io::Read::read_exact(&mut reader, &mut skip).unwrap();
        let mark = reader.tell();
        reader.seek(mark).unwrap();
        reader.seek(mark).unwrap();
        assert_eq!(reader.tell(), mark);
    }

    #[test]
    fn test_seek_beyond_block_length_is_misuse() {
        let (wire, _) = build_stream(b"short");
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        assert!(matches!(
            reader.seek(VirtualOffset::new(0, 100)),
            Err(crate::Error::MisuseError(
                MisuseError::CursorBeyondBlock { cursor: 100, length: 5 }
            ))
        ));
    }

    // ==================== Index/useek Tests ====================

    #[test]
    fn test_useek_with_written_index() {
        let payload: Vec<u8> = (0..400_000u32).map(|i| (i % 241) as u8).collect();
        let (wire, index) = build_stream(&payload);
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        reader.index_load(&mut Cursor::new(index)).unwrap();

        let target = 2 * block::MAX_BLOCK_PAYLOAD as u64 + 17;
        reader.useek(target).unwrap();
        let mut buf = [0u8; 8];
        io::Read::read_exact(&mut reader, &mut buf).unwrap();
        let expected: Vec<u8> = (target..target + 8).map(|i| (i % 241) as u8).collect();
        assert_eq!(buf.to_vec(), expected);
    }

    #[test]
    fn test_useek_with_retrofit_index() {
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 199) as u8).collect();
        let (wire, _) = build_stream(&payload);
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        reader.index_build().unwrap();

        reader.useek(123_456).unwrap();
        let mut buf = [0u8; 4];
        io::Read::read_exact(&mut reader, &mut buf).unwrap();
        let expected: Vec<u8> = (123_456u64..123_460).map(|i| (i % 199) as u8).collect();
        assert_eq!(buf.to_vec(), expected);
    }

    #[test]
    fn test_useek_without_index_is_misuse() {
        let (wire, _) = build_stream(b"data");
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        assert!(matches!(
            reader.useek(0),
            Err(crate::Error::MisuseError(MisuseError::MissingIndex))
        ));
    }

    #[test]
    fn test_useek_past_end_lands_at_eof() {
        let payload = vec![b'e'; 10_000];
        let (wire, index) = build_stream(&payload);
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        reader.index_load(&mut Cursor::new(index)).unwrap();
        reader.useek(1_000_000).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_useek_index_stream_mismatch_detected() {
        let payload = vec![b'm'; block::MAX_BLOCK_PAYLOAD + 1000];
        let (wire, _) = build_stream(&payload);
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        // An index claiming the whole stream is one block: the cursor into
        // the first block would overrun its decoded payload.
        reader
            .index_load(&mut Cursor::new(0u64.to_le_bytes()))
            .unwrap();
        assert!(matches!(
            reader.useek(block::MAX_BLOCK_PAYLOAD as u64 + 500),
            Err(crate::Error::MisuseError(
                MisuseError::CursorBeyondBlock { .. }
            ))
        ));
    }

    // ==================== EOF/Corruption Tests ====================

    #[test]
    fn test_check_eof() {
        let (wire, _) = build_stream(b"complete");
        let mut reader = Reader::new(Cursor::new(wire.clone())).unwrap();
        assert!(reader.check_eof().unwrap());

        let mut truncated = wire;
        truncated.truncate(truncated.len() - EOF_BLOCK.len());
        let mut reader = Reader::new(Cursor::new(truncated)).unwrap();
        assert!(!reader.check_eof().unwrap());
    }

    #[test]
    fn test_corrupt_footer_crc_in_two_block_stream() {
        let payload = vec![b'c'; block::MAX_BLOCK_PAYLOAD + 500];
        let (mut wire, _) = build_stream(&payload);
        // Locate the second block and flip a bit in its footer CRC.
        let first_size = {
            let raw = block::read_raw_block(&mut Cursor::new(&wire), 0)
                .unwrap()
                .unwrap();
            raw.size_on_disk()
        };
        let second_size = {
            let mut cursor = Cursor::new(&wire[first_size..]);
            block::read_raw_block(&mut cursor, 0).unwrap().unwrap().size_on_disk()
        };
        let crc_pos = first_size + second_size - block::FOOTER_SIZE;
        wire[crc_pos] ^= 0x01;

        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        let mut out = Vec::new();
        let err = io::Read::read_to_end(&mut reader, &mut out).unwrap_err();
        let inner = err.into_inner().unwrap();
        let inner = inner.downcast::<crate::Error>().unwrap();
        assert!(matches!(
            *inner,
            crate::Error::ChecksumError { offset, .. } if offset == first_size as u64
        ));
    }

    // ==================== Fallback Tests ====================

    #[test]
    fn test_plain_passthrough() {
        let mut reader = Reader::new(Cursor::new(b"plain text data".to_vec())).unwrap();
        assert_eq!(reader.kind(), StreamKind::Plain);
        let mut out = Vec::new();
        io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert_eq!(out, b"plain text data");
    }

    #[test]
    fn test_plain_seek_and_peek() {
        let mut reader = Reader::new(Cursor::new(b"0123456789".to_vec())).unwrap();
        reader.seek(VirtualOffset::from_raw(4)).unwrap();
        assert_eq!(reader.peek().unwrap(), Some(b'4'));
        assert_eq!(reader.tell(), VirtualOffset::from_raw(4));
        let mut buf = [0u8; 2];
        reader.read(&mut buf).unwrap();
        assert_eq!(&buf, b"45");
    }

    #[test]
    fn test_ordinary_gzip_fallback() {
        use flate2::write::GzEncoder;
        use flate2::Compression;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        std::io::Write::write_all(&mut encoder, b"gzip without framing").unwrap();
        let wire = encoder.finish().unwrap();

        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        assert_eq!(reader.kind(), StreamKind::Gzip);
        assert!(!reader.is_blocked());
        let mut out = Vec::new();
        io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert_eq!(out, b"gzip without framing");

        assert!(matches!(
            reader.seek(VirtualOffset::from_raw(0)),
            Err(crate::Error::MisuseError(MisuseError::UnseekableStream))
        ));
    }

    #[test]
    fn test_getline_on_plain_stream() {
        let mut reader = Reader::new(Cursor::new(b"one\ntwo".to_vec())).unwrap();
        let mut line = Vec::new();
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), Some(3));
        assert_eq!(line, b"one");
        line.clear();
        assert_eq!(reader.getline(b'\n', &mut line).unwrap(), Some(3));
        assert_eq!(line, b"two");
    }

    // ==================== Threaded Tests ====================

    #[test]
    fn test_threaded_matches_single_threaded() {
        let payload: Vec<u8> = (0..500_000u32).map(|i| (i % 251) as u8).collect();
        let (wire, _) = build_stream(&payload);

        let mut st = Reader::new(Cursor::new(wire.clone())).unwrap();
        let mut st_out = Vec::new();
        io::Read::read_to_end(&mut st, &mut st_out).unwrap();

        let pool = ThreadPool::new(4);
        let mut mt = Reader::new(Cursor::new(wire)).unwrap();
        mt.attach_pool(&pool, 8).unwrap();
        let mut mt_out = Vec::new();
        io::Read::read_to_end(&mut mt, &mut mt_out).unwrap();

        assert_eq!(st_out, mt_out);
    }

    #[test]
    fn test_threaded_seek() {
        let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 239) as u8).collect();
        let (wire, _) = build_stream(&payload);
        let pool = ThreadPool::new(2);
        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        reader.attach_pool(&pool, 4).unwrap();

        let mut skip = vec![0u8; 100_000];
        io::Read::read_exact(&mut reader, &mut skip).unwrap();
        let mark = reader.tell();
        let mut first = vec![0u8; 500];
        io::Read::read_exact(&mut reader, &mut first).unwrap();

        reader.seek(mark).unwrap();
        let mut again = vec![0u8; 500];
        io::Read::read_exact(&mut reader, &mut again).unwrap();
        assert_eq!(first, again);
    }

    #[test]
    fn test_attach_pool_on_plain_stream_is_noop() {
        let pool = ThreadPool::new(2);
        let mut reader = Reader::new(Cursor::new(b"still plain".to_vec())).unwrap();
        reader.attach_pool(&pool, 4).unwrap();
        let mut out = Vec::new();
        io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert_eq!(out, b"still plain");
    }

    // ==================== Append/Interior Empty Block Tests ====================

    #[test]
    fn test_interior_empty_blocks_are_skipped() {
        // Two finished streams back to back, as append mode produces.
        let (mut wire, _) = build_stream(b"first half ");
        let (second, _) = build_stream(b"and second");
        wire.extend_from_slice(&second);

        let mut reader = Reader::new(Cursor::new(wire)).unwrap();
        let mut out = Vec::new();
        io::Read::read_to_end(&mut reader, &mut out).unwrap();
        assert_eq!(out, b"first half and second");
    }
}
