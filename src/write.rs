//! Writer implementation for block-compressed streams.
//!
//! The writer accumulates bytes into a block-sized buffer and emits one
//! complete, independently decompressible block each time the buffer fills
//! or the stream is flushed. Finishing a stream appends the terminal empty
//! block so readers can tell a complete stream from a truncated one.
//!
//! A writer starts single-threaded; attaching a [`ThreadPool`] moves the
//! underlying sink into a [`WritePipeline`] that compresses blocks on the
//! pool while preserving their order on disk.
//!
//! # Example
//!
//! ```rust,no_run
//! use blockgz::WriterBuilder;
//! use std::fs::File;
//!
//! let file = File::create("example.gz").unwrap();
//! let mut writer = WriterBuilder::default().build(file);
//! writer.write(b"hello block world").unwrap();
//! writer.finish().unwrap();
//! ```

use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::mem;
use std::path::Path;
use std::sync::{Arc, Mutex};

use flate2::Compression;

use crate::block::{self, EOF_BLOCK, MAX_BLOCK_PAYLOAD};
use crate::error::{MisuseError, Result};
use crate::index::BlockIndex;
use crate::pipeline::WritePipeline;
use crate::pool::ThreadPool;
use crate::vpos::VirtualOffset;

/// A builder for creating configured [`Writer`] instances.
#[derive(Default)]
pub struct WriterBuilder {
    /// Compression level, `None` for the zlib default
    level: Option<u32>,
    /// Bypass block framing and write the payload through unchanged
    plain: bool,
}

impl WriterBuilder {
    /// Sets the compression level, `0` for stored (uncompressed) blocks
    /// through `9` for best compression. Unset means the zlib default.
    #[must_use]
    pub fn level(mut self, level: u32) -> Self {
        self.level = Some(level.min(9));
        self
    }

    /// Writes the payload through without any framing or compression. The
    /// resulting stream is not seekable.
    #[must_use]
    pub fn plain(mut self, plain: bool) -> Self {
        self.plain = plain;
        self
    }

    fn compression(&self) -> Compression {
        match self.level {
            Some(level) => Compression::new(level),
            None => Compression::default(),
        }
    }

    /// Builds a [`Writer`] over an arbitrary sink.
    pub fn build<W: Write>(self, inner: W) -> Writer<W> {
        let engine = if self.plain {
            Engine::Plain(inner)
        } else {
            Engine::Direct(inner)
        };
        Writer::from_engine(engine, self.compression(), 0, 0, true)
    }

    /// Creates `path` and builds a buffered [`Writer`] over it.
    pub fn create<P: AsRef<Path>>(self, path: P) -> Result<Writer<BufWriter<File>>> {
        let file = File::create(path)?;
        Ok(self.build(BufWriter::new(file)))
    }

    /// Opens `path` for appending. New blocks land after the existing
    /// content, including any terminal block already present; readers skip
    /// such interior empty blocks. The incremental index is unavailable in
    /// this mode because the uncompressed extent of the existing content is
    /// unknown.
    pub fn append<P: AsRef<Path>>(self, path: P) -> Result<Writer<BufWriter<File>>> {
        let existing = std::fs::metadata(&path)?.len();
        let file = OpenOptions::new().append(true).open(path)?;
        let engine = if self.plain {
            Engine::Plain(BufWriter::new(file))
        } else {
            Engine::Direct(BufWriter::new(file))
        };
        Ok(Writer::from_engine(
            engine,
            self.compression(),
            existing,
            0,
            false,
        ))
    }
}

enum Engine<W> {
    /// Compress blocks inline on the calling thread.
    Direct(W),
    /// No framing: bytes pass straight through.
    Plain(W),
    /// Blocks fan out to a worker pool, a drain thread owns the sink.
    Threaded(WritePipeline<W>),
    /// Transient state while the sink moves between engines.
    Detached,
}

/// Writer for block-compressed streams.
pub struct Writer<W: Write> {
    engine: Engine<W>,
    /// Payload accumulated for the block in progress.
    ubuf: Vec<u8>,
    /// Reusable frame buffer for inline compression.
    zbuf: Vec<u8>,
    level: Compression,
    /// Compressed bytes behind the next block. Exact between blocks when
    /// single-threaded, exact at flush points when threaded.
    coffset: u64,
    /// Decompressed bytes emitted into finished blocks.
    utotal: u64,
    index: Arc<Mutex<BlockIndex>>,
    indexing: bool,
    finished: bool,
}

impl<W: Write> Writer<W> {
    fn from_engine(
        engine: Engine<W>,
        level: Compression,
        coffset: u64,
        utotal: u64,
        indexing: bool,
    ) -> Self {
        Self {
            engine,
            ubuf: Vec::with_capacity(MAX_BLOCK_PAYLOAD),
            zbuf: Vec::new(),
            level,
            coffset,
            utotal,
            index: Arc::new(Mutex::new(BlockIndex::new())),
            indexing,
            finished: false,
        }
    }

    /// Appends `data` to the stream, emitting complete blocks as the
    /// accumulation buffer fills. Always consumes all of `data`.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.finished {
            return Err(MisuseError::Finished.into());
        }
        if let Engine::Plain(w) = &mut self.engine {
            w.write_all(data)?;
            self.coffset += data.len() as u64;
            self.utotal += data.len() as u64;
            return Ok(data.len());
        }
        let mut rest = data;
        while !rest.is_empty() {
            let room = MAX_BLOCK_PAYLOAD - self.ubuf.len();
            let take = room.min(rest.len());
            self.ubuf.extend_from_slice(&rest[..take]);
            rest = &rest[take..];
            if self.ubuf.len() == MAX_BLOCK_PAYLOAD {
                self.flush_block()?;
            }
        }
        Ok(data.len())
    }

    /// Emits any partial block and flushes the underlying sink. After a
    /// flush, [`Writer::tell`] is exact even in threaded mode.
    pub fn flush(&mut self) -> Result<()> {
        if self.finished {
            return Err(MisuseError::Finished.into());
        }
        self.flush_block()?;
        match &mut self.engine {
            Engine::Direct(w) | Engine::Plain(w) => w.flush()?,
            Engine::Threaded(pipeline) => {
                let point = pipeline.flush()?;
                self.coffset = point.coffset;
                self.utotal = point.utotal;
            }
            Engine::Detached => return Err(MisuseError::Poisoned.into()),
        }
        Ok(())
    }

    /// Completes the stream: drains pending blocks, appends the terminal
    /// empty block, and flushes the sink. Further writes are rejected.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        self.flush_block()?;
        if let Engine::Threaded(pipeline) = &mut self.engine {
            let (w, point) = pipeline.finish()?;
            self.coffset = point.coffset;
            self.utotal = point.utotal;
            self.engine = Engine::Direct(w);
        } else {
            match &mut self.engine {
                Engine::Direct(w) => {
                    w.write_all(&EOF_BLOCK)?;
                    self.coffset += EOF_BLOCK.len() as u64;
                    w.flush()?;
                }
                Engine::Plain(w) => w.flush()?,
                Engine::Threaded(_) | Engine::Detached => {}
            }
        }
        self.finished = true;
        Ok(())
    }

    /// The virtual offset at which the next written byte will land. Exact
    /// whenever no blocks are in flight, so threaded writers should flush
    /// before relying on it.
    #[must_use]
    pub fn tell(&self) -> VirtualOffset {
        VirtualOffset::new(self.coffset, self.ubuf.len() as u16)
    }

    /// Total decompressed bytes emitted into finished blocks.
    #[must_use]
    pub fn uncompressed_len(&self) -> u64 {
        self.utotal
    }

    /// Writes the side-file index of the blocks emitted so far. Call after
    /// [`Writer::finish`] for an index covering the whole stream.
    pub fn index_dump<S: Write>(&self, sink: &mut S) -> Result<()> {
        if !self.indexing {
            return Err(MisuseError::MissingIndex.into());
        }
        match self.index.lock() {
            Ok(index) => index.dump(sink),
            Err(_) => Err(MisuseError::Poisoned.into()),
        }
    }

    fn flush_block(&mut self) -> Result<()> {
        if self.ubuf.is_empty() {
            return Ok(());
        }
        match &mut self.engine {
            Engine::Direct(w) => {
                self.zbuf.clear();
                block::encode_block(&self.ubuf, self.level, &mut self.zbuf)?;
                w.write_all(&self.zbuf)?;
                self.coffset += self.zbuf.len() as u64;
                self.utotal += self.ubuf.len() as u64;
                if self.indexing {
                    if let Ok(mut index) = self.index.lock() {
                        index.push(self.utotal, self.coffset);
                    }
                }
                self.ubuf.clear();
            }
            Engine::Threaded(pipeline) => {
                let payload = mem::take(&mut self.ubuf);
                pipeline.submit(payload)?;
            }
            Engine::Plain(_) => {}
            Engine::Detached => return Err(MisuseError::Poisoned.into()),
        }
        Ok(())
    }
}

impl<W: Write + Send + 'static> Writer<W> {
    /// Moves the sink into a parallel write pipeline backed by `pool`. Up
    /// to `queue_depth` blocks are compressed concurrently. A no-op on
    /// plain-mode writers.
    pub fn attach_pool(&mut self, pool: &Arc<ThreadPool>, queue_depth: usize) -> Result<()> {
        if self.finished {
            return Err(MisuseError::Finished.into());
        }
        match mem::replace(&mut self.engine, Engine::Detached) {
            Engine::Direct(w) => {
                // Append mode keeps its index disabled; the pipeline's
                // boundary pushes land in a detached index it never reads.
                let index = if self.indexing {
                    Arc::clone(&self.index)
                } else {
                    Arc::new(Mutex::new(BlockIndex::new()))
                };
                self.engine = Engine::Threaded(WritePipeline::spawn(
                    w,
                    self.coffset,
                    self.utotal,
                    self.level,
                    Arc::clone(pool),
                    queue_depth,
                    index,
                ));
                Ok(())
            }
            other @ (Engine::Plain(_) | Engine::Threaded(_)) => {
                self.engine = other;
                Ok(())
            }
            Engine::Detached => Err(MisuseError::Poisoned.into()),
        }
    }
}

impl<W: Write> io::Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Writer::write(self, buf).map_err(io::Error::other)
    }

    fn flush(&mut self) -> io::Result<()> {
        Writer::flush(self).map_err(io::Error::other)
    }
}

impl<W: Write> Drop for Writer<W> {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.finish();
        }
    }
}
