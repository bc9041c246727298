//! Multi-threaded block pipelines.
//!
//! Both directions share the same shape: block codec work fans out onto a
//! shared [`ThreadPool`], while a dedicated thread owns the underlying
//! stream and keeps the blocks in order. Ordering is preserved without any
//! reordering buffer by queuing one single-use result channel per block on
//! a bounded queue: the queue carries the blocks' order, the per-block
//! channels carry their contents whenever the workers get to them.
//!
//! The reading side additionally services a command mailbox so seeks and
//! EOF probes reach the thread that owns the stream. A seek bumps a
//! generation counter on both sides of the queue, letting the consumer
//! discard blocks that were in flight when the seek happened.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, select, Receiver, Sender};
use flate2::Compression;
use tracing::{debug, warn};

use crate::block::{self, EOF_BLOCK};
use crate::error::{Error, MisuseError, Result};
use crate::index::BlockIndex;
use crate::pool::ThreadPool;

/// Blocks written between flushes of the underlying sink, bounding how much
/// finished output can sit in stdio buffers if the process dies.
const SINK_FLUSH_INTERVAL: usize = 64;

fn disconnected() -> Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "block pipeline terminated").into()
}

// ---------------------------------------------------------------------------
// Reading
// ---------------------------------------------------------------------------

/// One decompressed block handed to the consumer, with enough framing
/// information to reconstruct virtual offsets.
#[derive(Debug)]
pub struct DecodedBlock {
    pub coffset: u64,
    pub size_on_disk: usize,
    pub payload: Vec<u8>,
}

enum BlockItem {
    Data(DecodedBlock),
    Eof,
    Failed(Error),
}

enum ReadCommand {
    Seek { coffset: u64 },
    CheckEof { ack: Sender<Result<bool>> },
}

/// Prefetching, parallel-decoding source of decompressed blocks.
pub struct ReadPipeline {
    cmd_tx: Sender<ReadCommand>,
    results_rx: Receiver<(u64, Receiver<BlockItem>)>,
    generation: u64,
    io_thread: Option<JoinHandle<()>>,
}

impl ReadPipeline {
    /// Takes ownership of `reader` and starts prefetching at `coffset`.
    /// Up to `queue_depth` blocks are in flight at any time.
    pub fn spawn<R>(
        reader: R,
        coffset: u64,
        pool: Arc<ThreadPool>,
        queue_depth: usize,
    ) -> Self
    where
        R: Read + Seek + Send + 'static,
    {
        let queue_depth = queue_depth.max(1);
        let (cmd_tx, cmd_rx) = bounded(1);
        let (results_tx, results_rx) = bounded(queue_depth);
        let io_thread = thread::spawn(move || {
            debug!(coffset, queue_depth, "read pipeline started");
            io_loop(reader, coffset, &pool, &cmd_rx, &results_tx);
            debug!("read pipeline stopped");
        });
        Self {
            cmd_tx,
            results_rx,
            generation: 0,
            io_thread: Some(io_thread),
        }
    }

    /// Delivers the next block in stream order, `None` at end of stream.
    /// Empty interior blocks are skipped here so consumers only ever see
    /// payload-bearing blocks or the end of the stream.
    pub fn next_block(&mut self) -> Result<Option<DecodedBlock>> {
        loop {
            let (generation, block_rx) =
                self.results_rx.recv().map_err(|_| disconnected())?;
            if generation < self.generation {
                continue;
            }
            match block_rx.recv().map_err(|_| disconnected())? {
                BlockItem::Data(block) if block.payload.is_empty() => {}
                BlockItem::Data(block) => return Ok(Some(block)),
                BlockItem::Eof => return Ok(None),
                BlockItem::Failed(e) => return Err(e),
            }
        }
    }

    /// Repositions the stream at a compressed block boundary. Blocks that
    /// were in flight before the seek are discarded on delivery.
    pub fn seek(&mut self, coffset: u64) -> Result<()> {
        self.generation += 1;
        self.cmd_tx
            .send(ReadCommand::Seek { coffset })
            .map_err(|_| disconnected())
    }

    /// Asks the stream owner whether the underlying stream ends with the
    /// terminal empty block.
    pub fn check_eof(&mut self) -> Result<bool> {
        let (ack, ack_rx) = bounded(1);
        self.cmd_tx
            .send(ReadCommand::CheckEof { ack })
            .map_err(|_| disconnected())?;
        ack_rx.recv().map_err(|_| disconnected())?
    }
}

impl Drop for ReadPipeline {
    fn drop(&mut self) {
        // Disconnecting both channels unblocks the io thread wherever it is.
        let (dead_tx, _) = bounded(1);
        self.cmd_tx = dead_tx;
        let (_, dead_rx) = bounded(1);
        self.results_rx = dead_rx;
        if let Some(handle) = self.io_thread.take() {
            let _ = handle.join();
        }
    }
}

fn io_loop<R: Read + Seek + Send>(
    mut reader: R,
    mut coffset: u64,
    pool: &ThreadPool,
    cmd_rx: &Receiver<ReadCommand>,
    results_tx: &Sender<(u64, Receiver<BlockItem>)>,
) {
    let mut generation = 0u64;
    let mut finished = false;
    let mut saw_terminal = false;
    let mut pending: Option<Receiver<BlockItem>> = None;

    if let Err(e) = reader.seek(SeekFrom::Start(coffset)) {
        finished = true;
        pending = Some(failed_item(e.into()));
    }

    loop {
        let item = match pending.take() {
            Some(item) => item,
            None => next_item(&mut reader, &mut coffset, &mut finished, &mut saw_terminal, pool),
        };
        select! {
            recv(cmd_rx) -> cmd => match cmd {
                Ok(ReadCommand::Seek { coffset: target }) => {
                    // The undelivered item predates the seek: drop it.
                    generation += 1;
                    finished = false;
                    saw_terminal = false;
                    coffset = target;
                    if let Err(e) = reader.seek(SeekFrom::Start(target)) {
                        // Surface the failure through the next delivery.
                        finished = true;
                        pending = Some(failed_item(e.into()));
                    }
                }
                Ok(ReadCommand::CheckEof { ack }) => {
                    let _ = ack.send(probe_eof(&mut reader, coffset));
                    // The probed block is still valid: hold it for delivery.
                    pending = Some(item);
                }
                Err(_) => return,
            },
            send(results_tx, (generation, item)) -> res => {
                if res.is_err() {
                    return;
                }
            }
        }
    }
}

/// Frames the next block and schedules its decode, or synthesizes an EOF
/// sentinel once the stream is exhausted. The returned channel yields the
/// block whenever its worker finishes.
fn next_item<R: Read>(
    reader: &mut R,
    coffset: &mut u64,
    finished: &mut bool,
    saw_terminal: &mut bool,
    pool: &ThreadPool,
) -> Receiver<BlockItem> {
    if *finished {
        return eof_item();
    }
    match block::read_raw_block(reader, *coffset) {
        Ok(Some(raw)) => {
            *coffset += raw.size_on_disk() as u64;
            *saw_terminal = raw.declared_payload_len() == 0;
            let (tx, rx) = bounded(1);
            pool.spawn(move || {
                let mut payload = Vec::new();
                let item = match block::decode_block(&raw, &mut payload) {
                    Ok(()) => BlockItem::Data(DecodedBlock {
                        coffset: raw.coffset,
                        size_on_disk: raw.size_on_disk(),
                        payload,
                    }),
                    Err(e) => BlockItem::Failed(e),
                };
                let _ = tx.send(item);
            });
            rx
        }
        Ok(None) => {
            if !*saw_terminal {
                warn!(
                    coffset = *coffset,
                    "stream ended without the terminal empty block; possibly truncated"
                );
            }
            *finished = true;
            eof_item()
        }
        Err(e) => {
            *finished = true;
            failed_item(e)
        }
    }
}

fn eof_item() -> Receiver<BlockItem> {
    let (tx, rx) = bounded(1);
    let _ = tx.send(BlockItem::Eof);
    rx
}

fn failed_item(e: Error) -> Receiver<BlockItem> {
    let (tx, rx) = bounded(1);
    let _ = tx.send(BlockItem::Failed(e));
    rx
}

/// Checks for the terminal empty block at the end of the stream, then
/// restores the read position.
fn probe_eof<R: Read + Seek>(reader: &mut R, coffset: u64) -> Result<bool> {
    let len = reader.seek(SeekFrom::End(0))?;
    let ok = if len >= EOF_BLOCK.len() as u64 {
        reader.seek(SeekFrom::End(-(EOF_BLOCK.len() as i64)))?;
        let mut tail = [0u8; EOF_BLOCK.len()];
        reader.read_exact(&mut tail)?;
        tail == EOF_BLOCK
    } else {
        false
    };
    reader.seek(SeekFrom::Start(coffset))?;
    Ok(ok)
}

// ---------------------------------------------------------------------------
// Writing
// ---------------------------------------------------------------------------

struct EncodedBlock {
    frame: Vec<u8>,
    payload_len: usize,
}

enum WriteItem<W> {
    Block(Receiver<Result<EncodedBlock>>),
    Flush(Sender<Result<FlushPoint>>),
    Finish(Sender<Result<(W, FlushPoint)>>),
}

/// Exact stream offsets at a drain point of the write pipeline.
#[derive(Debug, Clone, Copy)]
pub struct FlushPoint {
    /// Compressed bytes written so far, where the next block will start.
    pub coffset: u64,
    /// Total decompressed bytes accepted so far.
    pub utotal: u64,
}

/// Parallel-encoding, order-preserving sink of block payloads.
pub struct WritePipeline<W> {
    queue_tx: Option<Sender<WriteItem<W>>>,
    pool: Arc<ThreadPool>,
    level: Compression,
    writer_thread: Option<JoinHandle<()>>,
}

impl<W: Write + Send + 'static> WritePipeline<W> {
    /// Takes ownership of `writer`, which has `coffset` compressed and
    /// `utotal` decompressed bytes already behind it (both zero for a fresh
    /// stream). Boundaries of finished blocks are appended to `index`.
    pub fn spawn(
        writer: W,
        coffset: u64,
        utotal: u64,
        level: Compression,
        pool: Arc<ThreadPool>,
        queue_depth: usize,
        index: Arc<Mutex<BlockIndex>>,
    ) -> Self {
        let queue_depth = queue_depth.max(1);
        let (queue_tx, queue_rx) = bounded(queue_depth);
        let writer_thread = thread::spawn(move || {
            debug!(coffset, queue_depth, "write pipeline started");
            drain_loop(writer, coffset, utotal, &queue_rx, &index);
            debug!("write pipeline stopped");
        });
        Self {
            queue_tx: Some(queue_tx),
            pool,
            level,
            writer_thread: Some(writer_thread),
        }
    }
}

// Only spawning moves the sink across threads; a pipeline handle itself
// works for any sink type.
impl<W: Write> WritePipeline<W> {
    fn queue(&self) -> Result<&Sender<WriteItem<W>>> {
        self.queue_tx.as_ref().ok_or_else(disconnected)
    }

    /// Schedules one block payload for encoding and ordered emission.
    /// Applies backpressure once `queue_depth` blocks are in flight.
    pub fn submit(&mut self, payload: Vec<u8>) -> Result<()> {
        let (tx, rx) = bounded(1);
        let level = self.level;
        self.pool.spawn(move || {
            let payload_len = payload.len();
            let mut frame = Vec::with_capacity(payload_len / 2 + 64);
            let item = block::encode_block(&payload, level, &mut frame)
                .map(|()| EncodedBlock { frame, payload_len });
            let _ = tx.send(item);
        });
        self.queue()?
            .send(WriteItem::Block(rx))
            .map_err(|_| disconnected())
    }

    /// Drains every in-flight block to the sink and flushes it, returning
    /// the exact stream offsets. Any error from earlier blocks surfaces
    /// here.
    pub fn flush(&mut self) -> Result<FlushPoint> {
        let (ack, ack_rx) = bounded(1);
        self.queue()?
            .send(WriteItem::Flush(ack))
            .map_err(|_| disconnected())?;
        ack_rx.recv().map_err(|_| disconnected())?
    }

    /// Drains the pipeline, appends the terminal empty block, flushes, and
    /// hands the sink back.
    pub fn finish(&mut self) -> Result<(W, FlushPoint)> {
        let (ack, ack_rx) = bounded(1);
        self.queue()?
            .send(WriteItem::Finish(ack))
            .map_err(|_| disconnected())?;
        self.queue_tx = None;
        let out = ack_rx.recv().map_err(|_| disconnected())?;
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
        out
    }
}

impl<W> Drop for WritePipeline<W> {
    fn drop(&mut self) {
        self.queue_tx = None;
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }
    }
}

fn drain_loop<W: Write>(
    writer: W,
    mut coffset: u64,
    mut utotal: u64,
    queue_rx: &Receiver<WriteItem<W>>,
    index: &Mutex<BlockIndex>,
) {
    let mut writer = Some(writer);
    let mut sticky: Option<Error> = None;
    let mut unflushed_blocks = 0usize;

    while let Ok(item) = queue_rx.recv() {
        match item {
            WriteItem::Block(rx) => {
                if sticky.is_some() {
                    continue;
                }
                let encoded = match rx.recv() {
                    Ok(Ok(encoded)) => encoded,
                    Ok(Err(e)) => {
                        sticky = Some(e);
                        continue;
                    }
                    Err(_) => {
                        sticky = Some(disconnected());
                        continue;
                    }
                };
                let Some(w) = writer.as_mut() else { continue };
                if let Err(e) = w.write_all(&encoded.frame) {
                    sticky = Some(e.into());
                    continue;
                }
                coffset += encoded.frame.len() as u64;
                utotal += encoded.payload_len as u64;
                if let Ok(mut index) = index.lock() {
                    index.push(utotal, coffset);
                }
                unflushed_blocks += 1;
                if unflushed_blocks >= SINK_FLUSH_INTERVAL {
                    if let Err(e) = w.flush() {
                        sticky = Some(e.into());
                    }
                    unflushed_blocks = 0;
                }
            }
            WriteItem::Flush(ack) => {
                let result = match take_sticky(&mut sticky) {
                    Some(e) => Err(e),
                    None => match writer.as_mut() {
                        Some(w) => {
                            unflushed_blocks = 0;
                            w.flush()
                                .map(|()| FlushPoint { coffset, utotal })
                                .map_err(Error::from)
                        }
                        None => Err(disconnected()),
                    },
                };
                let _ = ack.send(result);
            }
            WriteItem::Finish(ack) => {
                let result = match take_sticky(&mut sticky) {
                    Some(e) => Err(e),
                    None => finish_sink(&mut writer, &mut coffset, utotal),
                };
                let _ = ack.send(result);
                return;
            }
        }
    }
}

fn finish_sink<W: Write>(
    writer: &mut Option<W>,
    coffset: &mut u64,
    utotal: u64,
) -> Result<(W, FlushPoint)> {
    let mut w = writer.take().ok_or_else(disconnected)?;
    w.write_all(&EOF_BLOCK)?;
    *coffset += EOF_BLOCK.len() as u64;
    w.flush()?;
    Ok((
        w,
        FlushPoint {
            coffset: *coffset,
            utotal,
        },
    ))
}

/// Hands out a sticky error once, poisoning the pipeline for later callers.
fn take_sticky(sticky: &mut Option<Error>) -> Option<Error> {
    let taken = sticky.take()?;
    *sticky = Some(MisuseError::Poisoned.into());
    Some(taken)
}
