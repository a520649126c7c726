//! Asynchronous Sample Recorder
//!
//! A side channel that persists received sample chunks without touching the
//! hot path: producers hand chunks to a bounded queue and move on, a
//! dedicated thread drains the queue into a sink. When the queue is full the
//! chunk is dropped and the producer is told so; recording is lossy by
//! construction, the pipeline never waits for the disk.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use crossbeam_queue::ArrayQueue;
use num_complex::Complex32;
use tracing::{debug, error, warn};

use crate::config::RecorderConfig;
use crate::worker::pin_to_core;
use common::FrameId;

/// One recorded unit: the time-domain samples of a (frame, symbol, antenna).
#[derive(Debug, Clone)]
pub struct SampleChunk {
    pub frame_id: FrameId,
    pub symbol_id: u8,
    pub ant_id: u16,
    pub samples: Arc<[Complex32]>,
}

/// Recorder queue message.
enum RecordEvent {
    Record(SampleChunk),
    Terminate,
}

/// Destination of recorded chunks.
pub trait SampleSink: Send {
    /// Persist one chunk
    fn write_chunk(&mut self, chunk: &SampleChunk) -> std::io::Result<()>;

    /// Flush buffered output; called once at recorder shutdown
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Binary sink: a fixed header per chunk, then interleaved little-endian
/// f32 sample pairs.
pub struct WriteSink<W: Write + Send> {
    writer: W,
    buf: BytesMut,
}

impl<W: Write + Send> WriteSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, buf: BytesMut::new() }
    }
}

impl<W: Write + Send> SampleSink for WriteSink<W> {
    fn write_chunk(&mut self, chunk: &SampleChunk) -> std::io::Result<()> {
        self.buf.clear();
        self.buf.put_u32_le(chunk.frame_id);
        self.buf.put_u8(chunk.symbol_id);
        self.buf.put_u16_le(chunk.ant_id);
        self.buf.put_u32_le(chunk.samples.len() as u32);
        for s in chunk.samples.iter() {
            self.buf.put_f32_le(s.re);
            self.buf.put_f32_le(s.im);
        }
        self.writer.write_all(&self.buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

/// Sink that only counts, for tests and dry runs.
#[derive(Default)]
pub struct CountingSink {
    chunks: Arc<AtomicU64>,
    samples: Arc<AtomicU64>,
}

impl CountingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared counter handles, usable after the sink moved into the recorder
    pub fn counters(&self) -> (Arc<AtomicU64>, Arc<AtomicU64>) {
        (self.chunks.clone(), self.samples.clone())
    }
}

impl SampleSink for CountingSink {
    fn write_chunk(&mut self, chunk: &SampleChunk) -> std::io::Result<()> {
        self.chunks.fetch_add(1, Ordering::Relaxed);
        self.samples.fetch_add(chunk.samples.len() as u64, Ordering::Relaxed);
        Ok(())
    }
}

/// The recorder: bounded queue, optional wake signal, one drain thread.
pub struct RecorderThread {
    cfg: RecorderConfig,
    queue: Arc<ArrayQueue<RecordEvent>>,
    signal: Arc<(Mutex<bool>, Condvar)>,
    drops: AtomicU64,
    handle: Option<JoinHandle<()>>,
}

impl RecorderThread {
    pub fn new(cfg: RecorderConfig) -> Self {
        let queue = Arc::new(ArrayQueue::new(cfg.capacity));
        let signal = Arc::new((Mutex::new(false), Condvar::new()));
        Self { cfg, queue, signal, drops: AtomicU64::new(0), handle: None }
    }

    /// Spawn the drain thread over the given sink.
    pub fn start<S: SampleSink + 'static>(&mut self, sink: S) {
        debug_assert!(self.handle.is_none());
        let queue = self.queue.clone();
        let signal = self.signal.clone();
        let wait_signal = self.cfg.wait_signal;
        let core = self.cfg.core;

        let handle = std::thread::Builder::new()
            .name("recorder".to_string())
            .spawn(move || {
                if let Some(core) = core {
                    if !pin_to_core(core) {
                        warn!(core, "recorder pinning failed");
                    }
                }
                debug!("recorder started");
                let mut sink = sink;
                loop {
                    match queue.pop() {
                        Some(RecordEvent::Record(chunk)) => {
                            if let Err(e) = sink.write_chunk(&chunk) {
                                error!(error = %e, "recorder write failed, chunk lost");
                            }
                        }
                        Some(RecordEvent::Terminate) => break,
                        None => {
                            if wait_signal {
                                let (lock, cvar) = &*signal;
                                if let Ok(guard) = lock.lock() {
                                    // Timed wait so a missed notification
                                    // cannot park the thread forever
                                    let _ = cvar.wait_timeout(guard, Duration::from_millis(10));
                                }
                            } else {
                                std::thread::yield_now();
                            }
                        }
                    }
                }
                if let Err(e) = sink.flush() {
                    error!(error = %e, "recorder flush failed");
                }
                debug!("recorder stopped");
            })
            .expect("recorder thread spawn");
        self.handle = Some(handle);
    }

    /// Hand one chunk to the recorder. Never blocks: returns false and drops
    /// the chunk when the queue is full.
    pub fn dispatch(&self, chunk: SampleChunk) -> bool {
        if self.queue.push(RecordEvent::Record(chunk)).is_err() {
            let dropped = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
            warn!(dropped, "recorder queue full, dropping chunk");
            return false;
        }
        if self.cfg.wait_signal {
            self.notify();
        }
        true
    }

    /// Chunks dropped due to backpressure
    pub fn dropped(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    fn notify(&self) {
        let (_, cvar) = &*self.signal;
        cvar.notify_one();
    }

    /// Terminate and join the drain thread. Queued chunks ahead of the
    /// terminate marker are still written.
    pub fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        // The terminate marker must get through even when the queue is full
        let mut event = RecordEvent::Terminate;
        loop {
            match self.queue.push(event) {
                Ok(()) => break,
                Err(e) => {
                    event = e;
                    self.notify();
                    std::thread::yield_now();
                }
            }
        }
        self.notify();
        if handle.join().is_err() {
            warn!("recorder thread panicked");
        }
    }
}

impl Drop for RecorderThread {
    fn drop(&mut self) {
        self.stop();
    }
}
