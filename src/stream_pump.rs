//! Outbound to client relay.
//!
//! Reads from the outbound stream and forwards to the client channel. Once a stream
//! is past its interactive phase, small chunks are coalesced into larger messages.
//! Sends are gated on the channel's buffered amount. Client to outbound traffic does
//! not pass through here.

use std::collections::VecDeque;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::debug;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::{Instant, sleep, sleep_until};

use crate::client_channel::ClientChannel;
use crate::stats::{Stats, add, incr};

pub const BUFFER_HIGH_WATERMARK: usize = 256 * 1024;
pub const BUFFER_LOW_WATERMARK: usize = 64 * 1024;
pub const MAX_QUEUE_SIZE: usize = 512;
pub const BACKPRESSURE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Below this many transferred bytes every chunk is sent as soon as it is read.
pub const THRESHOLD_MEDIUM: u64 = 1024 * 1024;
pub const THRESHOLD_BULK: u64 = 5 * 1024 * 1024;

pub const COALESCE_THRESHOLD: usize = 16 * 1024;
pub const COALESCE_MAX_SIZE: usize = 128 * 1024;
pub const COALESCE_TIMEOUT: Duration = Duration::from_millis(5);

const READ_SIZE_INTERACTIVE: usize = 16 * 1024;
const READ_SIZE_BALANCED: usize = 32 * 1024;
const READ_SIZE_BULK: usize = 64 * 1024;

pub fn read_size_for(bytes_transferred: u64) -> usize {
    if bytes_transferred > THRESHOLD_BULK {
        READ_SIZE_BULK
    } else if bytes_transferred > THRESHOLD_MEDIUM {
        READ_SIZE_BALANCED
    } else {
        READ_SIZE_INTERACTIVE
    }
}

/// Protocol bytes owed to the client ahead of the first reply. Taken at most once,
/// and shared by every connection attempt made for one stream.
#[derive(Debug, Default)]
pub struct ResponsePrefix(Mutex<Option<Bytes>>);

impl ResponsePrefix {
    pub fn new(prefix: Option<Bytes>) -> Self {
        Self(Mutex::new(prefix.filter(|p| !p.is_empty())))
    }

    pub fn is_pending(&self) -> bool {
        self.0.lock().is_some()
    }

    /// Prepends the prefix to `chunk` if it has not been sent yet.
    pub fn apply(&self, chunk: Bytes) -> Bytes {
        match self.0.lock().take() {
            Some(prefix) => {
                let mut combined = BytesMut::with_capacity(prefix.len() + chunk.len());
                combined.extend_from_slice(&prefix);
                combined.extend_from_slice(&chunk);
                combined.freeze()
            }
            None => chunk,
        }
    }
}

/// Frames waiting for the client channel. Full queues drop their oldest frame.
#[derive(Debug)]
pub struct SendQueue {
    frames: VecDeque<Bytes>,
    capacity: usize,
}

impl SendQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: VecDeque::new(),
            capacity,
        }
    }

    /// Returns the frame dropped to make room, if any.
    pub fn push(&mut self, frame: Bytes) -> Option<Bytes> {
        let dropped = if self.frames.len() >= self.capacity {
            self.frames.pop_front()
        } else {
            None
        };
        self.frames.push_back(frame);
        dropped
    }

    pub fn pop(&mut self) -> Option<Bytes> {
        self.frames.pop_front()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

#[derive(Debug, Default)]
struct Batch {
    chunks: Vec<Bytes>,
    size: usize,
    deadline: Option<Instant>,
}

impl Batch {
    fn push(&mut self, chunk: Bytes) {
        self.size += chunk.len();
        self.chunks.push(chunk);
        if self.deadline.is_none() {
            self.deadline = Some(Instant::now() + COALESCE_TIMEOUT);
        }
    }

    fn clear(&mut self) {
        self.chunks.clear();
        self.size = 0;
        self.deadline = None;
    }
}

/// How a pump run ended.
#[derive(Debug)]
pub enum PumpEnd {
    /// The client channel closed first. The outbound stream was not read to EOF.
    ClientClosed { had_incoming_data: bool },
    /// The outbound stream reached EOF after delivering data.
    RemoteClosed,
    /// The outbound stream ended before delivering a single byte.
    NoData,
    Failed(io::Error),
}

enum Flow {
    Continue,
    ChannelClosed,
}

pub struct StreamPump<'a> {
    channel: &'a dyn ClientChannel,
    prefix: &'a ResponsePrefix,
    stats: &'a Stats,
    label: &'a str,
    queue: SendQueue,
    batch: Batch,
    bytes_transferred: u64,
    has_incoming_data: bool,
}

impl<'a> StreamPump<'a> {
    pub fn new(
        channel: &'a dyn ClientChannel,
        prefix: &'a ResponsePrefix,
        stats: &'a Stats,
        label: &'a str,
    ) -> Self {
        Self {
            channel,
            prefix,
            stats,
            label,
            queue: SendQueue::new(MAX_QUEUE_SIZE),
            batch: Batch::default(),
            bytes_transferred: 0,
            has_incoming_data: false,
        }
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    pub async fn run<R>(&mut self, reader: &mut R) -> PumpEnd
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let channel = self.channel;
        let mut buf = BytesMut::new();

        let end = loop {
            buf.reserve(read_size_for(self.bytes_transferred));
            let deadline = self.batch.deadline;

            tokio::select! {
                biased;
                _ = channel.closed() => {
                    break PumpEnd::ClientClosed {
                        had_incoming_data: self.has_incoming_data,
                    };
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.flush_batch();
                    match self.flush_queue().await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::ChannelClosed) => {
                            break PumpEnd::ClientClosed {
                                had_incoming_data: self.has_incoming_data,
                            };
                        }
                        Err(e) => break PumpEnd::Failed(e),
                    }
                }
                result = reader.read_buf(&mut buf) => {
                    let n = match result {
                        Ok(n) => n,
                        Err(e) => break PumpEnd::Failed(e),
                    };
                    if n == 0 {
                        self.flush_batch();
                        break match self.flush_queue().await {
                            Err(e) => PumpEnd::Failed(e),
                            Ok(Flow::ChannelClosed) => PumpEnd::ClientClosed {
                                had_incoming_data: self.has_incoming_data,
                            },
                            Ok(Flow::Continue) if self.has_incoming_data => PumpEnd::RemoteClosed,
                            Ok(Flow::Continue) => PumpEnd::NoData,
                        };
                    }

                    self.has_incoming_data = true;
                    let chunk = self.prefix.apply(buf.split().freeze());
                    self.enqueue_chunk(chunk);
                    match self.flush_queue().await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::ChannelClosed) => {
                            break PumpEnd::ClientClosed {
                                had_incoming_data: true,
                            };
                        }
                        Err(e) => break PumpEnd::Failed(e),
                    }
                }
            }
        };

        if !matches!(end, PumpEnd::RemoteClosed | PumpEnd::NoData) {
            // Anything still waiting is abandoned with the stream.
            self.batch.clear();
            self.queue.clear();
        }

        debug!(
            "{}: remote connection closed, transferred {:.2}MB",
            self.label,
            self.bytes_transferred as f64 / 1024.0 / 1024.0
        );
        end
    }

    fn enqueue_chunk(&mut self, chunk: Bytes) {
        let interactive = self.bytes_transferred < THRESHOLD_MEDIUM;
        if !interactive && chunk.len() < COALESCE_THRESHOLD {
            self.batch.push(chunk);
            if self.batch.size >= COALESCE_MAX_SIZE {
                self.flush_batch();
            }
        } else {
            self.flush_batch();
            self.enqueue_frame(chunk);
        }
    }

    fn flush_batch(&mut self) {
        let chunks = std::mem::take(&mut self.batch.chunks);
        self.batch.clear();

        let frame = match chunks.len() {
            0 => return,
            1 => {
                incr(&self.stats.batch.unbatched);
                chunks.into_iter().next().unwrap_or_default()
            }
            n => {
                incr(&self.stats.batch.batched);
                add(&self.stats.batch.savings, n as u64 - 1);
                let mut combined = BytesMut::with_capacity(chunks.iter().map(Bytes::len).sum());
                for chunk in &chunks {
                    combined.extend_from_slice(chunk);
                }
                combined.freeze()
            }
        };
        self.enqueue_frame(frame);
    }

    fn enqueue_frame(&mut self, frame: Bytes) {
        if self.queue.push(frame).is_some() {
            incr(&self.stats.buffer.queue_overflows);
            debug!("{}: send queue overflow, dropped oldest frame", self.label);
        }
        incr(&self.stats.buffer.total_queued);
        self.stats.buffer.observe_queue_depth(self.queue.len());
    }

    async fn flush_queue(&mut self) -> io::Result<Flow> {
        while let Some(frame) = self.queue.pop() {
            if !self.channel.is_open() {
                self.queue.clear();
                return Ok(Flow::ChannelClosed);
            }

            if self.channel.buffered_amount() > BUFFER_HIGH_WATERMARK {
                incr(&self.stats.buffer.backpressure_events);
                if let Flow::ChannelClosed = self.wait_for_drain().await {
                    self.queue.clear();
                    return Ok(Flow::ChannelClosed);
                }
            }

            let len = frame.len() as u64;
            if let Err(e) = self.channel.send(frame) {
                self.queue.clear();
                return Err(e);
            }
            self.bytes_transferred += len;
            add(&self.stats.streaming.bytes, len);
        }
        Ok(Flow::Continue)
    }

    async fn wait_for_drain(&self) -> Flow {
        while self.channel.buffered_amount() > BUFFER_LOW_WATERMARK {
            tokio::select! {
                _ = sleep(BACKPRESSURE_POLL_INTERVAL) => {}
                _ = self.channel.closed() => return Flow::ChannelClosed,
            }
            if !self.channel.is_open() {
                return Flow::ChannelClosed;
            }
        }
        Flow::Continue
    }
}
