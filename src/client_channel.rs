use std::io;

use async_trait::async_trait;
use bytes::Bytes;

/// Client-facing message channel. Each `send` becomes one binary message.
///
/// `buffered_amount` counts bytes accepted by `send` that have not reached the
/// transport yet. It is the only backpressure signal the relay gets from the client
/// side.
#[async_trait]
pub trait ClientChannel: Send + Sync {
    fn send(&self, data: Bytes) -> io::Result<()>;

    fn buffered_amount(&self) -> usize;

    fn is_open(&self) -> bool;

    /// Idempotent.
    fn close(&self);

    /// Resolves once the channel is closed from either side.
    async fn closed(&self);
}

/// Client-to-relay direction of the same connection: whole messages in arrival
/// order. `None` means the client finished the stream.
#[async_trait]
pub trait MessageSource: Send {
    async fn next_message(&mut self) -> io::Result<Option<Bytes>>;
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use parking_lot::Mutex;
    use tokio_util::sync::CancellationToken;

    use super::*;

    /// Records every message. The test drives `buffered_amount` directly.
    #[derive(Default)]
    pub struct RecordingChannel {
        pub sent: Mutex<Vec<Bytes>>,
        pub buffered: AtomicUsize,
        pub close_calls: AtomicUsize,
        token: CancellationToken,
    }

    impl RecordingChannel {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_buffered(&self, amount: usize) {
            self.buffered.store(amount, Ordering::SeqCst);
        }

        pub fn sent_count(&self) -> usize {
            self.sent.lock().len()
        }

        pub fn sent_bytes(&self) -> Vec<u8> {
            self.sent.lock().iter().flat_map(|b| b.iter().copied()).collect()
        }

        pub fn is_closed(&self) -> bool {
            self.token.is_cancelled()
        }
    }

    #[async_trait]
    impl ClientChannel for RecordingChannel {
        fn send(&self, data: Bytes) -> io::Result<()> {
            if self.token.is_cancelled() {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "channel is closed",
                ));
            }
            self.sent.lock().push(data);
            Ok(())
        }

        fn buffered_amount(&self) -> usize {
            self.buffered.load(Ordering::SeqCst)
        }

        fn is_open(&self) -> bool {
            !self.token.is_cancelled()
        }

        fn close(&self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.token.cancel();
        }

        async fn closed(&self) {
            self.token.cancelled().await
        }
    }

    /// Messages pushed by the test through the paired sender. Dropping the sender
    /// ends the stream.
    pub struct QueuedSource(pub tokio::sync::mpsc::UnboundedReceiver<Bytes>);

    impl QueuedSource {
        pub fn new() -> (tokio::sync::mpsc::UnboundedSender<Bytes>, Self) {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            (tx, Self(rx))
        }
    }

    #[async_trait]
    impl MessageSource for QueuedSource {
        async fn next_message(&mut self) -> io::Result<Option<Bytes>> {
            Ok(self.0.recv().await)
        }
    }
}
