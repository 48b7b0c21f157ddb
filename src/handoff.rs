//! Bounded hand-off queue between the frame-processing side of a
//! direction and its forwarding consumer.
//!
//! Each proxied connection owns two of these queues, one per direction.
//! The producer side pushes re-encoded wire bytes with [`HandoffSender::put`],
//! which blocks once the configured byte budget is full. The consumer side
//! drains chunks with [`HandoffReceiver::read`] and writes them to the peer
//! socket. Closing the queue is terminal: further puts fail, reads drain
//! whatever is still buffered and then return `None`.
//!
//! # Example
//!
//! ```
//! use tapwire::handoff::handoff_queue;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let (tx, mut rx) = handoff_queue(1024);
//! tx.put(bytes::Bytes::from_static(b"frame bytes")).await.unwrap();
//! tx.close();
//!
//! assert_eq!(rx.read().await.as_deref(), Some(&b"frame bytes"[..]));
//! assert!(rx.read().await.is_none());
//! # }
//! ```

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant, Sleep};

use crate::error::{Result, TapwireError};

/// Default queue capacity in bytes.
///
/// Matches the largest frame payload a peer may send before window
/// updates are required, so one direction can never buffer more than a
/// full flow-control window ahead of its consumer.
pub const DEFAULT_CAPACITY: usize = 65_535;

/// Interval between capacity checks while a put or read is waiting.
const CHECK_INTERVAL: Duration = Duration::from_micros(100);

/// State shared between the two ends of a queue.
#[derive(Debug)]
struct Shared {
    /// Bytes currently buffered (sent but not yet read).
    queued: AtomicUsize,
    /// Terminal close flag, settable from either end.
    closed: AtomicBool,
    /// Maximum buffered bytes before `put` blocks.
    capacity: usize,
}

/// Create a bounded byte queue with the given capacity.
///
/// Returns the producer and consumer ends.
pub fn handoff_queue(capacity: usize) -> (HandoffSender, HandoffReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared {
        queued: AtomicUsize::new(0),
        closed: AtomicBool::new(false),
        capacity: capacity.max(1),
    });

    (
        HandoffSender {
            tx,
            shared: shared.clone(),
        },
        HandoffReceiver { rx, shared },
    )
}

/// Create a queue with the default capacity.
pub fn handoff_queue_default() -> (HandoffSender, HandoffReceiver) {
    handoff_queue(DEFAULT_CAPACITY)
}

/// Producer end of a hand-off queue.
///
/// Cheaply cloneable; all clones feed the same receiver.
#[derive(Debug, Clone)]
pub struct HandoffSender {
    tx: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
}

impl HandoffSender {
    /// Push bytes into the queue, waiting while the byte budget is full.
    ///
    /// Chunks larger than the queue capacity are split so they can
    /// stream through as the consumer drains. Returns
    /// [`TapwireError::ChannelClosed`] once the queue has been closed
    /// from either end.
    pub async fn put(&self, data: Bytes) -> Result<()> {
        if data.is_empty() {
            return self.check_open();
        }

        let mut rest = data;
        while !rest.is_empty() {
            let take = rest.len().min(self.shared.capacity);
            let chunk = rest.split_to(take);

            self.wait_for_space(chunk.len()).await?;
            self.shared.queued.fetch_add(chunk.len(), Ordering::AcqRel);
            if self.tx.send(chunk).is_err() {
                self.shared.queued.fetch_sub(take, Ordering::Release);
                return Err(TapwireError::ChannelClosed);
            }
        }
        Ok(())
    }

    /// Wait until `len` more bytes fit, polling the shared counter.
    async fn wait_for_space(&self, len: usize) -> Result<()> {
        loop {
            self.check_open()?;
            if self.shared.queued.load(Ordering::Acquire) + len <= self.shared.capacity {
                return Ok(());
            }
            tokio::time::sleep(CHECK_INTERVAL).await;
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(TapwireError::ChannelClosed);
        }
        Ok(())
    }

    /// Close the queue.
    ///
    /// Subsequent puts fail; buffered chunks remain readable until the
    /// receiver drains them and sees end-of-input. Waiters on a full
    /// queue are woken with an error.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    /// Whether the queue has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Bytes currently buffered.
    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }

    /// Queue capacity in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }
}

/// Consumer end of a hand-off queue.
#[derive(Debug)]
pub struct HandoffReceiver {
    rx: mpsc::UnboundedReceiver<Bytes>,
    shared: Arc<Shared>,
}

impl HandoffReceiver {
    /// Read the next chunk.
    ///
    /// Waits while the queue is open but empty. Returns `None` once the
    /// queue is closed and fully drained; this is the end-of-input
    /// signal for the forwarding consumer.
    pub async fn read(&mut self) -> Option<Bytes> {
        loop {
            match self.rx.try_recv() {
                Ok(chunk) => {
                    self.shared.queued.fetch_sub(chunk.len(), Ordering::Release);
                    return Some(chunk);
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {
                    if self.shared.closed.load(Ordering::Acquire) {
                        return None;
                    }
                    tokio::time::sleep(CHECK_INTERVAL).await;
                }
            }
        }
    }

    /// Take the next chunk if one is already buffered, without waiting.
    pub fn try_read(&mut self) -> Option<Bytes> {
        match self.rx.try_recv() {
            Ok(chunk) => {
                self.shared.queued.fetch_sub(chunk.len(), Ordering::Release);
                Some(chunk)
            }
            Err(_) => None,
        }
    }

    /// Whether the queue is closed with nothing left to drain.
    pub fn is_terminated(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
            && self.shared.queued.load(Ordering::Acquire) == 0
    }

    /// Adapt this receiver into an [`AsyncRead`] byte stream.
    ///
    /// Lets the forwarding side of a direction be driven by anything that
    /// consumes `AsyncRead`, such as `tokio::io::copy` into the peer
    /// socket. End-of-input surfaces as a zero-byte read once the queue
    /// is closed and drained.
    pub fn into_reader(self) -> HandoffReader {
        HandoffReader {
            receiver: self,
            pending: Bytes::new(),
            poll_delay: Box::pin(sleep(CHECK_INTERVAL)),
        }
    }

    /// Close the queue from the consumer side.
    ///
    /// Producers blocked in [`HandoffSender::put`] are woken with an
    /// error; no further data is accepted.
    pub fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }

    /// Whether the queue has been closed.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Bytes currently buffered.
    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.shared.queued.load(Ordering::Acquire)
    }
}

/// [`AsyncRead`] adapter over a [`HandoffReceiver`].
#[derive(Debug)]
pub struct HandoffReader {
    receiver: HandoffReceiver,
    /// Remainder of a chunk the caller's buffer could not hold.
    pending: Bytes,
    poll_delay: Pin<Box<Sleep>>,
}

impl AsyncRead for HandoffReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.pending.is_empty() {
                let take = this.pending.len().min(buf.remaining());
                buf.put_slice(&this.pending.split_to(take));
                return Poll::Ready(Ok(()));
            }
            if let Some(chunk) = this.receiver.try_read() {
                this.pending = chunk;
                continue;
            }
            if this.receiver.is_terminated() {
                return Poll::Ready(Ok(()));
            }
            this.poll_delay
                .as_mut()
                .reset(Instant::now() + CHECK_INTERVAL);
            match this.poll_delay.as_mut().poll(cx) {
                Poll::Ready(()) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_put_then_read() {
        let (tx, mut rx) = handoff_queue(1024);

        tx.put(Bytes::from_static(b"hello")).await.unwrap();
        let chunk = rx.read().await.unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert_eq!(rx.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_preserves_order() {
        let (tx, mut rx) = handoff_queue(1024);

        for i in 0..10u8 {
            tx.put(Bytes::copy_from_slice(&[i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(rx.read().await.unwrap()[0], i);
        }
    }

    #[tokio::test]
    async fn test_put_blocks_when_full() {
        let (tx, mut rx) = handoff_queue(8);

        tx.put(Bytes::from_static(b"123456")).await.unwrap();

        // Only 2 bytes of budget left; a 6-byte put must wait.
        let blocked = tokio::time::timeout(
            Duration::from_millis(20),
            tx.put(Bytes::from_static(b"abcdef")),
        )
        .await;
        assert!(blocked.is_err(), "put should still be waiting");

        // Draining the queue lets the same put complete.
        let drain = tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 12 {
                let chunk = rx.read().await.unwrap();
                seen.extend_from_slice(&chunk);
            }
            seen
        });

        tx.put(Bytes::from_static(b"abcdef")).await.unwrap();
        let seen = drain.await.unwrap();
        assert_eq!(&seen[..], b"123456abcdef");
    }

    #[tokio::test]
    async fn test_oversized_put_streams_through() {
        let (tx, mut rx) = handoff_queue(4);

        let producer = tokio::spawn(async move {
            tx.put(Bytes::from_static(b"0123456789")).await.unwrap();
            tx.close();
        });

        let mut seen = Vec::new();
        while let Some(chunk) = rx.read().await {
            assert!(chunk.len() <= 4);
            seen.extend_from_slice(&chunk);
        }
        producer.await.unwrap();
        assert_eq!(&seen[..], b"0123456789");
    }

    #[tokio::test]
    async fn test_put_after_close_fails() {
        let (tx, _rx) = handoff_queue(1024);

        tx.close();
        let err = tx.put(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, TapwireError::ChannelClosed));
    }

    #[tokio::test]
    async fn test_close_drains_then_eof() {
        let (tx, mut rx) = handoff_queue(1024);

        tx.put(Bytes::from_static(b"first")).await.unwrap();
        tx.put(Bytes::from_static(b"second")).await.unwrap();
        tx.close();

        assert_eq!(rx.read().await.as_deref(), Some(&b"first"[..]));
        assert_eq!(rx.read().await.as_deref(), Some(&b"second"[..]));
        assert!(rx.read().await.is_none());
        assert!(rx.read().await.is_none());
    }

    #[tokio::test]
    async fn test_close_wakes_blocked_reader() {
        let (tx, mut rx) = handoff_queue(1024);

        let reader = tokio::spawn(async move { rx.read().await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        tx.close();

        let got = tokio::time::timeout(Duration::from_millis(200), reader)
            .await
            .expect("reader should wake on close")
            .unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn test_receiver_close_wakes_blocked_writer() {
        let (tx, rx) = handoff_queue(4);

        tx.put(Bytes::from_static(b"full")).await.unwrap();

        let tx2 = tx.clone();
        let writer = tokio::spawn(async move { tx2.put(Bytes::from_static(b"more")).await });

        tokio::time::sleep(Duration::from_millis(5)).await;
        rx.close();

        let got = tokio::time::timeout(Duration::from_millis(200), writer)
            .await
            .expect("writer should wake on close")
            .unwrap();
        assert!(matches!(got, Err(TapwireError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_queued_bytes_accounting() {
        let (tx, mut rx) = handoff_queue(1024);

        tx.put(Bytes::from_static(b"12345678")).await.unwrap();
        assert_eq!(tx.queued_bytes(), 8);

        rx.read().await.unwrap();
        assert_eq!(tx.queued_bytes(), 0);
    }

    #[tokio::test]
    async fn test_empty_put_is_noop() {
        let (tx, _rx) = handoff_queue(16);

        tx.put(Bytes::new()).await.unwrap();
        assert_eq!(tx.queued_bytes(), 0);

        tx.close();
        assert!(tx.put(Bytes::new()).await.is_err());
    }

    #[tokio::test]
    async fn test_reader_adapter_streams_all_bytes() {
        let (tx, rx) = handoff_queue(8);
        let mut reader = rx.into_reader();

        let producer = tokio::spawn(async move {
            tx.put(Bytes::from_static(b"frame one ")).await.unwrap();
            tx.put(Bytes::from_static(b"frame two")).await.unwrap();
            tx.close();
        });

        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        producer.await.unwrap();
        assert_eq!(&out[..], b"frame one frame two");
    }

    #[tokio::test]
    async fn test_reader_adapter_handles_small_destination() {
        let (tx, rx) = handoff_queue(64);
        tx.put(Bytes::from_static(b"abcdef")).await.unwrap();
        tx.close();

        let mut reader = rx.into_reader();
        let mut buf = [0u8; 4];
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
        let n = reader.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ef");
        assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_try_read_never_waits() {
        let (tx, mut rx) = handoff_queue(64);

        assert!(rx.try_read().is_none());
        tx.put(Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(rx.try_read().as_deref(), Some(&b"x"[..]));
        assert!(rx.try_read().is_none());
        assert!(!rx.is_terminated());

        tx.close();
        assert!(rx.is_terminated());
    }
}
