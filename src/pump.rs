//! Per-direction byte pump.
//!
//! One pump task drives one direction of one connection:
//!
//! ```text
//! source ──read──► Encoder ──pass_through──────────────► HandoffSender
//!                     │                                        │
//!                     └─available → decode → tap → encode──────┤
//!                                                              ▼
//! destination ◄──write── forward task ◄──────────────── HandoffReceiver
//! ```
//!
//! The pump owns its encoder; the hand-off queue is the only seam
//! between the protocol work and the socket writer, and the only point
//! that applies backpressure. Closing the queue is how either end learns
//! the direction is done.
//!
//! The [`MessageTap`] is where an interactive display hooks in: every
//! decoded message passes through it, edited or not, before re-encoding.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;

use crate::encoder::{Encoder, LogicalMessage};
use crate::error::Result;
use crate::handoff::{handoff_queue_default, HandoffReceiver, HandoffSender};

/// Read buffer size for the source endpoint.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Inspection seam for decoded messages.
///
/// Called once per unit, in order; the returned message is what gets
/// re-encoded and forwarded. Taps rewrite, they never drop.
pub trait MessageTap: Send {
    fn intercept(
        &mut self,
        message: LogicalMessage,
    ) -> Pin<Box<dyn Future<Output = LogicalMessage> + Send + '_>>;
}

/// Tap that forwards every message unchanged.
pub struct ForwardTap;

impl MessageTap for ForwardTap {
    fn intercept(
        &mut self,
        message: LogicalMessage,
    ) -> Pin<Box<dyn Future<Output = LogicalMessage> + Send + '_>> {
        Box::pin(async move { message })
    }
}

/// Drive one direction until the source closes or the queue drops.
///
/// The queue is closed on every exit path so the forward task always
/// sees end-of-stream.
pub async fn pump_loop<R, E, T>(
    mut source: R,
    mut encoder: E,
    mut tap: T,
    outbound: HandoffSender,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    E: Encoder,
    T: MessageTap,
{
    let result = drive(&mut source, &mut encoder, &mut tap, &outbound).await;
    outbound.close();
    if let Err(ref err) = result {
        tracing::debug!(encoder = encoder.name(), error = %err, "pump stopped");
    }
    result
}

async fn drive<R, E, T>(
    source: &mut R,
    encoder: &mut E,
    tap: &mut T,
    outbound: &HandoffSender,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    E: Encoder,
    T: MessageTap,
{
    // First cycle runs before any input so connection prologues go out
    // proactively.
    drain_cycle(encoder, tap, outbound).await?;

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => return Ok(()),
            Ok(n) => n,
            Err(err) => return Err(err.into()),
        };
        encoder.arrived(&buf[..n])?;
        drain_cycle(encoder, tap, outbound).await?;
    }
}

/// One pump cycle: unconditional bytes first, then every complete unit
/// through decode, tap and encode.
async fn drain_cycle<E, T>(encoder: &mut E, tap: &mut T, outbound: &HandoffSender) -> Result<()>
where
    E: Encoder,
    T: MessageTap,
{
    if let Some(bytes) = encoder.pass_through()? {
        outbound.put(bytes).await?;
    }
    while let Some(unit) = encoder.available()? {
        let message = encoder.decode(&unit)?;
        let message = tap.intercept(message).await;
        let wire = encoder.encode(message)?;
        if !wire.is_empty() {
            outbound.put(wire).await?;
        }
        // Encoding may have staged more unconditional bytes, and flow
        // credits may have released gated ones.
        if let Some(bytes) = encoder.pass_through()? {
            outbound.put(bytes).await?;
        }
    }
    Ok(())
}

/// Drain the hand-off queue into the destination endpoint.
///
/// Ends cleanly when the queue closes and its bytes are written; the
/// destination's write side is shut down to propagate end-of-stream.
pub async fn forward_loop<W>(mut queue: HandoffReceiver, mut destination: W) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = queue.read().await {
        destination.write_all(&chunk).await?;
        destination.flush().await?;
    }
    destination.shutdown().await?;
    Ok(())
}

/// Spawn the pump task for one direction.
pub fn spawn_pump_task<R, E, T>(
    source: R,
    encoder: E,
    tap: T,
    outbound: HandoffSender,
) -> JoinHandle<Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
    E: Encoder + 'static,
    T: MessageTap + 'static,
{
    tokio::spawn(pump_loop(source, encoder, tap, outbound))
}

/// Spawn the forward task for one direction.
pub fn spawn_forward_task<W>(queue: HandoffReceiver, destination: W) -> JoinHandle<Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(forward_loop(queue, destination))
}

/// Wire up one complete direction: source, encoder, tap, destination,
/// with a default-capacity hand-off queue in between.
pub fn spawn_direction<R, W, E, T>(
    source: R,
    destination: W,
    encoder: E,
    tap: T,
) -> (JoinHandle<Result<()>>, JoinHandle<Result<()>>)
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    E: Encoder + 'static,
    T: MessageTap + 'static,
{
    let (tx, rx) = handoff_queue_default();
    let pump = spawn_pump_task(source, encoder, tap, tx);
    let forward = spawn_forward_task(rx, destination);
    (pump, forward)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::{Framing, Http1Encoder, Http2Encoder, Role};
    use crate::protocol::PREFACE;
    use bytes::Bytes;

    /// Tap that swaps in a fixed body.
    struct ReplaceBody(&'static [u8]);

    impl MessageTap for ReplaceBody {
        fn intercept(
            &mut self,
            mut message: LogicalMessage,
        ) -> Pin<Box<dyn Future<Output = LogicalMessage> + Send + '_>> {
            if !message.is_raw() {
                message.body = Bytes::from_static(self.0);
            }
            Box::pin(async move { message })
        }
    }

    #[tokio::test]
    async fn test_pump_forwards_complete_requests() {
        let (mut near, far) = tokio::io::duplex(64 * 1024);
        let (mut out_read, out_write) = tokio::io::duplex(64 * 1024);
        let (pump, forward) = spawn_direction(far, out_write, Http1Encoder::new(), ForwardTap);

        near.write_all(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .await
            .unwrap();
        drop(near);

        pump.await.unwrap().unwrap();
        forward.await.unwrap().unwrap();

        let mut forwarded = Vec::new();
        out_read.read_to_end(&mut forwarded).await.unwrap();
        let text = String::from_utf8(forwarded).unwrap();
        assert!(text.starts_with("GET / HTTP/1.1\r\nHost: example.com\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[tokio::test]
    async fn test_pump_emits_prologue_before_any_input() {
        let (near, far) = tokio::io::duplex(64 * 1024);
        let (mut out_read, out_write) = tokio::io::duplex(64 * 1024);
        let (pump, forward) = spawn_direction(
            far,
            out_write,
            Http2Encoder::new(Role::ProxyClient),
            ForwardTap,
        );

        let mut prologue = vec![0u8; PREFACE.len()];
        out_read.read_exact(&mut prologue).await.unwrap();
        assert_eq!(&prologue[..], PREFACE);

        drop(near);
        pump.await.unwrap().unwrap();
        forward.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_tap_edit_reaches_the_wire() {
        let (mut near, far) = tokio::io::duplex(64 * 1024);
        let (mut out_read, out_write) = tokio::io::duplex(64 * 1024);
        let (pump, forward) = spawn_direction(
            far,
            out_write,
            Http1Encoder::new(),
            ReplaceBody(b"intercepted"),
        );

        near.write_all(b"POST /u HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        drop(near);

        pump.await.unwrap().unwrap();
        forward.await.unwrap().unwrap();

        let mut forwarded = Vec::new();
        out_read.read_to_end(&mut forwarded).await.unwrap();
        let text = String::from_utf8(forwarded).unwrap();
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\nintercepted"));
    }

    #[tokio::test]
    async fn test_forward_task_signals_end_of_stream() {
        let (tx, rx) = handoff_queue_default();
        let (mut out_read, out_write) = tokio::io::duplex(1024);
        let forward = spawn_forward_task(rx, out_write);

        tx.put(Bytes::from_static(b"last words")).await.unwrap();
        tx.close();
        forward.await.unwrap().unwrap();

        let mut forwarded = Vec::new();
        out_read.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(&forwarded[..], b"last words");
    }

    #[tokio::test]
    async fn test_pump_closes_queue_on_source_eof() {
        let (near, far) = tokio::io::duplex(1024);
        let (tx, mut rx) = handoff_queue_default();
        let pump = spawn_pump_task(far, Http1Encoder::new(), ForwardTap, tx);

        drop(near);
        pump.await.unwrap().unwrap();
        assert_eq!(rx.read().await, None);
    }

    #[tokio::test]
    async fn test_raw_passthrough_stays_byte_identical() {
        let (mut near, far) = tokio::io::duplex(1024);
        let (mut out_read, out_write) = tokio::io::duplex(1024);
        let (pump, forward) = spawn_direction(far, out_write, Http1Encoder::new(), ForwardTap);

        // Not HTTP at all: decode falls back to raw and the bytes are
        // relayed unmodified.
        let garbage = b"\x16\x03\x01\x00\x05hello\r\n\r\n";
        near.write_all(garbage).await.unwrap();
        drop(near);

        pump.await.unwrap().unwrap();
        forward.await.unwrap().unwrap();

        let mut forwarded = Vec::new();
        out_read.read_to_end(&mut forwarded).await.unwrap();
        assert_eq!(&forwarded[..], garbage);
    }

    #[tokio::test]
    async fn test_h2_units_flow_end_to_end() {
        use crate::protocol::{build_frame, flags, FrameKind};

        let (mut near, far) = tokio::io::duplex(64 * 1024);
        let (mut out_read, out_write) = tokio::io::duplex(64 * 1024);
        let (pump, forward) = spawn_direction(
            far,
            out_write,
            Http2Encoder::new(Role::ProxyServer),
            ForwardTap,
        );

        // custom-key: custom-header, literal with incremental indexing.
        let block: &[u8] = &[
            0x40, 0x0a, 0x63, 0x75, 0x73, 0x74, 0x6f, 0x6d, 0x2d, 0x6b, 0x65, 0x79, 0x0d,
            0x63, 0x75, 0x73, 0x74, 0x6f, 0x6d, 0x2d, 0x68, 0x65, 0x61, 0x64, 0x65, 0x72,
        ];
        near.write_all(&build_frame(FrameKind::Headers, flags::END_HEADERS, 1, block))
            .await
            .unwrap();
        near.write_all(&build_frame(FrameKind::Data, flags::END_STREAM, 1, b"hello"))
            .await
            .unwrap();
        drop(near);

        pump.await.unwrap().unwrap();
        forward.await.unwrap().unwrap();

        let mut forwarded = Vec::new();
        out_read.read_to_end(&mut forwarded).await.unwrap();
        // Prologue first, then the re-encoded stream; the DATA payload
        // survives the trip.
        assert!(forwarded.windows(5).any(|w| w == b"hello"));
    }
}
