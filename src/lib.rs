//! # tapwire
//!
//! Protocol multiplexing and interception pipeline for an interactive
//! MITM proxy core. Sits between two byte-oriented duplex endpoints
//! (supplied by the TLS/socket layer) and turns each direction's byte
//! stream into editable protocol units and back.
//!
//! ## Architecture
//!
//! One independent pipeline per connection per direction:
//!
//! ```text
//! source ──► pump ──► Encoder ──► hand-off queue ──► forward ──► destination
//!                       │  ▲
//!              decode   │  │   encode
//!                       ▼  │
//!                   LogicalMessage ◄──── tap (display / edit / resend)
//! ```
//!
//! - **protocol**: length-prefixed frame wire format, delimiter, codec
//! - **hpack**: order-sensitive header-compression contexts
//! - **mux**: frame classification, stream reassembly, send-side flow
//!   control
//! - **encoder**: the [`encoder::Encoder`] seam plus HTTP/2, HTTP/1.1
//!   and WebSocket implementations
//! - **handoff**: bounded byte queue between protocol work and socket
//!   writer
//! - **pump**: the per-direction tasks that tie it all together
//!
//! ## Example
//!
//! ```ignore
//! use tapwire::{pump::spawn_direction, ForwardTap, Http2Encoder, Role};
//!
//! #[tokio::main]
//! async fn main() -> tapwire::Result<()> {
//!     // `from_client` / `to_origin` are AsyncRead / AsyncWrite halves
//!     // handed over by the TLS layer.
//!     let encoder = Http2Encoder::new(Role::ProxyClient);
//!     let (pump, forward) =
//!         spawn_direction(from_client, to_origin, encoder, ForwardTap);
//!     pump.await??;
//!     forward.await??;
//!     Ok(())
//! }
//! ```

pub mod encoder;
pub mod error;
pub mod handoff;
pub mod hpack;
pub mod mux;
pub mod protocol;
pub mod pump;

pub use encoder::{
    Encoder, Framing, Http1Encoder, Http2Builder, Http2Encoder, LogicalMessage, ResendPolicy,
    Role, WebSocketEncoder,
};
pub use error::{Result, TapwireError};
pub use handoff::{
    handoff_queue, handoff_queue_default, HandoffReader, HandoffReceiver, HandoffSender,
};
pub use pump::{ForwardTap, MessageTap};
