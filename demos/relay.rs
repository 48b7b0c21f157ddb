//! Interception relay - one proxied direction over in-memory pipes.
//!
//! This example demonstrates:
//! - Wiring a direction with `spawn_direction`
//! - Watching decoded messages through a `MessageTap`
//! - Editing a message body and letting the encoder fix the framing
//!
//! # Running
//!
//! ```sh
//! cargo run --example relay
//! ```

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tapwire::{Http1Encoder, LogicalMessage, MessageTap};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Tap that prints each message and blanks out request bodies.
struct RedactTap;

impl MessageTap for RedactTap {
    fn intercept(
        &mut self,
        mut message: LogicalMessage,
    ) -> Pin<Box<dyn Future<Output = LogicalMessage> + Send + '_>> {
        Box::pin(async move {
            if message.is_raw() {
                println!("[tap] raw unit, {} bytes", message.body.len());
            } else {
                println!(
                    "[tap] {} ({} body bytes)",
                    message.headline(),
                    message.body.len()
                );
                if !message.body.is_empty() {
                    message.body = Bytes::from_static(b"[redacted]");
                }
            }
            message
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The client application writes into one pipe, the origin server
    // reads from the other; the relay sits in between.
    let (mut client, app_side) = tokio::io::duplex(64 * 1024);
    let (mut origin, origin_side) = tokio::io::duplex(64 * 1024);

    let (pump, forward) =
        tapwire::pump::spawn_direction(app_side, origin_side, Http1Encoder::new(), RedactTap);

    client
        .write_all(b"POST /login HTTP/1.1\r\nHost: demo\r\nContent-Length: 9\r\n\r\nhunter2!!")
        .await?;
    drop(client);

    pump.await??;
    forward.await??;

    let mut forwarded = Vec::new();
    origin.read_to_end(&mut forwarded).await?;
    println!("--- origin received ---");
    println!("{}", String::from_utf8_lossy(&forwarded));

    Ok(())
}
