//! Backbone bridge over stdio: one JSON document per line.
//!
//! Lines read from stdin are deliveries (user messages or events) for the
//! relay. Messages the relay sends are written to stdout.

use rapidsms_relay::message::{BackboneEvent, Message};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

/// Parses deliveries from `reader` until EOF. Lines that do not parse are
/// logged and skipped.
pub async fn read_deliveries<R>(reader: R, deliveries: mpsc::Sender<BackboneEvent>) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<BackboneEvent>(line) {
            Ok(event) => {
                if deliveries.send(event).await.is_err() {
                    break;
                }
            }
            Err(e) => tracing::warn!(error = %e, "skipping malformed delivery"),
        }
    }
    Ok(())
}

/// Writes every outbound message to `writer` as a JSON line.
pub async fn write_outbound<W>(mut outbound: mpsc::Receiver<Message>, mut writer: W) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = outbound.recv().await {
        let mut line = serde_json::to_vec(&message)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}
