//! Outbound frame transport
//!
//! The host never talks to the webview directly; it hands frames to a
//! [`FrameSink`]. Once the webview is disposed, sends fail with
//! [`TransportError::Closed`] and callers treat that as a no-op.

use crate::error::TransportError;
use crate::frame::{InboundFrame, OutboundFrame};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;

pub trait FrameSink: Send + Sync {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportError>;
}

/// Sink backed by an unbounded channel; the receiving half is owned by
/// whatever actually writes to the webview (or by a test).
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<OutboundFrame>,
    disposed: AtomicBool,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                disposed: AtomicBool::new(false),
            },
            rx,
        )
    }

    /// Mark the view as gone. Later sends fail even if the receiver is alive.
    pub fn dispose(&self) {
        self.disposed.store(true, Ordering::Relaxed);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Relaxed) || self.tx.is_closed()
    }
}

impl FrameSink for ChannelSink {
    fn send(&self, frame: OutboundFrame) -> Result<(), TransportError> {
        if self.disposed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        self.tx.send(frame).map_err(|_| TransportError::Closed)
    }
}

/// Write frames as newline-delimited JSON until the channel closes.
pub async fn write_frames<W>(
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut writer: W,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = rx.recv().await {
        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    Ok(())
}

/// Parse one inbound line. Blank lines yield `None`.
pub fn parse_inbound_line(line: &str) -> Result<Option<InboundFrame>, serde_json::Error> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed).map(Some)
}

/// Read newline-delimited inbound frames from stdin, forwarding each parsed
/// frame to `on_frame`. Malformed lines are logged and skipped.
pub async fn read_stdin_frames<F, Fut>(mut on_frame: F) -> Result<(), TransportError>
where
    F: FnMut(InboundFrame) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_inbound_line(&line) {
            Ok(Some(frame)) => on_frame(frame).await,
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "dropping malformed inbound frame"),
        }
    }
    tracing::info!("stdin closed, stopping frame reader");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_channel_sink_rejects_after_dispose() {
        let (sink, mut rx) = ChannelSink::new();
        sink.send(OutboundFrame::response("r1", json!(null)))
            .expect("send before dispose");
        assert!(rx.try_recv().is_ok());

        sink.dispose();
        assert!(sink.is_disposed());
        let err = sink
            .send(OutboundFrame::response("r2", json!(null)))
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[test]
    fn test_channel_sink_closed_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        assert!(sink.is_disposed());
        assert!(sink.send(OutboundFrame::Command { data: json!({}) }).is_err());
    }

    #[test]
    fn test_parse_inbound_line() {
        assert!(parse_inbound_line("   ").unwrap().is_none());
        let frame = parse_inbound_line(r#"{"type":"tasks.list","requestId":"r4"}"#)
            .unwrap()
            .unwrap();
        assert_eq!(frame.kind, "tasks.list");
        assert!(parse_inbound_line("{not json").is_err());
    }

    #[tokio::test]
    async fn test_write_frames_emits_json_lines() {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(OutboundFrame::response("r1", json!({"ok": true})))
            .unwrap();
        tx.send(OutboundFrame::error("r2", "HANDLER_ERROR", "boom"))
            .unwrap();
        drop(tx);

        let mut out: Vec<u8> = Vec::new();
        write_frames(rx, &mut out).await.unwrap();

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["requestId"], "r1");
        let second: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second["error"]["message"], "boom");
    }
}
