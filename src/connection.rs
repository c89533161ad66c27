//! Framed connection plumbing shared by client and server.
//!
//! Each connection has a single writer task fed through an [`Outbox`], so
//! replies, cancellations and bulk frames from many tasks interleave at frame
//! boundaries only.

use crate::error::{KvError, Result};
use crate::protocol::{write_frame, Frame};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Frames queued per connection before senders wait
const OUTBOX_DEPTH: usize = 256;

/// Sending half of a connection
#[derive(Clone, Debug)]
pub struct Outbox {
    tx: mpsc::Sender<Frame>,
}

impl Outbox {
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.tx
            .send(frame)
            .await
            .map_err(|_| KvError::Connection("connection closed".to_string()))
    }
}

/// Spawn the task that owns the write half of a connection.
///
/// The task exits once every [`Outbox`] clone is dropped or a write fails.
pub fn spawn_writer<W>(mut writer: W) -> (Outbox, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::channel::<Frame>(OUTBOX_DEPTH);

    let task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &frame).await {
                tracing::warn!("Connection write failed: {}", e);
                break;
            }
        }
        let _ = writer.shutdown().await;
    });

    (Outbox { tx }, task)
}
