//! Line-oriented socket plumbing shared by the controller, nodes and clients.

use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncRead, AsyncReadExt, AsyncWriteExt, Lines};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;

/// Outbound half of a connection: lines queued here are written in order by
/// a dedicated task, so any handler can send without blocking on the socket.
pub type LineSender = mpsc::UnboundedSender<String>;

/// Spawn the writer task for a connection and hand back its queue.
/// The task exits (closing the write half) once every sender is dropped.
pub fn spawn_line_writer(mut half: OwnedWriteHalf) -> LineSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        while let Some(line) = rx.recv().await {
            if half.write_all(line.as_bytes()).await.is_err()
                || half.write_all(b"\n").await.is_err()
                || half.flush().await.is_err()
            {
                break;
            }
        }
    });
    tx
}

/// Read one line, bounding the wait. `Ok(None)` means the peer closed.
pub async fn read_line_timeout<R: AsyncBufRead + Unpin>(
    lines: &mut Lines<R>,
    limit: Duration,
) -> crate::Result<Option<String>> {
    match tokio::time::timeout(limit, lines.next_line()).await {
        Ok(res) => Ok(res?),
        Err(_) => Err(crate::Error::Timeout("waiting for a reply line".into())),
    }
}

/// Read exactly `size` payload bytes following a data-plane command.
pub async fn read_payload<R: AsyncRead + Unpin>(
    reader: &mut R,
    size: u64,
    limit: Duration,
) -> crate::Result<Vec<u8>> {
    let mut buf = vec![0u8; size as usize];
    tokio::time::timeout(limit, reader.read_exact(&mut buf))
        .await
        .map_err(|_| crate::Error::Timeout(format!("reading {} payload bytes", size)))??;
    Ok(buf)
}
