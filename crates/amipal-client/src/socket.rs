use crate::sink::{Direction, TrafficRecord, TrafficSink};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

pub(crate) async fn connect(host: &str, port: u16, timeout: Duration) -> io::Result<TcpStream> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {host}:{port} timed out"),
            ))
        }
    };
    stream.set_nodelay(true)?;
    Ok(stream)
}

pub(crate) fn record_traffic(sink: &dyn TrafficSink, direction: Direction, bytes: &[u8]) {
    if let Err(err) = sink.record(&TrafficRecord::new(direction, bytes)) {
        debug!(event = "ami_sink_error", error = %err);
    }
}

/// Sends queued command frames in FIFO order until shutdown, then flushes
/// whatever is still queued so a trailing `Logoff` reaches the peer.
pub(crate) async fn writer_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Vec<u8>>,
    mut shutdown: watch::Receiver<bool>,
    write_timeout: Duration,
    sink: Arc<dyn TrafficSink>,
) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else {
                    break;
                };
                if !write_frame(&mut writer, &frame, write_timeout, sink.as_ref()).await {
                    return;
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    while let Ok(frame) = rx.try_recv() {
        if !write_frame(&mut writer, &frame, write_timeout, sink.as_ref()).await {
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn write_frame(
    writer: &mut OwnedWriteHalf,
    frame: &[u8],
    write_timeout: Duration,
    sink: &dyn TrafficSink,
) -> bool {
    record_traffic(sink, Direction::Outbound, frame);
    let send = async {
        writer.write_all(frame).await?;
        writer.flush().await
    };
    match tokio::time::timeout(write_timeout, send).await {
        Ok(Ok(())) => true,
        Ok(Err(err)) => {
            warn!(event = "ami_write_error", error = %err);
            false
        }
        Err(_) => {
            warn!(event = "ami_write_timeout", bytes = frame.len());
            false
        }
    }
}
