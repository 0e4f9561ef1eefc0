//! Stream coupler
//!
//! Pumps bytes both ways between an accepted connection and a dialed one,
//! counting traffic as it goes. The first direction to finish closes both
//! sides; once both tasks are done their results are normalised so that a
//! peer hanging up is not reported as a failure.

use log::debug;
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::task::{JoinError, JoinHandle};

use crate::common::error::is_clean_close_kind;
use crate::common::{RelayError, Result};
use crate::config::defaults::TRANSFER_BUFFER_SIZE;
use crate::metrics::Metrics;

/// Which way a pump moves bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    /// Client to destination
    Upload,
    /// Destination to client
    Download,
}

/// How a pump ended
#[derive(Debug)]
enum Finish {
    /// The source reached end of stream
    Eof,
    /// The task was stopped because the other direction ended first
    Cancelled,
    /// A read or write failed
    Failed(io::Error),
}

impl Finish {
    fn is_clean(&self) -> bool {
        match self {
            Self::Eof | Self::Cancelled => true,
            Self::Failed(e) => is_clean_close_kind(e.kind()),
        }
    }
}

/// Couple two streams using the default 128 byte transfer buffer
///
/// # Returns
///
/// Returns `Ok(())` when the session ended normally, otherwise the first
/// genuine I/O failure.
pub async fn couple<C, R>(client: C, remote: R, metrics: Arc<Metrics>) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    couple_with_buffer(client, remote, metrics, TRANSFER_BUFFER_SIZE).await
}

/// Couple two streams with an explicit per-direction buffer size
///
/// Datagram relays pass a buffer large enough for a whole datagram so that
/// message boundaries survive the copy.
pub async fn couple_with_buffer<C, R>(
    client: C,
    remote: R,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    R: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (client_reader, client_writer) = tokio::io::split(client);
    let (remote_reader, remote_writer) = tokio::io::split(remote);

    let mut upload = PumpTask(tokio::spawn(pump(
        client_reader,
        remote_writer,
        Direction::Upload,
        Arc::clone(&metrics),
        buffer_size,
    )));
    let mut download = PumpTask(tokio::spawn(pump(
        remote_reader,
        client_writer,
        Direction::Download,
        metrics,
        buffer_size,
    )));

    enum First {
        Upload(std::result::Result<Finish, JoinError>),
        Download(std::result::Result<Finish, JoinError>),
    }

    let first = tokio::select! {
        res = &mut upload.0 => First::Upload(res),
        res = &mut download.0 => First::Download(res),
    };

    // Stopping the other pump drops its halves, which closes both streams
    let (up, down) = match first {
        First::Upload(res) => {
            download.0.abort();
            (res, (&mut download.0).await)
        }
        First::Download(res) => {
            upload.0.abort();
            ((&mut upload.0).await, res)
        }
    };

    normalize(joined(up), joined(down))
}

/// Aborts the pump when the coupler itself is dropped, so a forced close
/// releases both sockets
struct PumpTask(JoinHandle<Finish>);

impl Drop for PumpTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn joined(res: std::result::Result<Finish, JoinError>) -> Finish {
    match res {
        Ok(finish) => finish,
        Err(e) if e.is_cancelled() => Finish::Cancelled,
        Err(e) => Finish::Failed(io::Error::new(io::ErrorKind::Other, e.to_string())),
    }
}

/// Collapse both directions into one result
///
/// A session that ended with either side closed (end of stream, a peer
/// hang-up, or stopped because the other side finished) is a success. Only
/// when both directions failed for some other reason is an error reported.
fn normalize(up: Finish, down: Finish) -> Result<()> {
    debug!("Stream finished: upload {:?}, download {:?}", up, down);

    if up.is_clean() || down.is_clean() {
        return Ok(());
    }

    match (up, down) {
        (Finish::Failed(e), _) | (_, Finish::Failed(e)) => Err(RelayError::Io(e)),
        _ => Ok(()),
    }
}

async fn pump<R, W>(
    mut reader: ReadHalf<R>,
    mut writer: WriteHalf<W>,
    direction: Direction,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> Finish
where
    R: AsyncRead + Send,
    W: AsyncWrite + Send,
{
    let mut buffer = vec![0u8; buffer_size];
    let mut total_bytes: u64 = 0;

    let finish = loop {
        let n = match reader.read(&mut buffer).await {
            Ok(0) => break Finish::Eof,
            Ok(n) => n,
            Err(e) => break Finish::Failed(e),
        };

        total_bytes += n as u64;
        match direction {
            Direction::Upload => metrics.record_bandwidth(n as u64, 0),
            Direction::Download => metrics.record_bandwidth(0, n as u64),
        }

        if let Err(e) = writer.write_all(&buffer[..n]).await {
            break Finish::Failed(e);
        }
    };

    // Pass the close on to the other side
    let _ = writer.shutdown().await;

    debug!("{:?} transferred {} bytes total", direction, total_bytes);
    finish
}
