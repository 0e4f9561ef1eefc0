//! UDP front end
//!
//! UDP has no accept, so the listener frames sessions itself: the first
//! datagram from a new peer address opens a session, later datagrams from
//! that peer are queued into it, and replies go back out of the listening
//! socket. A session ends after [`ListenOptions::udp_session_idle`] without
//! inbound traffic, which the coupler sees as end-of-stream.
//!
//! [`ListenOptions::udp_session_idle`]: crate::config::ListenOptions

use bytes::Bytes;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio::time::{Instant, Sleep};

use super::{tcp, Relay};
use crate::common::Result;
use crate::config::defaults::DATAGRAM_BUFFER_SIZE;
use crate::endpoint::Protocol;
use crate::pool::ConnHandle;

/// Datagrams buffered per session before new ones are dropped
const SESSION_QUEUE: usize = 64;

/// Listening socket that hands out one [`UdpSession`] per peer
#[derive(Debug)]
pub struct UdpListener {
    socket: Arc<UdpSocket>,
    sessions: HashMap<SocketAddr, mpsc::Sender<Bytes>>,
    idle: Duration,
    buffer: Vec<u8>,
}

impl UdpListener {
    /// Bind a listening socket
    pub async fn bind<A: ToSocketAddrs>(addr: A, idle: Duration) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;

        Ok(Self {
            socket: Arc::new(socket),
            sessions: HashMap::new(),
            idle,
            buffer: vec![0u8; DATAGRAM_BUFFER_SIZE],
        })
    }

    /// Address the socket is bound to
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Wait for a datagram from a peer with no live session
    ///
    /// Datagrams for existing sessions are routed to them while waiting.
    /// Cancel safe.
    pub async fn accept(&mut self) -> io::Result<(UdpSession, SocketAddr)> {
        loop {
            let (n, peer) = self.socket.recv_from(&mut self.buffer).await?;
            let mut datagram = Bytes::copy_from_slice(&self.buffer[..n]);

            if let Some(tx) = self.sessions.get(&peer) {
                match tx.try_send(datagram) {
                    Ok(()) => continue,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("Session queue for {} full, dropping datagram", peer);
                        continue;
                    }
                    Err(mpsc::error::TrySendError::Closed(d)) => {
                        // Session ended; this datagram starts a new one
                        self.sessions.remove(&peer);
                        datagram = d;
                    }
                }
            }

            self.sessions.retain(|_, tx| !tx.is_closed());

            let (tx, rx) = mpsc::channel(SESSION_QUEUE);
            let _ = tx.try_send(datagram);
            self.sessions.insert(peer, tx);

            let session = UdpSession {
                socket: Arc::clone(&self.socket),
                peer,
                rx,
                idle: self.idle,
                idle_timer: Box::pin(tokio::time::sleep(self.idle)),
            };
            return Ok((session, peer));
        }
    }
}

/// One peer's datagram exchange, presented as a byte stream
///
/// Each read yields exactly one datagram and each write sends one, so
/// message boundaries hold as long as reads use a buffer of at least
/// [`DATAGRAM_BUFFER_SIZE`] bytes.
pub struct UdpSession {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
    rx: mpsc::Receiver<Bytes>,
    idle: Duration,
    idle_timer: Pin<Box<Sleep>>,
}

impl std::fmt::Debug for UdpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSession")
            .field("peer", &self.peer)
            .field("idle", &self.idle)
            .finish()
    }
}

impl UdpSession {
    /// The peer this session talks to
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }
}

impl AsyncRead for UdpSession {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;

        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(datagram)) => {
                let n = datagram.len().min(buf.remaining());
                buf.put_slice(&datagram[..n]);

                let deadline = Instant::now() + this.idle;
                this.idle_timer.as_mut().reset(deadline);
                Poll::Ready(Ok(()))
            }
            // Listener gone
            Poll::Ready(None) => Poll::Ready(Ok(())),
            Poll::Pending => match this.idle_timer.as_mut().poll(cx) {
                // Idle for too long, report end-of-stream
                Poll::Ready(()) => Poll::Ready(Ok(())),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl AsyncWrite for UdpSession {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send_to(cx, buf, self.peer)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Connected outbound datagram socket presented as a byte stream
#[derive(Debug)]
pub struct UdpStream {
    socket: UdpSocket,
}

impl UdpStream {
    /// Wrap a socket that has already been `connect`ed
    pub fn new(socket: UdpSocket) -> Self {
        Self { socket }
    }
}

impl AsyncRead for UdpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

impl AsyncWrite for UdpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Accept UDP sessions until `shutdown` fires
pub(super) async fn accept_loop(
    relay: Arc<Relay>,
    mut listener: UdpListener,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!("[{}] UDP relay listening on {}", relay.name(), local);

    let mut tasks = JoinSet::new();

    loop {
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                warn!("[{}] Session task error: {}", relay.name(), e);
            }
        }

        tokio::select! {
            _ = &mut shutdown => {
                warn!("[{}] Listener closed", relay.name());
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((session, peer)) => {
                    let (handle, signal) = ConnHandle::new(peer, local, Protocol::Udp);
                    let relay = Arc::clone(&relay);
                    tasks.spawn(tcp::handle_conn(relay, session, handle, signal, DATAGRAM_BUFFER_SIZE));
                }
                Err(e) => warn!("[{}] Receive failed: {}", relay.name(), e),
            },
        }
    }

    // Live sessions outlive the listener
    tasks.detach_all();
    Ok(())
}
