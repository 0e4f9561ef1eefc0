//! TCP front end
//!
//! Accepts connections and runs one handling task per connection. The
//! handling task walks the destinations in attempt order, dials each one
//! directly or through its proxies, and couples the first stream that
//! connects with the client. UDP sessions reuse [`handle_conn`].

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinSet;

use super::dial::{self, Dialed};
use super::{coupler, selector, Relay};
use crate::common::Result;
use crate::config::defaults::TRANSFER_BUFFER_SIZE;
use crate::endpoint::{Endpoint, Protocol};
use crate::pool::{CloseSignal, ConnHandle, ConnToken};
use crate::proxy::ResolvedProxy;

/// Accept TCP connections until `shutdown` fires
///
/// Accept errors are logged and do not stop the loop. Connections still
/// being relayed when the loop ends keep running.
pub(super) async fn accept_loop(
    relay: Arc<Relay>,
    listener: TcpListener,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let local = listener.local_addr()?;
    info!("[{}] TCP relay listening on {}", relay.name(), local);

    let mut tasks = JoinSet::new();

    loop {
        // Reap finished connection tasks
        while let Some(result) = tasks.try_join_next() {
            if let Err(e) = result {
                error!("[{}] Connection task error: {}", relay.name(), e);
            }
        }

        tokio::select! {
            _ = &mut shutdown => {
                warn!("[{}] Listener closed", relay.name());
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("[{}] Failed to set TCP_NODELAY for {}: {}", relay.name(), peer, e);
                    }

                    let (handle, signal) = ConnHandle::new(peer, local, Protocol::Tcp);
                    let relay = Arc::clone(&relay);
                    tasks.spawn(handle_conn(relay, stream, handle, signal, TRANSFER_BUFFER_SIZE));
                }
                Err(e) => warn!("[{}] Accept failed: {}", relay.name(), e),
            },
        }
    }

    tasks.detach_all();
    Ok(())
}

/// Relay one accepted connection
///
/// Registers the connection in the pool for its whole lifetime and removes
/// it exactly once on the way out, whether the session ended on its own or
/// was closed through its [`ConnHandle`].
pub(crate) async fn handle_conn<S>(
    relay: Arc<Relay>,
    client: S,
    handle: ConnHandle,
    mut signal: CloseSignal,
    buffer_size: usize,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let peer = handle.peer_addr();
    let local = handle.local_addr();

    let token = relay.store_conn(handle);
    relay.metrics().record_connection_delta(1);
    info!("[{}] New connection {} on {}", relay.name(), peer, local);

    tokio::select! {
        _ = forward(&relay, token, client, buffer_size) => {}
        _ = signal.closed() => {
            info!("[{}] Connection {} dropped", relay.name(), peer);
        }
    }

    relay.remove_conn(token);
    relay.metrics().record_connection_delta(-1);
}

/// Dial destinations in order and couple the first that connects
async fn forward<S>(relay: &Arc<Relay>, token: ConnToken, client: S, buffer_size: usize)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let start = Instant::now();
    let load_balance = relay.load_balance();

    let order = match selector::attempt_order(load_balance, relay.destinations()) {
        Ok(order) => order,
        Err(e) => {
            error!("[{}] {}", relay.name(), e);
            return;
        }
    };

    for index in order {
        let destination = &relay.destinations()[index];
        let bypass_proxy = !load_balance && relay.proxy_ignored(index);

        let dialed = if bypass_proxy || destination.proxy_names().is_empty() {
            info!("[{}] Dialing destination [{}] {}", relay.name(), index + 1, destination);
            match dial::direct(destination, relay.dial_options()).await {
                Ok(dialed) => {
                    relay.metrics().record_dial(1, 0, start);
                    dialed
                }
                Err(e) => {
                    relay.metrics().record_dial(0, 1, start);
                    warn!("[{}] Failed to dial {}: {}", relay.name(), destination, e);
                    continue;
                }
            }
        } else {
            let proxies = match relay.proxies().resolve(destination.proxy_names()) {
                Ok(proxies) => proxies,
                Err(e) => {
                    error!("[{}] Destination {}: {}", relay.name(), destination, e);
                    return;
                }
            };

            match dial_proxies(relay, index, destination, &proxies, start).await {
                Some(dialed) => dialed,
                None => continue,
            }
        };

        relay.update_remote(token, &dialed.remote);
        info!("[{}] Connected to {}", relay.name(), dialed.remote);

        if let Err(e) =
            coupler::couple_with_buffer(client, dialed.stream, Arc::clone(relay.metrics()), buffer_size).await
        {
            warn!("[{}] Stream to {} failed: {}", relay.name(), dialed.remote, e);
        }

        info!("[{}] Connection to {} closed", relay.name(), dialed.remote);
        return;
    }

    warn!("[{}] Unable to reach any destination", relay.name());
}

/// Try each proxy of one destination in listed order
async fn dial_proxies(
    relay: &Relay,
    index: usize,
    destination: &Endpoint,
    proxies: &[ResolvedProxy],
    start: Instant,
) -> Option<Dialed> {
    for proxy in proxies {
        info!(
            "[{}] Dialing destination [{}] {} through proxy {:?}",
            relay.name(),
            index + 1,
            destination,
            proxy.name
        );

        match dial::via_proxy(destination, proxy).await {
            Ok(dialed) => {
                relay.metrics().record_dial(1, 0, start);
                return Some(dialed);
            }
            Err(e) => {
                relay.metrics().record_dial(0, 1, start);
                warn!("[{}] Proxy {:?} failed: {}", relay.name(), proxy.name, e);
            }
        }
    }

    None
}
