//! Outbound dialing
//!
//! Opens the destination side of a relayed connection, either directly with
//! the relay's [`DialOptions`] timeout or through a SOCKS5 proxy.

use log::debug;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::timeout;

use super::udp::UdpStream;
use crate::common::{RelayError, Result};
use crate::config::DialOptions;
use crate::endpoint::{Endpoint, Protocol};
use crate::proxy::ResolvedProxy;

/// Any duplex byte stream the coupler can drive
pub trait RelayStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> RelayStream for T {}

/// Type-erased destination stream
pub type BoxedStream = Box<dyn RelayStream>;

/// A successfully dialed destination
pub struct Dialed {
    /// The destination stream
    pub stream: BoxedStream,
    /// Address the stream is connected to, for the connection pool
    pub remote: String,
}

impl std::fmt::Debug for Dialed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dialed").field("remote", &self.remote).finish()
    }
}

/// Dial a destination without a proxy
///
/// Streams (tcp, http, https) get a TCP connection; udp destinations get a
/// connected datagram socket.
pub async fn direct(destination: &Endpoint, options: &DialOptions) -> Result<Dialed> {
    let address = destination.require_address()?;

    let dialed = timeout(options.timeout, connect(destination.protocol(), &address))
        .await
        .map_err(|_| RelayError::DialTimeout(address.clone()))??;

    debug!("Dialed {} directly", dialed.remote);
    Ok(dialed)
}

async fn connect(protocol: Protocol, address: &str) -> Result<Dialed> {
    match protocol {
        Protocol::Tcp | Protocol::Http | Protocol::Https => {
            let stream = TcpStream::connect(address).await?;
            stream.set_nodelay(true)?;
            let remote = stream.peer_addr()?.to_string();
            Ok(Dialed {
                stream: Box::new(stream),
                remote,
            })
        }
        Protocol::Udp => {
            let target = tokio::net::lookup_host(address)
                .await?
                .next()
                .ok_or_else(|| RelayError::DialFailed(address.to_string()))?;

            let bind = if target.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(target).await?;

            Ok(Dialed {
                stream: Box::new(UdpStream::new(socket)),
                remote: target.to_string(),
            })
        }
    }
}

/// Dial a destination through a SOCKS5 proxy
///
/// Only stream destinations can be tunnelled; SOCKS5 CONNECT carries no
/// datagrams.
pub async fn via_proxy(destination: &Endpoint, proxy: &ResolvedProxy) -> Result<Dialed> {
    if destination.protocol() == Protocol::Udp {
        return Err(RelayError::UnsupportedProtocol(format!(
            "udp destination {} through proxy {}",
            destination, proxy.name
        )));
    }

    let address = destination.require_address()?;
    let port = destination.port().ok_or_else(|| RelayError::MissingPort(destination.to_string()))?;

    let stream = proxy.dialer.dial(destination.host(), port).await?;
    stream.set_nodelay(true)?;

    debug!("Dialed {} through proxy {}", address, proxy.name);
    Ok(Dialed {
        stream: Box::new(stream),
        remote: address,
    })
}
