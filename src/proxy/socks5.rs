//! SOCKS5 CONNECT client
//!
//! Just enough of RFC 1928/1929 to open a TCP stream through a proxy:
//! no-auth or username/password negotiation followed by CONNECT. Host names
//! are sent to the proxy unresolved so that names such as `.onion` work.

use std::net::IpAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::common::{RelayError, Result};

const SOCKS_VERSION: u8 = 0x05;
const AUTH_NONE: u8 = 0x00;
const AUTH_USER_PASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;
const USER_PASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;
const REP_SUCCESS: u8 = 0x00;

/// Dialer bound to one SOCKS5 proxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Socks5Dialer {
    address: String,
    auth: Option<(String, String)>,
    connect_timeout: Duration,
}

impl Socks5Dialer {
    /// Create a dialer for the proxy at `address`
    ///
    /// Credentials are only offered when a non-empty username is given.
    pub fn new(address: &str, username: Option<&str>, password: Option<&str>) -> Self {
        let auth = match username {
            Some(user) if !user.is_empty() => {
                Some((user.to_string(), password.unwrap_or_default().to_string()))
            }
            _ => None,
        };

        Self {
            address: address.to_string(),
            auth,
            connect_timeout: crate::config::defaults::dial_timeout(),
        }
    }

    /// Bound on reaching the proxy and completing the handshake
    pub fn with_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// Proxy `host:port`
    pub fn address(&self) -> &str {
        &self.address
    }

    /// `socks5h://` URL for HTTP clients that tunnel through this proxy
    pub fn url(&self) -> Result<Url> {
        let mut url = Url::parse(&format!("socks5h://{}", self.address))
            .map_err(|e| RelayError::Config(format!("Invalid proxy address {}: {}", self.address, e)))?;

        if let Some((user, pass)) = &self.auth {
            let bad = |_| RelayError::Config(format!("Invalid proxy credentials for {}", self.address));
            url.set_username(user).map_err(bad)?;
            url.set_password(Some(pass)).map_err(bad)?;
        }

        Ok(url)
    }

    /// Open a TCP stream to `host:port` through the proxy
    pub async fn dial(&self, host: &str, port: u16) -> Result<TcpStream> {
        timeout(self.connect_timeout, self.connect(host, port))
            .await
            .map_err(|_| RelayError::DialTimeout(format!("{}:{} via {}", host, port, self.address)))?
    }

    async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(&self.address).await?;

        self.negotiate(&mut stream).await?;
        connect_request(&mut stream, host, port).await?;

        Ok(stream)
    }

    async fn negotiate(&self, stream: &mut TcpStream) -> Result<()> {
        let method = if self.auth.is_some() { AUTH_USER_PASS } else { AUTH_NONE };
        stream.write_all(&[SOCKS_VERSION, 0x01, method]).await?;

        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;

        if reply[0] != SOCKS_VERSION {
            return Err(RelayError::Socks5(format!("bad version {:#04x}", reply[0])));
        }

        match (reply[1], &self.auth) {
            (AUTH_NONE, _) => Ok(()),
            (AUTH_USER_PASS, Some((user, pass))) => {
                if user.len() > 255 || pass.len() > 255 {
                    return Err(RelayError::Socks5("username or password too long".to_string()));
                }

                let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
                msg.push(USER_PASS_VERSION);
                msg.push(user.len() as u8);
                msg.extend_from_slice(user.as_bytes());
                msg.push(pass.len() as u8);
                msg.extend_from_slice(pass.as_bytes());
                stream.write_all(&msg).await?;

                let mut status = [0u8; 2];
                stream.read_exact(&mut status).await?;
                if status[1] != REP_SUCCESS {
                    return Err(RelayError::Socks5("authentication rejected".to_string()));
                }
                Ok(())
            }
            (AUTH_NO_ACCEPTABLE, _) => {
                Err(RelayError::Socks5("no acceptable authentication method".to_string()))
            }
            (other, _) => Err(RelayError::Socks5(format!("unexpected method {:#04x}", other))),
        }
    }
}

async fn connect_request(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    let mut msg = vec![SOCKS_VERSION, CMD_CONNECT, 0x00];

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => {
            msg.push(ATYP_IPV4);
            msg.extend_from_slice(&ip.octets());
        }
        Ok(IpAddr::V6(ip)) => {
            msg.push(ATYP_IPV6);
            msg.extend_from_slice(&ip.octets());
        }
        Err(_) => {
            if host.len() > 255 {
                return Err(RelayError::Socks5(format!("host name too long: {}", host)));
            }
            msg.push(ATYP_DOMAIN);
            msg.push(host.len() as u8);
            msg.extend_from_slice(host.as_bytes());
        }
    }
    msg.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&msg).await?;

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[1] != REP_SUCCESS {
        return Err(RelayError::Socks5(format!("connect failed, reply {:#04x}", head[1])));
    }

    // Consume BND.ADDR and BND.PORT
    let remaining = match head[3] {
        ATYP_IPV4 => 4 + 2,
        ATYP_IPV6 => 16 + 2,
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            len[0] as usize + 2
        }
        other => return Err(RelayError::Socks5(format!("bad address type {:#04x}", other))),
    };
    let mut bound = vec![0u8; remaining];
    stream.read_exact(&mut bound).await?;

    Ok(())
}
