//! Dialers that open a byte stream to a peer's sync server.
//!
//! Production traffic goes through [`TorDialer`], a SOCKS5 CONNECT to the
//! external onion router's proxy port. [`StaticDialer`] maps service ids
//! straight to local socket addresses and exists for tests and loopback
//! setups.

use std::collections::HashMap;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::NetError;

const SOCKS_VERSION: u8 = 0x05;
const SOCKS_CMD_CONNECT: u8 = 0x01;
const SOCKS_ATYP_IPV4: u8 = 0x01;
const SOCKS_ATYP_DOMAIN: u8 = 0x03;
const SOCKS_ATYP_IPV6: u8 = 0x04;

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a connection to `service_id:port` through the overlay.
    async fn dial(&self, service_id: &str, port: u16) -> Result<TcpStream, NetError>;
}

/// Dials `<service-id>.onion` through the router's SOCKS5 proxy.
pub struct TorDialer {
    proxy_addr: SocketAddr,
}

impl TorDialer {
    pub fn new(socks_port: u16) -> Self {
        Self {
            proxy_addr: ([127, 0, 0, 1], socks_port).into(),
        }
    }
}

#[async_trait]
impl Dialer for TorDialer {
    async fn dial(&self, service_id: &str, port: u16) -> Result<TcpStream, NetError> {
        let host = format!("{service_id}.onion");
        if host.len() > 255 {
            return Err(NetError::Socks("hostname too long".into()));
        }

        let mut stream = TcpStream::connect(self.proxy_addr).await?;

        // Greeting: no authentication.
        stream
            .write_all(&[SOCKS_VERSION, 0x01, 0x00])
            .await?;
        let mut reply = [0u8; 2];
        stream.read_exact(&mut reply).await?;
        if reply != [SOCKS_VERSION, 0x00] {
            return Err(NetError::Socks(format!(
                "proxy rejected handshake: {reply:02x?}"
            )));
        }

        // CONNECT with a domain address.
        let mut request = vec![SOCKS_VERSION, SOCKS_CMD_CONNECT, 0x00, SOCKS_ATYP_DOMAIN];
        request.push(host.len() as u8);
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            return Err(NetError::Socks(format!(
                "connect to {host} failed: reply code {:#04x}",
                head[1]
            )));
        }

        // Drain the bound address so the stream starts at the payload.
        let addr_len = match head[3] {
            SOCKS_ATYP_IPV4 => 4,
            SOCKS_ATYP_IPV6 => 16,
            SOCKS_ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            other => {
                return Err(NetError::Socks(format!(
                    "unknown address type {other:#04x} in reply"
                )))
            }
        };
        let mut bound = vec![0u8; addr_len + 2];
        stream.read_exact(&mut bound).await?;

        debug!(host = %host, port, "Connected through SOCKS proxy");
        Ok(stream)
    }
}

/// Fixed service-id to socket-address table, bypassing the overlay.
#[derive(Debug, Default)]
pub struct StaticDialer {
    routes: HashMap<String, SocketAddr>,
}

impl StaticDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, service_id: impl Into<String>, addr: SocketAddr) {
        self.routes.insert(service_id.into(), addr);
    }
}

#[async_trait]
impl Dialer for StaticDialer {
    async fn dial(&self, service_id: &str, _port: u16) -> Result<TcpStream, NetError> {
        let addr = self
            .routes
            .get(service_id)
            .ok_or_else(|| NetError::NoRoute(service_id.to_string()))?;
        Ok(TcpStream::connect(addr).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_static_dialer_routes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let mut dialer = StaticDialer::new();
        dialer.insert("someservice", addr);

        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        let mut stream = dialer.dial("someservice", 10051).await.unwrap();
        let (mut peer, _) = accept.await.unwrap();

        peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_static_dialer_unknown_service() {
        let dialer = StaticDialer::new();
        assert!(matches!(
            dialer.dial("nowhere", 10051).await,
            Err(NetError::NoRoute(_))
        ));
    }

    #[tokio::test]
    async fn test_tor_dialer_speaks_socks5() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        // Minimal SOCKS5 server that accepts the CONNECT and echoes one byte.
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut greeting = [0u8; 3];
            stream.read_exact(&mut greeting).await.unwrap();
            assert_eq!(greeting, [0x05, 0x01, 0x00]);
            stream.write_all(&[0x05, 0x00]).await.unwrap();

            let mut head = [0u8; 5];
            stream.read_exact(&mut head).await.unwrap();
            assert_eq!(&head[..4], &[0x05, 0x01, 0x00, 0x03]);
            let mut rest = vec![0u8; head[4] as usize + 2];
            stream.read_exact(&mut rest).await.unwrap();
            let host = String::from_utf8(rest[..head[4] as usize].to_vec()).unwrap();
            assert_eq!(host, "someservice.onion");

            // Success, bound to 0.0.0.0:0.
            stream
                .write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                .await
                .unwrap();
            stream.write_all(b"x").await.unwrap();
        });

        let dialer = TorDialer::new(port);
        let mut stream = dialer.dial("someservice", 10051).await.unwrap();

        let mut buf = [0u8; 1];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"x");
        server.await.unwrap();
    }
}
