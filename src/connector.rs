use crate::config::ProxyConfig;
use crate::errors::{new_io_error, Error, Result};
use crate::socket::{MaybeTlsStream, Socket};
use crate::tls;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpSocket;
use tokio_rustls::TlsConnector;

/// Opens connections to origin servers.
#[derive(Clone)]
pub struct Connector {
  connect_timeout: Option<Duration>,
  write_timeout: Option<Duration>,
  nodelay: bool,
  tls: TlsConnector,
}

impl std::fmt::Debug for Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Connector")
      .field("connect_timeout", &self.connect_timeout)
      .field("write_timeout", &self.write_timeout)
      .field("nodelay", &self.nodelay)
      .finish()
  }
}

impl Connector {
  /// Build a connector from the upstream part of `config`.
  pub fn new(config: &ProxyConfig) -> Result<Self> {
    let tls = tls::client_config(config.upstream_certs_verification)?;
    Ok(Connector {
      connect_timeout: Some(config.upstream_connect_timeout),
      write_timeout: Some(config.write_timeout),
      nodelay: true,
      tls: TlsConnector::from(Arc::new(tls)),
    })
  }
  /// Connect to a remote endpoint with addr
  pub async fn connect_with_addr<S: Into<SocketAddr>>(&self, addr: S) -> Result<Socket> {
    let addr = addr.into();
    let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    raw_socket.set_nonblocking(true)?;
    let socket = TcpSocket::from_std_stream(raw_socket.into());
    if self.nodelay {
      socket.set_nodelay(self.nodelay)?;
    }
    let s = match self.connect_timeout {
      None => socket.connect(addr).await?,
      Some(timeout) => tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|x| new_io_error(std::io::ErrorKind::TimedOut, &x.to_string()))??,
    };
    Ok(Socket::new(MaybeTlsStream::Tcp(s), self.write_timeout))
  }
  /// Connect to `host:port`, trying every resolved address in turn, and
  /// wrap the stream in TLS when `secure` is set.
  ///
  /// All failures are reported as [`Error::Upstream`].
  pub async fn connect(&self, host: &str, port: u16, secure: bool) -> Result<Socket> {
    let target = format!("{}:{}", host, port);
    let addrs = tokio::net::lookup_host((host, port))
      .await
      .map_err(|e| Error::upstream(&target, e))?;
    let mut last_error = None;
    for addr in addrs {
      match self.connect_with_addr(addr).await {
        Ok(socket) => {
          tracing::debug!(%addr, secure, "connected upstream");
          if secure {
            return self.upgrade_to_tls(socket, host).await.map_err(|e| match e {
              Error::IO(io) => Error::upstream(&target, io),
              other => other,
            });
          }
          return Ok(socket);
        }
        Err(e) => {
          tracing::debug!(%addr, "connect failed: {}", e);
          last_error = Some(e);
        }
      }
    }
    let source = match last_error {
      Some(Error::IO(io)) => io,
      Some(other) => std::io::Error::other(other.to_string()),
      None => std::io::Error::new(std::io::ErrorKind::NotFound, "no address resolved"),
    };
    Err(Error::upstream(target, source))
  }
  /// A `Connector` will use transport layer security (TLS) to connect to https destinations.
  pub async fn upgrade_to_tls(&self, stream: Socket, domain: &str) -> Result<Socket> {
    let domain = tls::server_name(domain)?;
    let tcp = match stream.into_inner() {
      MaybeTlsStream::Tcp(tcp) => tcp,
      other => return Ok(Socket::new(other, self.write_timeout)),
    };
    let tls = self.tls.connect(domain, tcp).await?;
    Ok(Socket::new(
      MaybeTlsStream::ClientTls(Box::new(tls)),
      self.write_timeout,
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  #[tokio::test]
  async fn test_connect_plain() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let connector = Connector::new(&ProxyConfig::default()).unwrap();
    let socket = connector.connect("127.0.0.1", port, false).await.unwrap();
    assert!(!socket.is_tls());
    let (_, peer) = listener.accept().await.unwrap();
    assert_eq!(socket.peer_addr().unwrap().port(), port);
    assert!(peer.ip().is_loopback());
  }

  #[tokio::test]
  async fn test_refused_is_upstream_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    let connector = Connector::new(&ProxyConfig::default()).unwrap();
    let err = connector.connect("127.0.0.1", port, false).await.unwrap_err();
    assert!(matches!(err, Error::Upstream { .. }));
  }

  #[tokio::test]
  async fn test_write_to_stalled_origin_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ProxyConfig {
      write_timeout: Duration::from_millis(200),
      ..Default::default()
    };
    let connector = Connector::new(&config).unwrap();
    let mut socket = connector.connect("127.0.0.1", port, false).await.unwrap();
    // accepted but never read
    let (_stalled, _) = listener.accept().await.unwrap();
    let err = socket.write_all(&vec![0; 64 * 1024 * 1024]).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
  }
}
