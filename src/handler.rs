//! Per-connection pipeline
use crate::config::ParseLimits;
use crate::errors::{Error, Result};
use crate::message::{wants_close, HttpMessage};
use crate::request::read_request;
use crate::response::read_response;
use crate::server::ProxyState;
use crate::socket::{MaybeTlsStream, Socket};
use crate::{Request, Response};
use bytes::Bytes;
use http::{header, HeaderValue, Method, StatusCode};
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

const CONNECTION_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

/// An origin connection kept open across requests to the same authority.
struct Upstream {
  authority: String,
  secure: bool,
  reader: BufReader<Socket>,
}

/// What one pass through the pipeline produced.
enum Step {
  /// A request listener stopped the exchange, nothing was forwarded.
  Stopped,
  /// The origin closed without answering.
  Empty,
  /// Deliver the response unless a response listener vetoed it.
  Respond { message: HttpMessage, write: bool },
}

/// Drives one accepted client connection until it closes or is handed to
/// the WebSocket relay.
pub(crate) struct ConnectionHandler {
  state: Arc<ProxyState>,
  peer: SocketAddr,
  local_addr: SocketAddr,
  token: Arc<Mutex<()>>,
}

impl ConnectionHandler {
  /// `local_addr` is the proxy's own listening address. `token` serializes
  /// exchanges: one per connection, or one shared by all in serialize mode.
  pub(crate) fn new(
    state: Arc<ProxyState>,
    peer: SocketAddr,
    local_addr: SocketAddr,
    token: Arc<Mutex<()>>,
  ) -> Self {
    ConnectionHandler {
      state,
      peer,
      local_addr,
      token,
    }
  }

  pub(crate) async fn run(self, stream: TcpStream) {
    match self.handle(stream).await {
      Ok(()) => tracing::trace!(peer = %self.peer, "connection finished"),
      // logged where they were raised
      Err(Error::MalformedHeader(_) | Error::Recursive(_)) => {}
      Err(e) if e.is_timeout() => {
        tracing::warn!(peer = %self.peer, "timed out while reading a request: {}", e)
      }
      Err(Error::IO(e))
        if matches!(
          e.kind(),
          ErrorKind::ConnectionReset | ErrorKind::BrokenPipe | ErrorKind::UnexpectedEof
        ) =>
      {
        tracing::debug!(peer = %self.peer, "client went away: {}", e)
      }
      Err(e) => tracing::warn!(peer = %self.peer, "connection failed: {}", e),
    }
  }

  async fn handle(&self, stream: TcpStream) -> Result<()> {
    let config = &self.state.config;
    let limits = ParseLimits::from(config);
    let mut client = BufReader::new(Socket::new(
      MaybeTlsStream::Tcp(stream),
      Some(config.write_timeout),
    ));
    let mut tunnel: Option<String> = None;
    let mut upstream: Option<Upstream> = None;
    let mut idle_timeout = config.first_read_timeout;
    loop {
      // waiting for the next request is not an error, only a partial one is
      match timeout(idle_timeout, client.fill_buf()).await {
        Err(_) => {
          tracing::trace!(peer = %self.peer, "idle connection timed out");
          return Ok(());
        }
        Ok(Ok([])) => return Ok(()),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => return Err(e.into()),
      }
      idle_timeout = config.keep_alive_timeout;
      let request = timeout(
        config.first_read_timeout,
        read_request(&mut client, tunnel.as_deref(), limits),
      )
      .await??;
      let Some(mut request) = request else {
        return Ok(());
      };
      let (host, port) = request.target()?;
      self.guard_recursion(&host, port)?;

      if *request.method() == Method::CONNECT {
        if tunnel.is_some() {
          return Err(Error::malformed(format!(
            "CONNECT {} inside a tunnel",
            request.authority()
          )));
        }
        let Some(tls) = self.intercept_tunnel(client, &host).await? else {
          return Ok(());
        };
        client = tls;
        tunnel = Some(format!("{}:{}", host, port));
        upstream = None;
        continue;
      }

      let client_wants_close = request.wants_close();
      request.strip_accept_encoding();
      request.strip_proxy_headers();
      let mut message = match self.process(request, &mut upstream).await {
        Step::Stopped => continue,
        Step::Empty => {
          tracing::debug!(peer = %self.peer, "empty response from {}:{}", host, port);
          break;
        }
        Step::Respond {
          message,
          write: false,
        } => {
          if message
            .response
            .as_ref()
            .is_some_and(Response::is_websocket_upgrade)
          {
            break;
          }
          continue;
        }
        Step::Respond { message, .. } => message,
      };
      let Some(mut response) = message.response.take() else {
        break;
      };
      if response.is_close_delimited() && response.body().is_empty() {
        response
          .headers_mut()
          .insert(header::CONTENT_LENGTH, HeaderValue::from(0));
      }
      client.get_mut().write_all(&response.to_raw()).await?;

      if response.is_websocket_upgrade() {
        return self.hand_off(client, upstream.take(), &response);
      }
      let server_wants_close = wants_close(response.headers(), response.version());
      if server_wants_close || response.is_close_delimited() {
        upstream = None;
      }
      if client_wants_close
        || server_wants_close
        || (response.is_close_delimited() && !response.body().is_empty())
      {
        break;
      }
    }
    let _ = client.get_mut().shutdown().await;
    Ok(())
  }

  /// Refuse targets that would loop back into this proxy.
  fn guard_recursion(&self, host: &str, port: u16) -> Result<()> {
    if is_recursive(host, port, self.local_addr) {
      let error = Error::Recursive(format!("{}:{}", host, port));
      tracing::error!(peer = %self.peer, "{}", error);
      return Err(error);
    }
    Ok(())
  }

  /// Answer the `CONNECT` and terminate TLS for `host` on the client socket.
  ///
  /// `Ok(None)` when no certificate could be issued: the client then gets a
  /// plaintext diagnostic and the connection ends.
  async fn intercept_tunnel(
    &self,
    mut client: BufReader<Socket>,
    host: &str,
  ) -> Result<Option<BufReader<Socket>>> {
    client.get_mut().write_all(CONNECTION_ESTABLISHED).await?;
    let server_config = match self.state.provider.issue_tunnel_certificate(host) {
      Ok(config) => config,
      Err(Error::CertificateMissing(reason)) => {
        let diagnostic = Response::plain(
          StatusCode::GATEWAY_TIMEOUT,
          format!(
            "The proxy could not intercept the HTTPS connection to {}: {}\n\
             Generate or import a root CA certificate and try again.\n",
            host, reason
          ),
        );
        client.get_mut().write_all(&diagnostic.to_raw()).await?;
        let _ = client.get_mut().shutdown().await;
        return Ok(None);
      }
      Err(e) => return Err(e),
    };
    // a ClientHello pipelined behind the CONNECT is already buffered
    let early = Bytes::copy_from_slice(client.buffer());
    let tcp = match client.into_inner().into_inner() {
      MaybeTlsStream::Tcp(tcp) => tcp,
      _ => return Err(Error::malformed("CONNECT over an encrypted stream")),
    };
    let tls = TlsAcceptor::from(server_config)
      .accept_with(tcp, |conn| {
        let mut early = &early[..];
        while !early.is_empty() {
          match conn.read_tls(&mut early) {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
          }
        }
        // a failure here resurfaces from the handshake
        let _ = conn.process_new_packets();
      })
      .await?;
    tracing::debug!(peer = %self.peer, host, "tunnel intercepted");
    Ok(Some(BufReader::new(Socket::new(
      MaybeTlsStream::ServerTls(Box::new(tls)),
      Some(self.state.config.write_timeout),
    ))))
  }

  /// Cache, listeners and the upstream exchange for one request.
  async fn process(&self, request: Request, upstream: &mut Option<Upstream>) -> Step {
    let mut message = HttpMessage::new(request);
    let uri = message.request.uri().to_string();
    let excluded = self.state.exclusions.read().await.is_excluded(&uri);
    if excluded {
      tracing::trace!(%uri, "excluded from listeners");
    } else if let Some(response) = self.lookup_cache(&message).await {
      tracing::debug!(%uri, "served from cache");
      message.response = Some(response);
      return Step::Respond {
        message,
        write: true,
      };
    }

    let _guard = self.token.lock().await;
    let listeners = if excluded {
      None
    } else {
      Some(self.state.listeners.read().await.clone())
    };
    if let Some(listeners) = &listeners {
      if !listeners.notify_request(&mut message) {
        return Step::Stopped;
      }
    }
    message.sent_at = Some(SystemTime::now());
    let response = match self.forward(&message.request, upstream).await {
      Ok(Some(response)) => response,
      Ok(None) => return Step::Empty,
      Err(e) => {
        tracing::warn!(%uri, "upstream exchange failed: {}", e);
        *upstream = None;
        Response::gateway_timeout(e)
      }
    };
    message.received_at = Some(SystemTime::now());
    message.response = Some(response);
    if let Some(listeners) = &listeners {
      if !listeners.notify_response(&mut message) {
        return Step::Respond {
          message,
          write: false,
        };
      }
    }
    Step::Respond {
      message,
      write: true,
    }
  }

  async fn lookup_cache(&self, message: &HttpMessage) -> Option<Response> {
    if !self.state.is_cache_enabled() {
      return None;
    }
    self.state.cache.read().await.lookup(&message.fingerprint())
  }

  /// Send `request` to its origin, reusing the open connection when it
  /// points at the same authority. A reused connection that turns out to be
  /// closed is replaced once.
  async fn forward(
    &self,
    request: &Request,
    upstream: &mut Option<Upstream>,
  ) -> Result<Option<Response>> {
    let (host, port) = request.target()?;
    let authority = format!("{}:{}", host, port);
    let secure = request.is_secure();
    let reusable = upstream
      .as_ref()
      .is_some_and(|u| u.authority == authority && u.secure == secure);
    if reusable {
      if let Some(up) = upstream.as_mut() {
        match self.exchange(up, request).await {
          Ok(Some(response)) => return Ok(Some(response)),
          Ok(None) | Err(Error::Upstream { .. }) => {
            tracing::debug!(%authority, "kept-alive upstream went away, reconnecting");
          }
          Err(e) => return Err(e),
        }
      }
    }
    let socket = self.state.connector.connect(&host, port, secure).await?;
    let up = upstream.insert(Upstream {
      authority,
      secure,
      reader: BufReader::new(socket),
    });
    self.exchange(up, request).await
  }

  async fn exchange(&self, up: &mut Upstream, request: &Request) -> Result<Option<Response>> {
    let config = &self.state.config;
    up.reader
      .get_mut()
      .write_all(&request.to_raw())
      .await
      .map_err(|e| Error::upstream(&up.authority, e))?;
    match timeout(
      config.upstream_read_timeout,
      read_response(&mut up.reader, request.method(), ParseLimits::from(config)),
    )
    .await
    {
      Err(elapsed) => Err(Error::upstream(
        &up.authority,
        std::io::Error::new(ErrorKind::TimedOut, elapsed.to_string()),
      )),
      Ok(Err(Error::IO(e))) => Err(Error::upstream(&up.authority, e)),
      Ok(result) => result,
    }
  }

  /// Give both sockets, and anything read past the handshake, to the relay.
  fn hand_off(
    &self,
    client: BufReader<Socket>,
    upstream: Option<Upstream>,
    response: &Response,
  ) -> Result<()> {
    let (Some(relay), Some(upstream)) = (&self.state.websocket, upstream) else {
      tracing::warn!(peer = %self.peer, "websocket upgrade without a relay, closing");
      return Ok(());
    };
    let local_buffered = Bytes::copy_from_slice(client.buffer());
    let remote_buffered = Bytes::copy_from_slice(upstream.reader.buffer());
    let id = relay.add_channel_buffered(
      response.headers(),
      client.into_inner(),
      local_buffered,
      upstream.reader.into_inner(),
      remote_buffered,
    )?;
    tracing::debug!(peer = %self.peer, channel = %id, authority = %upstream.authority, "handed off to websocket relay");
    Ok(())
  }
}

/// Whether `host:port` names the proxy listening on `local`. No name
/// resolution is done: only IP literals and `localhost` are recognised.
pub(crate) fn is_recursive(host: &str, port: u16, local: SocketAddr) -> bool {
  if port != local.port() {
    return false;
  }
  let host = host.trim_start_matches('[').trim_end_matches(']');
  let bind = local.ip();
  let any_local = |ip: IpAddr| ip.is_loopback() || ip.is_unspecified();
  match host.parse::<IpAddr>() {
    Ok(ip) => ip == bind || (any_local(bind) && any_local(ip)),
    Err(_) => host.eq_ignore_ascii_case("localhost") && any_local(bind),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_is_recursive() {
    let local: SocketAddr = "127.0.0.1:8080".parse().unwrap();
    assert!(is_recursive("127.0.0.1", 8080, local));
    assert!(is_recursive("LOCALHOST", 8080, local));
    assert!(is_recursive("[::1]", 8080, local));
    assert!(!is_recursive("127.0.0.1", 8081, local));
    assert!(!is_recursive("example.com", 8080, local));
    let public: SocketAddr = "192.0.2.10:3128".parse().unwrap();
    assert!(is_recursive("192.0.2.10", 3128, public));
    assert!(!is_recursive("127.0.0.1", 3128, public));
    let any: SocketAddr = "0.0.0.0:3128".parse().unwrap();
    assert!(is_recursive("localhost", 3128, any));
    assert!(is_recursive("0.0.0.0", 3128, any));
  }
}
