//! Listening socket, accept loop and the state every connection shares
use crate::cache::{CacheEntry, CacheList};
use crate::config::{ExclusionList, ProxyConfig};
use crate::connector::Connector;
use crate::errors::{Error, Result};
use crate::handler::ConnectionHandler;
use crate::listener::{ListenerRegistry, ProxyListener};
use crate::tls::{CertificateProvider, MissingRootCertificate};
use crate::websocket::{RelayOptions, WebSocketRelay};
use socket2::{Domain, Protocol, Type};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;

const LISTEN_BACKLOG: i32 = 1024;

/// Read by every [`ConnectionHandler`]. The collections are only mutated
/// through [`ProxyServer`]; handlers take a snapshot per request.
pub(crate) struct ProxyState {
  pub(crate) config: ProxyConfig,
  pub(crate) connector: Connector,
  pub(crate) provider: Arc<dyn CertificateProvider>,
  pub(crate) websocket: Option<Arc<WebSocketRelay>>,
  pub(crate) listeners: RwLock<ListenerRegistry>,
  pub(crate) exclusions: RwLock<ExclusionList>,
  pub(crate) cache: RwLock<CacheList>,
  cache_enabled: AtomicBool,
  serialize: AtomicBool,
  global_token: Arc<Mutex<()>>,
}

impl ProxyState {
  pub(crate) fn is_cache_enabled(&self) -> bool {
    self.cache_enabled.load(Ordering::Acquire)
  }
  /// The exclusion token for a new connection.
  fn session_token(&self) -> Arc<Mutex<()>> {
    if self.serialize.load(Ordering::Acquire) {
      self.global_token.clone()
    } else {
      Arc::new(Mutex::new(()))
    }
  }
}

struct Running {
  local_addr: SocketAddr,
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
}

/// The intercepting proxy.
///
/// ```no_run
/// # async fn run() -> snare::Result<()> {
/// let server = snare::ProxyServer::builder().build()?;
/// let port = server.start().await?;
/// println!("listening on {}", port);
/// server.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct ProxyServer {
  state: Arc<ProxyState>,
  running: std::sync::Mutex<Option<Running>>,
}

impl std::fmt::Debug for ProxyServer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ProxyServer")
      .field("config", &self.state.config)
      .field("local_addr", &self.local_addr())
      .finish()
  }
}

/// Builder for [`ProxyServer`].
#[derive(Default)]
pub struct ProxyServerBuilder {
  config: Option<ProxyConfig>,
  provider: Option<Arc<dyn CertificateProvider>>,
  websocket: Option<Arc<WebSocketRelay>>,
  without_websocket: bool,
}

impl ProxyServerBuilder {
  /// Set the [`ProxyConfig`] to use.
  pub fn config(mut self, config: ProxyConfig) -> Self {
    self.config = Some(config);
    self
  }
  /// Set where tunnel certificates come from. Defaults to
  /// [`MissingRootCertificate`], which refuses every tunnel.
  pub fn certificate_provider(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
    self.provider = Some(provider);
    self
  }
  /// Share an already running relay, for example between several servers.
  pub fn websocket_relay(mut self, relay: Arc<WebSocketRelay>) -> Self {
    self.websocket = Some(relay);
    self.without_websocket = false;
    self
  }
  /// Do not relay upgraded connections; they are closed after the handshake
  /// response is delivered.
  pub fn without_websocket(mut self) -> Self {
    self.websocket = None;
    self.without_websocket = true;
    self
  }
  /// Build the server. Starts a relay unless one was given or relaying was
  /// disabled.
  pub fn build(self) -> Result<ProxyServer> {
    let config = self.config.unwrap_or_default();
    let connector = Connector::new(&config)?;
    let provider = self
      .provider
      .unwrap_or_else(|| Arc::new(MissingRootCertificate));
    let websocket = match (self.websocket, self.without_websocket) {
      (Some(relay), _) => Some(relay),
      (None, true) => None,
      (None, false) => Some(Arc::new(WebSocketRelay::start(RelayOptions::from(&config))?)),
    };
    let serialize = AtomicBool::new(config.serialize);
    Ok(ProxyServer {
      state: Arc::new(ProxyState {
        config,
        connector,
        provider,
        websocket,
        listeners: RwLock::new(ListenerRegistry::default()),
        exclusions: RwLock::new(ExclusionList::default()),
        cache: RwLock::new(CacheList::default()),
        cache_enabled: AtomicBool::new(false),
        serialize,
        global_token: Arc::new(Mutex::new(())),
      }),
      running: std::sync::Mutex::new(None),
    })
  }
}

impl ProxyServer {
  /// Start building a server.
  pub fn builder() -> ProxyServerBuilder {
    ProxyServerBuilder::default()
  }
  /// Configuration the server was built with.
  pub fn config(&self) -> &ProxyConfig {
    &self.state.config
  }
  /// The relay upgraded connections are handed to, to add observers.
  pub fn websocket(&self) -> Option<&Arc<WebSocketRelay>> {
    self.state.websocket.as_ref()
  }
  /// Address the accept loop listens on, once started.
  pub fn local_addr(&self) -> Option<SocketAddr> {
    self.lock_running().as_ref().map(|r| r.local_addr)
  }

  /// Bind and start accepting, returning the port actually bound.
  ///
  /// With `allow_port_fallback` the following ports are tried when the
  /// configured one is taken, up to `max_port_attempts` in total. Starting a
  /// running server returns its port.
  pub async fn start(&self) -> Result<u16> {
    if let Some(addr) = self.local_addr() {
      return Ok(addr.port());
    }
    let listener = self.bind()?;
    let local_addr = listener.local_addr()?;
    let (shutdown, stopped) = watch::channel(false);
    let task = tokio::spawn(accept_loop(
      listener,
      local_addr,
      self.state.clone(),
      stopped,
    ));
    tracing::info!("proxy listening on {}", local_addr);
    *self.lock_running() = Some(Running {
      local_addr,
      shutdown,
      task,
    });
    Ok(local_addr.port())
  }

  fn bind(&self) -> Result<TcpListener> {
    let config = &self.state.config;
    let attempts = if config.allow_port_fallback {
      config.max_port_attempts.max(1)
    } else {
      1
    };
    let mut last = None;
    for offset in 0..attempts {
      let Some(port) = config.port.checked_add(offset) else {
        break;
      };
      let addr = SocketAddr::new(config.bind_addr, port);
      match bind_listener(addr) {
        Ok(listener) => return Ok(listener),
        Err(e) => {
          tracing::debug!("failed to bind {}: {}", addr, e);
          last = Some((addr, e));
        }
      }
    }
    let (addr, source) = last.unwrap_or_else(|| {
      (
        SocketAddr::new(config.bind_addr, config.port),
        std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "no port left to try"),
      )
    });
    let error = Error::Bind {
      addr: addr.to_string(),
      source,
    };
    tracing::error!("{}", error);
    Err(error)
  }

  /// Close the listening socket and wait for the accept loop to exit.
  /// Connections already accepted run to completion.
  pub async fn stop(&self) {
    let running = self.lock_running().take();
    let Some(running) = running else {
      return;
    };
    let _ = running.shutdown.send(true);
    if let Err(e) = running.task.await {
      tracing::error!("accept loop ended abnormally: {}", e);
    }
    tracing::info!("proxy on {} stopped", running.local_addr);
  }

  /// Add a listener, keeping the registry sorted by order.
  pub async fn add_listener(&self, listener: Arc<dyn ProxyListener>) {
    self.state.listeners.write().await.add(listener);
  }
  /// Remove a listener by identity.
  pub async fn remove_listener(&self, listener: &Arc<dyn ProxyListener>) -> bool {
    self.state.listeners.write().await.remove(listener)
  }
  /// Replace the exclusion list. Nothing changes if a pattern is invalid.
  pub async fn set_exclusions<I, S>(&self, patterns: I) -> Result<()>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let exclusions = ExclusionList::new(patterns)?;
    *self.state.exclusions.write().await = exclusions;
    Ok(())
  }
  /// Toggle cache lookups for every connection. Disabling clears the list.
  pub async fn enable_cache_processing(&self, enabled: bool) {
    self.state.cache_enabled.store(enabled, Ordering::Release);
    if !enabled {
      self.state.cache.write().await.clear();
    }
  }
  /// Queue a cache entry. Only the first queued entry is consulted.
  pub async fn push_cache_entry(&self, entry: CacheEntry) {
    self.state.cache.write().await.push(entry);
  }
  /// Drop the entry currently consulted, so the next one takes over.
  pub async fn pop_cache_entry(&self) -> Option<CacheEntry> {
    self.state.cache.write().await.pop()
  }
  /// Serialize exchanges across every connection accepted from now on.
  pub fn set_serialize(&self, serialize: bool) {
    self.state.serialize.store(serialize, Ordering::Release);
  }
  /// Whether serialize mode is on.
  pub fn is_serialize(&self) -> bool {
    self.state.serialize.load(Ordering::Acquire)
  }

  fn lock_running(&self) -> std::sync::MutexGuard<'_, Option<Running>> {
    self.running.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl Drop for ProxyServer {
  fn drop(&mut self) {
    if let Some(running) = self.lock_running().take() {
      let _ = running.shutdown.send(true);
      running.task.abort();
    }
  }
}

fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
  let socket = socket2::Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
  socket.set_reuse_address(true)?;
  socket.bind(&addr.into())?;
  socket.listen(LISTEN_BACKLOG)?;
  socket.set_nonblocking(true)?;
  TcpListener::from_std(socket.into())
}

async fn accept_loop(
  listener: TcpListener,
  local_addr: SocketAddr,
  state: Arc<ProxyState>,
  mut stopped: watch::Receiver<bool>,
) {
  loop {
    let accepted = tokio::select! {
      _ = stopped.changed() => break,
      accepted = listener.accept() => accepted,
    };
    match accepted {
      Ok((stream, peer)) => {
        tracing::trace!(%peer, "accepted connection");
        if let Err(e) = stream.set_nodelay(true) {
          tracing::debug!(%peer, "set_nodelay failed: {}", e);
        }
        let handler = ConnectionHandler::new(state.clone(), peer, local_addr, state.session_token());
        tokio::spawn(handler.run(stream));
      }
      Err(e) => {
        tracing::warn!("accept failed: {}", e);
        tokio::time::sleep(state.config.accept_backoff).await;
      }
    }
  }
  tracing::debug!("accept loop on {} exited", local_addr);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_bind_falls_back_to_next_port() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let server = ProxyServer::builder()
      .config(ProxyConfig {
        port,
        max_port_attempts: 50,
        ..Default::default()
      })
      .without_websocket()
      .build()
      .unwrap();
    let actual = server.start().await.unwrap();
    assert_ne!(actual, port);
    assert!(actual > port);
    server.stop().await;
    assert!(server.local_addr().is_none());
  }

  #[tokio::test]
  async fn test_bind_without_fallback_fails() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();
    let server = ProxyServer::builder()
      .config(ProxyConfig {
        port,
        allow_port_fallback: false,
        ..Default::default()
      })
      .without_websocket()
      .build()
      .unwrap();
    assert!(matches!(server.start().await, Err(Error::Bind { .. })));
  }

  #[tokio::test]
  async fn test_invalid_exclusions_keep_previous_list() {
    let server = ProxyServer::builder().without_websocket().build().unwrap();
    server.set_exclusions([".*\\.png"]).await.unwrap();
    assert!(server.set_exclusions(["("]).await.is_err());
    assert_eq!(server.state.exclusions.read().await.len(), 1);
  }
}
