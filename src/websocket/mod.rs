//! WebSocket relay
//!
//! Upgraded connections leave the tokio runtime and are multiplexed by one
//! dedicated thread over non-blocking sockets. Each channel decodes frames as
//! they arrive, assembles fragmented messages per direction and forwards
//! control frames and completed messages byte for byte to the other side.
mod frame;
mod message;
mod observer;
mod relay;
mod selector;
mod stream;

pub use frame::{apply_mask, decode, read_frame, Frame, OpCode, MAX_HEAD_SIZE};
pub use message::{Direction, Message, MessageAssembler};
pub use observer::{ChannelId, ChannelInfo, ChannelState, ObserverRegistry, WebSocketObserver};
pub use relay::{RelayEngine, SUPPORTED_VERSION};
pub use stream::{ReadStatus, RelayStream};

use crate::config::ProxyConfig;
use crate::errors::{Error, Result};
use crate::Socket;
use bytes::Bytes;
use crossbeam_channel::Sender;
use http::{HeaderMap, HeaderName};
use mio::Waker;
use selector::SelectorLoop;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

const SEC_WEBSOCKET_EXTENSIONS: &str = "sec-websocket-extensions";
const SEC_WEBSOCKET_PROTOCOL: &str = "sec-websocket-protocol";
const SEC_WEBSOCKET_VERSION: &str = "sec-websocket-version";

/// Tuning for the selector thread and the channels it relays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOptions {
  /// How long the selector waits before re-checking for shutdown
  pub selector_timeout: Duration,
  /// Longest frame payload before the channel is closed
  pub max_frame_payload: usize,
  /// Longest fragmented message before the channel is closed
  pub max_message_size: usize,
  /// Bytes queued for one socket before reading from its peer pauses
  pub max_backlog: usize,
}

impl From<&ProxyConfig> for RelayOptions {
  fn from(config: &ProxyConfig) -> Self {
    RelayOptions {
      selector_timeout: config.selector_timeout,
      max_frame_payload: config.max_frame_payload,
      max_message_size: config.max_message_size,
      max_backlog: config.max_relay_backlog,
    }
  }
}

impl Default for RelayOptions {
  fn default() -> Self {
    RelayOptions::from(&ProxyConfig::default())
  }
}

/// Entry point of the WebSocket subsystem: owns the selector thread and
/// accepts upgraded socket pairs.
pub struct WebSocketRelay {
  sender: Sender<RelayEngine>,
  waker: Waker,
  options: RelayOptions,
  shutdown: Arc<AtomicBool>,
  observers: Arc<RwLock<ObserverRegistry>>,
  next_id: AtomicU64,
  thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WebSocketRelay {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("WebSocketRelay")
      .field("shutdown", &self.shutdown.load(Ordering::Relaxed))
      .field("next_id", &self.next_id.load(Ordering::Relaxed))
      .finish()
  }
}

impl WebSocketRelay {
  /// Start the selector thread. It re-checks for shutdown every
  /// `selector_timeout`.
  pub fn start(options: RelayOptions) -> Result<Self> {
    let (sender, receiver) = crossbeam_channel::unbounded();
    let observers = Arc::new(RwLock::new(ObserverRegistry::default()));
    let shutdown = Arc::new(AtomicBool::new(false));
    let (selector, waker) = SelectorLoop::new(
      receiver,
      observers.clone(),
      shutdown.clone(),
      options.selector_timeout,
    )?;
    let thread = std::thread::Builder::new()
      .name("websocket-selector".to_string())
      .spawn(move || selector.run())?;
    Ok(WebSocketRelay {
      sender,
      waker,
      options,
      shutdown,
      observers,
      next_id: AtomicU64::new(0),
      thread: Mutex::new(Some(thread)),
    })
  }
  /// Add an observer for every channel, current and future.
  pub fn add_observer(&self, observer: Arc<dyn WebSocketObserver>) {
    self
      .observers
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .add(observer);
  }
  /// Remove an observer by identity.
  pub fn remove_observer(&self, observer: &Arc<dyn WebSocketObserver>) -> bool {
    self
      .observers
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .remove(observer)
  }
  /// Relay an upgraded pair. `headers` are the handshake response headers.
  pub fn add_channel(&self, headers: &HeaderMap, local: Socket, remote: Socket) -> Result<ChannelId> {
    self.add_channel_buffered(headers, local, Bytes::new(), remote, Bytes::new())
  }
  /// Like [`add_channel`](Self::add_channel), with bytes each side already
  /// sent past the handshake.
  pub fn add_channel_buffered(
    &self,
    headers: &HeaderMap,
    local: Socket,
    local_buffered: Bytes,
    remote: Socket,
    remote_buffered: Bytes,
  ) -> Result<ChannelId> {
    if self.shutdown.load(Ordering::Acquire) {
      return Err(Error::IO(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        "websocket relay is shut down",
      )));
    }
    let id = ChannelId(self.next_id.fetch_add(1, Ordering::Relaxed));
    let info = channel_info(id, headers);
    let engine = RelayEngine::new(
      info,
      self.options,
      local.into_relay_stream()?,
      local_buffered,
      remote.into_relay_stream()?,
      remote_buffered,
    )?;
    self.sender.send(engine).map_err(|_| {
      Error::IO(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "websocket selector has stopped",
      ))
    })?;
    self.waker.wake()?;
    Ok(id)
  }
  /// Stop the selector thread, closing every channel, and wait for it.
  pub fn shutdown(&self) {
    self.shutdown.store(true, Ordering::Release);
    let _ = self.waker.wake();
    let thread = self
      .thread
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(thread) = thread {
      if thread.join().is_err() {
        tracing::error!("websocket selector thread panicked");
      }
    }
  }
}

impl Drop for WebSocketRelay {
  fn drop(&mut self) {
    self.shutdown();
  }
}

/// Negotiated parameters from a handshake response. The version defaults
/// to `13` when absent.
pub fn channel_info(id: ChannelId, headers: &HeaderMap) -> ChannelInfo {
  let joined = |name: &'static str| {
    let values = headers
      .get_all(HeaderName::from_static(name))
      .iter()
      .filter_map(|v| v.to_str().ok())
      .map(str::trim)
      .filter(|v| !v.is_empty())
      .collect::<Vec<_>>();
    if values.is_empty() {
      None
    } else {
      Some(values.join(", "))
    }
  };
  ChannelInfo {
    id,
    version: joined(SEC_WEBSOCKET_VERSION).unwrap_or_else(|| SUPPORTED_VERSION.to_string()),
    subprotocol: joined(SEC_WEBSOCKET_PROTOCOL),
    extensions: joined(SEC_WEBSOCKET_EXTENSIONS)
      .map(|v| parse_extensions(&v))
      .unwrap_or_default(),
  }
}

/// `token[; param=value]*` list, comma separated, into name to parameters.
pub fn parse_extensions(value: &str) -> BTreeMap<String, String> {
  value
    .split(',')
    .filter_map(|extension| {
      let (name, params) = match extension.split_once(';') {
        Some((name, params)) => (name, params),
        None => (extension, ""),
      };
      let name = name.trim();
      if name.is_empty() {
        return None;
      }
      let params = params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("; ");
      Some((name.to_string(), params))
    })
    .collect()
}
