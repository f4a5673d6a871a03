//! A relayed channel: two sockets, one assembler, frames forwarded as read
use super::frame;
use super::message::{Direction, MessageAssembler};
use super::observer::{ChannelInfo, ChannelState, ObserverRegistry};
use super::stream::{ReadStatus, RelayStream};
use super::RelayOptions;
use crate::errors::{Error, Result};
use bytes::{Bytes, BytesMut};
use mio::{Interest, Registry, Token};

/// The only protocol version the relay speaks.
pub const SUPPORTED_VERSION: &str = "13";

/// Bytes read from one socket before its frames are decoded and forwarded.
const READ_BUDGET: usize = 64 * 1024;

/// Which socket of the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
  /// the client's socket
  Local = 0,
  /// the origin's socket
  Remote = 1,
}

impl Side {
  pub(crate) fn from_token(token: Token) -> (usize, Side) {
    let side = if token.0 % 2 == 0 {
      Side::Local
    } else {
      Side::Remote
    };
    (token.0 / 2, side)
  }
  fn token(self, key: usize) -> Token {
    Token(key * 2 + self as usize)
  }
  fn direction(self) -> Direction {
    match self {
      Side::Local => Direction::Outgoing,
      Side::Remote => Direction::Incoming,
    }
  }
  fn opposite(self) -> Side {
    match self {
      Side::Local => Side::Remote,
      Side::Remote => Side::Local,
    }
  }
}

#[derive(Debug)]
struct Endpoint {
  stream: RelayStream,
  /// read but not yet decoded
  inbound: BytesMut,
  /// waiting to be written
  outbound: BytesMut,
  /// not read while the other side's backlog is full
  paused: bool,
  registered: Interest,
}

impl Endpoint {
  fn new(stream: RelayStream, buffered: Bytes) -> Self {
    Endpoint {
      stream,
      inbound: BytesMut::from(&buffered[..]),
      outbound: BytesMut::new(),
      paused: false,
      registered: Interest::READABLE,
    }
  }
  fn interest(&self) -> Interest {
    match (self.paused, self.stream.wants_write(&self.outbound)) {
      (false, false) => Interest::READABLE,
      (false, true) => Interest::READABLE | Interest::WRITABLE,
      (true, _) => Interest::WRITABLE,
    }
  }
}

/// Owns both sockets of an upgraded connection and moves frames between them.
#[derive(Debug)]
pub struct RelayEngine {
  info: ChannelInfo,
  options: RelayOptions,
  local: Endpoint,
  remote: Endpoint,
  assembler: MessageAssembler,
  key: Option<usize>,
  closed: bool,
}

impl RelayEngine {
  /// Bind a socket pair. `*_buffered` are bytes the HTTP side had already
  /// read past the handshake; they are relayed first.
  pub fn new(
    info: ChannelInfo,
    options: RelayOptions,
    local: RelayStream,
    local_buffered: Bytes,
    remote: RelayStream,
    remote_buffered: Bytes,
  ) -> Result<Self> {
    if info.version != SUPPORTED_VERSION {
      return Err(Error::UnsupportedVersion(info.version));
    }
    Ok(RelayEngine {
      info,
      options,
      local: Endpoint::new(local, local_buffered),
      remote: Endpoint::new(remote, remote_buffered),
      assembler: MessageAssembler::with_limit(options.max_message_size),
      key: None,
      closed: false,
    })
  }
  /// Negotiated channel parameters.
  pub fn info(&self) -> &ChannelInfo {
    &self.info
  }
  fn endpoint(&mut self, side: Side) -> &mut Endpoint {
    match side {
      Side::Local => &mut self.local,
      Side::Remote => &mut self.remote,
    }
  }
  /// Whether more is queued for `side` than the high-water mark allows.
  fn backlogged(&self, side: Side) -> bool {
    let endpoint = match side {
      Side::Local => &self.local,
      Side::Remote => &self.remote,
    };
    endpoint.outbound.len() > self.options.max_backlog
  }
  /// Register both sockets for readability under slab `key`, announce the
  /// channel and relay whatever was already buffered. `Ok(false)` means a
  /// side closed while doing so.
  pub(crate) fn register(
    &mut self,
    registry: &Registry,
    key: usize,
    observers: &ObserverRegistry,
  ) -> Result<bool> {
    for side in [Side::Local, Side::Remote] {
      let endpoint = self.endpoint(side);
      registry.register(endpoint.stream.socket_mut(), side.token(key), Interest::READABLE)?;
    }
    self.key = Some(key);
    tracing::debug!(channel = %self.info.id, subprotocol = ?self.info.subprotocol, "websocket channel open");
    observers.notify_state(&self.info, ChannelState::Open);
    for side in [Side::Local, Side::Remote] {
      if !self.on_readable(side, observers)? {
        return Ok(false);
      }
    }
    self.update_interest(registry)?;
    Ok(true)
  }
  /// Handle a readiness event. `Ok(false)` means the channel is finished.
  pub(crate) fn on_event(
    &mut self,
    registry: &Registry,
    side: Side,
    readable: bool,
    writable: bool,
    observers: &ObserverRegistry,
  ) -> Result<bool> {
    if writable {
      self.flush(side)?;
      if !self.resume(side.opposite(), observers)? {
        return Ok(false);
      }
    }
    if readable && !self.on_readable(side, observers)? {
      return Ok(false);
    }
    self.update_interest(registry)?;
    Ok(true)
  }
  /// Decode every complete frame available on `side` and forward it.
  /// Reading pauses while the opposite side has more than `max_backlog`
  /// bytes queued. `Ok(false)` once `side` has closed.
  pub(crate) fn on_readable(&mut self, side: Side, observers: &ObserverRegistry) -> Result<bool> {
    let direction = side.direction();
    let max_payload = self.options.max_frame_payload;
    loop {
      if self.backlogged(side.opposite()) {
        let endpoint = self.endpoint(side);
        if !endpoint.paused {
          endpoint.paused = true;
          tracing::trace!(channel = %self.info.id, ?side, "backlog full, reading paused");
        }
        return Ok(true);
      }
      let endpoint = self.endpoint(side);
      let status = endpoint
        .stream
        .read_available(&mut endpoint.inbound, READ_BUDGET)?;
      let mut forwarded = false;
      while let Some(frame) = frame::decode(&mut self.endpoint(side).inbound, max_payload)? {
        tracing::trace!(channel = %self.info.id, ?direction, opcode = ?frame.opcode, fin = frame.fin, len = frame.payload.len(), "frame");
        let Some(message) = self.assembler.feed(direction, frame)? else {
          continue;
        };
        if observers.notify_message(&self.info, direction, &message) {
          let opposite = self.endpoint(side.opposite());
          for raw in message.frames() {
            opposite.outbound.extend_from_slice(raw);
          }
          forwarded = true;
        }
      }
      if forwarded {
        self.flush(side.opposite())?;
      }
      match status {
        ReadStatus::Drained => return Ok(true),
        ReadStatus::Budget => continue,
        ReadStatus::Closed => {
          tracing::debug!(channel = %self.info.id, ?side, "peer closed");
          return Ok(false);
        }
      }
    }
  }
  /// Read from a paused `side` again once the backlog it feeds has drained.
  fn resume(&mut self, side: Side, observers: &ObserverRegistry) -> Result<bool> {
    if !self.endpoint(side).paused || self.backlogged(side.opposite()) {
      return Ok(true);
    }
    self.endpoint(side).paused = false;
    tracing::trace!(channel = %self.info.id, ?side, "backlog drained, reading resumed");
    self.on_readable(side, observers)
  }
  fn flush(&mut self, side: Side) -> Result<()> {
    let endpoint = self.endpoint(side);
    endpoint.stream.write_pending(&mut endpoint.outbound)?;
    Ok(())
  }
  fn update_interest(&mut self, registry: &Registry) -> Result<()> {
    let Some(key) = self.key else {
      return Ok(());
    };
    for side in [Side::Local, Side::Remote] {
      let endpoint = self.endpoint(side);
      let interest = endpoint.interest();
      if interest != endpoint.registered {
        registry.reregister(endpoint.stream.socket_mut(), side.token(key), interest)?;
        endpoint.registered = interest;
      }
    }
    Ok(())
  }
  /// Flush what can be flushed, close both sockets and report `Closed`.
  /// Calling it again does nothing.
  pub(crate) fn close(&mut self, registry: &Registry, observers: &ObserverRegistry) {
    if self.closed {
      return;
    }
    self.closed = true;
    let registered = self.key.is_some();
    for side in [Side::Local, Side::Remote] {
      let _ = self.flush(side);
      let endpoint = self.endpoint(side);
      if registered {
        let _ = registry.deregister(endpoint.stream.socket_mut());
      }
      endpoint.stream.shutdown();
    }
    if self.key.take().is_some() {
      tracing::debug!(channel = %self.info.id, "websocket channel closed");
      observers.notify_state(&self.info, ChannelState::Closed);
    }
  }
}
