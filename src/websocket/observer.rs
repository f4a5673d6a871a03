//! Hooks into relayed WebSocket traffic
use super::message::{Direction, Message};
use crate::listener::panic_message;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Identity of a relayed channel, unique for the life of a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(pub u64);

impl Display for ChannelId {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// What the handshake negotiated for a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
  /// id
  pub id: ChannelId,
  /// `Sec-WebSocket-Version`
  pub version: String,
  /// `Sec-WebSocket-Protocol`
  pub subprotocol: Option<String>,
  /// `Sec-WebSocket-Extensions`, extension name to its parameter string
  pub extensions: BTreeMap<String, String>,
}

/// Lifecycle of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
  /// registered with the selector
  Open,
  /// both sockets closed
  Closed,
}

/// Observes, and may suppress, relayed messages.
///
/// Called on the selector thread, so implementations must not block.
pub trait WebSocketObserver: Send + Sync {
  /// Position in the chain, lower runs first.
  fn order(&self) -> i32;
  /// A complete message or a control frame about to be forwarded.
  /// Returning `false` drops it.
  fn on_message(&self, channel: &ChannelInfo, direction: Direction, message: &Message) -> bool;
  /// The channel opened or closed.
  fn on_state_change(&self, channel: &ChannelInfo, state: ChannelState);
}

/// Observers sorted by order, stable for equal orders.
#[derive(Clone, Default)]
pub struct ObserverRegistry {
  observers: Vec<Arc<dyn WebSocketObserver>>,
}

impl ObserverRegistry {
  /// Insert after every observer with the same or a lower order.
  pub fn add(&mut self, observer: Arc<dyn WebSocketObserver>) {
    let order = observer.order();
    let at = self.observers.partition_point(|o| o.order() <= order);
    self.observers.insert(at, observer);
  }
  /// Remove `observer` by identity.
  pub fn remove(&mut self, observer: &Arc<dyn WebSocketObserver>) -> bool {
    match self.observers.iter().position(|o| Arc::ptr_eq(o, observer)) {
      Some(at) => {
        self.observers.remove(at);
        true
      }
      None => false,
    }
  }
  /// Number of observers
  pub fn len(&self) -> usize {
    self.observers.len()
  }
  /// Whether there are none
  pub fn is_empty(&self) -> bool {
    self.observers.is_empty()
  }
  pub(crate) fn notify_message(
    &self,
    channel: &ChannelInfo,
    direction: Direction,
    message: &Message,
  ) -> bool {
    for observer in &self.observers {
      match catch_unwind(AssertUnwindSafe(|| {
        observer.on_message(channel, direction, message)
      })) {
        Ok(true) => {}
        Ok(false) => {
          tracing::debug!(channel = %channel.id, ?direction, opcode = ?message.opcode(), "observer dropped message");
          return false;
        }
        Err(panic) => {
          tracing::error!(channel = %channel.id, "websocket observer panicked: {}", panic_message(&panic));
        }
      }
    }
    true
  }
  pub(crate) fn notify_state(&self, channel: &ChannelInfo, state: ChannelState) {
    for observer in &self.observers {
      if let Err(panic) = catch_unwind(AssertUnwindSafe(|| {
        observer.on_state_change(channel, state)
      })) {
        tracing::error!(channel = %channel.id, "websocket observer panicked: {}", panic_message(&panic));
      }
    }
  }
}
