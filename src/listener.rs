//! Ordered listener chain notified of every proxied request and response
use crate::message::HttpMessage;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Observes and may modify traffic passing through the proxy.
///
/// Listeners are called in ascending [`order`](ProxyListener::order), once
/// per request and once per response. Returning `false` stops the chain: in
/// the request phase nothing is forwarded, in the response phase nothing is
/// written back to the client. A panicking listener is logged and skipped.
pub trait ProxyListener: Send + Sync {
  /// Position in the chain, lower runs first.
  fn order(&self) -> i32;
  /// Called before `message.request` is forwarded.
  fn on_request(&self, message: &mut HttpMessage) -> bool;
  /// Called before `message.response` is returned to the client.
  fn on_response(&self, message: &mut HttpMessage) -> bool;
}

/// Listeners sorted by order, stable for equal orders.
#[derive(Clone, Default)]
pub struct ListenerRegistry {
  listeners: Vec<Arc<dyn ProxyListener>>,
}

impl std::fmt::Debug for ListenerRegistry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_list()
      .entries(self.listeners.iter().map(|l| l.order()))
      .finish()
  }
}

impl ListenerRegistry {
  /// Create an empty registry
  pub fn new() -> Self {
    Self::default()
  }
  /// Insert after every listener with the same or a lower order.
  pub fn add(&mut self, listener: Arc<dyn ProxyListener>) {
    let order = listener.order();
    let at = self.listeners.partition_point(|l| l.order() <= order);
    self.listeners.insert(at, listener);
  }
  /// Remove `listener` if it is registered. Identity is by pointer.
  pub fn remove(&mut self, listener: &Arc<dyn ProxyListener>) -> bool {
    match self.listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
      Some(at) => {
        self.listeners.remove(at);
        true
      }
      None => false,
    }
  }
  /// Number of registered listeners
  pub fn len(&self) -> usize {
    self.listeners.len()
  }
  /// Whether nothing is registered
  pub fn is_empty(&self) -> bool {
    self.listeners.is_empty()
  }
  /// Run the request phase. `false` means a listener asked to stop.
  pub fn notify_request(&self, message: &mut HttpMessage) -> bool {
    self.notify(message, Phase::Request)
  }
  /// Run the response phase. `false` means a listener asked to stop.
  pub fn notify_response(&self, message: &mut HttpMessage) -> bool {
    self.notify(message, Phase::Response)
  }
  fn notify(&self, message: &mut HttpMessage, phase: Phase) -> bool {
    for listener in &self.listeners {
      let result = catch_unwind(AssertUnwindSafe(|| match phase {
        Phase::Request => listener.on_request(message),
        Phase::Response => listener.on_response(message),
      }));
      match result {
        Ok(true) => {}
        Ok(false) => {
          tracing::debug!(order = listener.order(), ?phase, uri = %message.request.uri(), "listener stopped the chain");
          return false;
        }
        Err(panic) => {
          tracing::error!(
            order = listener.order(),
            ?phase,
            "listener panicked: {}",
            panic_message(&panic)
          );
        }
      }
    }
    true
  }
}

#[derive(Debug, Clone, Copy)]
enum Phase {
  Request,
  Response,
}

pub(crate) fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = panic.downcast_ref::<String>() {
    s.clone()
  } else {
    String::from("unknown panic")
  }
}

/// Logs every exchange at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingListener;

impl ProxyListener for LoggingListener {
  fn order(&self) -> i32 {
    i32::MIN
  }
  fn on_request(&self, message: &mut HttpMessage) -> bool {
    tracing::debug!(method = %message.request.method(), uri = %message.request.uri(), "request");
    for (name, value) in message.request.headers() {
      tracing::trace!("  {}: {:?}", name, value);
    }
    true
  }
  fn on_response(&self, message: &mut HttpMessage) -> bool {
    if let Some(response) = &message.response {
      tracing::debug!(status = %response.status_code(), uri = %message.request.uri(), "response");
    }
    true
  }
}
