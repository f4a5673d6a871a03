//! The single thread multiplexing every relayed channel
use super::observer::ObserverRegistry;
use super::relay::{RelayEngine, Side};
use crossbeam_channel::Receiver;
use mio::{Events, Poll, Token, Waker};
use slab::Slab;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

pub(crate) const WAKER: Token = Token(usize::MAX);

pub(crate) struct SelectorLoop {
  poll: Poll,
  channels: Slab<RelayEngine>,
  incoming: Receiver<RelayEngine>,
  observers: Arc<RwLock<ObserverRegistry>>,
  shutdown: Arc<AtomicBool>,
  timeout: Duration,
}

impl SelectorLoop {
  /// Create the selector and the waker other threads use to interrupt it.
  pub(crate) fn new(
    incoming: Receiver<RelayEngine>,
    observers: Arc<RwLock<ObserverRegistry>>,
    shutdown: Arc<AtomicBool>,
    timeout: Duration,
  ) -> std::io::Result<(Self, Waker)> {
    let poll = Poll::new()?;
    let waker = Waker::new(poll.registry(), WAKER)?;
    Ok((
      SelectorLoop {
        poll,
        channels: Slab::new(),
        incoming,
        observers,
        shutdown,
        timeout,
      },
      waker,
    ))
  }

  /// Run until shutdown is requested or the selector itself fails.
  pub(crate) fn run(mut self) {
    let mut events = Events::with_capacity(256);
    while !self.shutdown.load(Ordering::Acquire) {
      if let Err(e) = self.poll.poll(&mut events, Some(self.timeout)) {
        if e.kind() == std::io::ErrorKind::Interrupted {
          continue;
        }
        tracing::error!("websocket selector failed, relaying stops: {}", e);
        break;
      }
      let observers = self
        .observers
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
      for event in events.iter() {
        if event.token() == WAKER {
          self.accept_channels(&observers);
          continue;
        }
        let (key, side) = Side::from_token(event.token());
        let Some(engine) = self.channels.get_mut(key) else {
          continue;
        };
        let readable = event.is_readable() || event.is_read_closed() || event.is_error();
        let registry = self.poll.registry();
        let writable = event.is_writable();
        let result = catch_unwind(AssertUnwindSafe(|| {
          engine.on_event(registry, side, readable, writable, &observers)
        }));
        let open = match result {
          Ok(Ok(open)) => open,
          Ok(Err(e)) => {
            tracing::debug!(channel = %engine.info().id, "relay error: {}", e);
            false
          }
          Err(_) => {
            tracing::error!(channel = %engine.info().id, "relay panicked, closing the channel");
            false
          }
        };
        if !open {
          self.remove(key, &observers);
        }
      }
    }
    let observers = self
      .observers
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone();
    // channels queued but never registered are dropped with the receiver
    for key in self.channels.iter().map(|(k, _)| k).collect::<Vec<_>>() {
      self.remove(key, &observers);
    }
    tracing::debug!("websocket selector stopped");
  }

  fn accept_channels(&mut self, observers: &ObserverRegistry) {
    while let Ok(engine) = self.incoming.try_recv() {
      let entry = self.channels.vacant_entry();
      let key = entry.key();
      let engine = entry.insert(engine);
      let open = engine
        .register(self.poll.registry(), key, observers)
        .unwrap_or_else(|e| {
          tracing::warn!(channel = %engine.info().id, "failed to register channel: {}", e);
          false
        });
      if !open {
        self.remove(key, observers);
      }
    }
  }

  fn remove(&mut self, key: usize, observers: &ObserverRegistry) {
    if let Some(mut engine) = self.channels.try_remove(key) {
      engine.close(self.poll.registry(), observers);
    }
  }
}
