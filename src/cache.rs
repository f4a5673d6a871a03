//! Serving responses from earlier exchanges instead of the origin
use crate::message::{Fingerprint, HttpMessage};
use crate::Response;
use std::collections::VecDeque;
use std::sync::Arc;

/// Where previously recorded exchanges can be looked up.
pub trait HistoryStore: Send + Sync + std::fmt::Debug {
  /// The recorded response for a request with this fingerprint.
  fn lookup(&self, fingerprint: &Fingerprint) -> Option<Response>;
}

/// A cache target.
#[derive(Debug, Clone)]
pub enum CacheEntry {
  /// Serve `response` to a request equal to the stored one.
  InMemory(HttpMessage),
  /// Ask a history store.
  History(Arc<dyn HistoryStore>),
}

impl CacheEntry {
  /// The cached response for `fingerprint`, if this entry has one.
  pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Response> {
    match self {
      CacheEntry::InMemory(message) => {
        if message.fingerprint() == *fingerprint {
          message.response.clone()
        } else {
          None
        }
      }
      CacheEntry::History(store) => store.lookup(fingerprint),
    }
  }
}

/// Queue of cache targets. Only the front entry is ever consulted.
#[derive(Debug, Clone, Default)]
pub struct CacheList {
  entries: VecDeque<CacheEntry>,
}

impl CacheList {
  /// Queue a target behind the active one.
  pub fn push(&mut self, entry: CacheEntry) {
    self.entries.push_back(entry);
  }
  /// Drop the active target, making the next one active.
  pub fn pop(&mut self) -> Option<CacheEntry> {
    self.entries.pop_front()
  }
  /// Remove every target.
  pub fn clear(&mut self) {
    self.entries.clear();
  }
  /// Number of queued targets, the active one included.
  pub fn len(&self) -> usize {
    self.entries.len()
  }
  /// Whether nothing is queued.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }
  /// Look `fingerprint` up in the active target only.
  pub fn lookup(&self, fingerprint: &Fingerprint) -> Option<Response> {
    self.entries.front()?.lookup(fingerprint)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::Request;
  use http::StatusCode;

  fn message(uri: &str, status: StatusCode) -> HttpMessage {
    let request = Request::from(http::Request::get(uri).body(Vec::new()).unwrap());
    HttpMessage {
      request,
      response: Some(Response::plain(status, "cached")),
      ..Default::default()
    }
  }

  #[derive(Debug)]
  struct Everything;

  impl HistoryStore for Everything {
    fn lookup(&self, _: &Fingerprint) -> Option<Response> {
      Some(Response::plain(StatusCode::ACCEPTED, "history"))
    }
  }

  #[test]
  fn test_in_memory_matches_fingerprint() {
    let entry = CacheEntry::InMemory(message("http://a.test/x", StatusCode::OK));
    let hit = message("http://a.test/x", StatusCode::IM_A_TEAPOT).fingerprint();
    let miss = message("http://a.test/y", StatusCode::OK).fingerprint();
    assert_eq!(entry.lookup(&hit).unwrap().status_code(), StatusCode::OK);
    assert!(entry.lookup(&miss).is_none());
  }

  #[test]
  fn test_only_front_entry_is_consulted() {
    let mut list = CacheList::default();
    list.push(CacheEntry::InMemory(message("http://a.test/x", StatusCode::OK)));
    list.push(CacheEntry::History(Arc::new(Everything)));
    let other = message("http://b.test/", StatusCode::OK).fingerprint();
    assert!(list.lookup(&other).is_none());
    list.pop();
    assert_eq!(
      list.lookup(&other).unwrap().status_code(),
      StatusCode::ACCEPTED
    );
    list.clear();
    assert!(list.lookup(&other).is_none());
  }
}
