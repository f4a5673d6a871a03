//! One intercepted exchange as seen by listeners and the cache.
use crate::{Request, Response};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, Method, Uri, Version};
use std::time::SystemTime;

/// A request together with the response it produced, if any yet.
///
/// Listeners receive it mutably: changes made in the request phase are what
/// gets forwarded, changes made in the response phase are what the client sees.
#[derive(Debug, Default, Clone)]
pub struct HttpMessage {
  /// request
  pub request: Request,
  /// response, `None` until the origin answered
  pub response: Option<Response>,
  /// when the request was written upstream
  pub sent_at: Option<SystemTime>,
  /// when the response head arrived
  pub received_at: Option<SystemTime>,
}

impl HttpMessage {
  /// Wrap a request that has not been forwarded yet.
  pub fn new(request: Request) -> Self {
    Self {
      request,
      ..Default::default()
    }
  }
  /// Fingerprint of the request half.
  pub fn fingerprint(&self) -> Fingerprint {
    self.request.fingerprint()
  }
}

/// Identity of a request for cache lookups: method, full URI and body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
  /// method
  pub method: Method,
  /// absolute URI
  pub uri: Uri,
  /// body
  pub body: Bytes,
}

/// Whether `name` carries `token` in its comma separated list, ignoring case.
pub(crate) fn has_token(headers: &HeaderMap, name: HeaderName, token: &str) -> bool {
  headers
    .get_all(name)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .any(|t| t.trim().eq_ignore_ascii_case(token))
}

/// Whether the sender of these headers expects the connection to end after
/// this message. `Proxy-Connection` counts as `Connection`.
pub(crate) fn wants_close(headers: &HeaderMap, version: Version) -> bool {
  let proxy_connection = HeaderName::from_static("proxy-connection");
  if has_token(headers, header::CONNECTION, "close")
    || has_token(headers, proxy_connection.clone(), "close")
  {
    return true;
  }
  version < Version::HTTP_11
    && !has_token(headers, header::CONNECTION, "keep-alive")
    && !has_token(headers, proxy_connection, "keep-alive")
}

#[cfg(test)]
mod tests {
  use super::*;
  use http::HeaderValue;

  #[test]
  fn test_has_token() {
    let mut headers = HeaderMap::new();
    headers.append(header::CONNECTION, HeaderValue::from_static("keep-alive"));
    headers.append(header::CONNECTION, HeaderValue::from_static(" Upgrade , x"));
    assert!(has_token(&headers, header::CONNECTION, "upgrade"));
    assert!(has_token(&headers, header::CONNECTION, "KEEP-ALIVE"));
    assert!(!has_token(&headers, header::CONNECTION, "close"));
  }

  #[test]
  fn test_wants_close() {
    let mut headers = HeaderMap::new();
    assert!(!wants_close(&headers, Version::HTTP_11));
    assert!(wants_close(&headers, Version::HTTP_10));
    headers.insert("proxy-connection", HeaderValue::from_static("Keep-Alive"));
    assert!(!wants_close(&headers, Version::HTTP_10));
    headers.insert(header::CONNECTION, HeaderValue::from_static("close"));
    assert!(wants_close(&headers, Version::HTTP_11));
  }
}
