use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

use crate::config::ParseLimits;
use crate::errors::{new_io_error, Error, Result};
use crate::message::{wants_close, Fingerprint};
use crate::response::{
  dechunked, is_chunked, parser_version, read_body, read_chunked_body, read_headers,
};
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Codings removed from `Accept-Encoding` so origins answer uncompressed.
const COMPRESSION_TOKENS: [&str; 5] = ["gzip", "deflate", "compress", "x-gzip", "x-compress"];

/// A request read from the client.
///
/// The URI is always absolute: proxy-form targets are kept as sent, and
/// origin-form targets inside a TLS tunnel are resolved against the tunnel's
/// authority.
#[derive(Default, Clone, PartialEq)]
pub struct Request {
  uri: Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &format_args!("{}", &self.body.escape_ascii()))
      .finish()
  }
}

impl<T> From<http::Request<T>> for Request
where
  T: Into<Bytes>,
{
  fn from(value: http::Request<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: body.into(),
    }
  }
}

impl Request {
  /// Serialize in origin-form, as written to the origin server.
  pub fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    if self.method == Method::CONNECT {
      http_requests.extend(self.authority().as_bytes());
    } else {
      http_requests.extend(self.uri.path().as_bytes());
      if let Some(q) = self.uri.query() {
        http_requests.extend([63]);
        http_requests.extend(q.as_bytes());
      }
    }
    http_requests.extend(SPACE);
    http_requests.extend(format!("{:?}", self.version).as_bytes());
    http_requests.extend(CR_LF);
    if self.headers.get(header::HOST).is_none() {
      http_requests.extend(header::HOST.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(self.authority().as_bytes());
      http_requests.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    if !self.body.is_empty() {
      headers
        .entry(header::CONTENT_LENGTH)
        .or_insert(HeaderValue::from(self.body.len()));
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    http_requests.extend(self.body.as_ref());
    Bytes::from(http_requests)
  }
  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
}

impl Request {
  /// Get the HTTP Method for this request.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get the absolute URI for this request.
  #[inline]
  pub fn uri(&self) -> &Uri {
    &self.uri
  }
  /// Replace the URI. It must stay absolute for the request to be forwardable.
  #[inline]
  pub fn set_uri(&mut self, uri: Uri) {
    self.uri = uri;
  }
  /// Get the HTTP Version for this request.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the headers of this request.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers of this request.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the body of this request.
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Replace the body, keeping `Content-Length` in step.
  pub fn set_body(&mut self, body: impl Into<Bytes>) {
    self.body = body.into();
    self
      .headers
      .insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
  }
  /// Method, URI and body.
  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint {
      method: self.method.clone(),
      uri: self.uri.clone(),
      body: self.body.clone(),
    }
  }
  /// Whether the target is reached over TLS.
  pub fn is_secure(&self) -> bool {
    self.uri.scheme() == Some(&http::uri::Scheme::HTTPS) || self.method == Method::CONNECT
  }
  /// The `host` and `port` this request must be delivered to.
  pub fn target(&self) -> Result<(String, u16)> {
    let host = self
      .uri
      .host()
      .ok_or_else(|| Error::malformed(format!("no host in {}", self.uri)))?;
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    let port = self
      .uri
      .port_u16()
      .unwrap_or(if self.is_secure() { 443 } else { 80 });
    Ok((host, port))
  }
  /// `host:port` as it appears on the wire.
  pub fn authority(&self) -> String {
    match self.uri.authority() {
      Some(a) if a.port().is_some() || self.method != Method::CONNECT => a.to_string(),
      Some(a) => format!("{}:443", a.host()),
      None => String::new(),
    }
  }
  /// Whether the client asked for the connection to end after this exchange.
  pub fn wants_close(&self) -> bool {
    wants_close(&self.headers, self.version)
  }
  /// Drop compression codings from `Accept-Encoding`. One-way.
  pub fn strip_accept_encoding(&mut self) {
    let Some(value) = self.headers.get(header::ACCEPT_ENCODING) else {
      return;
    };
    let kept = value
      .to_str()
      .unwrap_or_default()
      .split(',')
      .map(str::trim)
      .filter(|coding| {
        let name = coding.split(';').next().unwrap_or_default().trim();
        !name.is_empty()
          && !COMPRESSION_TOKENS
            .iter()
            .any(|c| c.eq_ignore_ascii_case(name))
      })
      .collect::<Vec<_>>()
      .join(", ");
    if kept.is_empty() {
      self.headers.remove(header::ACCEPT_ENCODING);
    } else if let Ok(v) = HeaderValue::from_str(&kept) {
      self.headers.insert(header::ACCEPT_ENCODING, v);
    }
  }
  /// Remove hop-by-hop proxy headers before the request leaves the proxy.
  pub(crate) fn strip_proxy_headers(&mut self) {
    self.headers.remove(HeaderName::from_static("proxy-connection"));
    self.headers.remove(header::PROXY_AUTHORIZATION);
  }
}

/// Read one request from the client.
///
/// `tunnel` is the `host:port` of the TLS tunnel the request arrived through,
/// if any. Returns `Ok(None)` when the client closed before sending a byte.
pub(crate) async fn read_request<R>(
  reader: &mut R,
  tunnel: Option<&str>,
  limits: ParseLimits,
) -> Result<Option<Request>>
where
  R: AsyncBufRead + Unpin,
{
  let mut line = Vec::new();
  if reader.read_until(b'\n', &mut line).await? == 0 {
    return Ok(None);
  }
  if line.len() > limits.header {
    return Err(Error::malformed("request line too long"));
  }
  let (method, target, version) = parser_request_line(&line)?;
  let mut headers = read_headers(reader, limits.header).await?;
  let uri = resolve_target(&method, &target, tunnel, &headers)?;
  let body = if is_chunked(&headers) {
    let body = read_chunked_body(reader, limits.body).await?;
    dechunked(&mut headers, body.len());
    body
  } else if let Some(length) = headers
    .get(header::CONTENT_LENGTH)
    .and_then(|v| v.to_str().ok()?.trim().parse::<u64>().ok())
  {
    let body = read_body(reader, length, limits.body).await.map_err(|e| match e {
      Error::IO(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
        new_io_error(e.kind(), "connection closed inside request body")
      }
      other => other,
    })?;
    Bytes::from(body)
  } else {
    Bytes::new()
  };
  Ok(Some(Request {
    uri,
    version,
    method,
    headers,
    body,
  }))
}

fn parser_request_line(line: &[u8]) -> Result<(Method, String, Version)> {
  let text = std::str::from_utf8(line)
    .map_err(|_| Error::malformed("request line is not valid UTF-8"))?
    .trim_end_matches(['\r', '\n']);
  let parts: Vec<&str> = text.split_whitespace().collect();
  if parts.len() != 3 {
    return Err(Error::malformed(format!("invalid request line {text:?}")));
  }
  let method = Method::from_bytes(parts[0].as_bytes())
    .map_err(|_| Error::malformed(format!("invalid method {:?}", parts[0])))?;
  let version = parser_version(parts[2].as_bytes())?;
  Ok((method, parts[1].to_string(), version))
}

fn resolve_target(
  method: &Method,
  target: &str,
  tunnel: Option<&str>,
  headers: &HeaderMap,
) -> Result<Uri> {
  let absolute = if *method == Method::CONNECT || target.contains("://") {
    target.to_string()
  } else if !target.starts_with('/') && target != "*" {
    return Err(Error::malformed(format!("invalid request target {target:?}")));
  } else if let Some(authority) = tunnel {
    format!("https://{authority}{target}")
  } else {
    let host = headers
      .get(header::HOST)
      .and_then(|h| h.to_str().ok())
      .ok_or_else(|| Error::malformed("origin-form request without Host header"))?;
    format!("http://{host}{target}")
  };
  absolute
    .parse::<Uri>()
    .map_err(|e| Error::malformed(format!("invalid uri {absolute:?}: {e}")))
}
