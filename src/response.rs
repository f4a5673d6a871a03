use crate::config::ParseLimits;
use crate::errors::{new_io_error, Error, Result};
use crate::message::has_token;
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{header, HeaderMap, HeaderValue, Method, StatusCode, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// A Response received from the origin, or synthesized by the proxy.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Response {
  version: Version,
  status_code: StatusCode,
  headers: HeaderMap<HeaderValue>,
  body: Bytes,
  // body was delimited by the origin closing the connection
  close_delimited: bool,
}

impl<T> From<http::Response<T>> for Response
where
  T: Into<Bytes>,
{
  fn from(value: http::Response<T>) -> Self {
    let (parts, body) = value.into_parts();
    Self {
      version: parts.version,
      status_code: parts.status,
      headers: parts.headers,
      body: body.into(),
      close_delimited: false,
    }
  }
}

impl Response {
  /// Serialize the response exactly as it is written to the client.
  pub fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(format!("{}", self.status_code).as_bytes());
    http_response.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    http_response.extend(self.body.as_ref());
    Bytes::from(http_response)
  }
  /// An HTTP response builder
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// A plaintext response generated by the proxy itself.
  pub fn plain(status_code: StatusCode, text: impl Into<String>) -> Response {
    let body = Bytes::from(text.into());
    let mut headers = HeaderMap::new();
    headers.insert(
      header::CONTENT_TYPE,
      HeaderValue::from_static("text/plain; charset=UTF-8"),
    );
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(body.len()));
    Response {
      version: Version::HTTP_11,
      status_code,
      headers,
      body,
      close_delimited: false,
    }
  }
  /// The response delivered to the client when the upstream exchange fails.
  pub fn gateway_timeout(reason: impl std::fmt::Display) -> Response {
    Response::plain(StatusCode::GATEWAY_TIMEOUT, format!("{reason}"))
  }
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the body of this `Response`.
  #[inline]
  pub fn body(&self) -> &Bytes {
    &self.body
  }
  /// Replace the body, keeping `Content-Length` in step.
  pub fn set_body(&mut self, body: impl Into<Bytes>) {
    self.body = body.into();
    if !self.close_delimited {
      self
        .headers
        .insert(header::CONTENT_LENGTH, HeaderValue::from(self.body.len()));
    }
  }
  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.trim().parse().ok())
  }
  /// The origin gave no length, so the body ran until it closed the connection.
  pub fn is_close_delimited(&self) -> bool {
    self.close_delimited
  }
  /// `Connection: upgrade` together with `Upgrade: websocket`.
  pub fn is_websocket_upgrade(&self) -> bool {
    has_token(&self.headers, header::CONNECTION, "upgrade")
      && self
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"))
  }
}

/// Read one response from the origin.
///
/// Returns `Ok(None)` when the origin closed the connection before sending a
/// single byte. Interim `1xx` responses other than `101` are skipped. Reading
/// stops right after the head of a `101`, leaving whatever follows buffered in
/// `reader`.
pub(crate) async fn read_response<R>(
  reader: &mut R,
  method: &Method,
  limits: ParseLimits,
) -> Result<Option<Response>>
where
  R: AsyncBufRead + Unpin,
{
  loop {
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Ok(None);
    }
    let (version, status_code) = parser_status_line(&line)?;
    let headers = read_headers(reader, limits.header).await?;
    let mut response = Response {
      version,
      status_code,
      headers,
      body: Bytes::new(),
      close_delimited: false,
    };
    if status_code.is_informational() && status_code != StatusCode::SWITCHING_PROTOCOLS {
      tracing::trace!(status = %status_code, "skipping interim response");
      continue;
    }
    let bodyless = *method == Method::HEAD
      || status_code.is_informational()
      || status_code == StatusCode::NO_CONTENT
      || status_code == StatusCode::NOT_MODIFIED;
    if bodyless {
      return Ok(Some(response));
    }
    if is_chunked(&response.headers) {
      response.body = read_chunked_body(reader, limits.body).await?;
      dechunked(&mut response.headers, response.body.len());
    } else if let Some(length) = response.content_length() {
      response.body = read_body(reader, length, limits.body).await?.into();
    } else {
      let mut body = Vec::new();
      let read = (&mut *reader)
        .take((limits.body as u64).saturating_add(1))
        .read_to_end(&mut body)
        .await?;
      if read > limits.body {
        return Err(Error::malformed(format!(
          "body without a length exceeds the {} byte limit",
          limits.body
        )));
      }
      response.body = body.into();
      response.close_delimited = true;
    }
    return Ok(Some(response));
  }
}

fn parser_status_line(line: &[u8]) -> Result<(Version, StatusCode)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let mut parts = line.splitn(3, |b| b == &b' ');
  let version = parser_version(parts.next().unwrap_or_default())?;
  let code = parts
    .next()
    .filter(|c| !c.is_empty())
    .ok_or_else(|| Error::malformed("missing status code"))?;
  let status_code = StatusCode::from_bytes(code)
    .map_err(|_| Error::malformed(format!("bad status code {}", code.escape_ascii())))?;
  Ok((version, status_code))
}

pub(crate) fn parser_version(v: &[u8]) -> Result<Version> {
  match v {
    b"HTTP/0.9" => Ok(Version::HTTP_09),
    b"HTTP/1.0" => Ok(Version::HTTP_10),
    b"HTTP/1.1" => Ok(Version::HTTP_11),
    _ => Err(Error::malformed(format!(
      "unsupported http version {}",
      v.escape_ascii()
    ))),
  }
}

/// Read a header block up to and including the empty line.
pub(crate) async fn read_headers<R>(reader: &mut R, max_header_size: usize) -> Result<HeaderMap>
where
  R: AsyncBufRead + Unpin,
{
  let mut headers = HeaderMap::new();
  let mut total = 0;
  let mut header_line = Vec::new();
  loop {
    header_line.clear();
    let length = reader.read_until(b'\n', &mut header_line).await?;
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside header block",
      ));
    }
    total += length;
    if total > max_header_size {
      return Err(Error::malformed("header block exceeds maximum size"));
    }
    if header_line == b"\r\n" || header_line == b"\n" {
      return Ok(headers);
    }
    let (k, v) = parser_headers(&header_line)?;
    headers.append(k, v);
  }
}

pub(crate) fn parser_headers(buffer: &[u8]) -> Result<(http::HeaderName, http::HeaderValue)> {
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\r").unwrap_or(buffer);
  let mut split = buffer.splitn(2, |s| s == &b':');
  let (Some(name), Some(value)) = (split.next(), split.next()) else {
    return Err(Error::malformed(format!(
      "header line without colon: {}",
      buffer.escape_ascii()
    )));
  };
  let k = http::HeaderName::from_bytes(name.trim_ascii())
    .map_err(|e| Error::malformed(format!("bad header name: {e}")))?;
  let v = http::HeaderValue::from_bytes(value.trim_ascii())
    .map_err(|e| Error::malformed(format!("bad header value: {e}")))?;
  Ok((k, v))
}

pub(crate) fn is_chunked(headers: &HeaderMap) -> bool {
  has_token(headers, header::TRANSFER_ENCODING, "chunked")
}

/// After de-chunking the body travels with a plain `Content-Length`.
pub(crate) fn dechunked(headers: &mut HeaderMap, length: usize) {
  headers.remove(header::TRANSFER_ENCODING);
  headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
}

fn check_body_size(length: u64, max_body_size: usize) -> Result<()> {
  if length > max_body_size as u64 {
    return Err(Error::malformed(format!(
      "body of {} bytes exceeds the {} byte limit",
      length, max_body_size
    )));
  }
  Ok(())
}

/// Read a body of exactly `length` bytes. The buffer grows with what
/// actually arrives, never with what the header announced.
pub(crate) async fn read_body<R>(reader: &mut R, length: u64, max_body_size: usize) -> Result<Vec<u8>>
where
  R: AsyncBufRead + Unpin,
{
  check_body_size(length, max_body_size)?;
  let mut body = Vec::new();
  let read = (&mut *reader).take(length).read_to_end(&mut body).await?;
  if (read as u64) < length {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "connection closed inside body",
    ));
  }
  Ok(body)
}

pub(crate) async fn read_chunked_body<R>(reader: &mut R, max_body_size: usize) -> Result<Bytes>
where
  R: AsyncBufRead + Unpin,
{
  let mut body: Vec<u8> = Vec::new();
  let mut line = Vec::new();
  loop {
    line.clear();
    if reader.read_until(b'\n', &mut line).await? == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside chunked body",
      ));
    }
    let size = line
      .split(|b| *b == b';')
      .next()
      .map(|s| s.trim_ascii())
      .unwrap_or_default();
    let size = std::str::from_utf8(size)
      .ok()
      .and_then(|s| u64::from_str_radix(s, 16).ok())
      .ok_or_else(|| Error::malformed(format!("bad chunk size {}", line.escape_ascii())))?;
    if size == 0 {
      // trailers
      loop {
        line.clear();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 || line == b"\r\n" || line == b"\n" {
          return Ok(body.into());
        }
      }
    }
    check_body_size((body.len() as u64).saturating_add(size), max_body_size)?;
    let read = (&mut *reader).take(size).read_to_end(&mut body).await?;
    if (read as u64) < size {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside chunk",
      ));
    }
    line.clear();
    reader.read_until(b'\n', &mut line).await?;
  }
}
