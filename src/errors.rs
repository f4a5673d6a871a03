//! proxy error
use std::io::ErrorKind;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `snare::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while proxying a connection or relaying a channel.
///
/// Every kind is contained to the smallest scope it concerns: one connection,
/// one channel pair, or (for `Bind`) the listening socket.
#[derive(ThisError, Debug)]
pub enum Error {
  /// Unparsable request/response header or WebSocket frame header
  #[error("malformed header: {0}")]
  MalformedHeader(String),
  /// The request targets the proxy itself
  #[error("request to {0} would loop back into the proxy")]
  Recursive(String),
  /// I/O failure while talking to the origin server
  #[error("upstream {target}: {source}")]
  Upstream {
    /// host:port of the origin
    target: String,
    /// underlying failure
    source: std::io::Error,
  },
  /// The certificate provider has no root of trust to issue from
  #[error("certificate missing: {0}")]
  CertificateMissing(String),
  /// RFC 6455 violation on a relayed channel
  #[error("protocol violation: {0}")]
  ProtocolViolation(String),
  /// WebSocket version other than 13
  #[error("unsupported websocket version {0:?}")]
  UnsupportedVersion(String),
  /// Listening socket could not be bound
  #[error("failed to bind {addr}: {source}")]
  Bind {
    /// last address tried
    addr: String,
    /// underlying failure
    source: std::io::Error,
  },
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// invalid exclusion pattern
  #[error(transparent)]
  Pattern(#[from] regex::Error),
}

impl Error {
  /// Create a malformed-header error and log it
  pub fn malformed(msg: impl Into<String>) -> Self {
    let error = Error::MalformedHeader(msg.into());
    tracing::debug!("{}", error);
    error
  }

  /// Create a protocol violation error and log it
  pub fn protocol(msg: impl Into<String>) -> Self {
    let error = Error::ProtocolViolation(msg.into());
    tracing::warn!("{}", error);
    error
  }

  /// Create a certificate-missing error and log it
  pub fn certificate_missing(msg: impl Into<String>) -> Self {
    let error = Error::CertificateMissing(msg.into());
    tracing::error!("{}", error);
    error
  }

  /// Wrap an I/O failure against the origin `target`
  pub fn upstream(target: impl Into<String>, source: std::io::Error) -> Self {
    Error::Upstream {
      target: target.into(),
      source,
    }
  }

  /// Whether the error is a read/accept timeout
  pub fn is_timeout(&self) -> bool {
    match self {
      Error::IO(e) | Error::Upstream { source: e, .. } => e.kind() == ErrorKind::TimedOut,
      _ => false,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(value: tokio::time::error::Elapsed) -> Self {
    new_io_error(ErrorKind::TimedOut, &value.to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}
