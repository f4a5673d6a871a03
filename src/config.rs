//! Proxy configuration and the URL exclusion list
use crate::errors::Result;
use regex::{Regex, RegexBuilder};
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Settings shared by the listening socket and every connection it accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProxyConfig {
  /// Address to listen on
  pub bind_addr: IpAddr,
  /// First port to try
  pub port: u16,
  /// Try the following ports when `port` is taken
  pub allow_port_fallback: bool,
  /// How many ports to try in total when falling back
  pub max_port_attempts: u16,
  /// Read timeout for the first request on a connection
  pub first_read_timeout: Duration,
  /// Read timeout while waiting for a further request on a keep-alive connection
  pub keep_alive_timeout: Duration,
  /// Timeout for connecting to an origin server
  pub upstream_connect_timeout: Duration,
  /// Timeout for reading a response from an origin server
  pub upstream_read_timeout: Duration,
  /// Pause after a failed accept
  pub accept_backoff: Duration,
  /// Process one exchange at a time across all connections
  pub serialize: bool,
  /// Verify origin certificates against the webpki roots
  pub upstream_certs_verification: bool,
  /// Largest accepted request or response head, in bytes
  pub max_header_size: usize,
  /// Largest accepted request or response body, in bytes
  pub max_body_size: usize,
  /// Timeout for writing to a client or an origin
  pub write_timeout: Duration,
  /// Largest websocket frame payload; a longer frame closes its channel
  pub max_frame_payload: usize,
  /// Largest fragmented websocket message; a longer one closes its channel
  pub max_message_size: usize,
  /// Bytes queued for one relayed socket before reading from its peer pauses
  pub max_relay_backlog: usize,
  /// How long the websocket selector waits before re-checking for shutdown
  pub selector_timeout: Duration,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
      port: 8080,
      allow_port_fallback: true,
      max_port_attempts: 20,
      first_read_timeout: Duration::from_secs(60),
      keep_alive_timeout: Duration::from_secs(15),
      upstream_connect_timeout: Duration::from_secs(10),
      upstream_read_timeout: Duration::from_secs(60),
      accept_backoff: Duration::from_millis(100),
      serialize: false,
      upstream_certs_verification: false,
      max_header_size: 64 * 1024,
      max_body_size: 64 * 1024 * 1024,
      write_timeout: Duration::from_secs(60),
      max_frame_payload: 16 * 1024 * 1024,
      max_message_size: 64 * 1024 * 1024,
      max_relay_backlog: 1024 * 1024,
      selector_timeout: Duration::from_secs(1),
    }
  }
}

/// Size limits applied while reading one HTTP message off a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ParseLimits {
  pub(crate) header: usize,
  pub(crate) body: usize,
}

impl From<&ProxyConfig> for ParseLimits {
  fn from(config: &ProxyConfig) -> Self {
    ParseLimits {
      header: config.max_header_size,
      body: config.max_body_size,
    }
  }
}

/// Requests whose URI fully matches one of these patterns bypass listeners
/// and the cache but are still forwarded.
#[derive(Debug, Clone, Default)]
pub struct ExclusionList {
  patterns: Vec<Regex>,
}

impl ExclusionList {
  /// Compile `patterns` case-insensitively. Each must match the whole URI.
  pub fn new<I, S>(patterns: I) -> Result<Self>
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    let patterns = patterns
      .into_iter()
      .map(|p| {
        RegexBuilder::new(&format!("^(?:{})$", p.as_ref()))
          .case_insensitive(true)
          .build()
      })
      .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(Self { patterns })
  }
  /// Whether `uri` is excluded.
  pub fn is_excluded(&self, uri: &str) -> bool {
    self.patterns.iter().any(|p| p.is_match(uri))
  }
  /// Number of patterns.
  pub fn len(&self) -> usize {
    self.patterns.len()
  }
  /// Whether the list has no patterns.
  pub fn is_empty(&self) -> bool {
    self.patterns.is_empty()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_exclusion_is_full_match_and_case_insensitive() {
    let list = ExclusionList::new([r"https?://static\.example\.com/.*"]).unwrap();
    assert!(list.is_excluded("http://STATIC.example.com/app.js"));
    assert!(list.is_excluded("https://static.example.com/"));
    assert!(!list.is_excluded("http://evil.com/?r=http://static.example.com/x"));
  }

  #[test]
  fn test_bad_pattern_is_rejected() {
    assert!(matches!(
      ExclusionList::new(["("]),
      Err(crate::Error::Pattern(_))
    ));
  }

  #[test]
  fn test_defaults() {
    let config = ProxyConfig::default();
    assert_eq!(config.port, 8080);
    assert_eq!(config.max_port_attempts, 20);
    assert!(config.keep_alive_timeout < config.first_read_timeout);
    assert!(!config.upstream_certs_verification);
    assert!(config.max_frame_payload <= config.max_message_size);
    assert_eq!(
      ParseLimits::from(&config),
      ParseLimits {
        header: 64 * 1024,
        body: 64 * 1024 * 1024
      }
    );
  }
}
