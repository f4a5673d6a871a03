#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # snare
//!
//! The `snare` crate is an intercepting HTTP/HTTPS proxy for security
//! testing, with a frame-level WebSocket relay.
//!
//! - Every request and response passes an ordered chain of
//!   [`ProxyListener`]s that can inspect, rewrite or stop it
//! - `CONNECT` tunnels are terminated with certificates from a
//!   [`CertificateProvider`] so HTTPS traffic is visible too
//! - Upgraded connections are relayed by [`WebSocketRelay`], one thread
//!   multiplexing every channel, with [`WebSocketObserver`] hooks on each
//!   assembled message
//!
//! ## Running a proxy
//!
//! ```no_run
//! use std::sync::Arc;
//! # async fn run() -> snare::Result<()> {
//! let server = snare::ProxyServer::builder()
//!   .config(snare::ProxyConfig {
//!     port: 8080,
//!     ..Default::default()
//!   })
//!   .build()?;
//! server.add_listener(Arc::new(snare::LoggingListener)).await;
//! server.set_exclusions([r"https?://.*\.(png|jpg|woff2?)"]).await?;
//! let port = server.start().await?;
//! println!("point your browser at 127.0.0.1:{}", port);
//! # Ok(())
//! # }
//! ```
//!
//! ## HTTPS
//!
//! Without a root of trust the proxy answers every `CONNECT` with a
//! diagnostic page. Provide one with
//! [`certificate_provider`](ProxyServerBuilder::certificate_provider), for
//! example a [`StaticCertificateProvider`] built from PEM files.
//!
//! ## Optional Features
//!
//! - **serde**: Provides serialization and deserialization of [`ProxyConfig`].
//!
mod cache;
mod config;
mod connector;
mod errors;
mod handler;
mod listener;
mod message;
mod request;
mod response;
mod server;
mod socket;
mod tls;
/// WebSocket frames, messages and the relay
pub mod websocket;

pub use cache::{CacheEntry, CacheList, HistoryStore};
pub use config::{ExclusionList, ProxyConfig};
pub use connector::Connector;
pub use errors::{Error, Result};
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use listener::{ListenerRegistry, LoggingListener, ProxyListener};
pub use message::{Fingerprint, HttpMessage};
pub use request::Request;
pub use response::Response;
pub use server::{ProxyServer, ProxyServerBuilder};
pub use socket::{MaybeTlsStream, Socket};
pub use tls::{server_config, CertificateProvider, MissingRootCertificate, StaticCertificateProvider};
pub use tokio_rustls::rustls;
pub use websocket::{Direction, Message, WebSocketObserver, WebSocketRelay};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];
