use crate::websocket::RelayStream;
use std::io::Error;
use std::net::SocketAddr;
use std::ops::{Deref, DerefMut};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::{client, server};

/// A proxied socket: the client side (plain or inside a CONNECT tunnel) or
/// the origin side (plain or TLS).
#[derive(Debug)]
pub struct Socket {
  inner: MaybeTlsStream,
  write_timeout: Option<Duration>,
}
impl Socket {
  pub(crate) fn new(maybe_tls_stream: MaybeTlsStream, write_timeout: Option<Duration>) -> Self {
    Self {
      inner: maybe_tls_stream,
      write_timeout,
    }
  }
  /// A plain socket, used when handing over streams accepted elsewhere.
  pub fn from_tcp(stream: TcpStream) -> Self {
    Self::new(MaybeTlsStream::Tcp(stream), None)
  }
  pub(crate) fn into_inner(self) -> MaybeTlsStream {
    self.inner
  }
  /// Whether the bytes on this socket are TLS protected.
  pub fn is_tls(&self) -> bool {
    !matches!(self.inner, MaybeTlsStream::Tcp(_))
  }
  /// Address of the other end.
  pub fn peer_addr(&self) -> std::io::Result<SocketAddr> {
    self.tcp().peer_addr()
  }
  fn tcp(&self) -> &TcpStream {
    match &self.inner {
      MaybeTlsStream::Tcp(s) => s,
      MaybeTlsStream::ServerTls(t) => t.get_ref().0,
      MaybeTlsStream::ClientTls(t) => t.get_ref().0,
    }
  }
  /// Leave the tokio reactor and become a non-blocking relay socket.
  ///
  /// A TLS session moves along with its socket so the relay keeps decrypting
  /// where the HTTP side stopped.
  pub(crate) fn into_relay_stream(self) -> std::io::Result<RelayStream> {
    fn detach(stream: TcpStream) -> std::io::Result<mio::net::TcpStream> {
      let std_stream = stream.into_std()?;
      std_stream.set_nonblocking(true)?;
      Ok(mio::net::TcpStream::from_std(std_stream))
    }
    Ok(match self.inner {
      MaybeTlsStream::Tcp(s) => RelayStream::Plain(detach(s)?),
      MaybeTlsStream::ServerTls(t) => {
        let (s, session) = t.into_inner();
        RelayStream::Tls(detach(s)?, Box::new(session.into()))
      }
      MaybeTlsStream::ClientTls(t) => {
        let (s, session) = t.into_inner();
        RelayStream::Tls(detach(s)?, Box::new(session.into()))
      }
    })
  }
}
/// The transport under a [`Socket`].
#[derive(Debug)]
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS terminated by the proxy inside a CONNECT tunnel
  ServerTls(Box<server::TlsStream<TcpStream>>),
  /// TLS towards the origin
  ClientTls(Box<client::TlsStream<TcpStream>>),
}
// 实现socket的读写
impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}
impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}
impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_read(cx, buf),
    }
  }
}
impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_flush(cx),
    }
  }
  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::ServerTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
      MaybeTlsStream::ClientTls(stream) => Pin::new(stream.as_mut()).poll_shutdown(cx),
    }
  }
}
impl Socket {
  /// Attempts to write an entire buffer into this writer, then flushes it.
  pub async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
    let timeout = self.write_timeout;
    let write = async {
      AsyncWriteExt::write_all(self.deref_mut(), buf).await?;
      AsyncWriteExt::flush(self.deref_mut()).await
    };
    match timeout {
      None => write.await,
      Some(t) => tokio::time::timeout(t, write).await?,
    }
  }
  /// Shuts down the output stream, ensuring that the value can be dropped
  /// cleanly.
  pub async fn shutdown(&mut self) -> std::io::Result<()> {
    let timeout = self.write_timeout;
    match timeout {
      None => AsyncWriteExt::shutdown(self.deref_mut()).await,
      Some(t) => tokio::time::timeout(t, AsyncWriteExt::shutdown(self.deref_mut())).await?,
    }
  }
}

// 直接暴露socket的全部外部接口
impl Deref for Socket {
  type Target = MaybeTlsStream;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl DerefMut for Socket {
  fn deref_mut(&mut self) -> &mut Self::Target {
    &mut self.inner
  }
}
