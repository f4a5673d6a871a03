//! Non-blocking sockets handed over by the HTTP side
use bytes::{Buf, BytesMut};
use mio::net::TcpStream;
use std::io::{ErrorKind, Read, Write};
use tokio_rustls::rustls::Connection;

const READ_BUF_SIZE: usize = 16 * 1024;

/// How a [`RelayStream::read_available`] call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
  /// Nothing more to read until the next readiness event
  Drained,
  /// The read budget ran out; more may already be waiting
  Budget,
  /// The peer has closed its side
  Closed,
}

/// One side of a relayed channel, plain or still inside its TLS session.
#[derive(Debug)]
pub enum RelayStream {
  /// TCP
  Plain(TcpStream),
  /// TLS session carried over from the tunnel or the origin connection
  Tls(TcpStream, Box<Connection>),
}

impl RelayStream {
  pub(crate) fn socket_mut(&mut self) -> &mut TcpStream {
    match self {
      RelayStream::Plain(s) => s,
      RelayStream::Tls(s, _) => s,
    }
  }
  /// Read what is available into `buf`, stopping once `budget` bytes
  /// have been added.
  pub fn read_available(&mut self, buf: &mut BytesMut, budget: usize) -> std::io::Result<ReadStatus> {
    let limit = buf.len().saturating_add(budget);
    match self {
      RelayStream::Plain(s) => read_plain(s, buf, limit),
      RelayStream::Tls(s, conn) => read_tls(s, conn, buf, limit),
    }
  }
  /// Write as much of `pending` as the socket takes without blocking,
  /// advancing it past what was accepted.
  pub fn write_pending(&mut self, pending: &mut BytesMut) -> std::io::Result<()> {
    match self {
      RelayStream::Plain(s) => {
        while !pending.is_empty() {
          match s.write(pending) {
            Ok(0) => return Err(ErrorKind::WriteZero.into()),
            Ok(n) => pending.advance(n),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
          }
        }
        Ok(())
      }
      RelayStream::Tls(s, conn) => loop {
        while !pending.is_empty() {
          match conn.writer().write(pending)? {
            0 => break,
            n => pending.advance(n),
          }
        }
        if !flush_tls(s, conn)? || pending.is_empty() {
          return Ok(());
        }
      },
    }
  }
  /// Whether bytes are still waiting to reach the socket.
  pub fn wants_write(&self, pending: &BytesMut) -> bool {
    match self {
      RelayStream::Plain(_) => !pending.is_empty(),
      RelayStream::Tls(_, conn) => !pending.is_empty() || conn.wants_write(),
    }
  }
  /// Best effort close: TLS close_notify, then TCP shutdown.
  pub fn shutdown(&mut self) {
    if let RelayStream::Tls(s, conn) = self {
      conn.send_close_notify();
      let _ = flush_tls(s, conn);
    }
    let _ = self.socket_mut().shutdown(std::net::Shutdown::Both);
  }
}

fn read_plain(s: &mut TcpStream, buf: &mut BytesMut, limit: usize) -> std::io::Result<ReadStatus> {
  let mut chunk = [0; READ_BUF_SIZE];
  loop {
    if buf.len() >= limit {
      return Ok(ReadStatus::Budget);
    }
    match s.read(&mut chunk) {
      Ok(0) => return Ok(ReadStatus::Closed),
      Ok(n) => buf.extend_from_slice(&chunk[..n]),
      Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadStatus::Drained),
      Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
      Err(e) => return Err(e),
    }
  }
}

fn read_tls(
  s: &mut TcpStream,
  conn: &mut Connection,
  buf: &mut BytesMut,
  limit: usize,
) -> std::io::Result<ReadStatus> {
  // plaintext decrypted before the handoff comes first
  if drain_plaintext(conn, buf)? {
    return Ok(ReadStatus::Closed);
  }
  loop {
    if buf.len() >= limit {
      return Ok(ReadStatus::Budget);
    }
    let eof = match conn.read_tls(s) {
      Ok(0) => true,
      Ok(_) => false,
      Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(ReadStatus::Drained),
      Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
      Err(e) => return Err(e),
    };
    let state = conn
      .process_new_packets()
      .map_err(|e| std::io::Error::new(ErrorKind::InvalidData, e))?;
    let closed = drain_plaintext(conn, buf)?;
    // alerts and key updates
    flush_tls(s, conn)?;
    if eof || closed || state.peer_has_closed() {
      return Ok(ReadStatus::Closed);
    }
  }
}

/// Move decrypted bytes into `buf`. `true` when the session has ended.
fn drain_plaintext(conn: &mut Connection, buf: &mut BytesMut) -> std::io::Result<bool> {
  let mut chunk = [0; READ_BUF_SIZE];
  loop {
    match conn.reader().read(&mut chunk) {
      Ok(0) => return Ok(true),
      Ok(n) => buf.extend_from_slice(&chunk[..n]),
      Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
      Err(ref e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(true),
      Err(e) => return Err(e),
    }
  }
}

/// Push buffered TLS records to the socket. `false` if the socket is full.
fn flush_tls(s: &mut TcpStream, conn: &mut Connection) -> std::io::Result<bool> {
  while conn.wants_write() {
    match conn.write_tls(s) {
      Ok(_) => {}
      Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
      Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
      Err(e) => return Err(e),
    }
  }
  Ok(true)
}
