//! Integration tests for snare: a real proxy against in-process origins

use bytes::{Bytes, BytesMut};
use snare::rustls::pki_types::ServerName;
use snare::websocket::{decode, ChannelId, ChannelInfo, ChannelState, Frame, OpCode};
use snare::{
  CacheEntry, CertificateProvider, Direction, Error, Fingerprint, HistoryStore, HttpMessage,
  Message, ProxyConfig, ProxyListener, ProxyServer, Request, Response, StaticCertificateProvider,
  StatusCode, WebSocketObserver,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::io::{
  AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader,
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const WAIT: Duration = Duration::from_secs(10);

fn init_tracing() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
    .with_test_writer()
    .try_init();
}

fn test_config() -> ProxyConfig {
  init_tracing();
  ProxyConfig {
    port: 0,
    first_read_timeout: Duration::from_secs(5),
    keep_alive_timeout: Duration::from_secs(2),
    upstream_read_timeout: Duration::from_secs(5),
    selector_timeout: Duration::from_millis(100),
    ..Default::default()
  }
}

async fn start(server: ProxyServer) -> (ProxyServer, u16) {
  let port = server.start().await.unwrap();
  (server, port)
}

async fn proxy() -> (ProxyServer, u16) {
  start(ProxyServer::builder().config(test_config()).build().unwrap()).await
}

// ---------------------------------------------------------------------------
// origins

struct Origin {
  port: u16,
  requests: Arc<Mutex<Vec<String>>>,
  connections: Arc<AtomicUsize>,
}

impl Origin {
  fn requests(&self) -> Vec<String> {
    self.requests.lock().unwrap().clone()
  }
  fn paths(&self) -> Vec<String> {
    self
      .requests()
      .iter()
      .map(|head| path(head).to_string())
      .collect()
  }
}

async fn spawn_origin<F>(delay: Duration, tls: Option<TlsAcceptor>, respond: F) -> Origin
where
  F: Fn(&str) -> String + Send + Sync + 'static,
{
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let requests = Arc::new(Mutex::new(Vec::new()));
  let connections = Arc::new(AtomicUsize::new(0));
  let respond = Arc::new(respond);
  let (seen, count) = (requests.clone(), connections.clone());
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      count.fetch_add(1, Ordering::SeqCst);
      let (seen, respond, tls) = (seen.clone(), respond.clone(), tls.clone());
      tokio::spawn(async move {
        match tls {
          Some(acceptor) => {
            if let Ok(stream) = acceptor.accept(stream).await {
              serve_http(stream, delay, seen, respond).await
            }
          }
          None => serve_http(stream, delay, seen, respond).await,
        }
      });
    }
  });
  Origin {
    port,
    requests,
    connections,
  }
}

fn ok(body: &str) -> String {
  format!(
    "HTTP/1.1 200 OK\r\nContent-Length: {}\r\n\r\n{}",
    body.len(),
    body
  )
}

async fn plain_origin() -> Origin {
  spawn_origin(Duration::ZERO, None, |head| ok(&format!("origin {}", path(head)))).await
}

async fn serve_http<S, F>(
  stream: S,
  delay: Duration,
  requests: Arc<Mutex<Vec<String>>>,
  respond: Arc<F>,
) where
  S: AsyncRead + AsyncWrite + Unpin,
  F: Fn(&str) -> String,
{
  let mut stream = BufReader::new(stream);
  while let Some(head) = read_head(&mut stream).await {
    if let Some(length) = content_length(&head) {
      let mut body = vec![0; length];
      if stream.read_exact(&mut body).await.is_err() {
        return;
      }
    }
    requests.lock().unwrap().push(head.clone());
    tokio::time::sleep(delay).await;
    let reply = respond(&head);
    if stream.write_all(reply.as_bytes()).await.is_err() {
      return;
    }
    if reply.starts_with("HTTP/1.0") || reply.to_ascii_lowercase().contains("connection: close") {
      let _ = stream.shutdown().await;
      return;
    }
  }
}

// ---------------------------------------------------------------------------
// wire helpers

async fn read_head<R: AsyncBufRead + Unpin>(reader: &mut R) -> Option<String> {
  let mut head = String::new();
  loop {
    let mut line = String::new();
    if reader.read_line(&mut line).await.ok()? == 0 {
      return None;
    }
    head.push_str(&line);
    if line == "\r\n" {
      return Some(head);
    }
  }
}

fn header<'a>(head: &'a str, name: &str) -> Option<&'a str> {
  head.lines().find_map(|line| {
    let (k, v) = line.split_once(':')?;
    k.trim().eq_ignore_ascii_case(name).then(|| v.trim())
  })
}

fn content_length(head: &str) -> Option<usize> {
  header(head, "content-length")?.parse().ok()
}

fn path(head: &str) -> &str {
  head.split_whitespace().nth(1).unwrap_or_default()
}

fn status(head: &str) -> u16 {
  head
    .split_whitespace()
    .nth(1)
    .and_then(|s| s.parse().ok())
    .unwrap_or_default()
}

async fn connect_proxy(port: u16) -> BufReader<TcpStream> {
  BufReader::new(TcpStream::connect(("127.0.0.1", port)).await.unwrap())
}

async fn read_response<S: AsyncRead + Unpin>(client: &mut BufReader<S>) -> Option<(String, Vec<u8>)> {
  let head = tokio::time::timeout(WAIT, read_head(client)).await.ok()??;
  let mut body = Vec::new();
  match content_length(&head) {
    Some(length) => {
      body.resize(length, 0);
      client.read_exact(&mut body).await.ok()?;
    }
    None => {
      tokio::time::timeout(WAIT, client.read_to_end(&mut body))
        .await
        .ok()?
        .ok()?;
    }
  }
  Some((head, body))
}

async fn exchange<S: AsyncRead + AsyncWrite + Unpin>(
  client: &mut BufReader<S>,
  raw: &str,
) -> Option<(String, Vec<u8>)> {
  client.write_all(raw.as_bytes()).await.ok()?;
  read_response(client).await
}

fn get(port: u16, path: &str) -> String {
  format!("GET http://127.0.0.1:{port}{path} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n")
}

async fn is_closed<S: AsyncRead + Unpin>(client: &mut BufReader<S>) -> bool {
  let mut byte = [0; 1];
  matches!(
    tokio::time::timeout(WAIT, client.read(&mut byte)).await,
    Ok(Ok(0)) | Ok(Err(_))
  )
}

async fn eventually<F: Fn() -> bool>(check: F) -> bool {
  for _ in 0..100 {
    if check() {
      return true;
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
  }
  false
}

// ---------------------------------------------------------------------------
// listeners

struct Recorder {
  order: i32,
  log: Arc<Mutex<Vec<String>>>,
}

impl ProxyListener for Recorder {
  fn order(&self) -> i32 {
    self.order
  }
  fn on_request(&self, message: &mut HttpMessage) -> bool {
    self
      .log
      .lock()
      .unwrap()
      .push(format!("{} request {}", self.order, message.request.uri().path()));
    true
  }
  fn on_response(&self, message: &mut HttpMessage) -> bool {
    self
      .log
      .lock()
      .unwrap()
      .push(format!("{} response {}", self.order, message.request.uri().path()));
    true
  }
}

struct Tagger;

impl ProxyListener for Tagger {
  fn order(&self) -> i32 {
    5
  }
  fn on_request(&self, message: &mut HttpMessage) -> bool {
    message
      .request
      .headers_mut()
      .insert("x-snare", snare::header::HeaderValue::from_static("tagged"));
    true
  }
  fn on_response(&self, message: &mut HttpMessage) -> bool {
    if let Some(response) = message.response.as_mut() {
      response.set_body("rewritten");
    }
    true
  }
}

struct Panicking;

impl ProxyListener for Panicking {
  fn order(&self) -> i32 {
    0
  }
  fn on_request(&self, _: &mut HttpMessage) -> bool {
    panic!("listener bug in request phase")
  }
  fn on_response(&self, _: &mut HttpMessage) -> bool {
    panic!("listener bug in response phase")
  }
}

struct Blocker;

impl ProxyListener for Blocker {
  fn order(&self) -> i32 {
    0
  }
  fn on_request(&self, message: &mut HttpMessage) -> bool {
    message.request.uri().path() != "/blocked"
  }
  fn on_response(&self, _: &mut HttpMessage) -> bool {
    true
  }
}

#[derive(Default)]
struct Timestamps {
  exchanges: Mutex<Vec<(SystemTime, SystemTime)>>,
}

impl ProxyListener for Timestamps {
  fn order(&self) -> i32 {
    0
  }
  fn on_request(&self, _: &mut HttpMessage) -> bool {
    true
  }
  fn on_response(&self, message: &mut HttpMessage) -> bool {
    if let (Some(sent), Some(received)) = (message.sent_at, message.received_at) {
      self.exchanges.lock().unwrap().push((sent, received));
    }
    true
  }
}

// ---------------------------------------------------------------------------
// HTTP pipeline

#[tokio::test]
async fn test_listeners_run_in_order_and_rewrite() {
  let origin = plain_origin().await;
  let (server, port) = proxy().await;
  let log = Arc::new(Mutex::new(Vec::new()));
  for order in [30, -1, 10] {
    server
      .add_listener(Arc::new(Recorder {
        order,
        log: log.clone(),
      }))
      .await;
  }
  server.add_listener(Arc::new(Tagger)).await;

  let mut client = connect_proxy(port).await;
  let (head, body) = exchange(&mut client, &get(origin.port, "/ordered"))
    .await
    .unwrap();
  assert_eq!(status(&head), 200);
  assert_eq!(body, b"rewritten");
  assert_eq!(
    *log.lock().unwrap(),
    vec![
      "-1 request /ordered",
      "10 request /ordered",
      "30 request /ordered",
      "-1 response /ordered",
      "10 response /ordered",
      "30 response /ordered",
    ]
  );
  assert_eq!(header(&origin.requests()[0], "x-snare"), Some("tagged"));
  server.stop().await;
}

#[tokio::test]
async fn test_panicking_listener_is_fail_open() {
  let origin = plain_origin().await;
  let (server, port) = proxy().await;
  let log = Arc::new(Mutex::new(Vec::new()));
  server.add_listener(Arc::new(Panicking)).await;
  server
    .add_listener(Arc::new(Recorder {
      order: 1,
      log: log.clone(),
    }))
    .await;

  let mut client = connect_proxy(port).await;
  let (head, body) = exchange(&mut client, &get(origin.port, "/still-works"))
    .await
    .unwrap();
  assert_eq!(status(&head), 200);
  assert_eq!(body, b"origin /still-works");
  assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_stopped_request_keeps_connection_open() {
  let origin = plain_origin().await;
  let (_server, port) = {
    let (server, port) = proxy().await;
    server.add_listener(Arc::new(Blocker)).await;
    (server, port)
  };

  let mut client = connect_proxy(port).await;
  let pipelined = format!("{}{}", get(origin.port, "/blocked"), get(origin.port, "/ok"));
  let (head, body) = exchange(&mut client, &pipelined).await.unwrap();
  assert_eq!(status(&head), 200);
  assert_eq!(body, b"origin /ok");
  assert_eq!(origin.paths(), vec!["/ok"]);
}

#[tokio::test]
async fn test_excluded_uris_bypass_listeners() {
  let origin = plain_origin().await;
  let (server, port) = proxy().await;
  let log = Arc::new(Mutex::new(Vec::new()));
  server
    .add_listener(Arc::new(Recorder {
      order: 0,
      log: log.clone(),
    }))
    .await;
  server
    .set_exclusions([r"HTTP://127\.0\.0\.1:\d+/static/.*"])
    .await
    .unwrap();

  let mut client = connect_proxy(port).await;
  let (_, body) = exchange(&mut client, &get(origin.port, "/static/app.js"))
    .await
    .unwrap();
  assert_eq!(body, b"origin /static/app.js");
  let (_, body) = exchange(&mut client, &get(origin.port, "/page"))
    .await
    .unwrap();
  assert_eq!(body, b"origin /page");
  assert_eq!(
    *log.lock().unwrap(),
    vec!["0 request /page", "0 response /page"]
  );
  assert_eq!(origin.paths(), vec!["/static/app.js", "/page"]);
}

#[tokio::test]
async fn test_keep_alive_reuses_upstream() {
  let origin = plain_origin().await;
  let (_server, port) = proxy().await;
  let mut client = connect_proxy(port).await;
  for path in ["/one", "/two", "/three"] {
    let (head, _) = exchange(&mut client, &get(origin.port, path)).await.unwrap();
    assert_eq!(status(&head), 200);
  }
  assert_eq!(origin.connections.load(Ordering::SeqCst), 1);
  assert_eq!(origin.paths(), vec!["/one", "/two", "/three"]);
}

#[tokio::test]
async fn test_server_connection_close_ends_pipeline() {
  let origin = spawn_origin(Duration::ZERO, None, |_| {
    "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Length: 3\r\n\r\nbye".to_string()
  })
  .await;
  let (_server, port) = proxy().await;
  let mut client = connect_proxy(port).await;
  let request = format!(
    "GET http://127.0.0.1:{0}/ HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nConnection: keep-alive\r\n\r\n",
    origin.port
  );
  let (head, body) = exchange(&mut client, &request).await.unwrap();
  assert_eq!(status(&head), 200);
  assert_eq!(body, b"bye");
  assert!(is_closed(&mut client).await);
}

#[tokio::test]
async fn test_client_connection_close_ends_pipeline() {
  let origin = plain_origin().await;
  let (_server, port) = proxy().await;
  let mut client = connect_proxy(port).await;
  let request = format!(
    "GET http://127.0.0.1:{0}/last HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\nConnection: close\r\n\r\n",
    origin.port
  );
  let (_, body) = exchange(&mut client, &request).await.unwrap();
  assert_eq!(body, b"origin /last");
  assert!(is_closed(&mut client).await);
}

#[tokio::test]
async fn test_close_delimited_body_is_delivered_then_closed() {
  let origin = spawn_origin(Duration::ZERO, None, |_| {
    "HTTP/1.0 200 OK\r\nContent-Type: text/plain\r\n\r\nuntil the end".to_string()
  })
  .await;
  let (_server, port) = proxy().await;
  let mut client = connect_proxy(port).await;
  let (head, body) = exchange(&mut client, &get(origin.port, "/stream"))
    .await
    .unwrap();
  assert!(header(&head, "content-length").is_none());
  assert_eq!(body, b"until the end");
}

#[tokio::test]
async fn test_unreachable_origin_yields_504() {
  let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let dead_port = closed.local_addr().unwrap().port();
  drop(closed);
  let (_server, port) = proxy().await;
  let mut client = connect_proxy(port).await;
  let (head, body) = exchange(&mut client, &get(dead_port, "/")).await.unwrap();
  assert_eq!(status(&head), 504);
  assert!(header(&head, "content-type")
    .unwrap()
    .starts_with("text/plain"));
  assert!(String::from_utf8_lossy(&body).contains(&format!("127.0.0.1:{}", dead_port)));
}

#[tokio::test]
async fn test_request_to_proxy_itself_is_refused() {
  let (server, port) = proxy().await;
  let log = Arc::new(Mutex::new(Vec::new()));
  server
    .add_listener(Arc::new(Recorder {
      order: 0,
      log: log.clone(),
    }))
    .await;

  let mut client = connect_proxy(port).await;
  client
    .write_all(get(port, "/loop").as_bytes())
    .await
    .unwrap();
  assert!(is_closed(&mut client).await);

  let mut client = connect_proxy(port).await;
  let connect = format!("CONNECT localhost:{port} HTTP/1.1\r\nHost: localhost:{port}\r\n\r\n");
  client.write_all(connect.as_bytes()).await.unwrap();
  assert!(is_closed(&mut client).await);
  assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_serialize_mode_never_overlaps_exchanges() {
  let origin = spawn_origin(Duration::from_millis(300), None, |_| ok("slow")).await;
  let server = ProxyServer::builder()
    .config(ProxyConfig {
      serialize: true,
      ..test_config()
    })
    .build()
    .unwrap();
  let (server, port) = start(server).await;
  let timestamps = Arc::new(Timestamps::default());
  server.add_listener(timestamps.clone()).await;

  let first = async {
    let mut client = connect_proxy(port).await;
    exchange(&mut client, &get(origin.port, "/a")).await
  };
  let second = async {
    let mut client = connect_proxy(port).await;
    exchange(&mut client, &get(origin.port, "/b")).await
  };
  let (a, b) = tokio::join!(first, second);
  assert!(a.is_some() && b.is_some());

  let mut exchanges = timestamps.exchanges.lock().unwrap().clone();
  assert_eq!(exchanges.len(), 2);
  exchanges.sort();
  assert!(exchanges[0].1 <= exchanges[1].0, "{:?}", exchanges);
}

#[derive(Debug)]
struct Archive;

impl HistoryStore for Archive {
  fn lookup(&self, fingerprint: &Fingerprint) -> Option<Response> {
    Some(Response::plain(
      StatusCode::OK,
      format!("archived {}", fingerprint.uri.path()),
    ))
  }
}

#[tokio::test]
async fn test_cache_consults_one_entry_at_a_time() {
  let origin = plain_origin().await;
  let (server, port) = proxy().await;
  server.enable_cache_processing(true).await;
  let cached = Request::from(
    http::Request::get(format!("http://127.0.0.1:{}/cached", origin.port))
      .body(Bytes::new())
      .unwrap(),
  );
  server
    .push_cache_entry(CacheEntry::InMemory(HttpMessage {
      request: cached,
      response: Some(Response::plain(StatusCode::OK, "from memory")),
      ..Default::default()
    }))
    .await;
  server.push_cache_entry(CacheEntry::History(Arc::new(Archive))).await;

  let mut client = connect_proxy(port).await;
  let (_, body) = exchange(&mut client, &get(origin.port, "/cached")).await.unwrap();
  assert_eq!(body, b"from memory");
  // the history entry is queued behind the active one and not consulted
  let (_, body) = exchange(&mut client, &get(origin.port, "/fresh")).await.unwrap();
  assert_eq!(body, b"origin /fresh");

  assert!(server.pop_cache_entry().await.is_some());
  let (_, body) = exchange(&mut client, &get(origin.port, "/old")).await.unwrap();
  assert_eq!(body, b"archived /old");

  server.enable_cache_processing(false).await;
  let (_, body) = exchange(&mut client, &get(origin.port, "/old")).await.unwrap();
  assert_eq!(body, b"origin /old");
  assert_eq!(origin.paths(), vec!["/fresh", "/old"]);
}

// ---------------------------------------------------------------------------
// tunnels

fn identity() -> (rcgen::CertifiedKey, Arc<StaticCertificateProvider>) {
  let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
  let provider = StaticCertificateProvider::from_pem(
    cert.cert.pem().as_bytes(),
    cert.key_pair.serialize_pem().as_bytes(),
  )
  .unwrap();
  (cert, Arc::new(provider))
}

fn tls_client(cert: &rcgen::CertifiedKey) -> TlsConnector {
  let mut roots = snare::rustls::RootCertStore::empty();
  roots.add(cert.cert.der().clone()).unwrap();
  let config = snare::rustls::ClientConfig::builder_with_provider(Arc::new(
    snare::rustls::crypto::ring::default_provider(),
  ))
  .with_safe_default_protocol_versions()
  .unwrap()
  .with_root_certificates(roots)
  .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

async fn open_tunnel(
  proxy_port: u16,
  origin_port: u16,
  cert: &rcgen::CertifiedKey,
) -> BufReader<tokio_rustls::client::TlsStream<TcpStream>> {
  let mut client = connect_proxy(proxy_port).await;
  let connect =
    format!("CONNECT localhost:{origin_port} HTTP/1.1\r\nHost: localhost:{origin_port}\r\n\r\n");
  client.write_all(connect.as_bytes()).await.unwrap();
  let head = read_head(&mut client).await.unwrap();
  assert!(head.starts_with("HTTP/1.1 200 Connection established"));
  let tls = tls_client(cert)
    .connect(ServerName::try_from("localhost").unwrap(), client.into_inner())
    .await
    .unwrap();
  BufReader::new(tls)
}

#[tokio::test]
async fn test_connect_without_root_certificate_explains() {
  let (_server, port) = proxy().await;
  let mut client = connect_proxy(port).await;
  client
    .write_all(b"CONNECT secure.test:443 HTTP/1.1\r\nHost: secure.test:443\r\n\r\n")
    .await
    .unwrap();
  let head = read_head(&mut client).await.unwrap();
  assert_eq!(head, "HTTP/1.1 200 Connection established\r\n\r\n");
  let (head, body) = read_response(&mut client).await.unwrap();
  assert_eq!(status(&head), 504);
  let body = String::from_utf8(body).unwrap();
  assert!(body.contains("secure.test"));
  assert!(body.contains("root CA"));
  assert!(is_closed(&mut client).await);
}

#[tokio::test]
async fn test_connect_is_intercepted() {
  let (cert, provider) = identity();
  let acceptor = TlsAcceptor::from(provider.issue_tunnel_certificate("localhost").unwrap());
  let origin = spawn_origin(Duration::ZERO, Some(acceptor), |head| {
    ok(&format!("secure {}", path(head)))
  })
  .await;
  let server = ProxyServer::builder()
    .config(test_config())
    .certificate_provider(provider)
    .build()
    .unwrap();
  let (server, port) = start(server).await;
  let log = Arc::new(Mutex::new(Vec::new()));
  server
    .add_listener(Arc::new(Recorder {
      order: 0,
      log: log.clone(),
    }))
    .await;

  let mut client = open_tunnel(port, origin.port, &cert).await;
  for path in ["/inside", "/again"] {
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost:{}\r\n\r\n", origin.port);
    let (head, body) = exchange(&mut client, &request).await.unwrap();
    assert_eq!(status(&head), 200);
    assert_eq!(body, format!("secure {path}").as_bytes());
  }
  assert_eq!(
    *log.lock().unwrap(),
    vec![
      "0 request /inside",
      "0 response /inside",
      "0 request /again",
      "0 response /again",
    ]
  );
  assert_eq!(origin.connections.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// websocket relay

async fn next_frame<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut BytesMut) -> Option<Frame> {
  loop {
    match decode(buf, ProxyConfig::default().max_frame_payload) {
      Ok(Some(frame)) => return Some(frame),
      Ok(None) => {}
      Err(_) => return None,
    }
    match tokio::time::timeout(WAIT, reader.read_buf(buf)).await {
      Ok(Ok(n)) if n > 0 => {}
      _ => return None,
    }
  }
}

/// Answers the handshake with a greeting in the same write, then echoes
/// data frames upper-cased and answers pings.
async fn serve_ws<S>(stream: S, received: Arc<Mutex<Vec<String>>>)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut stream = BufReader::new(stream);
  if read_head(&mut stream).await.is_none() {
    return;
  }
  let mut reply = b"HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\nSec-WebSocket-Protocol: chat\r\n\r\n".to_vec();
  reply.extend_from_slice(Frame::new(true, OpCode::Text, None, "welcome").raw());
  if stream.write_all(&reply).await.is_err() {
    return;
  }
  let mut buf = BytesMut::new();
  while let Some(frame) = next_frame(&mut stream, &mut buf).await {
    let text = String::from_utf8_lossy(&frame.payload).to_string();
    received
      .lock()
      .unwrap()
      .push(format!("{:?} {}", frame.opcode, text));
    let answer = match frame.opcode {
      OpCode::Ping => Frame::new(true, OpCode::Pong, None, frame.payload.clone()),
      OpCode::Close => Frame::new(true, OpCode::Close, None, Bytes::new()),
      opcode => Frame::new(frame.fin, opcode, None, text.to_uppercase()),
    };
    if stream.write_all(answer.raw()).await.is_err() {
      return;
    }
  }
}

async fn spawn_ws_origin(tls: Option<TlsAcceptor>) -> (u16, Arc<Mutex<Vec<String>>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  let received = Arc::new(Mutex::new(Vec::new()));
  let seen = received.clone();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let (seen, tls) = (seen.clone(), tls.clone());
      tokio::spawn(async move {
        match tls {
          Some(acceptor) => {
            if let Ok(stream) = acceptor.accept(stream).await {
              serve_ws(stream, seen).await
            }
          }
          None => serve_ws(stream, seen).await,
        }
      });
    }
  });
  (port, received)
}

#[derive(Default)]
struct Tap {
  events: Mutex<Vec<String>>,
}

impl Tap {
  fn events(&self) -> Vec<String> {
    self.events.lock().unwrap().clone()
  }
}

impl WebSocketObserver for Tap {
  fn order(&self) -> i32 {
    0
  }
  fn on_message(&self, _: &ChannelInfo, direction: Direction, message: &Message) -> bool {
    let text = String::from_utf8_lossy(message.payload()).to_string();
    self
      .events
      .lock()
      .unwrap()
      .push(format!("{:?} {:?} {}", direction, message.opcode(), text));
    !(direction == Direction::Outgoing && text == "secret")
  }
  fn on_state_change(&self, channel: &ChannelInfo, state: ChannelState) {
    self.events.lock().unwrap().push(format!(
      "{:?} {}",
      state,
      channel.subprotocol.as_deref().unwrap_or_default()
    ));
  }
}

/// Upgrade through the proxy and read the origin's greeting. Returns the
/// frame buffer holding whatever arrived after it.
async fn upgrade<S>(client: &mut BufReader<S>, target: &str, host: &str) -> BytesMut
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let handshake = format!(
    "GET {target} HTTP/1.1\r\nHost: {host}\r\nConnection: Upgrade\r\nUpgrade: websocket\r\nSec-WebSocket-Version: 13\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Protocol: chat\r\n\r\n"
  );
  client.write_all(handshake.as_bytes()).await.unwrap();
  let head = tokio::time::timeout(WAIT, read_head(client))
    .await
    .unwrap()
    .unwrap();
  assert_eq!(status(&head), 101);

  let mut buf = BytesMut::new();
  let welcome = next_frame(client, &mut buf).await.unwrap();
  assert_eq!(welcome.opcode, OpCode::Text);
  assert_eq!(welcome.payload, Bytes::from_static(b"welcome"));
  buf
}

async fn websocket_session<S>(mut client: BufReader<S>, target: &str, host: &str)
where
  S: AsyncRead + AsyncWrite + Unpin,
{
  let mut buf = upgrade(&mut client, target, host).await;

  let mask = Some([0x11, 0x22, 0x33, 0x44]);
  let mut out = BytesMut::new();
  Frame::new(false, OpCode::Text, mask, "hel").encode(&mut out);
  Frame::new(true, OpCode::Ping, mask, "p").encode(&mut out);
  Frame::new(true, OpCode::Continuation, mask, "lo").encode(&mut out);
  client.write_all(&out).await.unwrap();

  let pong = next_frame(&mut client, &mut buf).await.unwrap();
  assert_eq!(pong.opcode, OpCode::Pong);
  assert_eq!(pong.payload, Bytes::from_static(b"p"));
  let first = next_frame(&mut client, &mut buf).await.unwrap();
  assert_eq!((first.opcode, first.fin), (OpCode::Text, false));
  assert_eq!(first.payload, Bytes::from_static(b"HEL"));
  let last = next_frame(&mut client, &mut buf).await.unwrap();
  assert_eq!((last.opcode, last.fin), (OpCode::Continuation, true));
  assert_eq!(last.payload, Bytes::from_static(b"LO"));

  let mut out = BytesMut::new();
  Frame::new(true, OpCode::Text, mask, "secret").encode(&mut out);
  Frame::new(true, OpCode::Text, mask, "after").encode(&mut out);
  client.write_all(&out).await.unwrap();
  let after = next_frame(&mut client, &mut buf).await.unwrap();
  assert_eq!(after.payload, Bytes::from_static(b"AFTER"));

  let _ = client.shutdown().await;
}

fn assert_relayed(tap: &Tap, received: &[String]) {
  let events = tap.events();
  assert_eq!(events.first().map(String::as_str), Some("Open chat"));
  assert_eq!(events.last().map(String::as_str), Some("Closed chat"));
  for expected in [
    "Incoming Text welcome",
    "Outgoing Ping p",
    "Outgoing Text hello",
    "Incoming Pong p",
    "Incoming Text HELLO",
    "Outgoing Text secret",
    "Outgoing Text after",
    "Incoming Text AFTER",
  ] {
    assert!(events.iter().any(|e| e == expected), "{expected} missing from {events:?}");
  }
  assert!(received.iter().any(|r| r == "Text after"));
  assert!(!received.iter().any(|r| r.contains("secret")));
}

#[tokio::test]
async fn test_websocket_relay_end_to_end() {
  let (origin_port, received) = spawn_ws_origin(None).await;
  let (server, port) = proxy().await;
  let tap = Arc::new(Tap::default());
  server.websocket().unwrap().add_observer(tap.clone());

  let client = connect_proxy(port).await;
  let host = format!("127.0.0.1:{origin_port}");
  websocket_session(client, &format!("http://{host}/chat"), &host).await;

  assert!(eventually(|| tap.events().last().map(String::as_str) == Some("Closed chat")).await);
  assert_relayed(&tap, &received.lock().unwrap());
}

#[tokio::test]
async fn test_websocket_relay_inside_tunnel() {
  let (cert, provider) = identity();
  let acceptor = TlsAcceptor::from(provider.issue_tunnel_certificate("localhost").unwrap());
  let (origin_port, received) = spawn_ws_origin(Some(acceptor)).await;
  let server = ProxyServer::builder()
    .config(test_config())
    .certificate_provider(provider)
    .build()
    .unwrap();
  let (server, port) = start(server).await;
  let tap = Arc::new(Tap::default());
  server.websocket().unwrap().add_observer(tap.clone());

  let client = open_tunnel(port, origin_port, &cert).await;
  websocket_session(client, "/chat", &format!("localhost:{origin_port}")).await;

  assert!(eventually(|| tap.events().last().map(String::as_str) == Some("Closed chat")).await);
  assert_relayed(&tap, &received.lock().unwrap());
}

#[derive(Default)]
struct Lifecycle {
  states: Mutex<Vec<(ChannelId, ChannelState)>>,
}

impl Lifecycle {
  fn with_state(&self, state: ChannelState) -> Vec<ChannelId> {
    self
      .states
      .lock()
      .unwrap()
      .iter()
      .filter(|(_, s)| *s == state)
      .map(|(id, _)| *id)
      .collect()
  }
}

impl WebSocketObserver for Lifecycle {
  fn order(&self) -> i32 {
    0
  }
  fn on_message(&self, _: &ChannelInfo, _: Direction, _: &Message) -> bool {
    true
  }
  fn on_state_change(&self, channel: &ChannelInfo, state: ChannelState) {
    self.states.lock().unwrap().push((channel.id, state));
  }
}

#[tokio::test]
async fn test_protocol_violation_closes_only_its_channel() {
  let (origin_port, received) = spawn_ws_origin(None).await;
  let (server, port) = proxy().await;
  let lifecycle = Arc::new(Lifecycle::default());
  server.websocket().unwrap().add_observer(lifecycle.clone());
  let host = format!("127.0.0.1:{origin_port}");
  let target = format!("http://{host}/chat");
  let mask = Some([1, 2, 3, 4]);

  let mut healthy = connect_proxy(port).await;
  let mut healthy_buf = upgrade(&mut healthy, &target, &host).await;
  let mut orphan = connect_proxy(port).await;
  upgrade(&mut orphan, &target, &host).await;
  let mut oversized = connect_proxy(port).await;
  upgrade(&mut oversized, &target, &host).await;
  let opened = lifecycle.with_state(ChannelState::Open);
  assert_eq!(opened.len(), 3);

  let continuation = Frame::new(true, OpCode::Continuation, mask, "x");
  orphan.write_all(continuation.raw()).await.unwrap();
  assert!(is_closed(&mut orphan).await);
  // announces a 2^46 byte payload that never follows
  oversized
    .write_all(&[0x82, 0xFF, 0, 0, 0x40, 0, 0, 0, 0, 0, 1, 2, 3, 4])
    .await
    .unwrap();
  assert!(is_closed(&mut oversized).await);

  let text = Frame::new(true, OpCode::Text, mask, "still here");
  healthy.write_all(text.raw()).await.unwrap();
  let echo = next_frame(&mut healthy, &mut healthy_buf).await.unwrap();
  assert_eq!(echo.payload, Bytes::from_static(b"STILL HERE"));
  assert!(eventually(|| lifecycle.with_state(ChannelState::Closed) == opened[1..]).await);
  assert!(!received
    .lock()
    .unwrap()
    .iter()
    .any(|r| r.starts_with("Continuation")));

  let _ = healthy.shutdown().await;
  assert!(eventually(|| lifecycle.with_state(ChannelState::Closed).len() == 3).await);
}

#[tokio::test]
async fn test_oversized_bodies_end_only_their_exchange() {
  let origin = spawn_origin(Duration::ZERO, None, |head| {
    if path(head) == "/huge" {
      "HTTP/1.1 200 OK\r\nContent-Length: 70368744177664\r\n\r\npartial".to_string()
    } else {
      ok(&format!("origin {}", path(head)))
    }
  })
  .await;
  let (_server, port) = proxy().await;

  let mut client = connect_proxy(port).await;
  client
    .write_all(
      b"POST http://example.test/ HTTP/1.1\r\nHost: example.test\r\nContent-Length: 70368744177664\r\n\r\nx",
    )
    .await
    .unwrap();
  assert!(is_closed(&mut client).await);

  let mut client = connect_proxy(port).await;
  let (head, _) = exchange(&mut client, &get(origin.port, "/huge")).await.unwrap();
  assert_eq!(status(&head), 504);
  let (head, body) = exchange(&mut client, &get(origin.port, "/after")).await.unwrap();
  assert_eq!(status(&head), 200);
  assert_eq!(body, b"origin /after");
  assert_eq!(origin.paths(), vec!["/huge", "/after"]);
}

// ---------------------------------------------------------------------------
// listening socket

#[tokio::test]
async fn test_port_fallback() {
  let (first, taken) = proxy().await;
  let second = ProxyServer::builder()
    .config(ProxyConfig {
      port: taken,
      ..test_config()
    })
    .without_websocket()
    .build()
    .unwrap();
  let fallback = second.start().await.unwrap();
  assert_ne!(fallback, taken);

  let strict = ProxyServer::builder()
    .config(ProxyConfig {
      port: taken,
      allow_port_fallback: false,
      ..test_config()
    })
    .without_websocket()
    .build()
    .unwrap();
  assert!(matches!(strict.start().await, Err(Error::Bind { .. })));

  first.stop().await;
  second.stop().await;
  assert!(first.local_addr().is_none());
}
