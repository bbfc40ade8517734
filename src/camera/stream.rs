//! Authenticated MJPEG stream server.
//!
//! One non-blocking accept loop, one detached worker per client. A client
//! presents a `token` query parameter; the store validates it and the worker
//! then fans out the latest captured frame as `multipart/x-mixed-replace`
//! parts at ~30 fps, JPEG quality 80. The accept loop runs the token janitor
//! on every iteration.
//!
//! If HTTPS is enabled, a rustls server context is built from the configured
//! certificate and key; a context that fails to build falls back to plain
//! TCP with a warning so the stream stays reachable.

use std::io::{BufReader, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use rustls::{Certificate, PrivateKey, ServerConfig, ServerConnection, StreamOwned};
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, warn};

use super::capture::{Frame, VisionError};
use super::token::TokenStore;

/// Multipart boundary token, fixed by the wire contract.
const BOUNDARY: &str = "mjpegstream";

/// JPEG quality on the stream path.
const STREAM_JPEG_QUALITY: u8 = 80;

/// Inter-part delay, ~30 fps.
const FRAME_INTERVAL: Duration = Duration::from_millis(33);

/// Accept-loop idle sleep.
const ACCEPT_IDLE: Duration = Duration::from_millis(100);

/// Pending-connection backlog on the listening socket.
const LISTEN_BACKLOG: i32 = 5;

/// Ceiling on request bytes read from a client.
const MAX_REQUEST_BYTES: usize = 4096;

/// Per-client socket timeouts; also bound worker exit after a shutdown.
const CLIENT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Stream listener settings, resolved from the camera config.
#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub port: u16,
    /// Address advertised in the stream-info message.
    pub host_ip: String,
    pub https: Option<HttpsPaths>,
}

#[derive(Debug, Clone)]
pub struct HttpsPaths {
    pub cert_path: String,
    pub key_path: String,
}

/// What `start_stream` reports back for the stream-info announcement.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub url: String,
    pub port: u16,
    pub tls_active: bool,
    /// True when HTTPS was requested but the context failed to build.
    pub tls_fallback: bool,
}

struct ClientSlot {
    id: u64,
    socket: TcpStream,
    handle: Option<thread::JoinHandle<()>>,
}

/// The stream server: listener thread plus per-client workers.
pub struct StreamServer {
    settings: StreamSettings,
    tokens: Arc<TokenStore>,
    latest: Arc<Mutex<Option<Frame>>>,
    streaming: Arc<AtomicBool>,
    clients: Arc<Mutex<Vec<ClientSlot>>>,
    accept: Option<thread::JoinHandle<()>>,
    active_info: Option<StreamInfo>,
}

impl StreamServer {
    pub fn new(settings: StreamSettings, latest: Arc<Mutex<Option<Frame>>>) -> Self {
        StreamServer {
            settings,
            tokens: Arc::new(TokenStore::new()),
            latest,
            streaming: Arc::new(AtomicBool::new(false)),
            clients: Arc::new(Mutex::new(Vec::new())),
            accept: None,
            active_info: None,
        }
    }

    pub fn tokens(&self) -> Arc<TokenStore> {
        Arc::clone(&self.tokens)
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Relaxed)
    }

    /// Binds the listener and starts the accept loop. Idempotent while
    /// already streaming.
    pub fn start_stream(
        &mut self,
        running: Arc<AtomicBool>,
    ) -> Result<StreamInfo, VisionError> {
        if self.is_streaming() {
            if let Some(info) = &self.active_info {
                return Ok(info.clone());
            }
        }

        let listener = bind_listener(self.settings.port)?;
        listener.set_nonblocking(true)?;
        let port = listener.local_addr()?.port();

        let (tls, tls_fallback) = match &self.settings.https {
            Some(paths) => match build_tls_context(paths) {
                Ok(context) => {
                    info!("stream TLS context loaded from {}", paths.cert_path);
                    (Some(context), false)
                }
                Err(e) => {
                    warn!("stream TLS setup failed, falling back to plain TCP: {e}");
                    (None, true)
                }
            },
            None => (None, false),
        };
        let tls_active = tls.is_some();

        self.streaming.store(true, Ordering::Relaxed);
        let accept = {
            let streaming = Arc::clone(&self.streaming);
            let tokens = Arc::clone(&self.tokens);
            let latest = Arc::clone(&self.latest);
            let clients = Arc::clone(&self.clients);
            thread::Builder::new()
                .name("stream-accept".into())
                .spawn(move || {
                    accept_loop(listener, tls, streaming, running, tokens, latest, clients)
                })
                .map_err(VisionError::Stream)?
        };
        self.accept = Some(accept);

        let scheme = if tls_active { "https" } else { "http" };
        let info = StreamInfo {
            url: format!("{scheme}://{}:{port}/stream", self.settings.host_ip),
            port,
            tls_active,
            tls_fallback,
        };
        self.active_info = Some(info.clone());
        info!("stream server listening on port {port}");
        Ok(info)
    }

    /// Stops the accept loop, shuts every registered client socket and joins
    /// the workers. Returns false when the server was not streaming.
    pub fn stop_stream(&mut self) -> bool {
        if !self.streaming.swap(false, Ordering::Relaxed) {
            return false;
        }
        self.active_info = None;

        if let Some(accept) = self.accept.take() {
            if accept.join().is_err() {
                error!("stream accept thread panicked");
            }
        }

        // Drain under the lock, then shut down and join without it so
        // workers can still remove themselves.
        let slots: Vec<ClientSlot> = self
            .clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for mut slot in slots {
            if let Err(e) = slot.socket.shutdown(Shutdown::Both) {
                debug!("client {} socket already closed: {e}", slot.id);
            }
            if let Some(handle) = slot.handle.take() {
                if handle.join().is_err() {
                    error!("stream client worker panicked");
                }
            }
        }

        info!("stream server stopped");
        true
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        self.stop_stream();
    }
}

/// Binds the listening socket with the contract's backlog of 5. The std
/// listener hard-codes the OS default backlog, so the socket is built
/// through `socket2` and handed over as a `TcpListener`.
fn bind_listener(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

fn build_tls_context(paths: &HttpsPaths) -> Result<Arc<ServerConfig>, VisionError> {
    let cert_file = std::fs::File::open(&paths.cert_path)
        .map_err(|e| VisionError::Tls(format!("{}: {e}", paths.cert_path)))?;
    let certs: Vec<Certificate> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .map_err(|e| VisionError::Tls(format!("bad certificate PEM: {e}")))?
        .into_iter()
        .map(Certificate)
        .collect();
    if certs.is_empty() {
        return Err(VisionError::Tls(format!(
            "no certificates in {}",
            paths.cert_path
        )));
    }

    let key_file = std::fs::File::open(&paths.key_path)
        .map_err(|e| VisionError::Tls(format!("{}: {e}", paths.key_path)))?;
    let mut reader = BufReader::new(key_file);
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut reader)
        .map_err(|e| VisionError::Tls(format!("bad key PEM: {e}")))?;
    if keys.is_empty() {
        // PKCS#1 keys ship from older provisioning scripts.
        let key_file = std::fs::File::open(&paths.key_path)
            .map_err(|e| VisionError::Tls(format!("{}: {e}", paths.key_path)))?;
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(key_file))
            .map_err(|e| VisionError::Tls(format!("bad key PEM: {e}")))?;
    }
    let key = keys
        .into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| VisionError::Tls(format!("no private key in {}", paths.key_path)))?;

    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| VisionError::Tls(e.to_string()))?;
    Ok(Arc::new(config))
}

#[allow(clippy::too_many_arguments)]
fn accept_loop(
    listener: TcpListener,
    tls: Option<Arc<ServerConfig>>,
    streaming: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
    tokens: Arc<TokenStore>,
    latest: Arc<Mutex<Option<Frame>>>,
    clients: Arc<Mutex<Vec<ClientSlot>>>,
) {
    debug!("stream accept loop started");
    let mut next_id: u64 = 0;

    while streaming.load(Ordering::Relaxed) && running.load(Ordering::Relaxed) {
        let culled = tokens.sweep();
        if culled > 0 {
            debug!("token janitor removed {culled} expired tokens");
        }

        match listener.accept() {
            Ok((socket, peer)) => {
                next_id += 1;
                let id = next_id;
                debug!("stream client {id} accepted from {peer}");

                let registered_socket = match socket.try_clone() {
                    Ok(clone) => clone,
                    Err(e) => {
                        error!("cannot clone client socket: {e}");
                        continue;
                    }
                };

                let handle = {
                    let tls = tls.clone();
                    let tokens = Arc::clone(&tokens);
                    let latest = Arc::clone(&latest);
                    let streaming = Arc::clone(&streaming);
                    let running = Arc::clone(&running);
                    let clients = Arc::clone(&clients);
                    thread::Builder::new()
                        .name(format!("stream-client-{id}"))
                        .spawn(move || {
                            client_worker(id, socket, tls, tokens, latest, streaming, running);
                            clients
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .retain(|slot| slot.id != id);
                        })
                };

                match handle {
                    Ok(handle) => {
                        clients
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .push(ClientSlot {
                                id,
                                socket: registered_socket,
                                handle: Some(handle),
                            });
                    }
                    Err(e) => error!("cannot spawn client worker: {e}"),
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_IDLE);
            }
            Err(e) => {
                error!("accept failed: {e}");
                thread::sleep(ACCEPT_IDLE);
            }
        }
    }
    debug!("stream accept loop stopped");
}

/// Read+Write over either a plain or a TLS-wrapped socket.
enum Channel {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ServerConnection, TcpStream>>),
}

impl Read for Channel {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Channel::Plain(s) => s.read(buf),
            Channel::Tls(s) => s.read(buf),
        }
    }
}

impl Write for Channel {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Channel::Plain(s) => s.write(buf),
            Channel::Tls(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Channel::Plain(s) => s.flush(),
            Channel::Tls(s) => s.flush(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn client_worker(
    id: u64,
    socket: TcpStream,
    tls: Option<Arc<ServerConfig>>,
    tokens: Arc<TokenStore>,
    latest: Arc<Mutex<Option<Frame>>>,
    streaming: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
) {
    // Accepted sockets must block with bounded timeouts; the listener itself
    // is non-blocking.
    if socket.set_nonblocking(false).is_err()
        || socket.set_read_timeout(Some(CLIENT_IO_TIMEOUT)).is_err()
        || socket.set_write_timeout(Some(CLIENT_IO_TIMEOUT)).is_err()
    {
        return;
    }

    let mut channel = match tls {
        Some(config) => match ServerConnection::new(config) {
            Ok(conn) => Channel::Tls(Box::new(StreamOwned::new(conn, socket))),
            Err(e) => {
                warn!("client {id}: TLS session setup failed: {e}");
                return;
            }
        },
        None => Channel::Plain(socket),
    };

    // One read covers the request line and headers for any sane client.
    let mut raw = [0u8; MAX_REQUEST_BYTES];
    let len = match channel.read(&mut raw) {
        Ok(0) | Err(_) => {
            debug!("client {id}: closed before sending a request");
            return;
        }
        Ok(len) => len,
    };

    let Some(request) = parse_request(&raw[..len]) else {
        warn!("client {id}: malformed HTTP request, closing");
        return;
    };
    debug!(
        "client {id}: {} {} {}",
        request.method, request.target, request.version
    );

    let authorized = query_param(&request.target, "token")
        .map(|token| tokens.validate(&token))
        .unwrap_or(false);
    if !authorized {
        warn!("client {id}: invalid or missing stream token");
        let body = "Invalid or expired token";
        let response = format!(
            "HTTP/1.1 401 Unauthorized\r\n\
             Connection: close\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\r\n{body}",
            body.len()
        );
        let _ = channel.write_all(response.as_bytes());
        let _ = channel.flush();
        return;
    }

    let header = "HTTP/1.1 200 OK\r\n\
                  Connection: close\r\n\
                  Cache-Control: no-cache\r\n\
                  Pragma: no-cache\r\n\
                  Content-Type: multipart/x-mixed-replace; boundary=mjpegstream\r\n\r\n";
    if channel.write_all(header.as_bytes()).is_err() {
        return;
    }
    info!("client {id}: streaming");

    while streaming.load(Ordering::Relaxed) && running.load(Ordering::Relaxed) {
        // Clone under the mutex, encode outside it.
        let frame = latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(frame) = frame.filter(|f| !f.is_empty()) else {
            thread::sleep(FRAME_INTERVAL);
            continue;
        };

        let jpeg = match frame.encode_jpeg(STREAM_JPEG_QUALITY) {
            Ok(jpeg) => jpeg,
            Err(e) => {
                error!("client {id}: frame encode failed: {e}");
                thread::sleep(FRAME_INTERVAL);
                continue;
            }
        };

        let part_header = format!(
            "--{BOUNDARY}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
            jpeg.len()
        );
        if channel.write_all(part_header.as_bytes()).is_err()
            || channel.write_all(&jpeg).is_err()
            || channel.write_all(b"\r\n").is_err()
        {
            debug!("client {id}: write failed, dropping");
            break;
        }

        thread::sleep(FRAME_INTERVAL);
    }

    debug!("client {id}: worker exiting");
}

/// A parsed HTTP request head. Header names keep their original case.
#[derive(Debug)]
pub(crate) struct HttpRequest {
    pub method: String,
    pub target: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

/// Parses the request line and headers; `None` on anything malformed.
pub(crate) fn parse_request(raw: &[u8]) -> Option<HttpRequest> {
    let text = std::str::from_utf8(raw).ok()?;
    let head = text.split("\r\n\r\n").next()?;
    let mut lines = head.split("\r\n");

    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let version = request_line.next()?.to_string();
    if !version.starts_with("HTTP/") {
        return None;
    }

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Some(HttpRequest {
        method,
        target,
        version,
        headers,
    })
}

/// Extracts a query parameter from a request target.
pub(crate) fn query_param(target: &str, name: &str) -> Option<String> {
    let (_, query) = target.split_once('?')?;
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        if key == name {
            return Some(value.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::time::Instant;

    use super::*;

    #[test]
    fn parses_request_line_and_headers() {
        let raw = b"GET /stream?token=abc HTTP/1.1\r\nHost: cam.lan\r\nX-Custom-Header: Value\r\n\r\n";
        let request = parse_request(raw).unwrap();
        assert_eq!(request.method, "GET");
        assert_eq!(request.target, "/stream?token=abc");
        assert_eq!(request.version, "HTTP/1.1");
        // Case preserved.
        assert_eq!(request.headers[1].0, "X-Custom-Header");
        assert_eq!(request.headers[1].1, "Value");
    }

    #[test]
    fn rejects_garbage_request() {
        assert!(parse_request(b"\xff\xfe\xfd").is_none());
        assert!(parse_request(b"GET\r\n\r\n").is_none());
        assert!(parse_request(b"GET / NOTHTTP\r\n\r\n").is_none());
    }

    #[test]
    fn query_param_extraction() {
        assert_eq!(
            query_param("/stream?token=abc123", "token").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            query_param("/stream?a=1&token=xyz&b=2", "token").as_deref(),
            Some("xyz")
        );
        assert_eq!(query_param("/stream", "token"), None);
        assert_eq!(query_param("/stream?other=1", "token"), None);
    }

    fn test_server() -> (StreamServer, StreamInfo, Arc<AtomicBool>) {
        let mut data = Vec::new();
        for _ in 0..64 * 48 {
            data.extend_from_slice(&[120, 80, 40]);
        }
        let latest = Arc::new(Mutex::new(Some(Frame::new(64, 48, data))));
        let running = Arc::new(AtomicBool::new(true));

        let mut server = StreamServer::new(
            StreamSettings {
                port: 0, // OS-assigned; tests must not collide
                host_ip: "127.0.0.1".into(),
                https: None,
            },
            latest,
        );
        let info = server.start_stream(Arc::clone(&running)).unwrap();
        (server, info, running)
    }

    #[test]
    fn bad_token_gets_401_and_closed_socket() {
        let (mut server, info, _running) = test_server();

        let mut socket = TcpStream::connect(("127.0.0.1", info.port)).unwrap();
        socket
            .write_all(b"GET /stream?token=deadbeef HTTP/1.1\r\nHost: cam\r\n\r\n")
            .unwrap();

        let mut response = String::new();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket.read_to_string(&mut response).unwrap();

        assert!(response.starts_with("HTTP/1.1 401 Unauthorized"));
        assert!(response.ends_with("Invalid or expired token"));
        assert!(server.stop_stream());
    }

    #[test]
    fn valid_token_streams_multipart_jpeg() {
        let (mut server, info, _running) = test_server();
        let (token, _) = server.tokens().issue();

        let mut socket = TcpStream::connect(("127.0.0.1", info.port)).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let request = format!("GET /stream?token={token} HTTP/1.1\r\nHost: cam\r\n\r\n");
        socket.write_all(request.as_bytes()).unwrap();

        // Accumulate until the response head and at least one part arrived.
        let mut collected = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let mut chunk = [0u8; 4096];
            match socket.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => collected.extend_from_slice(&chunk[..n]),
                Err(_) => break,
            }
            let text = String::from_utf8_lossy(&collected);
            if text.contains("--mjpegstream") && text.contains("Content-Length:") {
                break;
            }
        }

        let text = String::from_utf8_lossy(&collected);
        assert!(text.starts_with("HTTP/1.1 200 OK"));
        assert!(text.contains("Content-Type: multipart/x-mixed-replace; boundary=mjpegstream"));
        assert!(text.contains("--mjpegstream\r\nContent-Type: image/jpeg\r\nContent-Length:"));
        // JPEG SOI marker somewhere after the part header.
        assert!(collected.windows(2).any(|w| w == [0xff, 0xd8]));

        assert!(server.stop_stream());

        // After stop the socket is shut down; reads drain to EOF.
        let mut rest = Vec::new();
        let _ = socket.read_to_end(&mut rest);
    }

    #[test]
    fn expired_token_is_rejected() {
        let (mut server, info, _running) = test_server();
        server
            .tokens()
            .insert_with_ttl("expired0000000000000000000000000", Duration::ZERO);

        let mut socket = TcpStream::connect(("127.0.0.1", info.port)).unwrap();
        socket
            .write_all(b"GET /stream?token=expired0000000000000000000000000 HTTP/1.1\r\n\r\n")
            .unwrap();

        let mut response = String::new();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket.read_to_string(&mut response).unwrap();
        assert!(response.starts_with("HTTP/1.1 401 Unauthorized"));
        server.stop_stream();
    }

    #[test]
    fn broken_tls_setup_falls_back_to_plain_tcp() {
        let latest = Arc::new(Mutex::new(None));
        let running = Arc::new(AtomicBool::new(true));
        let mut server = StreamServer::new(
            StreamSettings {
                port: 0,
                host_ip: "127.0.0.1".into(),
                https: Some(HttpsPaths {
                    cert_path: "/nonexistent/stream.crt".into(),
                    key_path: "/nonexistent/stream.key".into(),
                }),
            },
            latest,
        );

        let info = server.start_stream(running).unwrap();
        assert!(!info.tls_active);
        assert!(info.tls_fallback);
        assert!(info.url.starts_with("http://"));
        server.stop_stream();
    }

    #[test]
    fn stop_stream_is_idempotent() {
        let (mut server, _info, _running) = test_server();
        assert!(server.stop_stream());
        assert!(!server.stop_stream());
    }
}
