//! Server: HTTP(S) termination, method dispatch and session transactions.
//!
//! The server looks like a small static site from the outside: `GET /`
//! serves a decoy page and everything else is a 404 or 400. The tunnel
//! lives entirely in POST requests carrying an `X-Session-Id` header. Each
//! POST writes its body into the session's back-end connection, waits one
//! short turnaround window for back-end output, and carries whatever
//! arrived (often nothing) back in the response body.

pub mod session;

pub use session::{Session, SessionTable};

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, CONTENT_TYPE};
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::{TokioIo, TokioTimer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::{
    MAX_PAYLOAD_LENGTH, MAX_SESSION_STALENESS, MIN_SESSION_ID_LENGTH, READ_WRITE_TIMEOUT,
    SESSION_ID_HEADER, TURNAROUND_TIMEOUT,
};

/// Body of the decoy page served on `GET /`.
const DECOY_PAGE: &str = "I\u{2019}m just a happy little web server.\n";

/// Server configuration, fixed at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address every new session's back-end connection dials.
    pub backend_addr: SocketAddr,
    /// Idle age beyond which the sweeper evicts a session.
    pub max_session_staleness: Duration,
    /// How long a request waits for back-end output before replying.
    pub turnaround_timeout: Duration,
}

impl ServerConfig {
    /// Configuration with the default staleness and turnaround windows.
    pub fn new(backend_addr: SocketAddr) -> Self {
        Self {
            backend_addr,
            max_session_staleness: MAX_SESSION_STALENESS,
            turnaround_timeout: TURNAROUND_TIMEOUT,
        }
    }
}

/// The tunnel server.
///
/// Handler lifecycle is reported on the `handler_events` channel: `+1` on
/// entry, `-1` on exit. A single supervisor loop (in the binary) folds the
/// events into the outstanding-handler count used for graceful shutdown, so
/// no shared counter exists.
pub struct Server {
    config: ServerConfig,
    sessions: SessionTable,
    handler_events: mpsc::UnboundedSender<i32>,
}

impl Server {
    /// Create a server for the given configuration.
    pub fn new(config: ServerConfig, handler_events: mpsc::UnboundedSender<i32>) -> Self {
        let sessions = SessionTable::new(config.backend_addr, config.max_session_staleness);
        Self {
            config,
            sessions,
            handler_events,
        }
    }

    /// Serve connections from `listener`, TLS-terminated when `tls` is
    /// given, until the task driving this future is aborted. Also runs the
    /// expiration sweeper.
    pub async fn run(self: Arc<Self>, listener: TcpListener, tls: Option<TlsAcceptor>) {
        let sweeper = Arc::clone(&self);
        tokio::spawn(async move { sweeper.sessions.expire_sessions().await });

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    let tls = tls.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer, tls).await {
                            debug!("connection from {peer}: {e}");
                        }
                    });
                }
                Err(e) => {
                    warn!("accept error: {e}");
                }
            }
        }
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        peer: SocketAddr,
        tls: Option<TlsAcceptor>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        match tls {
            Some(acceptor) => {
                let stream = acceptor.accept(stream).await?;
                self.serve_http(stream, peer).await
            }
            None => self.serve_http(stream, peer).await,
        }
    }

    async fn serve_http<S>(self: Arc<Self>, stream: S, peer: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server = Arc::clone(&self);
        let service = service_fn(move |req| {
            let server = Arc::clone(&server);
            async move { Ok::<_, Infallible>(server.dispatch(req, peer).await) }
        });

        http1::Builder::new()
            .timer(TokioTimer::new())
            .header_read_timeout(READ_WRITE_TIMEOUT)
            .serve_connection(TokioIo::new(stream), service)
            .await?;
        Ok(())
    }

    /// Route one request by method.
    async fn dispatch(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        let _ = self.handler_events.send(1);
        let resp = match *req.method() {
            Method::GET => get(req),
            Method::POST => {
                // The whole transaction is bounded; a stalled body or
                // back-end cannot pin a handler for good.
                match tokio::time::timeout(READ_WRITE_TIMEOUT, self.post(req, peer)).await {
                    Ok(resp) => resp,
                    Err(_) => http_error(StatusCode::INTERNAL_SERVER_ERROR),
                }
            }
            _ => http_error(StatusCode::BAD_REQUEST),
        };
        let _ = self.handler_events.send(-1);
        resp
    }

    async fn post(&self, req: Request<Incoming>, peer: SocketAddr) -> Response<Full<Bytes>> {
        let session_id = match req
            .headers()
            .get(SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            Some(id) if id.len() >= MIN_SESSION_ID_LENGTH => id.to_owned(),
            _ => return http_error(StatusCode::BAD_REQUEST),
        };

        let session = match self.sessions.get_or_dial(&session_id, peer).await {
            Ok(session) => session,
            Err(e) => {
                warn!("opening back-end: {e}");
                return http_error(StatusCode::INTERNAL_SERVER_ERROR);
            }
        };

        match self.transact(&session, req).await {
            Ok(reply) => Response::new(Full::new(reply)),
            Err(e) => {
                warn!("session transaction: {e}");
                self.sessions.close(&session_id);
                http_error(StatusCode::INTERNAL_SERVER_ERROR)
            }
        }
    }

    /// Copy the bounded request body into the back-end, then read once with
    /// the turnaround deadline. A deadline miss is a normal empty reply;
    /// everything else that goes wrong is fatal for the session.
    async fn transact(&self, session: &Session, req: Request<Incoming>) -> Result<Bytes> {
        // One byte of headroom: a conforming client never exceeds
        // MAX_PAYLOAD_LENGTH, so tripping the limit means a broken or
        // hostile peer and the session dies with the request.
        let body = Limited::new(req.into_body(), MAX_PAYLOAD_LENGTH + 1)
            .collect()
            .await
            .map_err(|e| Error::session(format!("reading request body: {e}")))?
            .to_bytes();

        let mut backend = session.backend().await;
        backend
            .write_all(&body)
            .await
            .map_err(|e| Error::session(format!("copying body to back-end: {e}")))?;

        let mut buf = vec![0u8; MAX_PAYLOAD_LENGTH];
        match tokio::time::timeout(self.config.turnaround_timeout, backend.read(&mut buf)).await {
            Err(_) => Ok(Bytes::new()),
            Ok(Ok(0)) => Err(Error::session("back-end closed the connection")),
            Ok(Ok(n)) => {
                buf.truncate(n);
                Ok(Bytes::from(buf))
            }
            Ok(Err(e)) => Err(Error::session(format!("reading from back-end: {e}"))),
        }
    }

    /// The session table, for introspection.
    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }
}

/// `GET /` serves the decoy page; any other path is a 404.
fn get(req: Request<Incoming>) -> Response<Full<Bytes>> {
    if path_clean(req.uri().path()) != "/" {
        return http_error(StatusCode::NOT_FOUND);
    }
    let mut resp = Response::new(Full::new(Bytes::from_static(DECOY_PAGE.as_bytes())));
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// Minimal lexical path cleaning: collapse `.` and empty segments, resolve
/// `..`, so `//`, `/./` and friends cannot sidestep the root check.
fn path_clean(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            s => parts.push(s),
        }
    }
    let mut cleaned = String::from("/");
    cleaned.push_str(&parts.join("/"));
    cleaned
}

fn http_error(status: StatusCode) -> Response<Full<Bytes>> {
    let msg: &'static str = match status {
        StatusCode::BAD_REQUEST => "Bad request.\n",
        StatusCode::NOT_FOUND => "404 page not found\n",
        _ => "Internal server error.\n",
    };
    let mut resp = Response::new(Full::new(Bytes::from_static(msg.as_bytes())));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::time::timeout;

    #[test]
    fn test_path_clean() {
        assert_eq!(path_clean("/"), "/");
        assert_eq!(path_clean(""), "/");
        assert_eq!(path_clean("//"), "/");
        assert_eq!(path_clean("/./"), "/");
        assert_eq!(path_clean("/a/.."), "/");
        assert_eq!(path_clean("/index.html"), "/index.html");
        assert_eq!(path_clean("/a/b"), "/a/b");
    }

    /// Echo every back-end connection.
    async fn spawn_echo_backend() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (mut stream, _) = listener.accept().await.unwrap();
                tokio::spawn(async move {
                    let (mut r, mut w) = stream.split();
                    let _ = tokio::io::copy(&mut r, &mut w).await;
                });
            }
        });
        addr
    }

    async fn spawn_server(config: ServerConfig) -> (Arc<Server>, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events, _) = mpsc::unbounded_channel();
        let server = Arc::new(Server::new(config, events));
        tokio::spawn(Arc::clone(&server).run(listener, None));
        (server, addr)
    }

    fn test_config(backend: SocketAddr) -> ServerConfig {
        ServerConfig {
            turnaround_timeout: Duration::from_millis(200),
            ..ServerConfig::new(backend)
        }
    }

    /// One raw HTTP/1.1 exchange; `Connection: close` so the response can
    /// be read to EOF. Write and read errors end the exchange rather than
    /// failing the test, since a server rejecting an oversize body may
    /// reset the connection mid-request.
    async fn raw_request(addr: SocketAddr, request: String) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let _ = stream.write_all(request.as_bytes()).await;
        let mut response = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => response.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&response).into_owned()
    }

    fn post(session_id: &str, body: &str) -> String {
        format!(
            "POST / HTTP/1.1\r\nHost: t\r\n{SESSION_ID_HEADER}: {session_id}\r\n\
             Content-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    fn a_session_id() -> String {
        "a".repeat(MIN_SESSION_ID_LENGTH)
    }

    #[tokio::test]
    async fn test_get_root_serves_decoy() {
        let backend = spawn_echo_backend().await;
        let (_server, addr) = spawn_server(test_config(backend)).await;

        let resp = raw_request(
            addr,
            "GET / HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n".into(),
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.contains("happy little web server"), "{resp}");
        assert!(resp.contains("text/plain"), "{resp}");
    }

    #[tokio::test]
    async fn test_get_other_path_is_404() {
        let backend = spawn_echo_backend().await;
        let (_server, addr) = spawn_server(test_config(backend)).await;

        let resp = raw_request(
            addr,
            "GET /robots.txt HTTP/1.1\r\nHost: t\r\nConnection: close\r\n\r\n".into(),
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 404"), "{resp}");
    }

    #[tokio::test]
    async fn test_other_methods_are_400() {
        let backend = spawn_echo_backend().await;
        let (_server, addr) = spawn_server(test_config(backend)).await;

        let resp = raw_request(
            addr,
            "PUT / HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 400"), "{resp}");
    }

    #[tokio::test]
    async fn test_short_session_id_is_400_and_creates_nothing() {
        let backend = spawn_echo_backend().await;
        let (server, addr) = spawn_server(test_config(backend)).await;

        let resp = raw_request(addr, post("short", "payload")).await;
        assert!(resp.starts_with("HTTP/1.1 400"), "{resp}");
        assert!(server.sessions().is_empty());

        // Missing header entirely: same story.
        let resp = raw_request(
            addr,
            "POST / HTTP/1.1\r\nHost: t\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".into(),
        )
        .await;
        assert!(resp.starts_with("HTTP/1.1 400"), "{resp}");
        assert!(server.sessions().is_empty());
    }

    #[tokio::test]
    async fn test_post_round_trip_with_turnaround_drain() {
        let backend = spawn_echo_backend().await;
        let (server, addr) = spawn_server(test_config(backend)).await;

        let id = a_session_id();
        let resp = raw_request(addr, post(&id, "ping")).await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.ends_with("ping"), "echo missing from reply: {resp}");
        assert_eq!(server.sessions().len(), 1);
    }

    #[tokio::test]
    async fn test_post_any_path_reaches_the_session() {
        let backend = spawn_echo_backend().await;
        let (_server, addr) = spawn_server(test_config(backend)).await;

        let id = a_session_id();
        let req = format!(
            "POST /some/random/path HTTP/1.1\r\nHost: t\r\n{SESSION_ID_HEADER}: {id}\r\n\
             Content-Length: 4\r\nConnection: close\r\n\r\nping"
        );
        let resp = raw_request(addr, req).await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.ends_with("ping"), "{resp}");
    }

    #[tokio::test]
    async fn test_empty_poll_gets_empty_reply() {
        let backend = spawn_echo_backend().await;
        let (_server, addr) = spawn_server(test_config(backend)).await;

        let id = a_session_id();
        let resp = raw_request(addr, post(&id, "")).await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.contains("content-length: 0") || resp.contains("Content-Length: 0"), "{resp}");
    }

    #[tokio::test]
    async fn test_backend_close_evicts_session() {
        // A back-end that accepts and immediately hangs up.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                drop(stream);
            }
        });
        let (server, addr) = spawn_server(test_config(backend)).await;

        let id = a_session_id();
        // The transaction hits EOF on the drain read, which is fatal: the
        // session is gone by the time the 500 goes out.
        let resp = raw_request(addr, post(&id, "ping")).await;
        assert!(resp.starts_with("HTTP/1.1 500"), "{resp}");
        assert!(!server.sessions().contains(&id));
    }

    #[tokio::test]
    async fn test_session_expires_after_staleness() {
        let backend = spawn_echo_backend().await;
        let config = ServerConfig {
            max_session_staleness: Duration::from_millis(100),
            turnaround_timeout: Duration::from_millis(200),
            ..ServerConfig::new(backend)
        };
        let (server, addr) = spawn_server(config).await;

        let id = a_session_id();
        let resp = raw_request(addr, post(&id, "ping")).await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(server.sessions().contains(&id));

        // The sweeper runs every staleness/2; after several windows the
        // idle session must be gone.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!server.sessions().contains(&id));
    }

    #[tokio::test]
    async fn test_oversize_body_kills_session() {
        let backend = spawn_echo_backend().await;
        let (server, addr) = spawn_server(test_config(backend)).await;

        let id = a_session_id();
        let body = "x".repeat(MAX_PAYLOAD_LENGTH + 2);
        let resp = raw_request(addr, post(&id, &body)).await;
        assert!(resp.starts_with("HTTP/1.1 500"), "{resp}");
        assert!(!server.sessions().contains(&id));
    }
}
