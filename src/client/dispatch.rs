//! Request transaction dispatchers.
//!
//! One roundtrip carries one uplink chunk (possibly empty) and returns one
//! downlink chunk (possibly empty). Two interchangeable implementations are
//! selected at startup: a direct HTTP client, and the browser helper bridge
//! in [`helper`](crate::client::helper). Either way the caller sees a
//! [`TransportResponse`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{header, HeaderMap, Method, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::warn;
use url::Url;

use crate::client::{helper, RequestInfo};
use crate::error::{Error, Result};
use crate::{MAX_PAYLOAD_LENGTH, MAX_TRIES, RETRY_DELAY, SESSION_ID_HEADER};

/// What a roundtrip produced, independent of which dispatcher ran it.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body, capped at [`MAX_PAYLOAD_LENGTH`] for direct requests.
    pub body: Bytes,
    /// Response headers (empty for helper roundtrips; the helper protocol
    /// does not carry them).
    pub headers: HeaderMap,
}

/// A plain HTTP(S) client that dials a fresh connection per request.
///
/// Reusing connections would be faster, but a one-shot connection per
/// roundtrip is what a browser under cache pressure looks like, and it keeps
/// failure handling trivial: any connection state dies with the request.
#[derive(Clone)]
pub struct DirectClient {
    tls: TlsConnector,
}

impl DirectClient {
    /// Build a client trusting the bundled webpki roots.
    pub fn new() -> Self {
        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Perform one request against `url`, optionally via an upstream HTTP
    /// proxy. The request's URI is overwritten with the form the dial path
    /// requires (origin-form, or absolute-form when a proxy carries a
    /// cleartext request).
    pub async fn fetch(
        &self,
        url: &Url,
        proxy: Option<&Url>,
        mut req: Request<Full<Bytes>>,
    ) -> Result<TransportResponse> {
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            s => return Err(Error::config(format!("unsupported URL scheme {s:?}"))),
        };
        let host = url
            .host_str()
            .ok_or_else(|| Error::config("URL has no host"))?;
        let port = url
            .port_or_known_default()
            .unwrap_or(if https { 443 } else { 80 });

        let stream = match proxy {
            Some(proxy) => {
                if proxy.scheme() != "http" {
                    return Err(Error::proxy(format!("don't know how to use proxy {proxy}")));
                }
                let proxy_host = proxy
                    .host_str()
                    .ok_or_else(|| Error::proxy("proxy URL has no host"))?;
                let proxy_port = proxy.port_or_known_default().unwrap_or(80);
                let mut stream = TcpStream::connect((proxy_host, proxy_port)).await?;
                if https {
                    connect_through(&mut stream, host, port).await?;
                }
                stream
            }
            None => TcpStream::connect((host, port)).await?,
        };

        *req.uri_mut() = if proxy.is_some() && !https {
            // The proxy sees the request in the clear and routes on the
            // absolute URI.
            url.as_str()
                .parse::<Uri>()
                .map_err(|e| Error::config(format!("bad request URL: {e}")))?
        } else {
            origin_form(url)?
        };

        if https {
            let server_name = ServerName::try_from(host.to_owned())
                .map_err(|_| Error::config(format!("bad TLS server name {host:?}")))?;
            let stream = self.tls.connect(server_name, stream).await?;
            one_transaction(stream, req).await
        } else {
            one_transaction(stream, req).await
        }
    }
}

impl Default for DirectClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Path-and-query of `url` as a request URI.
fn origin_form(url: &Url) -> Result<Uri> {
    let mut target = url.path().to_owned();
    if let Some(q) = url.query() {
        target.push('?');
        target.push_str(q);
    }
    target
        .parse::<Uri>()
        .map_err(|e| Error::config(format!("bad request path: {e}")))
}

/// Open a tunnel through an HTTP proxy with a raw CONNECT exchange.
async fn connect_through(stream: &mut TcpStream, host: &str, port: u16) -> Result<()> {
    stream
        .write_all(format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n").as_bytes())
        .await?;

    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let granted = line
        .split_whitespace()
        .nth(1)
        .is_some_and(|code| code.starts_with('2'));
    if !granted {
        return Err(Error::proxy(format!(
            "proxy refused CONNECT: {}",
            line.trim_end()
        )));
    }
    // Skip the remaining response headers.
    loop {
        line.clear();
        reader.read_line(&mut line).await?;
        if line == "\r\n" || line == "\n" || line.is_empty() {
            return Ok(());
        }
    }
}

/// Drive one HTTP/1.1 exchange over an already-established stream.
async fn one_transaction<S>(stream: S, req: Request<Full<Bytes>>) -> Result<TransportResponse>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
    tokio::spawn(async move {
        // The connection future finishes when the exchange does; its error,
        // if any, surfaces through send_request or the body stream.
        let _ = conn.await;
    });

    let resp = sender.send_request(req).await?;
    let status = resp.status().as_u16();
    let headers = resp.headers().clone();

    // Accumulate at most MAX_PAYLOAD_LENGTH of body; anything beyond that
    // would never be copied to the local connection anyway.
    let mut body = resp.into_body();
    let mut collected = BytesMut::new();
    while collected.len() < MAX_PAYLOAD_LENGTH {
        match body.frame().await {
            Some(frame) => {
                let frame = frame?;
                if let Some(data) = frame.data_ref() {
                    collected.extend_from_slice(data);
                }
            }
            None => break,
        }
    }
    collected.truncate(MAX_PAYLOAD_LENGTH);

    Ok(TransportResponse {
        status,
        body: collected.freeze(),
        headers,
    })
}

/// The Host header value: the covert name when fronting, the URL authority
/// otherwise.
fn host_header(info: &RequestInfo) -> String {
    match (&info.host, info.url.host_str(), info.url.port()) {
        (Some(host), _, _) => host.clone(),
        (None, Some(h), Some(p)) => format!("{h}:{p}"),
        (None, Some(h), None) => h.to_owned(),
        (None, None, _) => String::new(),
    }
}

enum Kind {
    Direct(DirectClient),
    Helper(SocketAddr),
}

/// The roundtrip engine for one client process, chosen once at startup.
pub struct Dispatcher {
    kind: Kind,
    max_tries: u32,
    retry_delay: Duration,
}

impl Dispatcher {
    /// A dispatcher that performs HTTP itself.
    pub fn direct() -> Self {
        Self {
            kind: Kind::Direct(DirectClient::new()),
            max_tries: MAX_TRIES,
            retry_delay: RETRY_DELAY,
        }
    }

    /// A dispatcher that forwards every request through the browser helper
    /// at `addr`.
    pub fn helper(addr: SocketAddr) -> Self {
        Self {
            kind: Kind::Helper(addr),
            max_tries: MAX_TRIES,
            retry_delay: RETRY_DELAY,
        }
    }

    /// Override the retry policy (mostly for tests; `max_tries` is clamped
    /// to at least one attempt).
    pub fn with_retry(mut self, max_tries: u32, retry_delay: Duration) -> Self {
        self.max_tries = max_tries.max(1);
        self.retry_delay = retry_delay;
        self
    }

    async fn round_trip_once(&self, body: &[u8], info: &RequestInfo) -> Result<TransportResponse> {
        match &self.kind {
            Kind::Direct(client) => {
                let req = Request::builder()
                    .method(Method::POST)
                    // URI is filled in by fetch
                    .header(header::HOST, host_header(info))
                    .header(SESSION_ID_HEADER, &info.session_id)
                    .body(Full::new(Bytes::copy_from_slice(body)))
                    .map_err(|e| Error::config(format!("building request: {e}")))?;
                client.fetch(&info.url, info.proxy_url.as_ref(), req).await
            }
            Kind::Helper(addr) => helper::round_trip_with_helper(*addr, body, info).await,
        }
    }

    /// Do a roundtrip, trying at most `max_tries` times if there is an HTTP
    /// status other than 200.
    ///
    /// Retrying the request is a bit bogus: the remote server may or may not
    /// have consumed our bytes, so a retry can send duplicates and kill the
    /// connection. The alternative is to kill it immediately ourselves, so
    /// the retry stays. A system of acknowledgements would be needed to do
    /// better.
    pub async fn round_trip(&self, body: &[u8], info: &RequestInfo) -> Result<TransportResponse> {
        let mut tries = self.max_tries;
        loop {
            tries -= 1;
            let resp = self.round_trip_once(body, info).await?;
            if resp.status != 200 {
                if tries > 0 {
                    warn!(
                        "status code was {}, not 200; trying again after {} seconds ({} left)",
                        resp.status,
                        self.retry_delay.as_secs(),
                        tries
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    continue;
                }
                return Err(Error::Status(resp.status));
            }
            return Ok(resp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::gen_session_id;

    use std::sync::atomic::{AtomicU32, Ordering};

    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use tokio::net::TcpListener;

    /// Serve `handler` on a loopback port for the duration of the test.
    async fn spawn_server<F>(handler: F) -> SocketAddr
    where
        F: Fn(Request<Incoming>) -> http::Response<Full<Bytes>> + Clone + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let handler = handler.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| {
                        let handler = handler.clone();
                        async move { Ok::<_, std::convert::Infallible>(handler(req)) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn info_for(addr: SocketAddr) -> RequestInfo {
        RequestInfo {
            session_id: gen_session_id(),
            url: Url::parse(&format!("http://{addr}/")).unwrap(),
            host: None,
            proxy_url: None,
        }
    }

    #[tokio::test]
    async fn test_direct_round_trip_echoes() {
        let addr = spawn_server(|req| {
            assert_eq!(req.method(), Method::POST);
            assert!(req.headers().contains_key(SESSION_ID_HEADER));
            http::Response::new(Full::new(Bytes::from_static(b"pong")))
        })
        .await;

        let dispatcher = Dispatcher::direct().with_retry(1, Duration::ZERO);
        let resp = dispatcher.round_trip(b"ping", &info_for(addr)).await.unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(&resp.body[..], b"pong");
    }

    #[tokio::test]
    async fn test_host_header_override() {
        let addr = spawn_server(|req| {
            let host = req.headers().get(header::HOST).unwrap().to_str().unwrap();
            assert_eq!(host, "covert.example");
            http::Response::new(Full::new(Bytes::new()))
        })
        .await;

        let mut info = info_for(addr);
        info.host = Some("covert.example".into());
        let dispatcher = Dispatcher::direct().with_retry(1, Duration::ZERO);
        dispatcher.round_trip(&[], &info).await.unwrap();
    }

    #[tokio::test]
    async fn test_status_retry_then_success() {
        static HITS: AtomicU32 = AtomicU32::new(0);
        let addr = spawn_server(|_req| {
            if HITS.fetch_add(1, Ordering::SeqCst) == 0 {
                let mut resp = http::Response::new(Full::new(Bytes::new()));
                *resp.status_mut() = http::StatusCode::SERVICE_UNAVAILABLE;
                resp
            } else {
                http::Response::new(Full::new(Bytes::from_static(b"ok")))
            }
        })
        .await;

        let dispatcher = Dispatcher::direct().with_retry(2, Duration::ZERO);
        let resp = dispatcher.round_trip(&[], &info_for(addr)).await.unwrap();
        assert_eq!(&resp.body[..], b"ok");
        assert_eq!(HITS.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_status_failure_with_single_try() {
        let addr = spawn_server(|_req| {
            let mut resp = http::Response::new(Full::new(Bytes::new()));
            *resp.status_mut() = http::StatusCode::NOT_FOUND;
            resp
        })
        .await;

        let dispatcher = Dispatcher::direct().with_retry(1, Duration::ZERO);
        let err = dispatcher.round_trip(&[], &info_for(addr)).await.unwrap_err();
        assert!(matches!(err, Error::Status(404)));
    }

    #[tokio::test]
    async fn test_response_body_capped() {
        let addr = spawn_server(|_req| {
            http::Response::new(Full::new(Bytes::from(vec![0x42; MAX_PAYLOAD_LENGTH + 100])))
        })
        .await;

        let dispatcher = Dispatcher::direct().with_retry(1, Duration::ZERO);
        let resp = dispatcher.round_trip(&[], &info_for(addr)).await.unwrap();
        assert_eq!(resp.body.len(), MAX_PAYLOAD_LENGTH);
    }

    #[tokio::test]
    async fn test_network_error_is_not_retried() {
        // Nothing listens here; the dial fails, and failing ten times would
        // take ten connection attempts. One is enough to prove the point.
        let dispatcher = Dispatcher::direct().with_retry(10, Duration::from_secs(3600));
        let info = info_for("127.0.0.1:1".parse().unwrap());
        let started = std::time::Instant::now();
        let err = dispatcher.round_trip(&[], &info).await.unwrap_err();
        assert!(matches!(err, Error::Network(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
